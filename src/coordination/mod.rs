//! Swarm coordination module.
//!
//! Every protocol here is a convention over the shared memory store — locks,
//! elections, work stealing, and reclaim have no storage of their own:
//! - Events: coordination event bus for observers
//! - Locks: TTL'd lock entries, earliest writer wins
//! - Election: candidacy entries, pure winner computation, bounded terms
//! - Work pool: shared queue with stale-read-tolerant stealing
//! - Reclaim: heartbeat claims and takeover of failed peers
//! - Scheduler: tick loop tying tasks, resources, and timeouts together

pub mod election;
pub mod events;
pub mod locks;
pub mod reclaim;
pub mod scheduler;
pub mod work_pool;

pub use election::{compute_leader, Candidacy, Election, ElectionConfig, Leadership};
pub use events::{Event, EventBus, EventKind, Subscription};
pub use locks::{LockAttempt, LockCoordinator, LockOutcome};
pub use reclaim::{ClaimCoordinator, ReclaimRecord, TaskClaim};
pub use scheduler::{Scheduler, SchedulerConfig, TickReport};
pub use work_pool::{AgentType, CapabilityTier, WorkAssignment, WorkItem, WorkPool, WorkPoolCoordinator};
