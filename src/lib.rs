//! Stigmergy: task coordination and shared-memory substrate for agent swarms.
//!
//! Independent, loosely-synchronized agent processes coordinate through one
//! shared, namespaced key-value store — claiming tasks in dependency order,
//! taking exclusive and shared resource grants, electing leaders, stealing
//! work, and reclaiming tasks from failed peers. The store offers no
//! compare-and-swap and no cross-entry atomicity; every protocol above it is
//! race-tolerant by construction (write, re-read, confirm), which is stated
//! here so nobody mistakes the substrate for a linearizable one.

pub mod backend;
pub mod config;
pub mod context;
pub mod coordination;
pub mod error;
pub mod memory;
pub mod resources;
pub mod task;
pub mod task_graph;

pub use backend::{InMemoryBackend, MemoryBackend};
pub use config::{Config, LoadBalancingStrategy};
pub use context::CoordinationContext;
pub use coordination::{
    ClaimCoordinator, Election, EventBus, LockCoordinator, Scheduler, SchedulerConfig, WorkPoolCoordinator,
};
pub use error::{Error, Result};
pub use memory::{
    AgentId, ConflictPolicy, EntryId, EntryKind, EntryPatch, MemoryEntry, QueryFilter, SharedMemoryStore,
};
pub use resources::{AllocationOutcome, ResourceAllocator, ResourceRequirement};
pub use task::{TaskDefinition, TaskId, TaskSpec, TaskStatus};
pub use task_graph::{TaskGraph, TaskSnapshot};
