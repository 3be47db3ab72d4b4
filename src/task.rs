//! Task types for stigmergy.
//!
//! A task is identified by a composite `{swarm_id, sequence}` id and is
//! mutated only through recorded status transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resources::ResourceRequirement;

/// Composite task identifier: the owning swarm plus a per-swarm sequence.
///
/// Ordering is lexical on `swarm_id`, then numeric on `sequence`, which makes
/// "lexically smallest task id" tie-breaks total and deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    /// Swarm this task belongs to.
    pub swarm_id: String,
    /// Creation sequence within the swarm.
    pub sequence: u64,
}

impl TaskId {
    /// Create a task id from its parts.
    pub fn new(swarm_id: impl Into<String>, sequence: u64) -> Self {
        Self {
            swarm_id: swarm_id.into(),
            sequence,
        }
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.swarm_id, self.sequence)
    }
}

/// Task status.
///
/// The normal path is `Created -> Queued -> Assigned -> Running` followed by
/// one of the terminal states. `Running -> Queued` is deliberately absent
/// from the transition table; it is only reachable through the reclaim and
/// retry paths on the task graph, which record who triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Registered but not yet schedulable
    Created,
    /// Waiting for resources and a scheduling slot
    Queued,
    /// Resources granted, handed to an agent
    Assigned,
    /// Actively executing
    Running,
    /// Successfully completed
    Completed,
    /// Failed with error
    Failed,
    /// Cancelled by a caller
    Cancelled,
}

impl TaskStatus {
    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Check if the task can transition to the given status.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            // From Created
            (Created, Queued | Cancelled) => true,
            // From Queued
            (Queued, Assigned | Failed | Cancelled) => true,
            // From Assigned
            (Assigned, Running | Queued | Failed | Cancelled) => true,
            // From Running (Queued is reserved for reclaim, see TaskGraph)
            (Running, Completed | Failed | Cancelled) => true,
            // Terminal states cannot transition
            (Completed | Failed | Cancelled, _) => false,
            // Everything else is not allowed
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Created => "created",
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Kinds of dependencies between tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyKind {
    /// Satisfied once the referenced task has completed.
    FinishToStart,
}

/// A dependency on another task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// The task this one depends on.
    pub task_id: TaskId,
    /// How the dependency is satisfied.
    pub kind: DependencyKind,
}

impl Dependency {
    /// Finish-to-start dependency on the given task.
    pub fn finish_to_start(task_id: TaskId) -> Self {
        Self {
            task_id,
            kind: DependencyKind::FinishToStart,
        }
    }
}

/// Execution constraints for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConstraints {
    /// Maximum retry attempts after a retryable failure.
    pub max_retries: u32,
    /// Time limit in milliseconds, measured from the `Running` transition.
    pub timeout_after_ms: Option<u64>,
}

impl Default for TaskConstraints {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_after_ms: None,
        }
    }
}

/// One recorded status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    /// Status before the transition.
    pub from: TaskStatus,
    /// Status after the transition.
    pub to: TaskStatus,
    /// Why the transition happened.
    pub reason: String,
    /// Who triggered it (agent id, "scheduler", "reclaim", ...).
    pub triggered_by: String,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// One execution attempt of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    /// Attempt number, starting at 1.
    pub number: u32,
    /// When the attempt entered `Running`.
    pub started_at: DateTime<Utc>,
    /// When the attempt reached a terminal state or was requeued.
    pub ended_at: Option<DateTime<Utc>>,
    /// Terminal outcome of the attempt, if any.
    pub outcome: Option<String>,
}

/// A task definition.
///
/// Mutated only via the task graph's transition methods; `status_history`
/// is append-only and survives retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Composite identifier.
    pub id: TaskId,
    /// Short name.
    pub name: String,
    /// What the task is supposed to do.
    pub description: String,
    /// Task type (used for capability matching).
    pub task_type: String,
    /// Priority; higher values are scheduled first.
    pub priority: u8,
    /// Current status.
    pub status: TaskStatus,
    /// Tasks this one depends on.
    pub dependencies: Vec<Dependency>,
    /// Resources the task needs before it can be assigned.
    pub resource_requirements: Vec<ResourceRequirement>,
    /// Execution constraints.
    pub constraints: TaskConstraints,
    /// Execution attempts so far.
    pub attempts: Vec<Attempt>,
    /// Ordered transition log.
    pub status_history: Vec<StatusChange>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task was last updated.
    pub updated_at: DateTime<Utc>,
}

impl TaskDefinition {
    /// Number of `Failed` transitions recorded so far.
    ///
    /// Resource timeouts fail a task before it ever enters `Running`, so the
    /// retry budget is counted from the history, not from attempts.
    pub fn failure_count(&self) -> u32 {
        self.status_history
            .iter()
            .filter(|c| c.to == TaskStatus::Failed)
            .count() as u32
    }

    /// Whether the most recent failure is still within the retry budget.
    pub fn retries_remaining(&self) -> bool {
        self.failure_count() <= self.constraints.max_retries
    }

    /// The attempt currently open (entered `Running`, not yet ended).
    pub fn current_attempt(&self) -> Option<&Attempt> {
        self.attempts.iter().rev().find(|a| a.ended_at.is_none())
    }

    /// When the task last entered `Running`, if it is running.
    pub fn running_since(&self) -> Option<DateTime<Utc>> {
        if self.status != TaskStatus::Running {
            return None;
        }
        self.current_attempt().map(|a| a.started_at)
    }
}

/// What a caller provides to create a task.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    /// Short name.
    pub name: String,
    /// What the task is supposed to do.
    pub description: String,
    /// Task type (used for capability matching).
    pub task_type: String,
    /// Priority; higher values are scheduled first.
    pub priority: u8,
    /// Tasks this one depends on.
    pub dependencies: Vec<Dependency>,
    /// Resources the task needs before it can be assigned.
    pub resource_requirements: Vec<ResourceRequirement>,
    /// Execution constraints.
    pub constraints: TaskConstraints,
}

impl TaskSpec {
    /// Create a spec with the required fields.
    pub fn new(name: impl Into<String>, task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            task_type: task_type.into(),
            priority: 0,
            ..Self::default()
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Add a finish-to-start dependency.
    pub fn depends_on(mut self, task_id: TaskId) -> Self {
        self.dependencies.push(Dependency::finish_to_start(task_id));
        self
    }

    /// Add a resource requirement.
    pub fn requires(mut self, requirement: ResourceRequirement) -> Self {
        self.resource_requirements.push(requirement);
        self
    }

    /// Set the execution constraints.
    pub fn with_constraints(mut self, constraints: TaskConstraints) -> Self {
        self.constraints = constraints;
        self
    }
}
