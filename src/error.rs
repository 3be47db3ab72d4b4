//! Error types for stigmergy.

use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

/// Stigmergy error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Task not found
    #[error("task not found: {id}")]
    TaskNotFound { id: TaskId },

    /// Invalid task state transition
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition { from: TaskStatus, to: TaskStatus },

    /// Unknown or unsupported dependency reference
    #[error("dependency error for task {task}: {reason}")]
    Dependency { task: TaskId, reason: String },

    /// Exclusive resource claim not granted before the deadline
    #[error("task {task} timed out waiting for resource {resource}")]
    ResourceTimeout { task: TaskId, resource: String },

    /// Dependency cycle detected in the task graph
    #[error("deadlock detected: cycle {cycle:?}")]
    Deadlock { cycle: Vec<TaskId> },

    /// Claim heartbeat expired and the task was reclaimed
    #[error("stale claim {claim_id} on task {task}")]
    StaleClaim { claim_id: String, task: TaskId },

    /// Memory entry not found
    #[error("memory entry not found: {id}")]
    EntryNotFound { id: String },

    /// Storage backend error
    #[error("storage error: {0}")]
    Storage(String),

    /// Task validation error
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for stigmergy.
pub type Result<T> = std::result::Result<T, Error>;
