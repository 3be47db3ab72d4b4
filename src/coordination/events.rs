//! Event bus for coordination observers.
//!
//! Publish-subscribe over the swarm's coordination activity: task lifecycle,
//! lock and leadership changes, steals, conflicts, and deadlock alerts.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, Receiver, Sender};
use tokio::sync::Mutex;

use crate::memory::AgentId;
use crate::task::TaskId;

/// Kinds of events that can be published.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A task became schedulable.
    TaskQueued,
    /// A task was assigned its resources.
    TaskAssigned,
    /// A task started running.
    TaskStarted,
    /// A task completed successfully.
    TaskCompleted,
    /// A task failed.
    TaskFailed,
    /// A task was cancelled.
    TaskCancelled,
    /// A failed task re-entered the queue.
    TaskRetried,
    /// A stale task was taken over by another agent.
    TaskReclaimed,

    /// A resource lock was acquired.
    LockAcquired,
    /// A resource lock was released.
    LockReleased,
    /// A leader won an election term.
    LeaderElected,
    /// A work item was stolen from the pool.
    WorkStolen,
    /// A same-id write was resolved by the conflict policy.
    ConflictResolved,
    /// A dependency cycle or stuck task was detected.
    DeadlockDetected,

    /// Custom event type.
    Custom(String),
}

impl EventKind {
    /// Whether this event kind belongs in the durable audit trail.
    pub fn is_durable(&self) -> bool {
        match self {
            // Task lifecycle - always audit
            EventKind::TaskQueued
            | EventKind::TaskAssigned
            | EventKind::TaskStarted
            | EventKind::TaskCompleted
            | EventKind::TaskFailed
            | EventKind::TaskCancelled
            | EventKind::TaskRetried
            | EventKind::TaskReclaimed => true,

            // Coordination outcomes - audit
            EventKind::LeaderElected | EventKind::ConflictResolved | EventKind::DeadlockDetected => true,

            // High volume, reconstructable from the store
            EventKind::LockAcquired | EventKind::LockReleased | EventKind::WorkStolen => false,

            EventKind::Custom(_) => false,
        }
    }
}

/// An event in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID.
    pub id: String,
    /// Kind of event.
    pub kind: EventKind,
    /// Source task (if applicable).
    pub task_id: Option<TaskId>,
    /// Agent that caused the event (if applicable).
    pub agent_id: Option<AgentId>,
    /// Event payload (JSON).
    pub payload: serde_json::Value,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create a new event.
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            kind,
            task_id: None,
            agent_id: None,
            payload: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Set the source task.
    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Set the causing agent.
    pub fn by_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Subscription to events.
pub struct Subscription {
    receiver: Receiver<Event>,
    /// Filter for event kinds (empty = all).
    kinds: Vec<EventKind>,
    /// Filter for source tasks (empty = all).
    tasks: Vec<TaskId>,
}

impl Subscription {
    /// Receive the next event matching the filters.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(_) => return None,
            }
        }
    }

    fn matches(&self, event: &Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.tasks.is_empty() {
            match &event.task_id {
                Some(task) if self.tasks.contains(task) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Event bus for coordination observers.
pub struct EventBus {
    sender: Sender<Event>,
    /// History of recent events.
    history: Arc<Mutex<Vec<Event>>>,
    /// Maximum history size.
    max_history: usize,
    /// Event counts by kind.
    counts: Arc<Mutex<HashMap<EventKind, usize>>>,
}

impl EventBus {
    /// Create a new event bus.
    pub fn new() -> Self {
        Self::with_history_size(1000)
    }

    /// Create an event bus with custom history size.
    pub fn with_history_size(size: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            sender,
            history: Arc::new(Mutex::new(Vec::new())),
            max_history: size,
            counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Publish an event.
    pub async fn publish(&self, event: Event) {
        {
            let mut history = self.history.lock().await;
            history.push(event.clone());
            while history.len() > self.max_history {
                history.remove(0);
            }
        }

        {
            let mut counts = self.counts.lock().await;
            *counts.entry(event.kind.clone()).or_insert(0) += 1;
        }

        // Broadcast (ignore if no receivers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            kinds: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Subscribe to specific event kinds.
    pub fn subscribe_to(&self, kinds: Vec<EventKind>) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            kinds,
            tasks: Vec::new(),
        }
    }

    /// Subscribe to events about specific tasks.
    pub fn subscribe_to_tasks(&self, tasks: Vec<TaskId>) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            kinds: Vec::new(),
            tasks,
        }
    }

    /// Get recent events.
    pub async fn recent_events(&self, limit: usize) -> Vec<Event> {
        let history = self.history.lock().await;
        let start = history.len().saturating_sub(limit);
        history[start..].to_vec()
    }

    /// Count of published events for a kind.
    pub async fn count_of(&self, kind: &EventKind) -> usize {
        let counts = self.counts.lock().await;
        counts.get(kind).copied().unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.publish(Event::new(EventKind::TaskCompleted).for_task(TaskId::new("s", 1)))
            .await;

        let event = sub.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::TaskCompleted);
        assert_eq!(event.task_id, Some(TaskId::new("s", 1)));
    }

    #[tokio::test]
    async fn test_kind_filter() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_to(vec![EventKind::LockAcquired]);

        bus.publish(Event::new(EventKind::TaskCompleted)).await;
        bus.publish(Event::new(EventKind::LockAcquired)).await;

        let event = sub.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::LockAcquired);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_task_filter() {
        let bus = EventBus::new();
        let watched = TaskId::new("s", 1);
        let mut sub = bus.subscribe_to_tasks(vec![watched.clone()]);

        bus.publish(Event::new(EventKind::TaskStarted).for_task(TaskId::new("s", 2)))
            .await;
        bus.publish(Event::new(EventKind::TaskStarted).for_task(watched.clone()))
            .await;

        let event = sub.try_recv().unwrap();
        assert_eq!(event.task_id, Some(watched));
    }

    #[tokio::test]
    async fn test_history_and_counts() {
        let bus = EventBus::with_history_size(2);

        bus.publish(Event::new(EventKind::TaskQueued)).await;
        bus.publish(Event::new(EventKind::TaskQueued)).await;
        bus.publish(Event::new(EventKind::TaskCompleted)).await;

        let recent = bus.recent_events(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(bus.count_of(&EventKind::TaskQueued).await, 2);
        assert_eq!(bus.count_of(&EventKind::TaskCompleted).await, 1);
    }

    #[test]
    fn test_durability_flags() {
        assert!(EventKind::TaskCompleted.is_durable());
        assert!(EventKind::DeadlockDetected.is_durable());
        assert!(!EventKind::LockAcquired.is_durable());
        assert!(!EventKind::Custom("x".to_string()).is_durable());
    }
}
