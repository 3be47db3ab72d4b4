//! Failure detection and task reclaim.
//!
//! A running task's agent maintains a `TaskClaim` entry and refreshes its
//! heartbeat. Any observer that computes `now - last_heartbeat >
//! heartbeat_interval` may take the task over: it writes a `TaskReclaim`
//! audit entry referencing the stale claim, removes the claim, and requeues
//! the task. A stale claim is an expected, recoverable event, not an
//! escalation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::memory::{AgentId, EntryId, EntryKind, EntryPatch, MemoryEntry, QueryFilter, SharedMemoryStore};
use crate::task::TaskId;
use crate::task_graph::TaskGraph;

/// Namespace holding claim and reclaim entries.
pub const CLAIM_NAMESPACE: &str = "coordination";

/// A running task's liveness claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskClaim {
    /// The claimed task.
    pub task_id: TaskId,
    /// The executing agent.
    pub agent: AgentId,
    /// Expected heartbeat cadence in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Last heartbeat received.
    pub last_heartbeat: DateTime<Utc>,
    /// When the claim was first made.
    pub claimed_at: DateTime<Utc>,
}

impl TaskClaim {
    /// Whether the claim is stale at `now`.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        let elapsed = now - self.last_heartbeat;
        elapsed > chrono::Duration::milliseconds(self.heartbeat_interval_ms as i64)
    }
}

/// Audit record of a reclaim, stored as its own entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReclaimRecord {
    /// The reclaimed task.
    pub task_id: TaskId,
    /// The agent whose claim went stale.
    pub previous_agent: AgentId,
    /// The agent that took over.
    pub new_agent: AgentId,
    /// Entry id of the stale claim, for audit.
    pub stale_claim_entry: EntryId,
    /// When the takeover happened.
    pub reclaimed_at: DateTime<Utc>,
}

/// Manages claims, heartbeats, and takeovers.
pub struct ClaimCoordinator {
    /// Claim entries are kept alive for this many heartbeat intervals.
    ttl_intervals: u32,
}

impl ClaimCoordinator {
    /// Create a coordinator.
    pub fn new() -> Self {
        Self { ttl_intervals: 10 }
    }

    fn claim_id(task_id: &TaskId) -> EntryId {
        EntryId::named(format!("claim-{}", task_id))
    }

    fn claim_ttl(&self, interval: Duration) -> Duration {
        interval * self.ttl_intervals
    }

    /// Claim a task for an agent with the given heartbeat cadence.
    pub async fn claim(
        &self,
        store: &SharedMemoryStore,
        task_id: &TaskId,
        agent: &AgentId,
        heartbeat_interval: Duration,
    ) -> Result<TaskClaim> {
        let now = Utc::now();
        let claim = TaskClaim {
            task_id: task_id.clone(),
            agent: agent.clone(),
            heartbeat_interval_ms: heartbeat_interval.as_millis() as u64,
            last_heartbeat: now,
            claimed_at: now,
        };
        let entry = MemoryEntry::new(EntryKind::TaskClaim, serde_json::to_value(&claim)?)
            .with_id(Self::claim_id(task_id))
            .in_namespace(CLAIM_NAMESPACE)
            .owned_by(agent.clone())
            .with_tags(vec!["claim".to_string(), task_id.to_string()])
            .with_ttl(self.claim_ttl(heartbeat_interval));
        store.store(entry).await?;
        Ok(claim)
    }

    /// Refresh a claim's heartbeat. Returns false if the claim is gone or
    /// now belongs to someone else (the agent should stop working).
    pub async fn heartbeat(&self, store: &SharedMemoryStore, task_id: &TaskId, agent: &AgentId) -> Result<bool> {
        let Some(mut claim) = self.get_claim(store, task_id).await? else {
            return Ok(false);
        };
        if claim.agent != *agent {
            return Ok(false);
        }

        claim.last_heartbeat = Utc::now();
        let interval = Duration::from_millis(claim.heartbeat_interval_ms);
        let updated = store
            .update(
                &Self::claim_id(task_id),
                EntryPatch::new()
                    .content(serde_json::to_value(&claim)?)
                    .ttl(self.claim_ttl(interval)),
            )
            .await?;
        Ok(updated.is_some())
    }

    /// The live claim on a task, if any.
    pub async fn get_claim(&self, store: &SharedMemoryStore, task_id: &TaskId) -> Result<Option<TaskClaim>> {
        let entry = store.retrieve(&Self::claim_id(task_id)).await?;
        Ok(match entry {
            Some(e) => serde_json::from_value(e.content).ok(),
            None => None,
        })
    }

    /// Claims whose heartbeat has lapsed beyond their interval.
    pub async fn find_stale(&self, store: &SharedMemoryStore) -> Result<Vec<TaskClaim>> {
        let now = Utc::now();
        let filter = QueryFilter::new()
            .namespace(CLAIM_NAMESPACE)
            .kind(EntryKind::TaskClaim);
        let mut stale = Vec::new();
        for entry in store.query(&filter).await? {
            match serde_json::from_value::<TaskClaim>(entry.content.clone()) {
                Ok(claim) if claim.is_stale_at(now) => stale.push(claim),
                Ok(_) => {}
                Err(e) => log::warn!("skipping malformed claim entry {}: {}", entry.id, e),
            }
        }
        Ok(stale)
    }

    /// Take over a stale claim.
    ///
    /// Writes the audit record, removes the stale claim, and requeues the
    /// task through the graph's reclaim path (`Running -> Queued`).
    pub async fn reclaim(
        &self,
        store: &SharedMemoryStore,
        graph: &TaskGraph,
        stale: &TaskClaim,
        new_agent: &AgentId,
    ) -> Result<ReclaimRecord> {
        let record = ReclaimRecord {
            task_id: stale.task_id.clone(),
            previous_agent: stale.agent.clone(),
            new_agent: new_agent.clone(),
            stale_claim_entry: Self::claim_id(&stale.task_id),
            reclaimed_at: Utc::now(),
        };

        let entry = MemoryEntry::new(EntryKind::TaskReclaim, serde_json::to_value(&record)?)
            .in_namespace(CLAIM_NAMESPACE)
            .owned_by(new_agent.clone())
            .with_tags(vec!["reclaim".to_string(), stale.task_id.to_string()]);
        store.store(entry).await?;
        store.delete(&Self::claim_id(&stale.task_id)).await?;

        graph
            .reclaim_requeue(
                &stale.task_id,
                new_agent,
                format!("heartbeat from {} lapsed", stale.agent),
            )
            .await?;

        log::warn!(
            "task {} reclaimed from {} by {} (heartbeat lapsed)",
            stale.task_id,
            stale.agent,
            new_agent
        );
        Ok(record)
    }

    /// Audit records for a task's reclaims, oldest first.
    pub async fn reclaim_history(&self, store: &SharedMemoryStore, task_id: &TaskId) -> Result<Vec<ReclaimRecord>> {
        let filter = QueryFilter::new()
            .namespace(CLAIM_NAMESPACE)
            .kind(EntryKind::TaskReclaim)
            .tag(task_id.to_string());
        let mut records = Vec::new();
        for entry in store.query(&filter).await? {
            if let Ok(record) = serde_json::from_value::<ReclaimRecord>(entry.content.clone()) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Drop a claim on normal completion.
    pub async fn release(&self, store: &SharedMemoryStore, task_id: &TaskId) -> Result<bool> {
        store.delete(&Self::claim_id(task_id)).await
    }
}

impl Default for ClaimCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
