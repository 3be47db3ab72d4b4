//! Work-stealing pool as store conventions.
//!
//! A single `WorkPool` entry holds the available and in-progress item lists.
//! A stealer reads the pool, moves a compatible item, writes the pool back,
//! and records a separate `WorkAssignment` entry. The store has no
//! compare-and-swap, so two stealers can race on stale pool reads; duplicate
//! assignments for one item are expected and reconciled by earliest
//! `created_at` precedence — losers re-steal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::LoadBalancingStrategy;
use crate::error::Result;
use crate::memory::{AgentId, EntryId, EntryKind, MemoryEntry, QueryFilter, SharedMemoryStore};

/// Namespace holding pool and assignment entries.
pub const WORK_NAMESPACE: &str = "coordination";

/// Capability tier a work item requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityTier {
    /// Cheap, mechanical work.
    Light,
    /// Ordinary work.
    Standard,
    /// Work needing a capable specialist.
    Heavy,
}

/// Agent types participating in stealing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentType {
    /// Takes light and standard work.
    Generalist,
    /// Takes standard and heavy work.
    Specialist,
    /// Coordination-only; takes light work when idle.
    Coordinator,
}

impl AgentType {
    /// Explicit compatibility table: which tiers this agent type may steal.
    pub fn can_handle(&self, tier: CapabilityTier) -> bool {
        use CapabilityTier::*;
        match (self, tier) {
            (AgentType::Generalist, Light | Standard) => true,
            (AgentType::Generalist, Heavy) => false,
            (AgentType::Specialist, Standard | Heavy) => true,
            (AgentType::Specialist, Light) => false,
            (AgentType::Coordinator, Light) => true,
            (AgentType::Coordinator, Standard | Heavy) => false,
        }
    }
}

/// One stealable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique item id within the pool.
    pub id: String,
    /// What the work is.
    pub description: String,
    /// Required capability tier.
    pub tier: CapabilityTier,
    /// Arbitrary payload handed to the executing agent.
    pub payload: serde_json::Value,
}

impl WorkItem {
    /// Create a work item.
    pub fn new(id: impl Into<String>, description: impl Into<String>, tier: CapabilityTier) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            tier,
            payload: serde_json::Value::Null,
        }
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// The shared pool, stored as one entry's content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkPool {
    /// Pool identifier.
    pub pool_id: String,
    /// Items waiting to be stolen.
    pub available: Vec<WorkItem>,
    /// Items some agent believes it is working on.
    pub in_progress: Vec<WorkItem>,
}

/// An agent's claim on a stolen item, stored as a separate entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkAssignment {
    /// The pool the item came from.
    pub pool_id: String,
    /// The stolen item id.
    pub item_id: String,
    /// The stealing agent.
    pub agent: AgentId,
    /// When the steal was recorded.
    pub claimed_at: DateTime<Utc>,
    /// The store entry backing this assignment.
    pub entry_id: EntryId,
}

/// Manages work pools and stealing over the store.
pub struct WorkPoolCoordinator {
    strategy: LoadBalancingStrategy,
}

impl WorkPoolCoordinator {
    /// Create a coordinator using work stealing.
    pub fn new() -> Self {
        Self {
            strategy: LoadBalancingStrategy::WorkStealing,
        }
    }

    /// Create a coordinator with a specific selection strategy.
    pub fn with_strategy(strategy: LoadBalancingStrategy) -> Self {
        Self { strategy }
    }

    fn pool_entry_id(pool_id: &str) -> EntryId {
        EntryId::named(format!("work-pool-{}", pool_id))
    }

    /// Pick which compatible item to take, per the configured strategy.
    fn select_item(&self, pool: &WorkPool, agent_type: AgentType) -> Option<usize> {
        let compatible = |item: &WorkItem| agent_type.can_handle(item.tier);
        match self.strategy {
            // First compatible item in queue order
            LoadBalancingStrategy::WorkStealing => pool.available.iter().position(compatible),
            // Rotate the scan start with the pool's progress so successive
            // stealers spread across the queue
            LoadBalancingStrategy::RoundRobin => {
                let len = pool.available.len();
                if len == 0 {
                    return None;
                }
                let start = pool.in_progress.len() % len;
                (0..len)
                    .map(|i| (start + i) % len)
                    .find(|&i| compatible(&pool.available[i]))
            }
            // Most demanding tier the agent can still handle
            LoadBalancingStrategy::CapabilityBased => [CapabilityTier::Heavy, CapabilityTier::Standard, CapabilityTier::Light]
                .into_iter()
                .filter(|tier| agent_type.can_handle(*tier))
                .find_map(|tier| pool.available.iter().position(|item| item.tier == tier)),
        }
    }

    /// Create (or replace) a pool with the given items.
    pub async fn create_pool(&self, store: &SharedMemoryStore, pool_id: &str, items: Vec<WorkItem>) -> Result<()> {
        let pool = WorkPool {
            pool_id: pool_id.to_string(),
            available: items,
            in_progress: Vec::new(),
        };
        let entry = MemoryEntry::new(EntryKind::WorkPool, serde_json::to_value(&pool)?)
            .with_id(Self::pool_entry_id(pool_id))
            .in_namespace(WORK_NAMESPACE)
            .with_tags(vec!["work-pool".to_string(), pool_id.to_string()]);
        store.store(entry).await?;
        Ok(())
    }

    /// Read the pool's current state.
    pub async fn load(&self, store: &SharedMemoryStore, pool_id: &str) -> Result<Option<WorkPool>> {
        let entry = store.retrieve(&Self::pool_entry_id(pool_id)).await?;
        Ok(match entry {
            Some(e) => Some(serde_json::from_value(e.content)?),
            None => None,
        })
    }

    /// Steal the first available item the agent's type can handle.
    ///
    /// Writes the updated pool plus a `WorkAssignment` entry. The returned
    /// assignment is provisional until [`WorkPoolCoordinator::confirm`]
    /// agrees the steal won reconciliation.
    pub async fn steal(
        &self,
        store: &SharedMemoryStore,
        pool_id: &str,
        agent: &AgentId,
        agent_type: AgentType,
    ) -> Result<Option<WorkAssignment>> {
        let Some(mut pool) = self.load(store, pool_id).await? else {
            return Ok(None);
        };

        let Some(position) = self.select_item(&pool, agent_type) else {
            return Ok(None);
        };
        let item = pool.available.remove(position);
        pool.in_progress.push(item.clone());

        // Write the pool back first, then the assignment; a stale read by a
        // peer between the two shows up as a duplicate assignment, which
        // reconcile() resolves.
        let pool_entry = MemoryEntry::new(EntryKind::WorkPool, serde_json::to_value(&pool)?)
            .with_id(Self::pool_entry_id(pool_id))
            .in_namespace(WORK_NAMESPACE)
            .with_tags(vec!["work-pool".to_string(), pool_id.to_string()]);
        store.store(pool_entry).await?;

        let entry_id = EntryId::new();
        let assignment = WorkAssignment {
            pool_id: pool_id.to_string(),
            item_id: item.id.clone(),
            agent: agent.clone(),
            claimed_at: Utc::now(),
            entry_id: entry_id.clone(),
        };
        let assignment_entry = MemoryEntry::new(EntryKind::WorkAssignment, serde_json::to_value(&assignment)?)
            .with_id(entry_id)
            .in_namespace(WORK_NAMESPACE)
            .owned_by(agent.clone())
            .with_tags(vec![
                "work-assignment".to_string(),
                pool_id.to_string(),
                item.id.clone(),
            ]);
        store.store(assignment_entry).await?;

        log::debug!("agent {} stole item {} from pool {}", agent, item.id, pool_id);
        Ok(Some(assignment))
    }

    /// All live assignment claims for an item, earliest first.
    pub async fn assignments_for(
        &self,
        store: &SharedMemoryStore,
        pool_id: &str,
        item_id: &str,
    ) -> Result<Vec<WorkAssignment>> {
        let filter = QueryFilter::new()
            .namespace(WORK_NAMESPACE)
            .kind(EntryKind::WorkAssignment)
            .tag(pool_id.to_string())
            .tag(item_id.to_string());
        let mut assignments = Vec::new();
        for entry in store.query(&filter).await? {
            match serde_json::from_value::<WorkAssignment>(entry.content.clone()) {
                Ok(assignment) => assignments.push(assignment),
                Err(e) => log::warn!("skipping malformed assignment entry {}: {}", entry.id, e),
            }
        }
        Ok(assignments)
    }

    /// Resolve duplicate claims on an item: the earliest-created assignment
    /// wins, losing entries are deleted. Returns the winning agent, if any.
    pub async fn reconcile(&self, store: &SharedMemoryStore, pool_id: &str, item_id: &str) -> Result<Option<AgentId>> {
        let assignments = self.assignments_for(store, pool_id, item_id).await?;
        let Some((winner, losers)) = assignments.split_first() else {
            return Ok(None);
        };

        for loser in losers {
            store.delete(&loser.entry_id).await?;
            log::debug!(
                "duplicate claim on {}/{} by {} reconciled away in favor of {}",
                pool_id,
                item_id,
                loser.agent,
                winner.agent
            );
        }
        Ok(Some(winner.agent.clone()))
    }

    /// Whether this assignment survived reconciliation.
    pub async fn confirm(&self, store: &SharedMemoryStore, assignment: &WorkAssignment) -> Result<bool> {
        let winner = self.reconcile(store, &assignment.pool_id, &assignment.item_id).await?;
        Ok(winner.as_ref() == Some(&assignment.agent))
    }

    /// Mark an item finished: drop it from `in_progress` and delete its
    /// assignment entries.
    pub async fn complete(&self, store: &SharedMemoryStore, pool_id: &str, item_id: &str) -> Result<()> {
        if let Some(mut pool) = self.load(store, pool_id).await? {
            pool.in_progress.retain(|item| item.id != item_id);
            let entry = MemoryEntry::new(EntryKind::WorkPool, serde_json::to_value(&pool)?)
                .with_id(Self::pool_entry_id(pool_id))
                .in_namespace(WORK_NAMESPACE)
                .with_tags(vec!["work-pool".to_string(), pool_id.to_string()]);
            store.store(entry).await?;
        }
        for assignment in self.assignments_for(store, pool_id, item_id).await? {
            store.delete(&assignment.entry_id).await?;
        }
        Ok(())
    }
}

impl Default for WorkPoolCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
