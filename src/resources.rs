//! Resource allocation over the shared memory store.
//!
//! Allocations are plain store entries; there is no lock server. A racing
//! exclusive request writes its grant, re-reads every live grant for the
//! resource, and keeps it only if it ordered first (earliest `acquired_at`,
//! then lexically smallest task id). Losers delete their write, so exactly
//! one exclusive holder survives any interleaving.
//!
//! Requirement `priority` is a scheduling hint only. It never affects who
//! wins acquisition and never revokes a granted allocation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::memory::{EntryId, EntryKind, MemoryEntry, QueryFilter, SharedMemoryStore};
use crate::task::TaskId;

/// Namespace holding allocation entries.
pub const RESOURCE_NAMESPACE: &str = "resources";

/// A resource a task needs before it can be assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    /// The resource being requested.
    pub resource_id: String,
    /// Resource kind ("database", "gpu", "api-quota", ...).
    pub kind: String,
    /// How much of it.
    pub amount: f64,
    /// Unit for `amount`.
    pub unit: String,
    /// Whether the task needs the resource exclusively.
    pub exclusive: bool,
    /// Scheduling hint; never consulted during acquisition.
    pub priority: u8,
}

impl ResourceRequirement {
    /// Exclusive requirement on a resource.
    pub fn exclusive(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            kind: "generic".to_string(),
            amount: 1.0,
            unit: "unit".to_string(),
            exclusive: true,
            priority: 0,
        }
    }

    /// Shared requirement on a resource.
    pub fn shared(resource_id: impl Into<String>) -> Self {
        Self {
            exclusive: false,
            ..Self::exclusive(resource_id)
        }
    }

    /// Set the resource kind.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Set the amount and unit.
    pub fn with_amount(mut self, amount: f64, unit: impl Into<String>) -> Self {
        self.amount = amount;
        self.unit = unit.into();
        self
    }

    /// Set the scheduling hint.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// A granted allocation, as stored in entry content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    /// The allocated resource.
    pub resource_id: String,
    /// The holding task.
    pub owner: TaskId,
    /// Whether the grant is exclusive.
    pub exclusive: bool,
    /// When the grant was made.
    pub acquired_at: DateTime<Utc>,
    /// When the grant lapses on its own, if ever.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Result of an allocation request.
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationOutcome {
    /// The resource is granted.
    Granted(ResourceAllocation),
    /// The resource is held; retry after a release or expiry.
    Denied {
        /// The winning holder, when one is identifiable.
        holder: Option<TaskId>,
    },
}

impl AllocationOutcome {
    /// Whether the request was granted.
    pub fn is_granted(&self) -> bool {
        matches!(self, AllocationOutcome::Granted(_))
    }
}

/// Allocator configuration.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Cap on concurrent shared holders per resource (None = unbounded).
    pub max_concurrent: Option<usize>,
    /// TTL applied to allocation entries so abandoned grants age out.
    pub allocation_ttl: Option<Duration>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            allocation_ttl: Some(Duration::from_secs(300)),
        }
    }
}

/// Grants and releases resource claims through the store.
pub struct ResourceAllocator {
    config: AllocatorConfig,
}

impl ResourceAllocator {
    /// Create an allocator with default configuration.
    pub fn new() -> Self {
        Self {
            config: AllocatorConfig::default(),
        }
    }

    /// Create an allocator with custom configuration.
    pub fn with_config(config: AllocatorConfig) -> Self {
        Self { config }
    }

    /// Deterministic entry id for a (resource, task) grant, so a repeated
    /// request by the same task overwrites rather than duplicates.
    fn entry_id(resource_id: &str, task_id: &TaskId) -> EntryId {
        EntryId::named(format!("alloc-{}-{}", resource_id, task_id))
    }

    /// Request an allocation for a task.
    ///
    /// Exclusive: denied while any live grant exists; racing writers are
    /// resolved by the write-then-reread protocol described at module level.
    /// Shared: denied only by a live exclusive holder or the optional
    /// `max_concurrent` cap, judged with the same earliest-first ordering.
    pub async fn request(
        &self,
        store: &SharedMemoryStore,
        task_id: &TaskId,
        requirement: &ResourceRequirement,
    ) -> Result<AllocationOutcome> {
        let existing = self.live_allocations(store, &requirement.resource_id).await?;

        // Fast-path denial before writing anything
        if let Some(holder) = existing.iter().find(|a| a.exclusive && a.owner != *task_id) {
            return Ok(AllocationOutcome::Denied {
                holder: Some(holder.owner.clone()),
            });
        }
        if requirement.exclusive {
            if let Some(holder) = existing.iter().find(|a| a.owner != *task_id) {
                return Ok(AllocationOutcome::Denied {
                    holder: Some(holder.owner.clone()),
                });
            }
        }

        let allocation = ResourceAllocation {
            resource_id: requirement.resource_id.clone(),
            owner: task_id.clone(),
            exclusive: requirement.exclusive,
            acquired_at: Utc::now(),
            expires_at: self.config.allocation_ttl.map(|ttl| {
                Utc::now() + chrono::Duration::milliseconds(ttl.as_millis() as i64)
            }),
        };

        let mut entry = MemoryEntry::new(EntryKind::Allocation, serde_json::to_value(&allocation)?)
            .with_id(Self::entry_id(&requirement.resource_id, task_id))
            .in_namespace(RESOURCE_NAMESPACE)
            .with_tags(vec!["allocation".to_string(), requirement.resource_id.clone()]);
        if let Some(ttl) = self.config.allocation_ttl {
            entry = entry.with_ttl(ttl);
        }
        store.store(entry).await?;

        // Re-read to learn whether the write won; the store's ordering plus
        // the (acquired_at, task id) sort is the only arbiter here.
        let mut after = self.live_allocations(store, &requirement.resource_id).await?;
        after.sort_by(|a, b| a.acquired_at.cmp(&b.acquired_at).then_with(|| a.owner.cmp(&b.owner)));

        let won = if requirement.exclusive {
            after.first().is_some_and(|a| a.owner == *task_id)
        } else {
            let exclusive_holder = after.iter().find(|a| a.exclusive && a.owner != *task_id);
            let within_cap = match self.config.max_concurrent {
                Some(cap) => after
                    .iter()
                    .take(cap)
                    .any(|a| a.owner == *task_id),
                None => true,
            };
            exclusive_holder.is_none() && within_cap
        };

        if won {
            Ok(AllocationOutcome::Granted(allocation))
        } else {
            // Lost the race: withdraw the write so the winner stands alone
            store
                .delete(&Self::entry_id(&requirement.resource_id, task_id))
                .await?;
            let holder = after.iter().find(|a| a.owner != *task_id).map(|a| a.owner.clone());
            log::debug!(
                "task {} lost allocation race for {} to {:?}",
                task_id,
                requirement.resource_id,
                holder
            );
            Ok(AllocationOutcome::Denied { holder })
        }
    }

    /// Release a task's grant on a resource, returning whether one existed.
    pub async fn release(&self, store: &SharedMemoryStore, task_id: &TaskId, resource_id: &str) -> Result<bool> {
        store.delete(&Self::entry_id(resource_id, task_id)).await
    }

    /// Release every grant held by a task. Returns the released resource ids.
    pub async fn release_all(&self, store: &SharedMemoryStore, task_id: &TaskId) -> Result<Vec<String>> {
        let filter = QueryFilter::new()
            .namespace(RESOURCE_NAMESPACE)
            .kind(EntryKind::Allocation);
        let mut released = Vec::new();
        for entry in store.query(&filter).await? {
            let Ok(allocation) = serde_json::from_value::<ResourceAllocation>(entry.content.clone()) else {
                continue;
            };
            if allocation.owner == *task_id {
                store.delete(&entry.id).await?;
                released.push(allocation.resource_id);
            }
        }
        Ok(released)
    }

    /// Current live holders of a resource, winner first.
    pub async fn status(&self, store: &SharedMemoryStore, resource_id: &str) -> Result<Vec<ResourceAllocation>> {
        let mut holders = self.live_allocations(store, resource_id).await?;
        holders.sort_by(|a, b| a.acquired_at.cmp(&b.acquired_at).then_with(|| a.owner.cmp(&b.owner)));
        Ok(holders)
    }

    async fn live_allocations(&self, store: &SharedMemoryStore, resource_id: &str) -> Result<Vec<ResourceAllocation>> {
        let filter = QueryFilter::new()
            .namespace(RESOURCE_NAMESPACE)
            .kind(EntryKind::Allocation)
            .tag(resource_id);
        let mut allocations = Vec::new();
        for entry in store.query(&filter).await? {
            match serde_json::from_value::<ResourceAllocation>(entry.content.clone()) {
                Ok(allocation) => allocations.push(allocation),
                Err(e) => log::warn!("skipping malformed allocation entry {}: {}", entry.id, e),
            }
        }
        Ok(allocations)
    }
}

impl Default for ResourceAllocator {
    fn default() -> Self {
        Self::new()
    }
}
