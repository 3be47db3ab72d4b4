//! Distributed locks as store conventions.
//!
//! There is no lock server. A lock is "held" iff a non-expired `Lock` entry
//! for the resource exists; among racing attempts the holder is the entry
//! with the earliest `created_at` (lexical id tie-break). A loser deletes
//! its attempt, backs off, and retries; the TTL guarantees a crashed holder
//! eventually releases.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::error::Result;
use crate::memory::{AgentId, EntryId, EntryKind, MemoryEntry, QueryFilter, SharedMemoryStore};

/// Namespace holding lock entries.
pub const LOCK_NAMESPACE: &str = "coordination";

/// Content of a lock attempt entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockAttempt {
    /// The locked resource.
    pub resource: String,
    /// The attempting agent.
    pub agent: AgentId,
    /// When the attempt was made.
    pub attempted_at: DateTime<Utc>,
    /// When the lock lapses if not released.
    pub expires_at: DateTime<Utc>,
}

/// Result of a lock acquisition.
#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
    /// This agent holds the lock.
    Acquired(LockAttempt),
    /// Another agent ordered first.
    Blocked {
        /// The current holder.
        holder: AgentId,
    },
    /// Retries exhausted without acquiring.
    Timeout,
}

impl LockOutcome {
    /// Whether the lock was acquired.
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired(_))
    }
}

/// Acquires and releases locks through the store.
pub struct LockCoordinator {
    default_ttl: Duration,
}

impl LockCoordinator {
    /// Create a coordinator with a 30s default TTL.
    pub fn new() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
        }
    }

    /// Create a coordinator with a custom default TTL.
    pub fn with_ttl(default_ttl: Duration) -> Self {
        Self { default_ttl }
    }

    /// Deterministic entry id per (resource, agent): re-acquiring refreshes
    /// instead of stacking attempts.
    fn entry_id(resource: &str, agent: &AgentId) -> EntryId {
        EntryId::named(format!("lock-{}-{}", resource, agent))
    }

    /// Attempt to acquire a lock once.
    ///
    /// Writes an attempt entry, then re-reads every live attempt for the
    /// resource; the earliest wins. An agent that already holds the lock
    /// re-acquires without changing its position.
    pub async fn acquire(
        &self,
        store: &SharedMemoryStore,
        resource: &str,
        agent: &AgentId,
        ttl: Option<Duration>,
    ) -> Result<LockOutcome> {
        let ttl = ttl.unwrap_or(self.default_ttl);

        // Already held by this agent: refresh nothing, just confirm
        if let Some(holder) = self.holder(store, resource).await? {
            if holder == *agent {
                let attempt = self.own_attempt(store, resource, agent).await?;
                if let Some(attempt) = attempt {
                    return Ok(LockOutcome::Acquired(attempt));
                }
            } else {
                return Ok(LockOutcome::Blocked { holder });
            }
        }

        let now = Utc::now();
        let attempt = LockAttempt {
            resource: resource.to_string(),
            agent: agent.clone(),
            attempted_at: now,
            expires_at: now + chrono::Duration::milliseconds(ttl.as_millis() as i64),
        };
        let entry = MemoryEntry::new(EntryKind::Lock, serde_json::to_value(&attempt)?)
            .with_id(Self::entry_id(resource, agent))
            .in_namespace(LOCK_NAMESPACE)
            .owned_by(agent.clone())
            .with_tags(vec!["lock".to_string(), resource.to_string()])
            .with_ttl(ttl);
        store.store(entry).await?;

        // Re-read to learn whether the write ordered first
        match self.holder(store, resource).await? {
            Some(holder) if holder == *agent => Ok(LockOutcome::Acquired(attempt)),
            Some(holder) => {
                store.delete(&Self::entry_id(resource, agent)).await?;
                log::debug!("agent {} lost lock race for {} to {}", agent, resource, holder);
                Ok(LockOutcome::Blocked { holder })
            }
            // Swept between write and re-read; treat as blocked and retry
            None => Ok(LockOutcome::Blocked {
                holder: agent.clone(),
            }),
        }
    }

    /// Acquire with backoff, giving up after `attempts` tries.
    pub async fn acquire_with_retry(
        &self,
        store: &SharedMemoryStore,
        resource: &str,
        agent: &AgentId,
        ttl: Option<Duration>,
        attempts: u32,
        delay: Duration,
    ) -> Result<LockOutcome> {
        for attempt in 0..attempts {
            match self.acquire(store, resource, agent, ttl).await? {
                LockOutcome::Acquired(lock) => return Ok(LockOutcome::Acquired(lock)),
                LockOutcome::Blocked { .. } if attempt + 1 < attempts => sleep(delay).await,
                LockOutcome::Blocked { .. } => {}
                LockOutcome::Timeout => {}
            }
        }
        Ok(LockOutcome::Timeout)
    }

    /// Release a lock held by an agent, returning whether it was held.
    pub async fn release(&self, store: &SharedMemoryStore, resource: &str, agent: &AgentId) -> Result<bool> {
        store.delete(&Self::entry_id(resource, agent)).await
    }

    /// The current holder, if the lock is held.
    pub async fn holder(&self, store: &SharedMemoryStore, resource: &str) -> Result<Option<AgentId>> {
        let attempts = self.live_attempts(store, resource).await?;
        Ok(attempts.first().map(|a| a.agent.clone()))
    }

    /// Whether the resource is currently locked.
    pub async fn is_held(&self, store: &SharedMemoryStore, resource: &str) -> Result<bool> {
        Ok(self.holder(store, resource).await?.is_some())
    }

    async fn own_attempt(
        &self,
        store: &SharedMemoryStore,
        resource: &str,
        agent: &AgentId,
    ) -> Result<Option<LockAttempt>> {
        let entry = store.retrieve(&Self::entry_id(resource, agent)).await?;
        Ok(match entry {
            Some(e) => serde_json::from_value(e.content).ok(),
            None => None,
        })
    }

    /// Live attempts for a resource, earliest first (the store's ordering).
    async fn live_attempts(&self, store: &SharedMemoryStore, resource: &str) -> Result<Vec<LockAttempt>> {
        let filter = QueryFilter::new()
            .namespace(LOCK_NAMESPACE)
            .kind(EntryKind::Lock)
            .tag("lock")
            .tag(resource);
        let mut attempts = Vec::new();
        for entry in store.query(&filter).await? {
            match serde_json::from_value::<LockAttempt>(entry.content.clone()) {
                Ok(attempt) => attempts.push(attempt),
                Err(e) => log::warn!("skipping malformed lock entry {}: {}", entry.id, e),
            }
        }
        Ok(attempts)
    }
}

impl Default for LockCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
