//! Shared memory store: the one mutable resource every agent can see.
//!
//! Entries are namespaced, tagged, optionally expiring records. The store
//! offers no multi-entry atomicity and no compare-and-swap; concurrent
//! writers are reconciled by a deterministic conflict policy, and every
//! coordination protocol built on top re-reads after writing to learn
//! whether it won. Query results are ordered by `created_at` ascending with
//! a lexical id tie-break — the tie-break rules elsewhere depend on this.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{InMemoryBackend, MemoryBackend};
use crate::error::Result;

/// Unique identifier for an agent process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    /// Create an agent id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unique identifier for a memory entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub String);

impl EntryId {
    /// Generate a new entry ID using UUID v7 (time-ordered).
    pub fn new() -> Self {
        Self(format!("entry-{}", Uuid::now_v7()))
    }

    /// Create an entry id from a known string (well-known singleton entries).
    pub fn named(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for EntryId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Kinds of entries in the store.
///
/// Locks, claims, elections, and work pools are all plain entries
/// distinguished by kind and tags; they have no storage of their own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    /// Shared knowledge or scratch data.
    Knowledge,
    /// A lock attempt on a resource.
    Lock,
    /// A resource allocation grant.
    Allocation,
    /// A leader-election candidacy.
    Candidacy,
    /// The authoritative leadership record for a term.
    Leadership,
    /// The shared work pool.
    WorkPool,
    /// An agent's claim on a stolen work item.
    WorkAssignment,
    /// A running task's liveness claim.
    TaskClaim,
    /// Audit record of a stale claim being taken over.
    TaskReclaim,
    /// Anything else.
    Custom(String),
}

/// How concurrent writes to the same entry id are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// The write with the newer `updated_at` survives; an exact tie keeps
    /// the incumbent.
    LastWriteWins,
    /// Numeric `metadata.priority` (missing = 0) decides; higher wins. Equal
    /// priority falls back to newer `updated_at`, then the incumbent. The
    /// loser's tags are merged into the winner.
    PriorityMerge,
}

/// A single entry in the shared memory store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Unique identifier.
    pub id: EntryId,
    /// Namespace the entry lives in.
    pub namespace: String,
    /// Entry kind.
    pub kind: EntryKind,
    /// Owning agent, if any.
    pub agent_id: Option<AgentId>,
    /// Arbitrary structured payload.
    pub content: serde_json::Value,
    /// Tags, kept sorted and deduplicated.
    pub tags: Vec<String>,
    /// Arbitrary metadata (consulted by the priority-merge policy).
    pub metadata: serde_json::Value,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// When the entry was last written.
    pub updated_at: DateTime<Utc>,
    /// Time-to-live in milliseconds, if the entry expires.
    pub ttl_ms: Option<u64>,
    /// When the entry becomes logically absent.
    pub expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    /// Create an entry in the default namespace.
    pub fn new(kind: EntryKind, content: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: EntryId::new(),
            namespace: "default".to_string(),
            kind,
            agent_id: None,
            content,
            tags: Vec::new(),
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
            ttl_ms: None,
            expires_at: None,
        }
    }

    /// Use a specific id (well-known singleton entries like a work pool).
    pub fn with_id(mut self, id: EntryId) -> Self {
        self.id = id;
        self
    }

    /// Set the namespace.
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the owning agent.
    pub fn owned_by(mut self, agent: AgentId) -> Self {
        self.agent_id = Some(agent);
        self
    }

    /// Add tags (stored sorted and deduplicated).
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags.extend(tags.into_iter().map(|t| t.into()));
        self.tags.sort();
        self.tags.dedup();
        self
    }

    /// Set the metadata payload.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Give the entry a time-to-live from now.
    pub fn with_ttl(mut self, ttl: std::time::Duration) -> Self {
        let ttl_ms = ttl.as_millis() as u64;
        self.ttl_ms = Some(ttl_ms);
        self.expires_at = Some(self.created_at + Duration::milliseconds(ttl_ms as i64));
        self
    }

    /// Whether the entry is logically absent at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|e| e <= now)
    }

    /// The priority used by [`ConflictPolicy::PriorityMerge`] (missing = 0).
    pub fn merge_priority(&self) -> i64 {
        self.metadata.get("priority").and_then(|p| p.as_i64()).unwrap_or(0)
    }
}

/// Filter for querying the store.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// Restrict to a namespace.
    pub namespace: Option<String>,
    /// Restrict to these kinds (empty = all).
    pub kinds: Vec<EntryKind>,
    /// Entry must carry every one of these tags.
    pub tags: Vec<String>,
    /// Restrict to entries owned by this agent.
    pub agent_id: Option<AgentId>,
    /// Substring match over the serialized content.
    pub content_match: Option<String>,
    /// Skip this many results.
    pub offset: usize,
    /// Cap the result count.
    pub limit: Option<usize>,
}

impl QueryFilter {
    /// Empty filter matching everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to a namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Restrict to a kind.
    pub fn kind(mut self, kind: EntryKind) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Require a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Restrict to an owning agent.
    pub fn agent(mut self, agent: AgentId) -> Self {
        self.agent_id = Some(agent);
        self
    }

    /// Substring match over serialized content.
    pub fn content_match(mut self, needle: impl Into<String>) -> Self {
        self.content_match = Some(needle.into());
        self
    }

    /// Skip this many results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Cap the result count.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &MemoryEntry) -> bool {
        if let Some(ns) = &self.namespace {
            if &entry.namespace != ns {
                return false;
            }
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&entry.kind) {
            return false;
        }
        if !self.tags.iter().all(|t| entry.tags.contains(t)) {
            return false;
        }
        if let Some(agent) = &self.agent_id {
            if entry.agent_id.as_ref() != Some(agent) {
                return false;
            }
        }
        if let Some(needle) = &self.content_match {
            let serialized = entry.content.to_string();
            if !serialized.contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Partial update for an entry.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    /// Replace the content.
    pub content: Option<serde_json::Value>,
    /// Replace the tags.
    pub tags: Option<Vec<String>>,
    /// Replace the metadata.
    pub metadata: Option<serde_json::Value>,
    /// Reset the time-to-live from now.
    pub ttl: Option<std::time::Duration>,
}

impl EntryPatch {
    /// Empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the content.
    pub fn content(mut self, content: serde_json::Value) -> Self {
        self.content = Some(content);
        self
    }

    /// Replace the tags.
    pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = Some(tags.into_iter().map(|t| t.into()).collect());
        self
    }

    /// Replace the metadata.
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Reset the time-to-live from now.
    pub fn ttl(mut self, ttl: std::time::Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Statistics about the store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    /// Live (non-expired) entries.
    pub live_entries: usize,
    /// Entries past their expiry awaiting the sweep.
    pub expired_entries: usize,
    /// Live entries per namespace.
    pub by_namespace: HashMap<String, usize>,
}

/// The shared memory store.
///
/// This is coordination under eventual consistency, not linearizability:
/// there is a per-entry total order (`created_at`, then lexical id) but no
/// commit order across entries written as one logical operation. Callers
/// performing read-modify-write sequences must re-read after writing to
/// confirm their action won.
pub struct SharedMemoryStore {
    backend: Arc<dyn MemoryBackend>,
    policy: ConflictPolicy,
}

impl SharedMemoryStore {
    /// Create a store over the in-memory backend with last-write-wins.
    pub fn new() -> Self {
        Self {
            backend: Arc::new(InMemoryBackend::new()),
            policy: ConflictPolicy::LastWriteWins,
        }
    }

    /// Create a store over a specific backend.
    pub fn with_backend(backend: Arc<dyn MemoryBackend>) -> Self {
        Self {
            backend,
            policy: ConflictPolicy::LastWriteWins,
        }
    }

    /// Set the conflict-resolution policy.
    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The configured conflict policy.
    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Store an entry.
    ///
    /// Refreshes `updated_at`. Writing to an existing id is not an error: the
    /// configured [`ConflictPolicy`] picks the survivor deterministically.
    pub async fn store(&self, mut entry: MemoryEntry) -> Result<EntryId> {
        entry.updated_at = Utc::now();
        if let Some(ttl_ms) = entry.ttl_ms {
            if entry.expires_at.is_none() {
                entry.expires_at = Some(entry.created_at + Duration::milliseconds(ttl_ms as i64));
            }
        }

        let id = entry.id.clone();
        let incumbent = self.backend.fetch(&id).await?;
        let resolved = match incumbent {
            Some(existing) if !existing.is_expired_at(Utc::now()) => {
                let winner = resolve_conflict(self.policy, existing, entry);
                log::debug!("conflict on {} resolved by {:?}", id, self.policy);
                winner
            }
            _ => entry,
        };

        self.backend.insert(resolved).await?;
        Ok(id)
    }

    /// Retrieve an entry by id. Expired entries are absent even before the
    /// maintenance sweep deletes them.
    pub async fn retrieve(&self, id: &EntryId) -> Result<Option<MemoryEntry>> {
        let entry = self.backend.fetch(id).await?;
        Ok(entry.filter(|e| !e.is_expired_at(Utc::now())))
    }

    /// Query live entries.
    ///
    /// Results are ordered by `created_at` ascending, ties broken by lexical
    /// id. Every earliest-wins rule in the coordination layer leans on this.
    pub async fn query(&self, filter: &QueryFilter) -> Result<Vec<MemoryEntry>> {
        let now = Utc::now();
        let mut results: Vec<MemoryEntry> = self
            .backend
            .scan()
            .await?
            .into_iter()
            .filter(|e| !e.is_expired_at(now) && filter.matches(e))
            .collect();

        results.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let results: Vec<MemoryEntry> = results.into_iter().skip(filter.offset).collect();
        Ok(match filter.limit {
            Some(limit) => results.into_iter().take(limit).collect(),
            None => results,
        })
    }

    /// Apply a partial update to an entry.
    ///
    /// A missing (or expired) id is a no-op returning `Ok(None)`, not a
    /// failure: under concurrent maintenance an update can always lose the
    /// race with an expiry sweep.
    pub async fn update(&self, id: &EntryId, patch: EntryPatch) -> Result<Option<MemoryEntry>> {
        let now = Utc::now();
        let Some(mut entry) = self.backend.fetch(id).await? else {
            return Ok(None);
        };
        if entry.is_expired_at(now) {
            return Ok(None);
        }

        if let Some(content) = patch.content {
            entry.content = content;
        }
        if let Some(mut tags) = patch.tags {
            tags.sort();
            tags.dedup();
            entry.tags = tags;
        }
        if let Some(metadata) = patch.metadata {
            entry.metadata = metadata;
        }
        if let Some(ttl) = patch.ttl {
            let ttl_ms = ttl.as_millis() as u64;
            entry.ttl_ms = Some(ttl_ms);
            entry.expires_at = Some(now + Duration::milliseconds(ttl_ms as i64));
        }
        entry.updated_at = now;

        self.backend.insert(entry.clone()).await?;
        Ok(Some(entry))
    }

    /// Delete an entry, returning whether it existed.
    pub async fn delete(&self, id: &EntryId) -> Result<bool> {
        self.backend.remove(id).await
    }

    /// Sweep entries whose expiry has passed. Returns how many were removed.
    ///
    /// Idempotent: a second run with no elapsed time removes nothing.
    /// Designed to run on a timer; it holds no lock across the removals.
    pub async fn perform_maintenance(&self) -> Result<usize> {
        let now = Utc::now();
        let expired: Vec<EntryId> = self
            .backend
            .scan()
            .await?
            .into_iter()
            .filter(|e| e.is_expired_at(now))
            .map(|e| e.id)
            .collect();

        let mut removed = 0;
        for id in expired {
            if self.backend.remove(&id).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            log::debug!("maintenance removed {} expired entries", removed);
        }
        Ok(removed)
    }

    /// Count live entries in a namespace.
    pub async fn count(&self, namespace: &str) -> Result<usize> {
        let filter = QueryFilter::new().namespace(namespace);
        Ok(self.query(&filter).await?.len())
    }

    /// Statistics over the whole store.
    pub async fn stats(&self) -> Result<MemoryStats> {
        let now = Utc::now();
        let mut stats = MemoryStats::default();
        for entry in self.backend.scan().await? {
            if entry.is_expired_at(now) {
                stats.expired_entries += 1;
            } else {
                stats.live_entries += 1;
                *stats.by_namespace.entry(entry.namespace.clone()).or_insert(0) += 1;
            }
        }
        Ok(stats)
    }
}

impl Default for SharedMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick the surviving entry for a same-id write. Pure and deterministic.
fn resolve_conflict(policy: ConflictPolicy, incumbent: MemoryEntry, incoming: MemoryEntry) -> MemoryEntry {
    match policy {
        ConflictPolicy::LastWriteWins => {
            if incoming.updated_at > incumbent.updated_at {
                incoming
            } else {
                incumbent
            }
        }
        ConflictPolicy::PriorityMerge => {
            let (mut winner, loser) = match incoming.merge_priority().cmp(&incumbent.merge_priority()) {
                std::cmp::Ordering::Greater => (incoming, incumbent),
                std::cmp::Ordering::Less => (incumbent, incoming),
                std::cmp::Ordering::Equal => {
                    if incoming.updated_at > incumbent.updated_at {
                        (incoming, incumbent)
                    } else {
                        (incumbent, incoming)
                    }
                }
            };
            winner.tags.extend(loser.tags);
            winner.tags.sort();
            winner.tags.dedup();
            winner
        }
    }
}
