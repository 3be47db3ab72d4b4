//! Pluggable persistence backend for the shared memory store.
//!
//! The coordination layer never talks to a backend directly; it goes through
//! [`crate::memory::SharedMemoryStore`], which layers conflict resolution,
//! expiry, and query ordering on top of these four primitives. Backend choice
//! does not change coordination correctness.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::memory::{EntryId, MemoryEntry};

/// Storage primitives the shared memory store is built on.
///
/// Implementations provide plain CRUD plus a full scan; filtering, ordering,
/// and TTL interpretation live in the store. `conditional_insert` is an
/// optional extension point for backends that can offer an atomic
/// compare-and-write; the coordination protocols never rely on it.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Insert or replace an entry.
    async fn insert(&self, entry: MemoryEntry) -> Result<()>;

    /// Fetch an entry by id, expired or not.
    async fn fetch(&self, id: &EntryId) -> Result<Option<MemoryEntry>>;

    /// Remove an entry, returning whether it existed.
    async fn remove(&self, id: &EntryId) -> Result<bool>;

    /// Return all entries, in no particular order.
    async fn scan(&self) -> Result<Vec<MemoryEntry>>;

    /// Atomically insert `entry` iff the stored entry's `updated_at` equals
    /// `expected` (`None` = entry must not exist). Returns whether the write
    /// happened. Backends without atomic writes return `Error::Storage`.
    async fn conditional_insert(&self, _entry: MemoryEntry, _expected: Option<DateTime<Utc>>) -> Result<bool> {
        Err(Error::Storage("conditional writes not supported by this backend".to_string()))
    }
}

/// In-memory backend used by default and in tests.
#[derive(Default)]
pub struct InMemoryBackend {
    entries: Arc<Mutex<HashMap<EntryId, MemoryEntry>>>,
}

impl InMemoryBackend {
    /// Create an empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    async fn insert(&self, entry: MemoryEntry) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn fetch(&self, id: &EntryId) -> Result<Option<MemoryEntry>> {
        let entries = self.entries.lock().await;
        Ok(entries.get(id).cloned())
    }

    async fn remove(&self, id: &EntryId) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        Ok(entries.remove(id).is_some())
    }

    async fn scan(&self) -> Result<Vec<MemoryEntry>> {
        let entries = self.entries.lock().await;
        Ok(entries.values().cloned().collect())
    }

    async fn conditional_insert(&self, entry: MemoryEntry, expected: Option<DateTime<Utc>>) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let current = entries.get(&entry.id).map(|e| e.updated_at);
        if current == expected {
            entries.insert(entry.id.clone(), entry);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
