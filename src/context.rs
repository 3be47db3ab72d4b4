//! Explicit coordination context.
//!
//! Every scheduler tick and agent-facing call receives the context instead
//! of reaching for global managers; tests can build as many independent
//! contexts as they like.

use std::sync::Arc;

use crate::coordination::EventBus;
use crate::memory::SharedMemoryStore;
use crate::resources::ResourceAllocator;
use crate::task_graph::TaskGraph;

/// The shared collaborators threaded through coordination calls.
#[derive(Clone)]
pub struct CoordinationContext {
    /// The shared memory store.
    pub store: Arc<SharedMemoryStore>,
    /// The task graph manager.
    pub graph: Arc<TaskGraph>,
    /// The resource allocator.
    pub allocator: Arc<ResourceAllocator>,
    /// Event bus for observers.
    pub events: Arc<EventBus>,
}

impl CoordinationContext {
    /// Context with default collaborators (in-memory store).
    pub fn new() -> Self {
        Self {
            store: Arc::new(SharedMemoryStore::new()),
            graph: Arc::new(TaskGraph::new()),
            allocator: Arc::new(ResourceAllocator::new()),
            events: Arc::new(EventBus::new()),
        }
    }

    /// Swap in a specific store (custom backend or conflict policy).
    pub fn with_store(mut self, store: SharedMemoryStore) -> Self {
        self.store = Arc::new(store);
        self
    }

    /// Swap in a specific allocator.
    pub fn with_allocator(mut self, allocator: ResourceAllocator) -> Self {
        self.allocator = Arc::new(allocator);
        self
    }
}

impl Default for CoordinationContext {
    fn default() -> Self {
        Self::new()
    }
}
