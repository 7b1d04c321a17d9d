use std::sync::Arc;

use parking_lot::RwLock;

/// Tab-scoped holder of the server-issued session identifier.
///
/// Implementations are synchronous: the cache is read right before every
/// request and written right after every reply.
pub trait SessionStore: Send + Sync {
    fn get(&self) -> Option<String>;

    fn set(&self, session_id: String);

    fn clear(&self);
}

/// In-memory store that lives as long as the client process.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    current: RwLock<Option<String>>,
}

impl MemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self) -> Option<String> {
        self.current.read().clone()
    }

    fn set(&self, session_id: String) {
        *self.current.write() = Some(session_id);
    }

    fn clear(&self) {
        self.current.write().take();
    }
}
