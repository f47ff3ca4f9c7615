use async_trait::async_trait;

use crate::adaptor::memory::store::MemoryStore;
use crate::client::{Client, Closer, Session};
use crate::error::FerryResult;

/// Client handing out sessions over a shared [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryClient {
    store: MemoryStore,
}

impl MemoryClient {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }
}

impl Client for MemoryClient {
    type Session = MemorySession;

    async fn connect(&self) -> FerryResult<MemorySession> {
        Ok(MemorySession {
            store: self.store.clone(),
        })
    }
}

/// Session over a [`MemoryStore`]. Closing it is counted by the store.
#[derive(Debug)]
pub struct MemorySession {
    store: MemoryStore,
}

impl MemorySession {
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

#[async_trait]
impl Closer for MemorySession {
    async fn close(&mut self) {
        self.store.session_closed();
    }
}

impl Session for MemorySession {
    fn closer(&mut self) -> Option<&mut dyn Closer> {
        Some(self)
    }
}
