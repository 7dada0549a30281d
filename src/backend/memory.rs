//! In-process backend for every storage kind.
//!
//! Keeps its data in a hash map guarded by a read-write lock.  Nothing is
//! persisted: `fini` drops everything.  Useful for tests and for client-side
//! tiers that only cache.

use std::any::Any;
use std::collections::HashMap;

use parking_lot::RwLock;

use super::backend::{Backend, BackendHandle};
use super::registry::BackendModule;
use crate::config::StorageKind;

/// Name under which the modules are registered.
pub const NAME: &str = "memory";

#[derive(Debug, Default)]
struct Inner {
    path: Option<String>,
    entries: HashMap<String, Vec<u8>>,
}

/// In-memory storage backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: RwLock<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path the backend was initialized with.
    pub fn path(&self) -> Option<String> {
        self.inner.read().path.clone()
    }

    pub fn put(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        if inner.path.is_none() {
            anyhow::bail!("memory backend is not initialized");
        }
        inner.entries.insert(key.to_string(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.read().entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Backend for MemoryBackend {
    fn init(&self, path: &str) -> anyhow::Result<()> {
        if path.is_empty() {
            anyhow::bail!("memory backend needs a non-empty path");
        }
        self.inner.write().path = Some(path.to_string());
        Ok(())
    }

    fn fini(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.write();
        inner.path = None;
        inner.entries.clear();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The `memory` module for `kind`.  Accepts any component.
pub fn module(kind: StorageKind) -> BackendModule {
    BackendModule::new(kind, NAME)
        .with_entry(move |_component: &str| Ok(BackendHandle::new(kind, Box::new(MemoryBackend::new()))))
}
