//! Local filesystem object backend.
//!
//! Objects live as files under a root directory.  `init` creates the root
//! and `fini` forgets it.
//! Only the lifecycle is handled here; the object I/O path belongs to the
//! data layer and reaches this type through [`PosixBackend::root`].

use std::any::Any;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use super::backend::{Backend, BackendHandle};
use super::registry::BackendModule;
use crate::config::StorageKind;

/// Name under which the module is registered.
pub const NAME: &str = "posix";

/// Components this backend accepts.
const COMPONENTS: [&str; 2] = ["client", "server"];

/// Stores objects on the local filesystem.
#[derive(Debug, Default)]
pub struct PosixBackend {
    /// Root directory, set by `init`.
    root: RwLock<Option<PathBuf>>,
}

impl PosixBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root directory, if initialized.
    pub fn root(&self) -> Option<PathBuf> {
        self.root.read().clone()
    }

    /// Resolve an object key to a file below the root.
    ///
    /// Keys containing `..` components are rejected.
    pub fn resolve(&self, key: &str) -> anyhow::Result<PathBuf> {
        let root = self
            .root()
            .ok_or_else(|| anyhow::anyhow!("posix backend is not initialized"))?;
        for component in Path::new(key).components() {
            if let std::path::Component::ParentDir = component {
                anyhow::bail!("Path traversal detected in object key: {}", key);
            }
        }
        Ok(root.join(key.trim_start_matches('/')))
    }
}

impl Backend for PosixBackend {
    fn init(&self, path: &str) -> anyhow::Result<()> {
        let root = PathBuf::from(path);
        std::fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "posix backend initialized");
        *self.root.write() = Some(root);
        Ok(())
    }

    fn fini(&self) -> anyhow::Result<()> {
        if self.root.write().take().is_none() {
            anyhow::bail!("posix backend closed before init");
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn entry(component: &str) -> anyhow::Result<BackendHandle> {
    if !COMPONENTS.contains(&component) {
        anyhow::bail!("unknown component, expected one of {:?}", COMPONENTS);
    }
    Ok(BackendHandle::new(
        StorageKind::Object,
        Box::new(PosixBackend::new()),
    ))
}

/// The `posix` object module, with client and server entry points.
pub fn module() -> BackendModule {
    BackendModule::new(StorageKind::Object, NAME).with_entry(entry)
}
