//! Abstract backend trait and the handles the lifecycle manager passes around.
//!
//! The core only ever calls [`Backend::init`] and [`Backend::fini`].  The
//! kind-specific data operations live on the concrete types and are reached
//! through [`BackendHandle::downcast_ref`].

use std::any::Any;
use std::fmt;

use crate::config::{BackendSpec, StorageKind};

/// Where a backend runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Linked into the client process.
    Client,
    /// Hosted by a server process that does the real I/O.
    Server,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle contract of a storage backend.
pub trait Backend: Send + Sync + 'static {
    /// Prepare the backend to serve requests from `path`.
    fn init(&self, path: &str) -> anyhow::Result<()>;

    /// Release everything `init` acquired.  Called at most once, and only
    /// after a successful `init`.
    fn fini(&self) -> anyhow::Result<()>;

    /// Access to the concrete type for kind-specific operations.
    fn as_any(&self) -> &dyn Any;
}

/// A freshly resolved backend, tagged with the storage kind it serves.
///
/// The role it was resolved for is tracked by the accompanying
/// [`super::ModuleHandle`].
pub enum BackendHandle {
    Object(Box<dyn Backend>),
    KeyValue(Box<dyn Backend>),
    Db(Box<dyn Backend>),
}

impl BackendHandle {
    /// Wrap `backend` in the variant for `kind`.
    pub fn new(kind: StorageKind, backend: Box<dyn Backend>) -> Self {
        match kind {
            StorageKind::Object => BackendHandle::Object(backend),
            StorageKind::KeyValue => BackendHandle::KeyValue(backend),
            StorageKind::Db => BackendHandle::Db(backend),
        }
    }

    pub fn kind(&self) -> StorageKind {
        match self {
            BackendHandle::Object(_) => StorageKind::Object,
            BackendHandle::KeyValue(_) => StorageKind::KeyValue,
            BackendHandle::Db(_) => StorageKind::Db,
        }
    }

    pub fn backend(&self) -> &dyn Backend {
        match self {
            BackendHandle::Object(b) | BackendHandle::KeyValue(b) | BackendHandle::Db(b) => {
                b.as_ref()
            }
        }
    }

    /// Downcast to the concrete backend type.
    pub fn downcast_ref<T: Backend>(&self) -> Option<&T> {
        self.backend().as_any().downcast_ref::<T>()
    }
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BackendHandle").field(&self.kind()).finish()
    }
}

/// Everything needed to resolve one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub kind: StorageKind,
    pub role: Role,
    /// Name of the backend implementation.
    pub backend: String,
    /// Sub-variant of the implementation.
    pub component: String,
    /// Tier index; `None` for the db kind.
    pub tier: Option<usize>,
}

impl BackendDescriptor {
    /// Describe tier `tier` of `kind` as configured by `spec`.
    pub fn for_spec(kind: StorageKind, tier: Option<usize>, role: Role, spec: &BackendSpec) -> Self {
        Self {
            kind,
            role,
            backend: spec.backend.clone(),
            component: spec.component.clone(),
            tier: if kind.is_tiered() { tier } else { None },
        }
    }

    /// Module name following the `{kind}-{role}-{backend}` convention.
    pub fn module_name(&self) -> String {
        module_name(self.kind, self.role, &self.backend)
    }
}

pub(crate) fn module_name(kind: StorageKind, role: Role, backend: &str) -> String {
    format!("{kind}-{role}-{backend}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    #[test]
    fn test_module_name_convention() {
        let spec = BackendSpec {
            backend: "posix".to_string(),
            component: "server".to_string(),
            path: "/tmp".to_string(),
        };
        let desc = BackendDescriptor::for_spec(StorageKind::Object, Some(1), Role::Server, &spec);
        assert_eq!(desc.module_name(), "object-server-posix");
        assert_eq!(desc.tier, Some(1));

        let desc = BackendDescriptor::for_spec(StorageKind::Db, Some(0), Role::Client, &spec);
        assert_eq!(desc.module_name(), "db-client-posix");
        assert_eq!(desc.tier, None);
    }

    #[test]
    fn test_handle_kind_and_downcast() {
        let handle = BackendHandle::new(StorageKind::KeyValue, Box::new(MemoryBackend::new()));
        assert_eq!(handle.kind(), StorageKind::KeyValue);
        assert!(handle.downcast_ref::<MemoryBackend>().is_some());
        assert_eq!(format!("{handle:?}"), "BackendHandle(KeyValue)");
    }
}
