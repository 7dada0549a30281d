//! Backend module registry.
//!
//! A [`BackendModule`] plays the part of a loadable plugin: it carries an
//! ABI version and up to two entry points, one producing the client-side
//! variant of the backend and one producing the server-side variant.
//! [`BackendRegistry::resolve`] finds the module for a descriptor, checks
//! it, and calls the entry point selected by the descriptor's role.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::backend::{module_name, BackendDescriptor, BackendHandle, Role};
use super::{memory, posix};
use crate::config::StorageKind;
use crate::errors::LoadError;

/// ABI version backends must be built against.
pub const BACKEND_ABI_VERSION: u32 = 1;

/// Discovery entry point: given a component name, produce a backend.
pub type EntryPoint = Arc<dyn Fn(&str) -> anyhow::Result<BackendHandle> + Send + Sync>;

/// A registered backend implementation for one storage kind.
pub struct BackendModule {
    kind: StorageKind,
    name: String,
    abi_version: u32,
    client: Option<EntryPoint>,
    server: Option<EntryPoint>,
}

impl BackendModule {
    /// A module with no entry points yet, built for the current ABI.
    pub fn new(kind: StorageKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            abi_version: BACKEND_ABI_VERSION,
            client: None,
            server: None,
        }
    }

    pub fn with_client<F>(mut self, entry: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<BackendHandle> + Send + Sync + 'static,
    {
        self.client = Some(Arc::new(entry));
        self
    }

    pub fn with_server<F>(mut self, entry: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<BackendHandle> + Send + Sync + 'static,
    {
        self.server = Some(Arc::new(entry));
        self
    }

    /// Use the same entry point for both roles.
    pub fn with_entry<F>(mut self, entry: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<BackendHandle> + Send + Sync + 'static,
    {
        let entry: EntryPoint = Arc::new(entry);
        self.client = Some(Arc::clone(&entry));
        self.server = Some(entry);
        self
    }

    /// Override the declared ABI version.
    pub fn with_abi_version(mut self, version: u32) -> Self {
        self.abi_version = version;
        self
    }

    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn abi_version(&self) -> u32 {
        self.abi_version
    }

    fn entry_point(&self, role: Role) -> Option<&EntryPoint> {
        match role {
            Role::Client => self.client.as_ref(),
            Role::Server => self.server.as_ref(),
        }
    }
}

impl fmt::Debug for BackendModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendModule")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("abi_version", &self.abi_version)
            .field("client", &self.client.is_some())
            .field("server", &self.server.is_some())
            .finish()
    }
}

/// Keeps a module loaded for as long as a backend produced by it is alive.
#[derive(Debug, Clone)]
pub struct ModuleHandle {
    module: Arc<BackendModule>,
    role: Role,
}

impl ModuleHandle {
    pub fn kind(&self) -> StorageKind {
        self.module.kind
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn backend_name(&self) -> &str {
        &self.module.name
    }

    /// Name following the `{kind}-{role}-{backend}` convention.
    pub fn module_name(&self) -> String {
        module_name(self.module.kind, self.role, &self.module.name)
    }
}

/// Lookup table of backend modules keyed by storage kind and backend name.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    modules: BTreeMap<(StorageKind, String), Arc<BackendModule>>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in `posix` and `memory` modules.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(posix::module());
        for kind in [StorageKind::Object, StorageKind::KeyValue, StorageKind::Db] {
            registry.register(memory::module(kind));
        }
        registry
    }

    /// Add `module`, replacing any module with the same kind and name.
    pub fn register(&mut self, module: BackendModule) -> &mut Self {
        debug!(kind = %module.kind, name = %module.name, "registering backend module");
        self.modules
            .insert((module.kind, module.name.clone()), Arc::new(module));
        self
    }

    /// Names of every resolvable module, one per provided role.
    pub fn module_names(&self) -> Vec<String> {
        self.modules
            .values()
            .flat_map(|m| {
                [Role::Client, Role::Server]
                    .into_iter()
                    .filter(|role| m.entry_point(*role).is_some())
                    .map(|role| module_name(m.kind, role, &m.name))
            })
            .collect()
    }

    /// Number of outstanding [`ModuleHandle`]s for a module, or `None` if no
    /// such module is registered.
    pub fn open_handles(&self, kind: StorageKind, name: &str) -> Option<usize> {
        self.modules
            .get(&(kind, name.to_string()))
            .map(|m| Arc::strong_count(m) - 1)
    }

    /// Resolve `descriptor` to a module handle and a fresh backend.
    ///
    /// Either both handles are returned or neither.
    pub fn resolve(
        &self,
        descriptor: &BackendDescriptor,
    ) -> Result<(ModuleHandle, BackendHandle), LoadError> {
        let name = descriptor.module_name();

        let module = self
            .modules
            .get(&(descriptor.kind, descriptor.backend.clone()))
            .ok_or_else(|| LoadError::NotFound {
                module: name.clone(),
            })?;

        if module.abi_version != BACKEND_ABI_VERSION {
            return Err(LoadError::AbiMismatch {
                module: name,
                expected: BACKEND_ABI_VERSION,
                found: module.abi_version,
            });
        }

        let entry = module
            .entry_point(descriptor.role)
            .ok_or_else(|| LoadError::MissingEntryPoint {
                module: name.clone(),
                role: descriptor.role,
            })?;

        let handle = entry(&descriptor.component).map_err(|e| LoadError::Rejected {
            module: name.clone(),
            component: descriptor.component.clone(),
            reason: format!("{e:#}"),
        })?;

        if handle.kind() != descriptor.kind {
            return Err(LoadError::KindMismatch {
                module: name,
                expected: descriptor.kind,
                found: handle.kind(),
            });
        }

        debug!(module = %name, component = %descriptor.component, "resolved backend");

        Ok((
            ModuleHandle {
                module: Arc::clone(module),
                role: descriptor.role,
            },
            handle,
        ))
    }
}
