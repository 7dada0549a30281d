//! julea: backend registry and tiered lifecycle manager.
//!
//! This crate is the core of a storage framework whose object, key-value
//! and database backends are pluggable.  It reads the framework
//! configuration, resolves every configured backend through a registry,
//! brings them up tier by tier with full rollback on failure, and publishes
//! the resulting state process-wide so that other layers can reach the
//! backends without passing handles around.
//!
//! A hosting process calls [`init_as_client`] or [`init_as_server`] once at
//! start and the matching shutdown function at exit.

pub mod backend;
pub mod collaborators;
pub mod config;
pub mod errors;
pub mod keyfile;
pub mod lifecycle;
pub mod metrics;
pub mod state;

#[cfg(test)]
mod testing;

pub use backend::{Backend, BackendHandle, BackendModule, BackendRegistry, Role};
pub use collaborators::{ClientCollaborator, ClientCollaborators};
pub use config::{BackendSpec, Configuration, StorageKind};
pub use errors::{ConfigError, Error, LifecycleError, LoadError, StateError};
pub use lifecycle::{BackendInstance, ProcessState, TeardownReport};
pub use state::{
    configuration, db_backend, init_as_client, init_as_server, is_initialized, kv_backend,
    kv_backend_tier, object_backend, object_backend_tier, shutdown_client, shutdown_server,
    try_init_as_client, try_init_as_server, BackendRef, ConfigSource, Publisher,
};
