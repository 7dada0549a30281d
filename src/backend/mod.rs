//! Storage backends.
//!
//! The [`backend::Backend`] trait is the contract every pluggable storage
//! implementation fulfils.  Implementations are packaged as
//! [`registry::BackendModule`]s and looked up by name through a
//! [`registry::BackendRegistry`].  Two modules are built in: a directory
//! backed object store ([`posix`]) and an in-process store for every kind
//! ([`memory`]).

pub mod backend;
pub mod memory;
pub mod posix;
pub mod registry;

pub use backend::{Backend, BackendDescriptor, BackendHandle, Role};
pub use registry::{BackendModule, BackendRegistry, ModuleHandle, BACKEND_ABI_VERSION};
