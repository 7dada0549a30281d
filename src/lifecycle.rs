//! Tiered bring-up and teardown of every configured backend.
//!
//! [`bring_up`] walks the configuration in a fixed order: the db backend,
//! then every object tier, then every kv tier, and finally (client role
//! only) the client collaborators.  Each instance is recorded as soon as it
//! is ready, so a failure at any step can close exactly what was opened
//! before it.  [`tear_down`] does the same closing for a complete state.
//!
//! Neither function publishes anything; that is [`crate::state`]'s job.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::{debug, info, info_span, warn};

use crate::backend::{Backend, BackendDescriptor, BackendHandle, BackendRegistry, ModuleHandle, Role};
use crate::collaborators::{ClientCollaborator, ClientCollaborators};
use crate::config::{Configuration, StorageKind, PORT_TOKEN};
use crate::errors::{LifecycleError, LoadError};
use crate::metrics;

// -- Port substitution ---------------------------------------------------------

/// What replaces [`PORT_TOKEN`] in configured paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortToken {
    /// Leave paths untouched (client role: no local listener).
    Unset,
    /// Substitute the decimal port.
    Port(u16),
}

impl PortToken {
    pub fn for_role(role: Role, port: u16) -> Self {
        match role {
            Role::Server => PortToken::Port(port),
            Role::Client => PortToken::Unset,
        }
    }

    /// Apply the substitution to `template`.
    pub fn substitute(&self, template: &str) -> String {
        match self {
            PortToken::Unset => template.to_string(),
            PortToken::Port(port) => template.replace(PORT_TOKEN, &port.to_string()),
        }
    }
}

// -- Backend instances -----------------------------------------------------------

/// Lifecycle state of a [`BackendInstance`].  Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Resolved, `init` not yet called or failed.
    Loaded,
    /// `init` succeeded.
    Ready,
    /// `fini` was called.
    Closed,
}

impl InstanceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => InstanceState::Loaded,
            1 => InstanceState::Ready,
            _ => InstanceState::Closed,
        }
    }
}

/// One live backend: the backend itself, the module that produced it, and
/// the storage path it was initialized with.
#[derive(Debug)]
pub struct BackendInstance {
    // Declared before `module` so it is dropped first.
    backend: BackendHandle,
    module: ModuleHandle,
    descriptor: BackendDescriptor,
    path: String,
    state: AtomicU8,
}

impl BackendInstance {
    fn load(registry: &BackendRegistry, descriptor: BackendDescriptor, path: String) -> Result<Self, LoadError> {
        let (module, backend) = registry.resolve(&descriptor)?;
        Ok(Self {
            backend,
            module,
            descriptor,
            path,
            state: AtomicU8::new(InstanceState::Loaded as u8),
        })
    }

    /// `Loaded -> Ready`.
    fn init(&self) -> anyhow::Result<()> {
        debug!(kind = %self.kind(), tier = ?self.tier(), path = %self.path, "init backend");
        let result = self.backend.backend().init(&self.path);
        metrics::record_init(self.kind(), result.is_ok());
        result?;
        self.state.store(InstanceState::Ready as u8, Ordering::Release);
        Ok(())
    }

    /// `Ready -> Closed`.  Instances that never became ready are left alone.
    fn close(&self) -> anyhow::Result<()> {
        let was = self.state.compare_exchange(
            InstanceState::Ready as u8,
            InstanceState::Closed as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if was.is_err() {
            return Ok(());
        }
        debug!(kind = %self.kind(), tier = ?self.tier(), "fini backend");
        let result = self.backend.backend().fini();
        metrics::record_fini(self.kind(), result.is_ok());
        result
    }

    pub fn state(&self) -> InstanceState {
        InstanceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn kind(&self) -> StorageKind {
        self.descriptor.kind
    }

    pub fn tier(&self) -> Option<usize> {
        self.descriptor.tier
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    /// Storage path after port substitution.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn handle(&self) -> &BackendHandle {
        &self.backend
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.backend()
    }

    pub fn module(&self) -> &ModuleHandle {
        &self.module
    }
}

// -- Process state -----------------------------------------------------------------

/// The complete set of backends for one process, plus the configuration
/// they were built from.
#[derive(Debug)]
pub struct ProcessState {
    role: Role,
    db: BackendInstance,
    object: Vec<BackendInstance>,
    kv: Vec<BackendInstance>,
    collaborators: Option<ClientCollaborators>,
    configuration: Arc<Configuration>,
}

impl ProcessState {
    /// Role the state was brought up for.
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.configuration
    }

    pub fn db(&self) -> &BackendInstance {
        &self.db
    }

    /// Instances of `kind` in tier order.  The db kind has exactly one.
    pub fn tiers(&self, kind: StorageKind) -> &[BackendInstance] {
        match kind {
            StorageKind::Object => &self.object,
            StorageKind::KeyValue => &self.kv,
            StorageKind::Db => std::slice::from_ref(&self.db),
        }
    }

    pub fn tier(&self, kind: StorageKind, tier: usize) -> Option<&BackendInstance> {
        self.tiers(kind).get(tier)
    }

    /// Every instance, db first, then object and kv tiers in order.
    pub fn instances(&self) -> impl Iterator<Item = &BackendInstance> {
        std::iter::once(&self.db)
            .chain(self.object.iter())
            .chain(self.kv.iter())
    }

    pub fn collaborators(&self) -> Option<&ClientCollaborators> {
        self.collaborators.as_ref()
    }

    /// Whether every instance is ready.
    pub fn is_ready(&self) -> bool {
        self.instances().all(|i| i.state() == InstanceState::Ready)
    }
}

// -- Bring-up ------------------------------------------------------------------------

/// Tiers and collaborators opened so far during a bring-up.
#[derive(Default)]
struct Progress {
    object: Vec<BackendInstance>,
    kv: Vec<BackendInstance>,
    started: Vec<Arc<dyn ClientCollaborator>>,
}

impl Progress {
    fn push(&mut self, instance: BackendInstance) {
        match instance.kind() {
            StorageKind::Object => self.object.push(instance),
            StorageKind::KeyValue => self.kv.push(instance),
            StorageKind::Db => {}
        }
    }

    /// Close everything opened so far, newest first.
    fn rollback(self) {
        for collaborator in self.started.iter().rev() {
            if let Err(e) = collaborator.stop() {
                warn!(collaborator = collaborator.name(), error = %e, "rollback: stop failed");
            }
        }
        for instance in self.kv.iter().rev().chain(self.object.iter().rev()) {
            close_logged(instance);
        }
    }
}

fn close_logged(instance: &BackendInstance) {
    if let Err(e) = instance.close() {
        warn!(kind = %instance.kind(), tier = ?instance.tier(), error = %e, "rollback: fini failed");
    }
}

fn open_instance(
    registry: &BackendRegistry,
    descriptor: BackendDescriptor,
    template: &str,
    port: PortToken,
) -> Result<BackendInstance, LifecycleError> {
    let path = port.substitute(template);
    let kind = descriptor.kind;
    let tier = descriptor.tier;
    let backend = descriptor.backend.clone();

    let instance = BackendInstance::load(registry, descriptor, path.clone()).map_err(|source| {
        LifecycleError::Load {
            kind,
            tier,
            backend: backend.clone(),
            source,
        }
    })?;

    // A failed init leaves the instance Loaded; dropping it releases the
    // module without calling fini.
    instance
        .init()
        .map_err(|source| LifecycleError::InitFailed {
            kind,
            tier,
            backend,
            path,
            source,
        })?;

    Ok(instance)
}

/// Resolve and initialize every configured backend for `role`.
///
/// On failure everything opened so far is closed again, the configuration
/// reference is dropped, and the returned error names the kind and tier
/// that failed.
pub fn bring_up(
    role: Role,
    configuration: Arc<Configuration>,
    port: u16,
    registry: &BackendRegistry,
    collaborators: &ClientCollaborators,
) -> Result<ProcessState, LifecycleError> {
    let _span = info_span!("bring_up", %role).entered();
    let token = PortToken::for_role(role, port);

    let db_spec = configuration.db();
    let descriptor = BackendDescriptor::for_spec(StorageKind::Db, None, role, db_spec);
    let db = match open_instance(registry, descriptor, &db_spec.path, token) {
        Ok(db) => db,
        Err(e) => {
            warn!(error = %e, "bring-up failed");
            metrics::record_rollback(e.kind());
            return Err(e);
        }
    };

    let mut progress = Progress::default();
    if let Err(e) = open_rest(role, &configuration, token, registry, collaborators, &mut progress) {
        warn!(error = %e, "bring-up failed, rolling back");
        metrics::record_rollback(e.kind());
        progress.rollback();
        close_logged(&db);
        return Err(e);
    }

    info!(
        object_tiers = progress.object.len(),
        kv_tiers = progress.kv.len(),
        "backends ready"
    );

    Ok(ProcessState {
        role,
        db,
        object: progress.object,
        kv: progress.kv,
        collaborators: (role == Role::Client).then(|| collaborators.clone()),
        configuration,
    })
}

/// Every tier of every tiered kind, then the client collaborators.
fn open_rest(
    role: Role,
    configuration: &Configuration,
    token: PortToken,
    registry: &BackendRegistry,
    collaborators: &ClientCollaborators,
    progress: &mut Progress,
) -> Result<(), LifecycleError> {
    for kind in StorageKind::TIERED {
        for (tier, spec) in configuration.tiers(kind).iter().enumerate() {
            let descriptor = BackendDescriptor::for_spec(kind, Some(tier), role, spec);
            progress.push(open_instance(registry, descriptor, &spec.path, token)?);
        }
    }

    if role == Role::Client {
        for collaborator in collaborators.start_order() {
            collaborator
                .start(configuration)
                .map_err(|source| LifecycleError::CollaboratorFailed {
                    name: collaborator.name(),
                    source,
                })?;
            progress.started.push(Arc::clone(collaborator));
        }
    }

    Ok(())
}

// -- Teardown --------------------------------------------------------------------------

/// One step of a teardown that reported an error.
#[derive(Debug)]
pub struct TeardownFailure {
    /// Collaborator name, or `"{kind}"` / `"{kind}[tier]"` for backends.
    pub component: String,
    pub error: anyhow::Error,
}

/// Outcome of [`tear_down`].  Teardown never stops early; failures are
/// collected here after being logged.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub closed: usize,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Close every collaborator and backend held by `state`.
///
/// Collaborators go first, in reverse start order, then the db backend and
/// every object and kv tier.  Module handles and the configuration
/// reference are released when `state` itself is dropped.
pub fn tear_down(role: Role, state: &ProcessState) -> TeardownReport {
    let _span = info_span!("tear_down", %role).entered();
    let mut report = TeardownReport::default();

    if let Some(collaborators) = state.collaborators() {
        if role != Role::Client {
            debug!(brought_up_as = %state.role(), "stopping client collaborators on {role} shutdown");
        }
        for collaborator in collaborators.start_order().into_iter().rev() {
            if let Err(error) = collaborator.stop() {
                warn!(collaborator = collaborator.name(), error = %error, "stop failed");
                report.failures.push(TeardownFailure {
                    component: collaborator.name().to_string(),
                    error,
                });
            }
        }
    }

    for instance in state.instances() {
        let was_ready = instance.state() == InstanceState::Ready;
        match instance.close() {
            Ok(()) if was_ready => report.closed += 1,
            Ok(()) => {}
            Err(error) => {
                let component = match instance.tier() {
                    Some(t) => format!("{}[{t}]", instance.kind()),
                    None => instance.kind().to_string(),
                };
                warn!(backend = %component, error = %error, "fini failed");
                report.failures.push(TeardownFailure { component, error });
            }
        }
    }

    info!(
        closed = report.closed,
        failures = report.failures.len(),
        "backends closed"
    );
    report
}
