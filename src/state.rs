//! The process-wide backend state.
//!
//! A [`Publisher`] owns the single live [`ProcessState`] of a process.  The
//! state becomes visible to readers in one write, after bring-up has fully
//! succeeded, and is made invisible again before teardown begins, so a
//! reader sees either nothing or a state whose backends are all ready.
//!
//! Most code uses the global publisher through the free functions at the
//! bottom of this module.  Hosting processes call [`init_as_client`] /
//! [`init_as_server`] at start and [`shutdown_client`] / [`shutdown_server`]
//! at exit; nothing happens implicitly at load time.

use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::backend::{Backend, BackendRegistry, Role};
use crate::collaborators::ClientCollaborators;
use crate::config::{Configuration, StorageKind};
use crate::errors::{Result, StateError};
use crate::lifecycle::{bring_up, tear_down, BackendInstance, ProcessState, TeardownReport};

/// Where a publisher gets its configuration at initialization time.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// [`Configuration::load_default`].
    Default,
    /// A specific file.
    Path(PathBuf),
    /// An already parsed configuration.
    Fixed(Arc<Configuration>),
}

impl ConfigSource {
    fn load(&self) -> Result<Arc<Configuration>> {
        let cfg = match self {
            ConfigSource::Default => Configuration::load_default()?,
            ConfigSource::Path(path) => Configuration::load_from_path(path)?,
            ConfigSource::Fixed(cfg) => Arc::clone(cfg),
        };
        Ok(cfg)
    }
}

/// Holder of the published [`ProcessState`].
///
/// The slot's write lock is taken only to swap the pointer; bring-up and
/// teardown run outside it, so readers wait at most for that swap.
/// `published` mirrors the slot and is only changed under the same write
/// lock, giving [`Publisher::is_initialized`] a lock-free answer that never
/// disagrees with a completed swap.
pub struct Publisher {
    slot: RwLock<Option<Arc<ProcessState>>>,
    published: AtomicBool,
    // Serializes initialize/shutdown against each other.
    lifecycle: Mutex<()>,
    registry: BackendRegistry,
    collaborators: ClientCollaborators,
    source: ConfigSource,
}

impl Publisher {
    pub fn new(registry: BackendRegistry, source: ConfigSource) -> Self {
        Self {
            slot: RwLock::new(None),
            published: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            registry,
            collaborators: ClientCollaborators::default(),
            source,
        }
    }

    /// Use `collaborators` for client-role bring-ups.
    pub fn with_collaborators(mut self, collaborators: ClientCollaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Bring up every backend for `role` and publish the result.
    ///
    /// A client-role call while a state is already published returns
    /// immediately, so a server process can also ask for client access.
    /// A server-role call while published is refused.
    pub fn initialize(&self, role: Role, port: u16) -> Result<()> {
        let _guard = self.lifecycle.lock();

        if self.is_initialized() {
            return match role {
                Role::Client => {
                    debug!("already initialized, client init is a no-op");
                    Ok(())
                }
                Role::Server => Err(StateError::AlreadyInitialized),
            };
        }

        let configuration = self.source.load()?;
        let state = bring_up(role, configuration, port, &self.registry, &self.collaborators)?;

        let state = Arc::new(state);
        {
            let mut slot = self.slot.write();
            *slot = Some(state);
            self.published.store(true, Ordering::Release);
        }
        info!(%role, port, "initialized");
        Ok(())
    }

    /// Whether a state is published.  Never blocks.
    pub fn is_initialized(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    /// Unpublish and tear down the current state.
    ///
    /// Returns `None` if nothing was published.
    pub fn shutdown(&self, role: Role) -> Option<TeardownReport> {
        let _guard = self.lifecycle.lock();

        let state = {
            let mut slot = self.slot.write();
            self.published.store(false, Ordering::Release);
            slot.take()
        }?;

        let report = tear_down(role, &state);
        drop(state);
        info!(%role, "shut down");
        Some(report)
    }

    /// The published state.
    pub fn current(&self) -> Result<Arc<ProcessState>> {
        self.slot.read().clone().ok_or(StateError::NotInitialized)
    }

    pub fn configuration(&self) -> Result<Arc<Configuration>> {
        Ok(Arc::clone(self.current()?.configuration()))
    }

    pub fn db_backend(&self) -> Result<BackendRef> {
        BackendRef::new(self.current()?, StorageKind::Db, 0)
    }

    pub fn object_backend_tier(&self, tier: usize) -> Result<BackendRef> {
        BackendRef::new(self.current()?, StorageKind::Object, tier)
    }

    /// Tier 0 of the object kind.
    pub fn object_backend(&self) -> Result<BackendRef> {
        self.object_backend_tier(0)
    }

    pub fn kv_backend_tier(&self, tier: usize) -> Result<BackendRef> {
        BackendRef::new(self.current()?, StorageKind::KeyValue, tier)
    }

    /// Tier 0 of the kv kind.
    pub fn kv_backend(&self) -> Result<BackendRef> {
        self.kv_backend_tier(0)
    }
}

/// A backend of the published state.  Keeps that state alive while held.
pub struct BackendRef {
    state: Arc<ProcessState>,
    kind: StorageKind,
    tier: usize,
}

impl BackendRef {
    fn new(state: Arc<ProcessState>, kind: StorageKind, tier: usize) -> Result<Self> {
        let len = state.tiers(kind).len();
        if tier >= len {
            return Err(StateError::OutOfRange { kind, tier, len });
        }
        Ok(Self { state, kind, tier })
    }

    pub fn instance(&self) -> &BackendInstance {
        &self.state.tiers(self.kind)[self.tier]
    }
}

impl Deref for BackendRef {
    type Target = dyn Backend;

    fn deref(&self) -> &Self::Target {
        self.instance().backend()
    }
}

// -- Global publisher ----------------------------------------------------------

static GLOBAL: OnceLock<Publisher> = OnceLock::new();

/// The global publisher, created with the built-in registry and the default
/// configuration search on first use.
pub fn global() -> &'static Publisher {
    GLOBAL.get_or_init(|| Publisher::new(BackendRegistry::with_builtin(), ConfigSource::Default))
}

/// Install `publisher` as the global one.  Fails, returning it, if the
/// global publisher already exists.
pub fn install_global(publisher: Publisher) -> std::result::Result<(), Publisher> {
    GLOBAL.set(publisher)
}

fn fatal_message(role: Role, err: &StateError) -> String {
    format!("julea: failed to initialize as {role}: {err}")
}

fn fatal(role: Role, err: &StateError) -> ! {
    error!(%role, error = %err, "failed to initialize julea");
    // Printed as well in case the host installed no subscriber.
    eprintln!("{}", fatal_message(role, err));
    std::process::exit(1)
}

/// Initialize as a client.  Idempotent.  Exits the process on failure.
pub fn init_as_client() {
    if let Err(e) = try_init_as_client() {
        fatal(Role::Client, &e);
    }
}

/// Initialize as a server listening on `port`.  Exits the process on failure.
pub fn init_as_server(port: u16) {
    if let Err(e) = try_init_as_server(port) {
        fatal(Role::Server, &e);
    }
}

pub fn try_init_as_client() -> Result<()> {
    global().initialize(Role::Client, 0)
}

pub fn try_init_as_server(port: u16) -> Result<()> {
    global().initialize(Role::Server, port)
}

pub fn shutdown_client() {
    global().shutdown(Role::Client);
}

pub fn shutdown_server() {
    global().shutdown(Role::Server);
}

pub fn is_initialized() -> bool {
    global().is_initialized()
}

pub fn configuration() -> Result<Arc<Configuration>> {
    global().configuration()
}

pub fn db_backend() -> Result<BackendRef> {
    global().db_backend()
}

pub fn object_backend_tier(tier: usize) -> Result<BackendRef> {
    global().object_backend_tier(tier)
}

pub fn object_backend() -> Result<BackendRef> {
    global().object_backend()
}

pub fn kv_backend_tier(tier: usize) -> Result<BackendRef> {
    global().kv_backend_tier(tier)
}

pub fn kv_backend() -> Result<BackendRef> {
    global().kv_backend()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::InstanceState;
    use crate::testing::{config_text, recording_registry, Recorder, THREE_TIER_CONFIG};
    use std::time::Duration;

    fn publisher(recorder: &Recorder, text: &str) -> Publisher {
        let cfg = Arc::new(Configuration::parse(text).unwrap());
        Publisher::new(recording_registry(recorder), ConfigSource::Fixed(cfg))
    }

    #[test]
    fn test_end_to_end_server() {
        let recorder = Recorder::new();
        let text = "[servers]\nobject=h1:9000\nkv=h1:9000\ndb=h1:9000\n\
                    [object]\nbackend=rec\ncomponent=client\npath=/tmp/{PORT}/o\n\
                    [kv]\nbackend=rec\ncomponent=server\npath=/tmp/{PORT}/k\n\
                    [db]\nbackend=rec\ncomponent=server\npath=/tmp/{PORT}/d\n";
        let p = publisher(&recorder, text);

        assert!(!p.is_initialized());
        p.initialize(Role::Server, 9000).unwrap();
        assert!(p.is_initialized());
        assert_eq!(
            recorder.inits(),
            ["/tmp/9000/d", "/tmp/9000/o", "/tmp/9000/k"]
        );

        let report = p.shutdown(Role::Server).unwrap();
        assert!(report.is_clean());
        assert!(!p.is_initialized());
        let mut finis = recorder.finis();
        finis.sort();
        assert_eq!(finis, ["/tmp/9000/d", "/tmp/9000/k", "/tmp/9000/o"]);
    }

    #[test]
    fn test_client_init_is_idempotent() {
        let recorder = Recorder::new();
        let p = publisher(&recorder, &config_text(&["/o"], &["/k"], "/d", ""));

        p.initialize(Role::Client, 0).unwrap();
        let first = p.current().unwrap();
        p.initialize(Role::Client, 0).unwrap();
        let second = p.current().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(recorder.inits().len(), 3);
    }

    #[test]
    fn test_client_init_after_server_is_noop() {
        let recorder = Recorder::new();
        let p = publisher(&recorder, &config_text(&["/o"], &["/k"], "/d", ""));

        p.initialize(Role::Server, 4711).unwrap();
        p.initialize(Role::Client, 0).unwrap();
        assert_eq!(p.current().unwrap().role(), Role::Server);
        assert_eq!(recorder.inits().len(), 3);
    }

    #[test]
    fn test_second_server_init_refused() {
        let recorder = Recorder::new();
        let p = publisher(&recorder, &config_text(&["/o"], &["/k"], "/d", ""));

        p.initialize(Role::Server, 4711).unwrap();
        assert!(matches!(
            p.initialize(Role::Server, 4712),
            Err(StateError::AlreadyInitialized)
        ));
        assert_eq!(recorder.inits().len(), 3);
    }

    #[test]
    fn test_shutdown_without_init_is_noop() {
        let recorder = Recorder::new();
        let p = publisher(&recorder, &config_text(&["/o"], &["/k"], "/d", ""));
        assert!(p.shutdown(Role::Client).is_none());
        assert!(p.shutdown(Role::Server).is_none());
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn test_accessors_before_init() {
        let recorder = Recorder::new();
        let p = publisher(&recorder, &config_text(&["/o"], &["/k"], "/d", ""));
        assert!(matches!(p.current(), Err(StateError::NotInitialized)));
        assert!(matches!(p.db_backend(), Err(StateError::NotInitialized)));
        assert!(matches!(p.object_backend(), Err(StateError::NotInitialized)));
        assert!(matches!(p.kv_backend_tier(0), Err(StateError::NotInitialized)));
        assert!(matches!(p.configuration(), Err(StateError::NotInitialized)));
    }

    #[test]
    fn test_tier_accessors() {
        let recorder = Recorder::new();
        let p = publisher(&recorder, THREE_TIER_CONFIG);
        p.initialize(Role::Server, 7000).unwrap();

        assert_eq!(p.object_backend_tier(2).unwrap().instance().path(), "/data/srv-7000/obj2");
        assert_eq!(p.object_backend().unwrap().instance().tier(), Some(0));
        assert_eq!(p.kv_backend().unwrap().instance().path(), "/data/srv-7000/kv0");
        assert_eq!(p.db_backend().unwrap().instance().tier(), None);
        assert!(matches!(
            p.object_backend_tier(3),
            Err(StateError::OutOfRange {
                kind: StorageKind::Object,
                tier: 3,
                len: 3
            })
        ));
        assert!(p.kv_backend_tier(1).is_err());
        assert_eq!(p.configuration().unwrap().object_tier_count(), 3);

        // Deref reaches the backend itself.
        let db = p.db_backend().unwrap();
        assert!(db.as_any().is::<crate::testing::RecordingBackend>());
        drop(db);

        p.shutdown(Role::Server);
    }

    #[test]
    fn test_failed_init_publishes_nothing() {
        let recorder = Recorder::new();
        recorder.fail_init_on("/data/srv-4711/obj1");
        let p = publisher(&recorder, THREE_TIER_CONFIG);

        let err = p.initialize(Role::Server, 4711).unwrap_err();
        assert!(matches!(err, StateError::Lifecycle(_)));
        assert!(!p.is_initialized());
        assert!(p.current().is_err());

        // A later attempt may succeed once the cause is gone.
        let recorder = Recorder::new();
        let p = publisher(&recorder, THREE_TIER_CONFIG);
        p.initialize(Role::Server, 4711).unwrap();
        assert!(p.is_initialized());
    }

    #[test]
    fn test_config_errors_surface() {
        let p = Publisher::new(
            BackendRegistry::with_builtin(),
            ConfigSource::Path(PathBuf::from("/nonexistent/julea/julea")),
        );
        assert!(matches!(
            p.initialize(Role::Client, 0),
            Err(StateError::Config(_))
        ));
        assert!(!p.is_initialized());
    }

    #[test]
    fn test_reinitialize_after_shutdown() {
        let recorder = Recorder::new();
        let p = publisher(&recorder, &config_text(&["/o"], &["/k"], "/d", ""));
        p.initialize(Role::Client, 0).unwrap();
        p.shutdown(Role::Client);
        p.initialize(Role::Client, 0).unwrap();
        assert!(p.is_initialized());
        assert_eq!(recorder.inits().len(), 6);
        assert_eq!(recorder.finis().len(), 3);
    }

    #[test]
    fn test_held_ref_outlives_shutdown() {
        let recorder = Recorder::new();
        let p = publisher(&recorder, &config_text(&["/o"], &["/k"], "/d", ""));
        p.initialize(Role::Client, 0).unwrap();

        let held = p.object_backend().unwrap();
        p.shutdown(Role::Client);
        assert!(!p.is_initialized());
        assert_eq!(held.instance().state(), InstanceState::Closed);
    }

    #[test]
    fn test_fatal_message_names_role_and_cause() {
        let err = StateError::Lifecycle(crate::errors::LifecycleError::InitFailed {
            kind: StorageKind::Object,
            tier: Some(1),
            backend: "posix".to_string(),
            path: "/data/o1".to_string(),
            source: anyhow::anyhow!("permission denied"),
        });
        let msg = fatal_message(Role::Server, &err);
        assert!(msg.starts_with("julea: failed to initialize as server: "), "{msg}");
        assert!(msg.contains("object backend posix (tier 1)"), "{msg}");
        assert!(msg.contains("permission denied"), "{msg}");
    }

    #[test]
    fn test_unpublished_before_teardown_runs() {
        let recorder = Recorder::new();
        recorder.slow_fini(Duration::from_millis(50));
        let p = Arc::new(publisher(&recorder, THREE_TIER_CONFIG));
        p.initialize(Role::Server, 4711).unwrap();
        assert!(p.is_initialized());
        assert!(p.current().is_ok());

        let closer = {
            let p = Arc::clone(&p);
            std::thread::spawn(move || p.shutdown(Role::Server))
        };
        while recorder.finis().is_empty() {
            std::thread::yield_now();
        }
        // Teardown is in progress: neither view still shows the state.
        assert!(!p.is_initialized());
        assert!(matches!(p.current(), Err(StateError::NotInitialized)));

        let report = closer.join().unwrap().unwrap();
        assert!(report.is_clean());
        assert_eq!(recorder.finis().len(), 5);
    }

    #[test]
    fn test_readers_never_see_partial_state() {
        let recorder = Recorder::new();
        recorder.slow_init(Duration::from_millis(5));
        let p = Arc::new(publisher(&recorder, THREE_TIER_CONFIG));

        let reader = {
            let p = Arc::clone(&p);
            std::thread::spawn(move || {
                let mut seen = 0usize;
                for _ in 0..20_000 {
                    if p.is_initialized() {
                        if let Ok(state) = p.current() {
                            assert!(state.is_ready(), "observed a state that is not fully ready");
                            seen += 1;
                        }
                    } else if let Ok(state) = p.current() {
                        assert!(state.is_ready());
                    }
                    if seen > 100 {
                        break;
                    }
                    std::thread::yield_now();
                }
            })
        };

        p.initialize(Role::Server, 4711).unwrap();
        reader.join().unwrap();
        p.shutdown(Role::Server);
    }
}
