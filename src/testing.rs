//! Shared fixtures for unit tests: configuration text and a backend that
//! records every lifecycle call.

use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{Backend, BackendHandle, BackendModule, BackendRegistry};
use crate::collaborators::{ClientCollaborator, ClientCollaborators};
use crate::config::{Configuration, StorageKind};

/// Three object tiers, one kv tier, everything served by `rec`.
pub const THREE_TIER_CONFIG: &str = "\
[core]
max-operation-size=1024

[clients]
max-connections=4
stripe-size=2048

[servers]
object=h1:4711;h2:4711
kv=h1:4711
db=h1:4711

[object]
backend=rec;rec;rec
component=server;server;server
path=/data/srv-{PORT}/obj0;/data/srv-{PORT}/obj1;/data/srv-{PORT}/obj2

[kv]
backend=rec
component=server
path=/data/srv-{PORT}/kv0

[db]
backend=rec
component=server
path=/data/srv-{PORT}/db
";

/// A configuration served entirely by `rec`, one tier per given path.
pub fn config_text(object_paths: &[&str], kv_paths: &[&str], db_path: &str, extra: &str) -> String {
    let tiers = |paths: &[&str]| {
        let n = paths.len();
        format!(
            "backend={}\ncomponent={}\npath={}\n",
            vec!["rec"; n].join(";"),
            vec!["server"; n].join(";"),
            paths.join(";")
        )
    };
    format!(
        "[servers]\nobject=h1:4711\nkv=h1:4711\ndb=h1:4711\n\n\
         [object]\n{}\n[kv]\n{}\n[db]\nbackend=rec\ncomponent=server\npath={db_path}\n{extra}",
        tiers(object_paths),
        tiers(kv_paths),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Init,
    Fini,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Backend {
        op: Op,
        kind: StorageKind,
        path: String,
    },
    Start(&'static str),
    Stop(&'static str),
}

#[derive(Default)]
struct RecorderInner {
    events: Vec<Event>,
    fail_init: HashSet<String>,
    fail_fini: HashSet<String>,
    init_delay: Option<Duration>,
    fini_delay: Option<Duration>,
}

/// Shared log of lifecycle calls, with failure injection by path.
#[derive(Clone, Default)]
pub struct Recorder {
    inner: Arc<Mutex<RecorderInner>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_init_on(&self, path: &str) {
        self.inner.lock().fail_init.insert(path.to_string());
    }

    pub fn fail_fini_on(&self, path: &str) {
        self.inner.lock().fail_fini.insert(path.to_string());
    }

    /// Make every `init` sleep first.
    pub fn slow_init(&self, delay: Duration) {
        self.inner.lock().init_delay = Some(delay);
    }

    /// Make every `fini` sleep after it is recorded.
    pub fn slow_fini(&self, delay: Duration) {
        self.inner.lock().fini_delay = Some(delay);
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().events.clone()
    }

    fn paths(&self, wanted: Op) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Backend { op, path, .. } if op == wanted => Some(path),
                _ => None,
            })
            .collect()
    }

    /// Paths passed to `init`, in call order.
    pub fn inits(&self) -> Vec<String> {
        self.paths(Op::Init)
    }

    /// Paths of backends `fini` was called on, in call order.
    pub fn finis(&self) -> Vec<String> {
        self.paths(Op::Fini)
    }

    pub fn count(&self, op: Op, path: &str) -> usize {
        self.paths(op).iter().filter(|p| *p == path).count()
    }

    fn record(&self, event: Event) {
        self.inner.lock().events.push(event);
    }
}

/// Backend that logs to a [`Recorder`].
pub struct RecordingBackend {
    kind: StorageKind,
    recorder: Recorder,
    path: Mutex<Option<String>>,
}

impl Backend for RecordingBackend {
    fn init(&self, path: &str) -> anyhow::Result<()> {
        let (delay, fail) = {
            let inner = self.recorder.inner.lock();
            (inner.init_delay, inner.fail_init.contains(path))
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.recorder.record(Event::Backend {
            op: Op::Init,
            kind: self.kind,
            path: path.to_string(),
        });
        if fail {
            anyhow::bail!("injected init failure at {path}");
        }
        *self.path.lock() = Some(path.to_string());
        Ok(())
    }

    fn fini(&self) -> anyhow::Result<()> {
        let path = self.path.lock().take().unwrap_or_default();
        self.recorder.record(Event::Backend {
            op: Op::Fini,
            kind: self.kind,
            path: path.clone(),
        });
        let (delay, fail) = {
            let inner = self.recorder.inner.lock();
            (inner.fini_delay, inner.fail_fini.contains(&path))
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if fail {
            anyhow::bail!("injected fini failure at {path}");
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Registry with a `rec` module for every kind, both roles.
pub fn recording_registry(recorder: &Recorder) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    for kind in [StorageKind::Object, StorageKind::KeyValue, StorageKind::Db] {
        let recorder = recorder.clone();
        registry.register(BackendModule::new(kind, "rec").with_entry(move |_: &str| {
            Ok(BackendHandle::new(
                kind,
                Box::new(RecordingBackend {
                    kind,
                    recorder: recorder.clone(),
                    path: Mutex::new(None),
                }),
            ))
        }));
    }
    registry
}

/// Collaborator that logs start/stop and can be made to fail on start.
pub struct RecordingCollaborator {
    name: &'static str,
    recorder: Recorder,
    fail: bool,
}

impl RecordingCollaborator {
    /// A full collaborator set; the one named `failing` refuses to start.
    pub fn set(recorder: &Recorder, failing: Option<&'static str>) -> ClientCollaborators {
        let make = |name: &'static str| -> Arc<dyn ClientCollaborator> {
            Arc::new(RecordingCollaborator {
                name,
                recorder: recorder.clone(),
                fail: failing == Some(name),
            })
        };
        ClientCollaborators {
            connection_pool: make("connection-pool"),
            distribution: make("distribution"),
            background_operations: make("background-operations"),
            operation_cache: make("operation-cache"),
        }
    }
}

impl ClientCollaborator for RecordingCollaborator {
    fn name(&self) -> &'static str {
        self.name
    }

    fn start(&self, _configuration: &Configuration) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("injected start failure");
        }
        self.recorder.record(Event::Start(self.name));
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        self.recorder.record(Event::Stop(self.name));
        Ok(())
    }
}
