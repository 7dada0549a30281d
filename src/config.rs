//! Configuration loading and types.
//!
//! A configuration describes the storage topology of a deployment: the
//! servers for each storage kind, the backend to use for every tier, and a
//! handful of client tuning knobs.  It is read once, validated as a whole,
//! and then shared read-only through an [`Arc`] for the rest of the process
//! lifetime.
//!
//! Two source formats are understood.  The native one is the grouped
//! key/value format read by [`crate::keyfile`]; files ending in `.yaml` or
//! `.yml` are read as YAML with the same groups and keys.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use garde::Validate;
use serde::Deserialize;
use tracing::debug;

use crate::errors::ConfigError;
use crate::keyfile::KeyFile;

/// Environment variable naming the configuration source.
///
/// An absolute path is loaded directly.  Anything else is taken as the file
/// name to search for in the configuration directories.
pub const CONFIG_ENV: &str = "JULEA_CONFIG";

/// File name searched for when [`CONFIG_ENV`] is unset.
pub const DEFAULT_CONFIG_NAME: &str = "julea";

/// Sub-directory of every configuration directory that holds our files.
const CONFIG_SUBDIR: &str = "julea";

/// Placeholder in backend paths replaced by the server port.
pub const PORT_TOKEN: &str = "{PORT}";

// -- Storage kinds -----------------------------------------------------------

/// The three kinds of storage a deployment provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StorageKind {
    /// Object storage (tiered).
    Object,
    /// Key-value storage (tiered).
    KeyValue,
    /// Structured-record (database) storage.  Not tiered.
    Db,
}

impl StorageKind {
    /// Kinds that have an ordered list of tiers, in bring-up order.
    pub const TIERED: [StorageKind; 2] = [StorageKind::Object, StorageKind::KeyValue];

    /// Short name used in configuration groups, module names and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            StorageKind::Object => "object",
            StorageKind::KeyValue => "kv",
            StorageKind::Db => "db",
        }
    }

    pub fn is_tiered(self) -> bool {
        !matches!(self, StorageKind::Db)
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -- Validated model ---------------------------------------------------------

/// Which backend implementation serves one tier, and where it stores data.
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct BackendSpec {
    /// Name of the backend implementation (e.g. `posix`).
    #[garde(length(min = 1))]
    pub backend: String,
    /// Sub-variant of the implementation (e.g. `server`).
    #[garde(length(min = 1))]
    pub component: String,
    /// Storage path, possibly containing [`PORT_TOKEN`].
    #[garde(length(min = 1))]
    pub path: String,
}

/// Server endpoints per storage kind.
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct Servers {
    #[garde(length(min = 1), inner(length(min = 1)))]
    pub object: Vec<String>,
    #[garde(length(min = 1), inner(length(min = 1)))]
    pub kv: Vec<String>,
    #[garde(length(min = 1), inner(length(min = 1)))]
    pub db: Vec<String>,
}

/// A validated, immutable configuration.
///
/// Construct through [`Configuration::parse`], [`Configuration::parse_yaml`]
/// or one of the loaders; there is no way to obtain a partially valid one.
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct Configuration {
    #[garde(dive)]
    servers: Servers,
    #[garde(length(min = 1), dive)]
    object: Vec<BackendSpec>,
    #[garde(length(min = 1), dive)]
    kv: Vec<BackendSpec>,
    #[garde(dive)]
    db: BackendSpec,
    #[garde(range(min = 1))]
    max_operation_size: u64,
    #[garde(range(min = 1))]
    max_connections: u32,
    #[garde(range(min = 1))]
    stripe_size: u64,
}

// -- Defaults ----------------------------------------------------------------

fn default_max_operation_size() -> u64 {
    8 * 1024 * 1024 // 8 MiB
}

fn default_max_connections() -> u32 {
    u32::try_from(num_cpus::get()).unwrap_or(u32::MAX).max(1)
}

fn default_stripe_size() -> u64 {
    4 * 1024 * 1024 // 4 MiB
}

// -- Raw (unvalidated) form --------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    core: RawCore,
    clients: RawClients,
    servers: RawServers,
    object: RawTiers,
    kv: RawTiers,
    db: RawDb,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct RawCore {
    max_operation_size: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct RawClients {
    max_connections: Option<u64>,
    stripe_size: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawServers {
    object: Option<Vec<String>>,
    kv: Option<Vec<String>>,
    db: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTiers {
    backend: Option<Vec<String>>,
    component: Option<Vec<String>>,
    path: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDb {
    backend: Option<String>,
    component: Option<String>,
    path: Option<String>,
}

impl RawConfig {
    fn from_keyfile(kf: &KeyFile) -> Result<Self, ConfigError> {
        let tiers = |group: &str| RawTiers {
            backend: kf.string_list(group, "backend"),
            component: kf.string_list(group, "component"),
            path: kf.string_list(group, "path"),
        };

        Ok(Self {
            core: RawCore {
                max_operation_size: kf.u64("core", "max-operation-size")?,
            },
            clients: RawClients {
                max_connections: kf.u64("clients", "max-connections")?,
                stripe_size: kf.u64("clients", "stripe-size")?,
            },
            servers: RawServers {
                object: kf.string_list("servers", "object"),
                kv: kf.string_list("servers", "kv"),
                db: kf.string_list("servers", "db"),
            },
            object: tiers("object"),
            kv: tiers("kv"),
            db: RawDb {
                backend: kf.string("db", "backend"),
                component: kf.string("db", "component"),
                path: kf.string("db", "path"),
            },
        })
    }

    /// Check presence and shape, apply defaults, then validate field contents.
    fn into_configuration(self) -> Result<Configuration, ConfigError> {
        let servers = Servers {
            object: required(self.servers.object, "servers.object")?,
            kv: required(self.servers.kv, "servers.kv")?,
            db: required(self.servers.db, "servers.db")?,
        };

        let object = zip_tiers(self.object, StorageKind::Object)?;
        let kv = zip_tiers(self.kv, StorageKind::KeyValue)?;

        let db = BackendSpec {
            backend: required(self.db.backend, "db.backend")?,
            component: required(self.db.component, "db.component")?,
            path: required(self.db.path, "db.path")?,
        };

        let max_connections = match self.clients.max_connections {
            None | Some(0) => default_max_connections(),
            Some(n) => u32::try_from(n).map_err(|_| {
                ConfigError::invalid(format!("clients.max-connections: {n} is too large"))
            })?,
        };

        let configuration = Configuration {
            servers,
            object,
            kv,
            db,
            max_operation_size: non_zero_or(
                self.core.max_operation_size,
                default_max_operation_size,
            ),
            max_connections,
            stripe_size: non_zero_or(self.clients.stripe_size, default_stripe_size),
        };

        configuration
            .validate()
            .map_err(|report| ConfigError::invalid(report.to_string()))?;

        Ok(configuration)
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, ConfigError> {
    value.ok_or_else(|| ConfigError::invalid(format!("{field} is missing")))
}

fn non_zero_or(value: Option<u64>, default: fn() -> u64) -> u64 {
    match value {
        None | Some(0) => default(),
        Some(v) => v,
    }
}

fn zip_tiers(raw: RawTiers, kind: StorageKind) -> Result<Vec<BackendSpec>, ConfigError> {
    let group = kind.as_str();
    let backend = required(raw.backend, &format!("{group}.backend"))?;
    let component = required(raw.component, &format!("{group}.component"))?;
    let path = required(raw.path, &format!("{group}.path"))?;

    if backend.len() != component.len() || component.len() != path.len() {
        return Err(ConfigError::invalid(format!(
            "{group}: backend, component and path must list the same number of tiers \
             (got {}, {}, {})",
            backend.len(),
            component.len(),
            path.len()
        )));
    }

    Ok(backend
        .into_iter()
        .zip(component)
        .zip(path)
        .map(|((backend, component), path)| BackendSpec {
            backend,
            component,
            path,
        })
        .collect())
}

// -- Construction ------------------------------------------------------------

impl Configuration {
    /// Parse the grouped key/value format.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let kf = KeyFile::parse(text)?;
        RawConfig::from_keyfile(&kf)?.into_configuration()
    }

    /// Parse the YAML form of the same structure.
    pub fn parse_yaml(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text)
            .map_err(|e| ConfigError::invalid(format!("yaml: {e}")))?;
        raw.into_configuration()
    }

    /// Load one file, choosing the format from its extension.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Arc<Self>, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    searched: vec![path.to_path_buf()],
                }
            } else {
                ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Self::parse_for_path(path, &contents).map(Arc::new)
    }

    /// Locate and load the configuration using the process environment.
    ///
    /// See [`SearchPaths::from_env`] for the precedence rules.
    pub fn load_default() -> Result<Arc<Self>, ConfigError> {
        SearchPaths::from_env().load()
    }

    fn parse_for_path(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let parsed = if is_yaml {
            Self::parse_yaml(contents)
        } else {
            Self::parse(contents)
        };
        parsed.map_err(|e| match e {
            ConfigError::Invalid { reason } => {
                ConfigError::invalid(format!("{}: {reason}", path.display()))
            }
            other => other,
        })
    }

    // -- Accessors -----------------------------------------------------------

    pub fn servers(&self) -> &Servers {
        &self.servers
    }

    /// Server endpoints for `kind`.
    pub fn servers_for(&self, kind: StorageKind) -> &[String] {
        match kind {
            StorageKind::Object => &self.servers.object,
            StorageKind::KeyValue => &self.servers.kv,
            StorageKind::Db => &self.servers.db,
        }
    }

    pub fn server(&self, kind: StorageKind, index: usize) -> Result<&str, ConfigError> {
        let servers = self.servers_for(kind);
        servers
            .get(index)
            .map(String::as_str)
            .ok_or(ConfigError::OutOfRange {
                what: server_label(kind),
                index,
                len: servers.len(),
            })
    }

    pub fn object_server(&self, index: usize) -> Result<&str, ConfigError> {
        self.server(StorageKind::Object, index)
    }

    pub fn kv_server(&self, index: usize) -> Result<&str, ConfigError> {
        self.server(StorageKind::KeyValue, index)
    }

    pub fn db_server(&self, index: usize) -> Result<&str, ConfigError> {
        self.server(StorageKind::Db, index)
    }

    pub fn object_server_count(&self) -> usize {
        self.servers.object.len()
    }

    pub fn kv_server_count(&self) -> usize {
        self.servers.kv.len()
    }

    pub fn db_server_count(&self) -> usize {
        self.servers.db.len()
    }

    /// Backend specs for `kind`, one per tier.  The db kind has exactly one.
    pub fn tiers(&self, kind: StorageKind) -> &[BackendSpec] {
        match kind {
            StorageKind::Object => &self.object,
            StorageKind::KeyValue => &self.kv,
            StorageKind::Db => std::slice::from_ref(&self.db),
        }
    }

    pub fn tier(&self, kind: StorageKind, index: usize) -> Result<&BackendSpec, ConfigError> {
        let tiers = self.tiers(kind);
        tiers.get(index).ok_or(ConfigError::OutOfRange {
            what: tier_label(kind),
            index,
            len: tiers.len(),
        })
    }

    pub fn object_tier(&self, index: usize) -> Result<&BackendSpec, ConfigError> {
        self.tier(StorageKind::Object, index)
    }

    pub fn kv_tier(&self, index: usize) -> Result<&BackendSpec, ConfigError> {
        self.tier(StorageKind::KeyValue, index)
    }

    pub fn object_tier_count(&self) -> usize {
        self.object.len()
    }

    pub fn kv_tier_count(&self) -> usize {
        self.kv.len()
    }

    /// The single structured-record backend spec.
    pub fn db(&self) -> &BackendSpec {
        &self.db
    }

    /// Largest single operation in bytes.
    pub fn max_operation_size(&self) -> u64 {
        self.max_operation_size
    }

    /// Connections a client keeps per server.
    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    /// Stripe size in bytes used by the distribution policy.
    pub fn stripe_size(&self) -> u64 {
        self.stripe_size
    }
}

fn server_label(kind: StorageKind) -> &'static str {
    match kind {
        StorageKind::Object => "object server",
        StorageKind::KeyValue => "kv server",
        StorageKind::Db => "db server",
    }
}

fn tier_label(kind: StorageKind) -> &'static str {
    match kind {
        StorageKind::Object => "object tier",
        StorageKind::KeyValue => "kv tier",
        StorageKind::Db => "db tier",
    }
}

// -- Loader ------------------------------------------------------------------

/// Where to look for the configuration, in precedence order.
#[derive(Debug, Clone)]
pub struct SearchPaths {
    /// Value of [`CONFIG_ENV`], if set.
    pub env_override: Option<String>,
    /// Per-user configuration directory (`$XDG_CONFIG_HOME` or `~/.config`).
    pub user_config_dir: Option<PathBuf>,
    /// System configuration directories (`$XDG_CONFIG_DIRS` or `/etc/xdg`).
    pub system_config_dirs: Vec<PathBuf>,
}

impl SearchPaths {
    /// Gather the search locations from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`SearchPaths::from_env`], reading variables through `lookup`.
    /// Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let user_config_dir = env("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| env("HOME").map(|home| Path::new(&home).join(".config")));

        let system_config_dirs = match env("XDG_CONFIG_DIRS") {
            Some(dirs) => dirs
                .split(':')
                .filter(|d| !d.is_empty())
                .map(PathBuf::from)
                .collect(),
            None => vec![PathBuf::from("/etc/xdg")],
        };

        Self {
            env_override: env(CONFIG_ENV),
            user_config_dir,
            system_config_dirs,
        }
    }

    /// Absolute path from the override, if one was given.
    pub fn explicit_path(&self) -> Option<&Path> {
        self.env_override
            .as_deref()
            .map(Path::new)
            .filter(|p| p.is_absolute())
    }

    /// File name searched for in the configuration directories.
    pub fn config_name(&self) -> String {
        self.env_override
            .as_deref()
            .and_then(|v| Path::new(v).file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_CONFIG_NAME.to_string())
    }

    /// Every candidate path, in the order they are tried.
    pub fn candidates(&self) -> Vec<PathBuf> {
        if let Some(path) = self.explicit_path() {
            return vec![path.to_path_buf()];
        }

        let name = self.config_name();
        self.user_config_dir
            .iter()
            .chain(self.system_config_dirs.iter())
            .map(|dir| dir.join(CONFIG_SUBDIR).join(&name))
            .collect()
    }

    /// Load the first candidate that can be read.  Unreadable candidates
    /// are skipped.
    ///
    /// An explicit absolute override is never followed by a search: if it
    /// cannot be read the result is [`ConfigError::NotFound`].
    pub fn load(&self) -> Result<Arc<Configuration>, ConfigError> {
        let candidates = self.candidates();

        for path in &candidates {
            match std::fs::read_to_string(path) {
                Ok(contents) => {
                    debug!(path = %path.display(), "loading configuration");
                    return Configuration::parse_for_path(path, &contents).map(Arc::new);
                }
                Err(e) if self.explicit_path().is_some() => {
                    debug!(path = %path.display(), error = %e, "cannot open configuration");
                    break;
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping configuration candidate");
                }
            }
        }

        Err(ConfigError::NotFound {
            searched: candidates,
        })
    }
}

// -- Tests --------------------------------------------------------------------
