//! Configuration for the daemon.
//!
//! Layered settings: built-in defaults, then `.cindex/settings.toml`
//! (discovered by walking up from the working directory), then
//! environment variables prefixed with `CINDEX_` using double
//! underscores for nesting:
//! - `CINDEX_THREAD_COUNT=8` sets `thread_count`
//! - `CINDEX_SYNC__SOFT_LIMIT=50000` sets `sync.soft_limit`
//! - `CINDEX_LOGGING__DEFAULT=debug` sets `logging.default`

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory holding the store, the fileids table, and the per-project
    /// restore blobs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Unix socket the daemon listens on; defaults to `<data_dir>/cindexd.sock`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,

    /// Worker threads for index and query jobs
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,

    /// Arguments appended to every compile invocation
    #[serde(default)]
    pub default_arguments: Vec<String>,

    /// Syncer tuning
    #[serde(default)]
    pub sync: SyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Pending-delta soft limit; producers block once the backlog
    /// exceeds it, until the syncer halves it
    #[serde(default = "default_soft_limit")]
    pub soft_limit: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module overrides, e.g. `sync = "debug"`
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_version() -> u32 {
    1
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(".cindex")
}
fn default_thread_count() -> usize {
    num_cpus::get()
}
fn default_soft_limit() -> usize {
    100_000
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            data_dir: default_data_dir(),
            socket_path: None,
            thread_count: default_thread_count(),
            default_arguments: Vec::new(),
            sync: SyncConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            soft_limit: default_soft_limit(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_config_file()
            .unwrap_or_else(|| PathBuf::from(".cindex/settings.toml"));

        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("CINDEX_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Walk up from the working directory looking for `.cindex/settings.toml`.
    fn find_config_file() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;
        for ancestor in current.ancestors() {
            let candidate = ancestor.join(".cindex").join("settings.toml");
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("index.db")
    }

    pub fn fileids_path(&self) -> PathBuf {
        self.data_dir.join("fileids")
    }

    pub fn projects_path(&self) -> PathBuf {
        self.data_dir.join("projects")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("cindexd.sock"))
    }

    /// Where a project's restore blob lives: the source-root path with
    /// separators encoded into the file name.
    pub fn project_blob_path(&self, src_root: &std::path::Path) -> PathBuf {
        let encoded: String = src_root
            .to_string_lossy()
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.data_dir.join(encoded)
    }
}
