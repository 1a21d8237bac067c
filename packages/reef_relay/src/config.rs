use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

// =============================================================================
// Tunable config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Two equivalent ways to configure:
//
//   config.toml:     [server]
//                    port = 9010
//
//   env var:         REEF_SERVER__PORT=9010   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub cache: CacheFileConfig,
    #[serde(default)]
    pub history: HistoryFileConfig,
}

/// Listener knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Pagination cache knobs (lives under `[cache]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheFileConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheFileConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

/// History replay knobs (lives under `[history]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryFileConfig {
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

impl Default for HistoryFileConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9010
}
fn default_max_entries() -> usize {
    500
}
fn default_page_size() -> i64 {
    20
}

/// Build a figment that layers: defaults → config.toml → REEF_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `REEF_SERVER__PORT=9010`  →  `server.port = 9010`
///   `REEF_CACHE__MAX_ENTRIES=50`  →  `cache.max_entries = 50`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("REEF_").split("__"))
}

// =============================================================================
// Directory layout config (not tunable via figment — derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub bind_host: String,
    pub bind_port: u16,
    pub cache_max_entries: usize,
    pub history_page_size: i64,
}

impl RelayConfig {
    pub fn new(custom_dir: Option<PathBuf>, fc: &FileConfig) -> Result<Self> {
        ensure!(
            fc.cache.max_entries > 0,
            "cache.max_entries must be at least 1"
        );

        let data_dir = custom_dir.unwrap_or_else(|| {
            dirs::home_dir()
                .expect("Could not find home directory")
                .join(".reef")
        });

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("reef.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            data_dir,
            db_path,
            bind_host: fc.server.host.clone(),
            bind_port: fc.server.port,
            cache_max_entries: fc.cache.max_entries,
            history_page_size: fc.history.page_size,
        })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
