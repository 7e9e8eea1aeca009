use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Location of the storage repository.
    pub storage: StorageConfig,
    /// The image utility used to inspect and mutate volumes.
    #[serde(default)]
    pub qemu_img: QemuImgConfig,
    /// Resource locking.
    #[serde(default)]
    pub locks: LockConfig,
    /// Job scheduling.
    #[serde(default)]
    pub jobs: JobsConfig,
    /// Logging.
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one subdirectory per storage domain.
    pub repository: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QemuImgConfig {
    /// `qemu-img` binary, to work with qcow2 files.
    pub binary: PathBuf,
}

impl Default for QemuImgConfig {
    fn default() -> Self {
        QemuImgConfig {
            binary: PathBuf::from("qemu-img"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long a job waits for its locks before failing.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            acquire_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Maximum number of jobs running at the same time.
    pub max_workers: usize,
    /// Remove finished jobs from the scheduler after this long. Finished
    /// jobs are kept until deleted explicitly if unset.
    #[serde(with = "humantime_serde")]
    pub autodelete_after: Option<Duration>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        JobsConfig {
            max_workers: 4,
            autodelete_after: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directives, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file {0:?} does not exist")]
    NotFound(PathBuf),
    #[error("failed to extract agent configuration: {0}")]
    Extract(#[from] figment::Error),
}

impl AgentConfig {
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        Ok(figment.extract()?)
    }
}

/// Load the agent configuration from `path`, overlaid with `SDM_`-prefixed
/// environment variables (e.g. `SDM_LOCKS__ACQUIRE_TIMEOUT=30s`).
pub fn load_configuration(path: &Path) -> Result<AgentConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    AgentConfig::from_figment(
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SDM_").split("__")),
    )
}
