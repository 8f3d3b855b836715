//! TOML configuration, by default at `~/.blobprop/config.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use common::storage::StorageName;
use object_store::StorageConfig;

use crate::propagator::{parse_schedule, PropagatorOptions, ReconcilerError, ReconcilerOptions};
use crate::queue::{Backoff, WorkerOptions};

pub const APP_DIR_NAME: &str = ".blobprop";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DB_FILE_NAME: &str = "blobprop.db";
pub const STAGING_DIR_NAME: &str = "staging";
pub const BLOBS_DIR_NAME: &str = "blobs";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine the home directory")]
    NoHomeDir,
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("primary storage {0} is not listed in [[storages]]")]
    PrimaryNotConfigured(StorageName),
    #[error("storage {0} is listed more than once")]
    DuplicateStorage(StorageName),
    #[error(transparent)]
    Schedule(#[from] ReconcilerError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Storage written synchronously before a blob is queued.
    pub primary_storage: StorageName,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub propagator: PropagatorConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub storages: Vec<StorageConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file. In-memory when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Directory for staged copies. In-memory when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagatorConfig {
    /// Jobs run concurrently by each worker.
    pub concurrency: usize,
    pub attempts: u32,
    pub backoff_delay_ms: u64,
    pub lowest_block_number: u64,
    pub poll_interval_ms: u64,
    pub close_timeout_secs: u64,
}

impl Default for PropagatorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            attempts: 3,
            backoff_delay_ms: 1000,
            lowest_block_number: 0,
            poll_interval_ms: 1000,
            close_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub enabled: bool,
    /// Seconds-first cron expression.
    pub cron_pattern: String,
    pub batch_size: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        let defaults = ReconcilerOptions::default();
        Self {
            enabled: true,
            cron_pattern: defaults.cron_pattern,
            batch_size: defaults.batch_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, `RUST_LOG` takes precedence.
    pub level: String,
    /// Also write daily rotated log files here.
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

impl Config {
    /// `~/.blobprop`
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(APP_DIR_NAME))
            .ok_or(ConfigError::NoHomeDir)
    }

    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::default_dir()?.join(CONFIG_FILE_NAME))
    }

    /// A local setup rooted at `dir`: blobs on disk as the primary storage
    /// plus a SQLite copy.
    pub fn local(dir: &Path) -> Self {
        Self {
            primary_storage: StorageName::FileSystem,
            database: DatabaseConfig {
                path: Some(dir.join(DB_FILE_NAME)),
            },
            staging: StagingConfig {
                path: Some(dir.join(STAGING_DIR_NAME)),
            },
            propagator: PropagatorConfig::default(),
            reconciler: ReconcilerConfig::default(),
            log: LogConfig::default(),
            storages: vec![
                StorageConfig::FileSystem {
                    path: dir.join(BLOBS_DIR_NAME),
                    prefix: None,
                },
                StorageConfig::Sqlite {
                    path: Some(dir.join("blobs.sqlite")),
                },
            ],
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let raw = toml::to_string_pretty(self)?;
        std::fs::write(path, raw).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = Vec::with_capacity(self.storages.len());
        for storage in &self.storages {
            let name = storage.name();
            if names.contains(&name) {
                return Err(ConfigError::DuplicateStorage(name));
            }
            names.push(name);
        }
        if !names.contains(&self.primary_storage) {
            return Err(ConfigError::PrimaryNotConfigured(self.primary_storage));
        }

        if self.propagator.attempts == 0 {
            return Err(ConfigError::Invalid("propagator.attempts must be at least 1".into()));
        }
        if self.propagator.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "propagator.concurrency must be at least 1".into(),
            ));
        }
        if self.reconciler.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "reconciler.batch_size must be at least 1".into(),
            ));
        }
        parse_schedule(&self.reconciler.cron_pattern)?;
        Ok(())
    }

    pub fn propagator_options(&self) -> PropagatorOptions {
        let propagator = &self.propagator;
        PropagatorOptions {
            attempts: propagator.attempts,
            backoff: Backoff::exponential(Duration::from_millis(propagator.backoff_delay_ms)),
            lowest_block_number: propagator.lowest_block_number,
            worker: WorkerOptions {
                concurrency: propagator.concurrency,
                poll_interval: Duration::from_millis(propagator.poll_interval_ms),
                close_timeout: Duration::from_secs(propagator.close_timeout_secs),
            },
            run_workers: true,
            reconciler: self.reconciler.enabled.then(|| ReconcilerOptions {
                cron_pattern: self.reconciler.cron_pattern.clone(),
                batch_size: self.reconciler.batch_size,
            }),
            reconcile_batch_size: self.reconciler.batch_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        primary_storage = "file_system"

        [database]
        path = "/var/lib/blobprop/blobprop.db"

        [reconciler]
        cron_pattern = "0 */5 * * * *"
        batch_size = 50

        [[storages]]
        kind = "file_system"
        path = "/var/lib/blobprop/blobs"

        [[storages]]
        kind = "s3"
        endpoint = "http://localhost:9000"
        access_key = "minioadmin"
        secret_key = "minioadmin"
        bucket = "blobs"
    "#;

    #[test]
    fn test_parse_sample_with_defaults() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.primary_storage, StorageName::FileSystem);
        assert_eq!(config.storages.len(), 2);
        assert_eq!(config.storages[1].name(), StorageName::S3);
        assert_eq!(config.staging.path, None);
        assert_eq!(config.propagator, PropagatorConfig::default());
        assert!(config.reconciler.enabled);
        assert_eq!(config.reconciler.batch_size, 50);
        assert_eq!(config.log.level, "info");

        let options = config.propagator_options();
        assert_eq!(options.attempts, 3);
        assert_eq!(options.backoff.base_delay, Duration::from_secs(1));
        assert_eq!(options.reconciler.unwrap().cron_pattern, "0 */5 * * * *");
    }

    #[test]
    fn test_rejects_unknown_primary() {
        let mut config = Config::local(Path::new("/tmp/blobprop"));
        config.primary_storage = StorageName::Swarm;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PrimaryNotConfigured(StorageName::Swarm))
        ));
    }

    #[test]
    fn test_rejects_bad_cron_and_duplicates() {
        let mut config = Config::local(Path::new("/tmp/blobprop"));
        config.reconciler.cron_pattern = "*/30 minutes".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Schedule(_))));

        let mut config = Config::local(Path::new("/tmp/blobprop"));
        config.storages.push(StorageConfig::Sqlite { path: None });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateStorage(StorageName::Sqlite))
        ));
    }

    #[test]
    fn test_disabled_reconciler_keeps_batch_size() {
        let mut config = Config::local(Path::new("/tmp/blobprop"));
        config.reconciler.enabled = false;
        config.reconciler.batch_size = 7;
        let options = config.propagator_options();
        assert!(options.reconciler.is_none());
        assert_eq!(options.reconcile_batch_size, 7);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = Config::local(temp_dir.path());
        let path = temp_dir.path().join("nested").join(CONFIG_FILE_NAME);

        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }
}
