use std::fmt;
use std::path::{Path, PathBuf};

use clap::Args;
use owo_colors::OwoColorize;

use blobprop_daemon::config::{Config, ConfigError};

#[derive(Args, Debug, Clone)]
pub struct Init {
    /// Overwrite an existing config file
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug)]
pub struct InitOutput {
    pub config_path: PathBuf,
    pub config: Config,
}

impl fmt::Display for InitOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} config at {}",
            "Initialized".green().bold(),
            self.config_path.display().to_string().bold()
        )?;
        writeln!(
            f,
            "  {} {}",
            "Primary:".dimmed(),
            self.config.primary_storage
        )?;
        if let Some(db) = &self.config.database.path {
            writeln!(f, "  {} {}", "Database:".dimmed(), db.display())?;
        }
        if let Some(staging) = &self.config.staging.path {
            writeln!(f, "  {} {}", "Staging:".dimmed(), staging.display())?;
        }
        let storages: Vec<String> = self
            .config
            .storages
            .iter()
            .map(|storage| storage.name().to_string())
            .collect();
        write!(f, "  {} {}", "Storages:".dimmed(), storages.join(", "))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("config already exists at {0}, pass --force to overwrite it")]
    AlreadyExists(PathBuf),
    #[error("config path {0} has no parent directory")]
    InvalidPath(PathBuf),
    #[error("init failed: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn create_dir(path: &Path) -> Result<(), InitError> {
    std::fs::create_dir_all(path).map_err(|source| InitError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Init {
    type Error = InitError;
    type Output = InitOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let config_path = ctx.config_path.clone();
        if config_path.exists() && !self.force {
            return Err(InitError::AlreadyExists(config_path));
        }
        let dir = config_path
            .parent()
            .ok_or_else(|| InitError::InvalidPath(config_path.clone()))?;

        let config = Config::local(dir);
        create_dir(dir)?;
        if let Some(staging) = &config.staging.path {
            create_dir(staging)?;
        }
        for storage in &config.storages {
            if let object_store::StorageConfig::FileSystem { path, .. } = storage {
                create_dir(path)?;
            }
        }
        config.save(&config_path)?;

        Ok(InitOutput {
            config_path,
            config,
        })
    }
}
