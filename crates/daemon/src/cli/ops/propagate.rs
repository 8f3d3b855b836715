use std::fmt;
use std::path::PathBuf;

use clap::Args;
use owo_colors::OwoColorize;

use blobprop_daemon::config::ConfigError;
use blobprop_daemon::database::DatabaseError;
use blobprop_daemon::propagator::{PropagationError, PropagatorCloseError};
use blobprop_daemon::setup::{build_propagator, SetupError};
use common::blob::{Blob, VersionedHash, VersionedHashError};
use common::storage::StorageName;

/// Store a blob in the primary storage and queue it for every other storage.
///
/// Jobs are picked up by a running `blobprop run`.
#[derive(Args, Debug, Clone)]
pub struct Propagate {
    /// File holding the raw blob bytes
    #[arg(long)]
    pub file: PathBuf,

    /// Versioned hash of the blob (0x01...)
    #[arg(long, conflicts_with = "commitment", required_unless_present = "commitment")]
    pub hash: Option<String>,

    /// Hex encoded KZG commitment to derive the versioned hash from
    #[arg(long)]
    pub commitment: Option<String>,

    /// Block the blob was included in, used for priority
    #[arg(long)]
    pub block: Option<u64>,
}

#[derive(Debug)]
pub struct PropagateOutput {
    pub versioned_hash: VersionedHash,
    pub size: usize,
    pub primary: StorageName,
    pub storages: Vec<StorageName>,
}

impl fmt::Display for PropagateOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {}",
            "Submitted".green().bold(),
            self.versioned_hash.to_string().bold()
        )?;
        writeln!(f, "  {} {} bytes", "Size:".dimmed(), self.size)?;
        writeln!(f, "  {} {}", "Primary:".dimmed(), self.primary)?;
        let storages: Vec<&str> = self.storages.iter().map(|s| s.as_str()).collect();
        write!(f, "  {} {}", "Queued for:".dimmed(), storages.join(", "))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PropagateError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid versioned hash: {0}")]
    Hash(#[from] VersionedHashError),
    #[error("invalid commitment: {0}")]
    Commitment(#[from] hex::FromHexError),
    #[error("either --hash or --commitment is required")]
    MissingHash,
    #[error("failed to record blob: {0}")]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Propagation(#[from] PropagationError),
    #[error(transparent)]
    Close(#[from] PropagatorCloseError),
}

impl Propagate {
    fn versioned_hash(&self) -> Result<VersionedHash, PropagateError> {
        if let Some(hash) = &self.hash {
            return Ok(hash.parse()?);
        }
        let commitment = self.commitment.as_ref().ok_or(PropagateError::MissingHash)?;
        let digits = commitment.strip_prefix("0x").unwrap_or(commitment);
        Ok(VersionedHash::from_kzg_commitment(&hex::decode(digits)?))
    }
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Propagate {
    type Error = PropagateError;
    type Output = PropagateOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let config = ctx.load_config()?;
        let versioned_hash = self.versioned_hash()?;
        let data = tokio::fs::read(&self.file)
            .await
            .map_err(|source| PropagateError::Read {
                path: self.file.clone(),
                source,
            })?;

        let mut blob = Blob::new(versioned_hash.clone(), data);
        if let Some(block) = self.block {
            blob = blob.with_block_number(block);
        }

        // Submit only; the daemon's workers do the rest.
        let mut options = config.propagator_options();
        options.run_workers = false;
        options.reconciler = None;
        let propagator = build_propagator(&config, options).await?;

        propagator
            .database()
            .insert_blob(&versioned_hash, blob.size() as i64, blob.block_number)
            .await?;
        let submitted = propagator.propagate_blob(&blob).await;
        propagator.close().await?;
        submitted?;

        Ok(PropagateOutput {
            versioned_hash,
            size: blob.size(),
            primary: propagator.primary(),
            storages: propagator.storages().to_vec(),
        })
    }
}
