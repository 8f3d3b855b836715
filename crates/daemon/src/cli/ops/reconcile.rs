use std::fmt;

use clap::Args;
use owo_colors::OwoColorize;
use time::format_description::well_known::Rfc3339;

use blobprop_daemon::config::ConfigError;
use blobprop_daemon::propagator::{PropagatorCloseError, ReconcileResult, ReconcilerError};
use blobprop_daemon::setup::{build_propagator, SetupError};

/// Resubmit flows for blobs that have no storage reference, once.
#[derive(Args, Debug, Clone)]
pub struct Reconcile {
    /// Orphans to resubmit (default: reconciler.batch_size)
    #[arg(long)]
    pub batch_size: Option<u32>,
}

#[derive(Debug)]
pub struct ReconcileOutput {
    pub result: ReconcileResult,
}

impl fmt::Display for ReconcileOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.result.jobs_created == 0 {
            return write!(f, "{}", "No orphaned blobs".dimmed());
        }
        write!(
            f,
            "{} {} orphaned blobs",
            "Resubmitted".green().bold(),
            self.result.jobs_created
        )?;
        if let Some(timestamps) = &self.result.blob_timestamps {
            let format = |at: time::OffsetDateTime| {
                at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
            };
            write!(
                f,
                "\n  {} {}\n  {} {}",
                "First:".dimmed(),
                format(timestamps.first_blob),
                "Last:".dimmed(),
                format(timestamps.last_blob)
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("reconciliation failed: {0}")]
    Reconciler(#[from] ReconcilerError),
    #[error(transparent)]
    Close(#[from] PropagatorCloseError),
    #[error("--batch-size must be at least 1")]
    InvalidBatchSize,
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Reconcile {
    type Error = ReconcileError;
    type Output = ReconcileOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let config = ctx.load_config()?;

        let mut options = config.propagator_options();
        options.run_workers = false;
        options.reconciler = None;
        if let Some(batch_size) = self.batch_size {
            if batch_size == 0 {
                return Err(ReconcileError::InvalidBatchSize);
            }
            options.reconcile_batch_size = batch_size;
        }

        let propagator = build_propagator(&config, options).await?;
        let result = propagator.reconcile().await;
        propagator.close().await?;

        Ok(ReconcileOutput { result: result? })
    }
}
