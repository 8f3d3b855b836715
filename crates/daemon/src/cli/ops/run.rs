use std::fmt;

use clap::Args;
use owo_colors::OwoColorize;
use tracing::info;

use blobprop_daemon::config::ConfigError;
use blobprop_daemon::propagator::PropagatorCloseError;
use blobprop_daemon::setup::{build_propagator, SetupError};

/// Run the workers, the finalizer and the scheduled reconciler until Ctrl-C.
#[derive(Args, Debug, Clone)]
pub struct Run;

#[derive(Debug)]
pub struct RunOutput {
    pub storages: usize,
}

impl fmt::Display for RunOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after serving {} storages",
            "Stopped".green().bold(),
            self.storages
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("failed to listen for ctrl-c: {0}")]
    Signal(#[from] std::io::Error),
    #[error(transparent)]
    Close(#[from] PropagatorCloseError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Run {
    type Error = RunError;
    type Output = RunOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let config = ctx.load_config()?;
        let propagator = build_propagator(&config, config.propagator_options()).await?;
        let storages = propagator.storages().len();

        info!(
            primary = %propagator.primary(),
            storages,
            "blob propagator running, press ctrl-c to stop"
        );

        // Close even when the signal handler could not be installed.
        let signal = tokio::signal::ctrl_c().await;
        info!("shutting down");
        propagator.close().await?;
        signal?;

        Ok(RunOutput { storages })
    }
}
