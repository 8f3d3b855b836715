use std::fmt;
use std::path::PathBuf;

use blobprop_daemon::config::{Config, ConfigError};

/// Context shared by every command.
#[derive(Debug, Clone)]
pub struct OpContext {
    pub config_path: PathBuf,
}

impl OpContext {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config_path = match config_path {
            Some(path) => path,
            None => Config::default_path()?,
        };
        Ok(Self { config_path })
    }

    pub fn load_config(&self) -> Result<Config, ConfigError> {
        Config::load(&self.config_path)
    }
}

/// A CLI command.
#[async_trait::async_trait]
pub trait Op: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;
    type Output: fmt::Display + fmt::Debug;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error>;
}

/// Generate a clap `Command` enum over ops, plus the matching `OpOutput`
/// and `OpError` enums and the dispatching `execute`.
#[macro_export]
macro_rules! command_enum {
    ($(($variant:ident, $ty:ty)),* $(,)?) => {
        #[derive(clap::Subcommand, Debug, Clone)]
        pub enum Command {
            $($variant($ty),)*
        }

        #[derive(Debug)]
        pub enum OpOutput {
            $($variant(<$ty as $crate::cli::op::Op>::Output),)*
        }

        impl std::fmt::Display for OpOutput {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(OpOutput::$variant(output) => write!(f, "{}", output),)*
                }
            }
        }

        #[derive(Debug, thiserror::Error)]
        pub enum OpError {
            $(
                #[error(transparent)]
                $variant(<$ty as $crate::cli::op::Op>::Error),
            )*
        }

        impl Command {
            pub async fn execute(
                &self,
                ctx: &$crate::cli::op::OpContext,
            ) -> Result<OpOutput, OpError> {
                match self {
                    $(
                        Command::$variant(op) => $crate::cli::op::Op::execute(op, ctx)
                            .await
                            .map(OpOutput::$variant)
                            .map_err(OpError::$variant),
                    )*
                }
            }
        }
    };
}
