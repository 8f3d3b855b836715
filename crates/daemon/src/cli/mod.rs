use std::path::PathBuf;

use clap::Parser;

pub mod op;
pub mod ops;

pub use ops::Command;

#[derive(Parser, Debug)]
#[command(
    name = "blobprop",
    about = "Replicate EIP-4844 blobs across storage backends",
    version
)]
pub struct Cli {
    /// Config file (default: ~/.blobprop/config.toml)
    #[arg(long, global = true, env = "BLOBPROP_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}
