use clap::Parser;
use owo_colors::OwoColorize;

use blobprop_daemon::config::LogConfig;

mod cli;

use cli::op::OpContext;
use cli::Cli;

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    let ctx = match OpContext::new(args.config) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            std::process::exit(1);
        }
    };

    // Logging follows the config when it can be read; init and broken
    // configs still get the defaults.
    let log_config = ctx
        .load_config()
        .map(|config| config.log)
        .unwrap_or_else(|_| LogConfig::default());
    let guards = blobprop_daemon::logging::init(&log_config);

    let code = match args.command.execute(&ctx).await {
        Ok(output) => {
            println!("{}", output);
            0
        }
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            1
        }
    };

    // exit() skips destructors, flush buffered log lines first.
    drop(guards);
    std::process::exit(code);
}
