use std::io::IsTerminal;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::FmtSubscriber;

use crate::config::LogConfig;

const LOG_FILE_PREFIX: &str = "blobprop.log";

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. When `dir` is set, logs are
/// also written to a daily rotated file there. The returned guards flush
/// pending lines on drop and must be held until exit.
pub fn init(config: &LogConfig) -> Vec<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (stderr, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());
    let mut guards = vec![stderr_guard];

    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_env_filter(filter)
        .with_thread_ids(false);

    match &config.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (file, file_guard) = tracing_appender::non_blocking(appender);
            guards.push(file_guard);
            let _ = builder
                .with_ansi(false)
                .with_writer(stderr.and(file))
                .finish()
                .try_init();
        }
        None => {
            let _ = builder
                .with_ansi(std::io::stderr().is_terminal())
                .with_writer(stderr)
                .finish()
                .try_init();
        }
    }

    guards
}
