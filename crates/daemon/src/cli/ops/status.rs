use std::collections::BTreeMap;
use std::fmt;

use clap::Args;
use comfy_table::Table;
use owo_colors::OwoColorize;

use blobprop_daemon::config::ConfigError;
use blobprop_daemon::database::DatabaseError;
use blobprop_daemon::queue::{JobCounts, JobState, QueueError, QueueStore};
use blobprop_daemon::setup::open_database;

/// Show job counts per queue and how many blobs lack any copy.
#[derive(Args, Debug, Clone)]
pub struct Status;

#[derive(Debug)]
pub struct StatusOutput {
    pub queues: BTreeMap<String, JobCounts>,
    pub blobs: i64,
    pub orphaned: i64,
}

impl fmt::Display for StatusOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", "Blobs:".bold(), self.blobs)?;
        let orphaned = if self.orphaned == 0 {
            self.orphaned.green().to_string()
        } else {
            self.orphaned.yellow().to_string()
        };
        writeln!(f, "{} {}", "Orphaned:".bold(), orphaned)?;

        if self.queues.is_empty() {
            return write!(f, "{}", "No jobs".dimmed());
        }

        let mut table = Table::new();
        let mut header = vec!["Queue".to_string()];
        header.extend(JobState::ALL.iter().map(|state| state.to_string()));
        table.set_header(header);

        for (queue, counts) in &self.queues {
            let mut row = vec![queue.clone()];
            row.extend(JobState::ALL.iter().map(|state| counts.get(*state).to_string()));
            table.add_row(row);
        }

        write!(f, "{table}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to open database: {0}")]
    Database(#[from] DatabaseError),
    #[error("failed to read queues: {0}")]
    Queue(#[from] QueueError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Status {
    type Error = StatusError;
    type Output = StatusOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let config = ctx.load_config()?;
        let db = open_database(&config).await?;

        let blobs = db.blob_count().await?;
        let orphaned = db.count_orphaned_blobs().await?;
        let queues = QueueStore::new(db).counts().await?;

        Ok(StatusOutput {
            queues,
            blobs,
            orphaned,
        })
    }
}
