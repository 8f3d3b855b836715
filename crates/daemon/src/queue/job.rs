use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::sqlite::{SqliteArgumentValue, SqliteRow, SqliteTypeInfo, SqliteValueRef};
use sqlx::{Decode, Encode, Row, Sqlite, Type};
use time::OffsetDateTime;

use crate::database::from_millis;

use super::QueueError;

/// Lifecycle of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Runnable as soon as a worker is free.
    Waiting,
    /// Flow parent blocked until every child completes.
    WaitingChildren,
    /// Waiting out a retry backoff.
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Waiting,
        JobState::WaitingChildren,
        JobState::Delayed,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::WaitingChildren => "waiting_children",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// Completed and failed jobs never run again unless resubmitted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown job state: {0}")]
pub struct UnknownJobState(pub String);

impl FromStr for JobState {
    type Err = UnknownJobState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownJobState(s.to_string()))
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Decode<'_, Sqlite> for JobState {
    fn decode(value: SqliteValueRef<'_>) -> Result<Self, BoxDynError> {
        let s = <String as Decode<Sqlite>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl<'q> Encode<'q, Sqlite> for JobState {
    fn encode_by_ref(
        &self,
        args: &mut Vec<SqliteArgumentValue<'q>>,
    ) -> Result<IsNull, BoxDynError> {
        args.push(SqliteArgumentValue::Text(self.as_str().into()));
        Ok(IsNull::No)
    }
}

impl Type<Sqlite> for JobState {
    fn compatible(ty: &SqliteTypeInfo) -> bool {
        <String as Type<Sqlite>>::compatible(ty)
    }

    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }
}

/// Exponential retry backoff: `base * 2^(attempts_made - 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_delay: Duration,
}

impl Backoff {
    pub fn exponential(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    /// Delay before the next attempt, after `attempts_made` failed ones.
    pub fn delay(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(1000))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    /// 1 is the most urgent.
    pub priority: u32,
    /// Total attempts including the first one.
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 1,
            attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

/// A job about to be submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    /// Deterministic id, doubling as the deduplication key.
    pub id: String,
    pub queue: String,
    pub name: String,
    pub data: serde_json::Value,
    pub options: JobOptions,
}

impl NewJob {
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        queue: impl Into<String>,
        name: impl Into<String>,
        data: &T,
        options: JobOptions,
    ) -> Result<Self, QueueError> {
        Ok(Self {
            id: id.into(),
            queue: queue.into(),
            name: name.into(),
            data: serde_json::to_value(data)?,
            options,
        })
    }
}

/// A job as persisted in the `jobs` table.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub data: serde_json::Value,
    pub priority: u32,
    pub max_attempts: u32,
    pub attempts_made: u32,
    pub backoff: Backoff,
    pub state: JobState,
    pub run_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub failed_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,
}

impl Job {
    /// Deserialize the payload into the processor's input type.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }

    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, QueueError> {
        let data: String = row.try_get("data")?;
        let return_value: Option<String> = row.try_get("return_value")?;
        let priority: i64 = row.try_get("priority")?;
        let max_attempts: i64 = row.try_get("max_attempts")?;
        let attempts_made: i64 = row.try_get("attempts_made")?;
        let backoff_delay_ms: i64 = row.try_get("backoff_delay_ms")?;
        let run_at: i64 = row.try_get("run_at")?;
        let created_at: i64 = row.try_get("created_at")?;
        let finished_at: Option<i64> = row.try_get("finished_at")?;

        Ok(Self {
            id: row.try_get("id")?,
            queue: row.try_get("queue")?,
            name: row.try_get("name")?,
            parent_id: row.try_get("parent_id")?,
            data: serde_json::from_str(&data)?,
            priority: priority as u32,
            max_attempts: max_attempts as u32,
            attempts_made: attempts_made as u32,
            backoff: Backoff::exponential(Duration::from_millis(backoff_delay_ms as u64)),
            state: row.try_get("state")?,
            run_at: from_millis(run_at)?,
            created_at: from_millis(created_at)?,
            finished_at: finished_at.map(from_millis).transpose()?,
            failed_reason: row.try_get("failed_reason")?,
            return_value: return_value
                .map(|value| serde_json::from_str(&value))
                .transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay(3), Duration::from_millis(4000));
        // never panics on absurd attempt counts
        assert!(backoff.delay(u32::MAX) >= backoff.delay(31));
    }

    #[test]
    fn test_state_parse() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("stalled".parse::<JobState>().is_err());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::WaitingChildren.is_terminal());
    }

    #[test]
    fn test_default_options() {
        let options = JobOptions::default();
        assert_eq!(options.attempts, 3);
        assert_eq!(options.backoff.base_delay, Duration::from_millis(1000));
    }
}
