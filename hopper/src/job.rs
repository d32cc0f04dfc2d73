//! The job model.
//!
//! A job is an opaque payload plus the bookkeeping the queue needs to hand it to exactly one
//! worker at a time: attempts, priority, availability, and progress.
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::backend;

pub mod builder;
pub(crate) mod registry;
pub(crate) mod runner;

/// The queue jobs are pushed to when no queue is given.
pub const DEFAULT_QUEUE: &str = "default";

/// The identifier of a job in the job store.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct JobId(i64);

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// A reserved job with its payload decoded into the executor's data type.
///
/// This is what an [`crate::executor::Executor`] receives. The raw, storage level
/// representation is [`backend::Job`].
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct Job<D> {
    pub id: JobId,
    pub queue: String,
    pub job_type: String,
    pub data: D,
    pub priority: i32,
    /// The attempt currently running, starting at 1.
    pub attempts: u16,
    pub max_attempts: u16,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
}

impl<D> TryFrom<backend::Job> for Job<D>
where
    D: DeserializeOwned,
{
    type Error = serde_json::Error;

    fn try_from(value: backend::Job) -> Result<Self, Self::Error> {
        let data = serde_json::from_value(value.payload)?;
        Ok(Self {
            id: value.id,
            queue: value.queue,
            job_type: value.job_type,
            data,
            priority: value.priority,
            attempts: value.attempts,
            max_attempts: value.max_attempts,
            created_at: value.created_at,
            available_at: value.available_at,
            reserved_at: value.reserved_at,
        })
    }
}

impl<D> Job<D> {
    /// Whether a failure of the current attempt sends the job to the failure archive.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Where a job currently sits in its life cycle.
///
/// Archived jobs are not represented here: they no longer live in the job store, see
/// [`backend::FailedJob`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum JobState {
    /// Waiting for its `available_at` to pass.
    Delayed,
    /// Eligible for the next `pop`.
    Queued,
    /// Held by a worker.
    Reserved,
    Completed,
}

/// Progress reported by a running job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Progress {
    /// Percentage complete, `0..=100`.
    pub percent: u8,
    /// Free form data attached to the latest update. Replaced, never merged.
    pub data: Option<serde_json::Value>,
}

impl Progress {
    pub const MAX_PERCENT: u8 = 100;
}
