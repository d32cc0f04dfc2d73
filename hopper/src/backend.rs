//! The storage seam of the queue.
//!
//! A [`Backend`] owns three durable collections: the job store, the failure archive and the
//! worker registry. Everything the [`crate::JobQueue`] and [`crate::worker::Worker`] do goes
//! through this trait, and every method that moves a job between states must do so
//! atomically with respect to concurrent callers.
//!
//! Two implementations exist: [`memory::InMemoryBackend`] in this crate and a PostgreSQL one
//! in `hopper-sqlx`. Both are checked by the shared conformance suite in [`testing`].
use std::{error::Error, fmt::Display};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    job::{JobId, JobState, Progress, DEFAULT_QUEUE},
    worker::{WorkerId, WorkerRecord, WorkerStatus},
};

pub mod memory;
#[doc(hidden)]
pub mod testing;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Inserts a new job with no attempts, available `job.delay` from now.
    async fn push(&self, job: EnqueuableJob) -> Result<JobId, BackendError>;

    /// Atomically selects the most urgent available job in `queue` and reserves it.
    ///
    /// Selection is highest priority first, then oldest first. Reserving sets `reserved_at`,
    /// records `worker_id` as the holder and increments `attempts`. Under concurrent calls a
    /// job must be handed to at most one caller.
    async fn reserve(
        &self,
        queue: &str,
        worker_id: Option<&WorkerId>,
    ) -> Result<Option<Job>, BackendError>;

    /// Marks a reserved job completed.
    ///
    /// This and the other methods taking a [`Reservation`] only act while the job is still
    /// held under that reservation and is not completed. Otherwise they change nothing and
    /// fail with [`BackendError::ReservationLost`].
    async fn mark_job_complete(&self, reservation: Reservation) -> Result<(), BackendError>;

    /// Returns a reserved job to the pool without counting the attempt.
    async fn release_job(
        &self,
        reservation: Reservation,
        delay: TimeDelta,
    ) -> Result<(), BackendError>;

    /// Clears the reservation after a failed attempt, making the job available again after
    /// `delay`. The attempt stays counted.
    async fn mark_job_retryable(
        &self,
        reservation: Reservation,
        delay: TimeDelta,
    ) -> Result<(), BackendError>;

    /// Moves a reserved job from the job store to the failure archive in one atomic step.
    async fn archive_job(
        &self,
        reservation: Reservation,
        error: ErrorRecord,
    ) -> Result<FailedJobId, BackendError>;

    /// Overwrites the progress of a job.
    async fn update_progress(
        &self,
        id: JobId,
        progress: Progress,
    ) -> Result<(), BackendError>;

    async fn job(&self, id: JobId) -> Result<Option<Job>, BackendError>;

    /// Archived jobs for `queue`, most recent failure first.
    async fn failed_jobs(
        &self,
        queue: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<FailedJob>, BackendError>;

    /// Atomically moves an archived job back into the job store with no attempts and its
    /// priority raised by `priority_boost`.
    async fn retry_failed_job(
        &self,
        id: FailedJobId,
        queue: &str,
        priority_boost: i32,
    ) -> Result<JobId, BackendError>;

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, BackendError>;

    /// Deletes completed jobs of `queue` that finished more than `older_than` ago.
    async fn prune_completed_jobs(
        &self,
        queue: &str,
        older_than: TimeDelta,
    ) -> Result<u64, BackendError>;

    /// Creates or resets the record of a worker, marking it running.
    async fn register_worker(&self, id: &WorkerId, queue: &str) -> Result<(), BackendError>;

    /// Refreshes the heartbeat and counters of a worker and returns its current status, or
    /// `None` when the worker has no record.
    async fn record_heartbeat(
        &self,
        id: &WorkerId,
        processed: u64,
        failed: u64,
    ) -> Result<Option<WorkerStatus>, BackendError>;

    async fn set_worker_status(
        &self,
        id: &WorkerId,
        status: WorkerStatus,
    ) -> Result<(), BackendError>;

    async fn unregister_worker(&self, id: &WorkerId) -> Result<(), BackendError>;

    async fn workers(&self, queue: Option<&str>) -> Result<Vec<WorkerRecord>, BackendError>;

    /// Deletes workers whose last heartbeat is older than `timeout` and resolves orphaned
    /// reservations.
    ///
    /// A reservation is orphaned when its holder has no worker record left, or when it has
    /// no holder and was taken more than `timeout` ago. Orphans that used their last attempt
    /// are archived with [`ErrorType::Orphaned`]; the rest become available immediately.
    async fn reap_stale_workers(&self, timeout: TimeDelta) -> Result<ReapReport, BackendError>;
}

/// A job ready to be inserted into the job store.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueuableJob {
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    pub priority: i32,
    pub max_attempts: u16,
    pub delay: TimeDelta,
}

impl EnqueuableJob {
    pub const DEFAULT_MAX_ATTEMPTS: u16 = 3;

    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_owned(),
            job_type: job_type.into(),
            payload,
            priority: 0,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            delay: TimeDelta::zero(),
        }
    }

    pub fn on_queue(self, queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..self
        }
    }

    pub fn with_priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    pub fn with_delay(self, delay: TimeDelta) -> Self {
        Self { delay, ..self }
    }
}

/// A job as held in the job store.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    pub priority: i32,
    pub attempts: u16,
    pub max_attempts: u16,
    pub progress: u8,
    pub progress_data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub reserved_by: Option<WorkerId>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn state(&self, now: DateTime<Utc>) -> JobState {
        if self.completed_at.is_some() {
            JobState::Completed
        } else if self.reserved_at.is_some() {
            JobState::Reserved
        } else if self.available_at > now {
            JobState::Delayed
        } else {
            JobState::Queued
        }
    }

    pub fn progress(&self) -> Progress {
        Progress {
            percent: self.progress,
            data: self.progress_data.clone(),
        }
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// The reservation this copy of the job was handed out under.
    pub fn reservation(&self) -> Result<Reservation, BackendError> {
        let reserved_at = self
            .reserved_at
            .ok_or(BackendError::ReservationLost(self.id))?;
        Ok(Reservation {
            job_id: self.id,
            reserved_at,
        })
    }
}

/// Identifies one reservation of a job.
///
/// A job reclaimed by [`Backend::reap_stale_workers`] and reserved again gets a new
/// reservation, so a former holder can no longer settle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub job_id: JobId,
    pub reserved_at: DateTime<Utc>,
}

/// The identifier of an entry in the failure archive.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct FailedJobId(i64);

impl From<i64> for FailedJobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<FailedJobId> for i64 {
    fn from(value: FailedJobId) -> Self {
        value.0
    }
}

impl Display for FailedJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FailedJobId({})", self.0)
    }
}

/// A job that exhausted its attempts, kept with the error that finished it.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedJob {
    pub id: FailedJobId,
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    pub priority: i32,
    pub max_attempts: u16,
    /// Attempts made when the job was archived.
    pub attempts: u16,
    pub error_type: ErrorType,
    pub message: String,
    pub detail: String,
    pub failed_at: DateTime<Utc>,
}

/// Why an attempt failed, as stored alongside archived jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub error_type: ErrorType,
    pub message: String,
    pub detail: String,
}

impl ErrorRecord {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            detail: String::new(),
        }
    }

    pub fn with_detail(self, detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            ..self
        }
    }

    /// The error recorded when a reservation's holder is gone.
    pub fn orphaned(holder: Option<&WorkerId>) -> Self {
        let message = match holder {
            Some(holder) => format!("Reservation abandoned by worker {holder}"),
            None => "Reservation expired without a worker".to_owned(),
        };
        Self::new(ErrorType::Orphaned, message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorType {
    Panic,
    Timeout,
    /// The worker holding the reservation stopped sending heartbeats.
    Orphaned,
    /// No executor is registered for the job's type.
    UnknownJobType,
    /// The payload could not be decoded into the executor's data.
    Decode,
    Other(String),
}

impl ErrorType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Panic => "panic",
            Self::Timeout => "timeout",
            Self::Orphaned => "orphaned",
            Self::UnknownJobType => "unknown_job_type",
            Self::Decode => "decode",
            Self::Other(other) => other,
        }
    }
}

impl From<&str> for ErrorType {
    fn from(value: &str) -> Self {
        match value {
            "panic" => Self::Panic,
            "timeout" => Self::Timeout,
            "orphaned" => Self::Orphaned,
            "unknown_job_type" => Self::UnknownJobType,
            "decode" => Self::Decode,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl From<String> for ErrorType {
    fn from(value: String) -> Self {
        value.as_str().into()
    }
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Counts for a single queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs not yet completed: pending, delayed and reserved.
    pub total: u64,
    pub pending: u64,
    pub delayed: u64,
    pub reserved: u64,
    pub completed: u64,
    /// Entries in the failure archive.
    pub failed: u64,
    /// Registered workers with status running.
    pub active_workers: u64,
}

/// What [`Backend::reap_stale_workers`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub workers: Vec<WorkerId>,
    pub released: Vec<JobId>,
    pub archived: Vec<JobId>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty() && self.released.is_empty() && self.archived.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("Failed job not found: {0}")]
    FailedJobNotFound(FailedJobId),
    #[error("Reservation of job {0} is no longer held")]
    ReservationLost(JobId),
    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),
    #[error("Missing storage collection `{0}`, has the schema been provisioned?")]
    MissingCollection(String),
    #[error("System in bad state")]
    BadState,
    #[error("Storage error: {0}")]
    Storage(#[source] Box<dyn Error + Send + Sync>),
}

#[cfg(test)]
impl Job {
    pub(crate) fn raw_job() -> Self {
        let now = Utc::now();
        Self {
            id: 0.into(),
            queue: DEFAULT_QUEUE.to_owned(),
            job_type: "executor".to_owned(),
            payload: Value::Null,
            priority: 0,
            attempts: 1,
            max_attempts: 3,
            progress: 0,
            progress_data: None,
            created_at: now,
            available_at: now,
            reserved_at: Some(now),
            reserved_by: None,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_type_round_trips_through_its_name() {
        for error_type in [
            ErrorType::Panic,
            ErrorType::Timeout,
            ErrorType::Orphaned,
            ErrorType::UnknownJobType,
            ErrorType::Decode,
            ErrorType::Other("custom".to_owned()),
        ] {
            assert_eq!(ErrorType::from(error_type.as_str()), error_type);
        }
    }

    #[test]
    fn orphaned_error_names_the_worker() {
        let holder = WorkerId::from("worker-1");

        let error = ErrorRecord::orphaned(Some(&holder));
        assert_eq!(error.error_type, ErrorType::Orphaned);
        assert_eq!(error.message, "Reservation abandoned by worker worker-1");

        let error = ErrorRecord::orphaned(None);
        assert_eq!(error.message, "Reservation expired without a worker");
    }

    #[test]
    fn reservation_requires_a_reserved_job() {
        let job = Job::raw_job();
        let reservation = job.reservation().unwrap();
        assert_eq!(reservation.job_id, job.id);
        assert_eq!(Some(reservation.reserved_at), job.reserved_at);

        let job = Job {
            reserved_at: None,
            ..job
        };
        assert!(matches!(
            job.reservation(),
            Err(BackendError::ReservationLost(_))
        ));
    }
}
