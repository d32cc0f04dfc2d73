use chrono::{DateTime, Utc};
use hopper::{
    backend::{self, BackendError},
    worker,
};
use sqlx::prelude::FromRow;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "hopper_worker_status", rename_all = "lowercase")]
pub(crate) enum WorkerStatus {
    Running,
    Paused,
    Stopped,
}

impl From<WorkerStatus> for worker::WorkerStatus {
    fn from(value: WorkerStatus) -> Self {
        match value {
            WorkerStatus::Running => Self::Running,
            WorkerStatus::Paused => Self::Paused,
            WorkerStatus::Stopped => Self::Stopped,
        }
    }
}

impl From<worker::WorkerStatus> for WorkerStatus {
    fn from(value: worker::WorkerStatus) -> Self {
        match value {
            worker::WorkerStatus::Running => Self::Running,
            worker::WorkerStatus::Paused => Self::Paused,
            worker::WorkerStatus::Stopped => Self::Stopped,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct Job {
    pub id: i64,
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub progress: i16,
    pub progress_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub reserved_by: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<Job> for backend::Job {
    type Error = BackendError;

    fn try_from(value: Job) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.into(),
            queue: value.queue,
            job_type: value.job_type,
            payload: value.payload,
            priority: value.priority,
            attempts: narrow(value.attempts)?,
            max_attempts: narrow(value.max_attempts)?,
            progress: narrow(value.progress)?,
            progress_data: value.progress_data,
            created_at: value.created_at,
            available_at: value.available_at,
            reserved_at: value.reserved_at,
            reserved_by: value.reserved_by.map(Into::into),
            completed_at: value.completed_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct FailedJob {
    pub id: i64,
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_attempts: i32,
    pub attempts: i32,
    pub error_type: String,
    pub message: String,
    pub detail: String,
    pub failed_at: DateTime<Utc>,
}

impl TryFrom<FailedJob> for backend::FailedJob {
    type Error = BackendError;

    fn try_from(value: FailedJob) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.into(),
            queue: value.queue,
            job_type: value.job_type,
            payload: value.payload,
            priority: value.priority,
            max_attempts: narrow(value.max_attempts)?,
            attempts: narrow(value.attempts)?,
            error_type: value.error_type.into(),
            message: value.message,
            detail: value.detail,
            failed_at: value.failed_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct WorkerRecord {
    pub worker_id: String,
    pub queue: String,
    pub status: WorkerStatus,
    pub processed_count: i64,
    pub failed_count: i64,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl TryFrom<WorkerRecord> for worker::WorkerRecord {
    type Error = BackendError;

    fn try_from(value: WorkerRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            worker_id: value.worker_id.into(),
            queue: value.queue,
            status: value.status.into(),
            processed_count: narrow(value.processed_count)?,
            failed_count: narrow(value.failed_count)?,
            last_heartbeat: value.last_heartbeat,
            started_at: value.started_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct QueueStats {
    pub pending: i64,
    pub delayed: i64,
    pub reserved: i64,
    pub completed: i64,
    pub failed: i64,
    pub active_workers: i64,
}

impl TryFrom<QueueStats> for backend::QueueStats {
    type Error = BackendError;

    fn try_from(value: QueueStats) -> Result<Self, Self::Error> {
        let pending = narrow(value.pending)?;
        let delayed = narrow(value.delayed)?;
        let reserved = narrow(value.reserved)?;
        Ok(Self {
            total: pending + delayed + reserved,
            pending,
            delayed,
            reserved,
            completed: narrow(value.completed)?,
            failed: narrow(value.failed)?,
            active_workers: narrow(value.active_workers)?,
        })
    }
}

/// A job left without a live holder, as found by the reaper.
#[derive(Debug, FromRow)]
pub(crate) struct Orphan {
    pub id: i64,
    pub reserved_at: DateTime<Utc>,
    pub reserved_by: Option<String>,
    pub exhausted: bool,
}

impl Orphan {
    pub(crate) fn reservation(&self) -> backend::Reservation {
        backend::Reservation {
            job_id: self.id.into(),
            reserved_at: self.reserved_at,
        }
    }
}

/// Converts a column into the narrower or unsigned type of the domain model.
///
/// The schema's check constraints keep these in range, so a failure means the table was
/// written to outside of this crate.
fn narrow<T, U>(value: T) -> Result<U, BackendError>
where
    U: TryFrom<T>,
{
    U::try_from(value).map_err(|_| BackendError::BadState)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn negative_counts_are_rejected() {
        let stats = QueueStats {
            pending: 2,
            delayed: 1,
            reserved: -1,
            completed: 0,
            failed: 0,
            active_workers: 0,
        };

        assert!(matches!(
            backend::QueueStats::try_from(stats),
            Err(BackendError::BadState)
        ));
    }

    #[test]
    fn stats_total_excludes_completed() {
        let stats = QueueStats {
            pending: 2,
            delayed: 1,
            reserved: 3,
            completed: 7,
            failed: 4,
            active_workers: 1,
        };

        let stats = backend::QueueStats::try_from(stats).unwrap();
        assert_eq!(stats.total, 6);
        assert_eq!(stats.completed, 7);
    }

    #[test]
    fn worker_status_maps_both_ways() {
        for status in [
            worker::WorkerStatus::Running,
            worker::WorkerStatus::Paused,
            worker::WorkerStatus::Stopped,
        ] {
            assert_eq!(
                worker::WorkerStatus::from(WorkerStatus::from(status)),
                status
            );
        }
    }
}
