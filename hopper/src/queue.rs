//! The queue orchestrator.
//!
//! [`JobQueue`] is the entry point for producers, workers and operators alike. It is a thin,
//! cheaply cloneable handle over a shared [`Backend`] that adds the retry and failure policy on
//! top of the backend's atomic state transitions.
use std::sync::Arc;

use chrono::TimeDelta;
use serde_json::Value;

use crate::{
    backend::{
        Backend, BackendError, EnqueuableJob, ErrorRecord, FailedJob, FailedJobId, Job,
        QueueStats, ReapReport, Reservation,
    },
    job::{JobId, Progress},
    retry::RetryPolicy,
    worker::{WorkerAction, WorkerId, WorkerRecord},
    HopperError,
};

type Result<T> = std::result::Result<T, HopperError>;

/// Tunables for a [`JobQueue`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueConfig {
    /// How long a worker may go without a heartbeat before
    /// [`JobQueue::cleanup_stale_workers`] treats it as dead.
    pub stale_worker_timeout: TimeDelta,
    /// Added to the priority of archived jobs put back by [`JobQueue::retry_failed_job`].
    pub retry_priority_boost: i32,
    /// Used by [`JobQueue::handle_failure`]. Jobs run by a worker use their executor's policy.
    pub retry_policy: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stale_worker_timeout: TimeDelta::minutes(5),
            retry_priority_boost: 10,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn with_stale_worker_timeout(self, stale_worker_timeout: TimeDelta) -> Self {
        Self {
            stale_worker_timeout,
            ..self
        }
    }

    pub fn with_retry_priority_boost(self, retry_priority_boost: i32) -> Self {
        Self {
            retry_priority_boost,
            ..self
        }
    }

    pub fn with_retry_policy(self, retry_policy: RetryPolicy) -> Self {
        Self {
            retry_policy,
            ..self
        }
    }
}

/// What became of a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The job is back in the job store, available after `delay`.
    Retrying { delay: TimeDelta },
    /// The job used its last attempt and moved to the failure archive.
    Archived(FailedJobId),
}

#[derive(Clone)]
pub struct JobQueue {
    backend: Arc<dyn Backend>,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new<B>(backend: B) -> Self
    where
        B: Backend + 'static,
    {
        Self::from_arc(Arc::new(backend))
    }

    pub fn from_arc(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            config: QueueConfig::default(),
        }
    }

    pub fn with_config(self, config: QueueConfig) -> Self {
        Self { config, ..self }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub async fn push(&self, job: EnqueuableJob) -> Result<JobId> {
        let queue = job.queue.clone();
        let job_id = self.backend.push(job).await?;
        tracing::debug!(%job_id, %queue, "Pushed job {job_id} to {queue}");
        Ok(job_id)
    }

    /// Reserves the most urgent available job of `queue` without naming a holder.
    ///
    /// Anonymous reservations are only reclaimed by [`JobQueue::cleanup_stale_workers`] once
    /// they are older than the stale worker timeout.
    pub async fn pop(&self, queue: &str) -> Result<Option<Job>> {
        Ok(self.backend.reserve(queue, None).await?)
    }

    pub(crate) async fn reserve_for(
        &self,
        queue: &str,
        worker_id: &WorkerId,
    ) -> Result<Option<Job>> {
        Ok(self.backend.reserve(queue, Some(worker_id)).await?)
    }

    pub async fn job(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.backend.job(job_id).await?)
    }

    /// Marks a job returned by [`JobQueue::pop`] completed.
    ///
    /// Fails with [`BackendError::ReservationLost`] when the reservation was reclaimed by
    /// [`JobQueue::cleanup_stale_workers`] in the meantime.
    pub async fn complete(&self, job: &Job) -> Result<()> {
        self.complete_reservation(job.reservation()?).await
    }

    pub(crate) async fn complete_reservation(&self, reservation: Reservation) -> Result<()> {
        let job_id = reservation.job_id;
        self.backend.mark_job_complete(reservation).await?;
        tracing::debug!(%job_id, "Job {job_id} complete");
        Ok(())
    }

    /// Hands a reserved job back without counting the attempt.
    pub async fn release(&self, job: &Job, delay: TimeDelta) -> Result<()> {
        self.release_reservation(job.reservation()?, delay).await
    }

    pub(crate) async fn release_reservation(
        &self,
        reservation: Reservation,
        delay: TimeDelta,
    ) -> Result<()> {
        let job_id = reservation.job_id;
        self.backend.release_job(reservation, delay).await?;
        tracing::debug!(%job_id, "Job {job_id} released for {delay}");
        Ok(())
    }

    /// Records a failed attempt of a reserved job, retrying it after the configured
    /// [`QueueConfig::retry_policy`] delay or archiving it when no attempts remain.
    pub async fn handle_failure(&self, job: &Job, error: ErrorRecord) -> Result<FailureOutcome> {
        let delay = self.config.retry_policy.delay(job.attempts);
        self.fail_attempt(job.reservation()?, !job.has_attempts_remaining(), error, delay)
            .await
    }

    pub(crate) async fn fail_attempt(
        &self,
        reservation: Reservation,
        is_final_attempt: bool,
        error: ErrorRecord,
        delay: TimeDelta,
    ) -> Result<FailureOutcome> {
        let job_id = reservation.job_id;
        if is_final_attempt {
            tracing::error!(
                %job_id,
                error_type = %error.error_type,
                "Job {job_id} failed and will be archived: {}",
                error.message
            );
            let failed_job_id = self.backend.archive_job(reservation, error).await?;
            Ok(FailureOutcome::Archived(failed_job_id))
        } else {
            tracing::warn!(
                %job_id,
                error_type = %error.error_type,
                "Job {job_id} failed and will be retried in {delay}: {}",
                error.message
            );
            self.backend.mark_job_retryable(reservation, delay).await?;
            Ok(FailureOutcome::Retrying { delay })
        }
    }

    /// Moves a job straight to the failure archive, whatever its attempts.
    pub(crate) async fn archive(
        &self,
        reservation: Reservation,
        error: ErrorRecord,
    ) -> Result<FailedJobId> {
        let job_id = reservation.job_id;
        tracing::error!(
            %job_id,
            error_type = %error.error_type,
            "Job {job_id} cannot run and will be archived: {}",
            error.message
        );
        Ok(self.backend.archive_job(reservation, error).await?)
    }

    /// Archived jobs of `queue`, most recent failure first.
    pub async fn failed_jobs(
        &self,
        queue: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<FailedJob>> {
        Ok(self.backend.failed_jobs(queue, limit, offset).await?)
    }

    /// Puts an archived job back in the job store with no attempts and a raised priority.
    pub async fn retry_failed_job(&self, id: FailedJobId, queue: &str) -> Result<JobId> {
        let job_id = self
            .backend
            .retry_failed_job(id, queue, self.config.retry_priority_boost)
            .await?;
        tracing::info!(%job_id, failed_job_id = %id, "Retrying archived job {id} as {job_id}");
        Ok(job_id)
    }

    pub async fn stats(&self, queue: &str) -> Result<QueueStats> {
        Ok(self.backend.queue_stats(queue).await?)
    }

    /// Registered workers, optionally limited to those consuming `queue`.
    pub async fn workers(&self, queue: Option<&str>) -> Result<Vec<WorkerRecord>> {
        Ok(self.backend.workers(queue).await?)
    }

    /// Asks a worker to pause, resume or stop.
    ///
    /// Only the worker's status is written; the worker observes it after its current job.
    pub async fn control_worker(&self, worker_id: &WorkerId, action: WorkerAction) -> Result<()> {
        let status = action.target_status();
        self.backend.set_worker_status(worker_id, status).await?;
        tracing::info!(%worker_id, %status, "Worker {worker_id} set to {status}");
        Ok(())
    }

    /// Removes workers that stopped sending heartbeats and resolves the reservations they
    /// left behind.
    pub async fn cleanup_stale_workers(&self) -> Result<ReapReport> {
        let report = self
            .backend
            .reap_stale_workers(self.config.stale_worker_timeout)
            .await?;
        if !report.is_empty() {
            tracing::warn!(
                workers = ?report.workers,
                released = report.released.len(),
                archived = report.archived.len(),
                "Reaped {} stale workers",
                report.workers.len()
            );
        }
        Ok(report)
    }

    pub async fn progress(&self, job_id: JobId) -> Result<Progress> {
        self.backend
            .job(job_id)
            .await?
            .map(|job| job.progress())
            .ok_or(HopperError::Backend(BackendError::JobNotFound(job_id)))
    }

    /// Overwrites the progress of a job. `percent` must be at most 100.
    pub async fn update_progress(
        &self,
        job_id: JobId,
        percent: u8,
        data: Option<Value>,
    ) -> Result<()> {
        if percent > Progress::MAX_PERCENT {
            return Err(HopperError::InvalidProgress(percent));
        }
        self.backend
            .update_progress(job_id, Progress { percent, data })
            .await?;
        tracing::trace!(%job_id, percent, "Job {job_id} at {percent}%");
        Ok(())
    }

    /// Deletes completed jobs of `queue` that finished more than `older_than` ago.
    pub async fn prune_completed_jobs(&self, queue: &str, older_than: TimeDelta) -> Result<u64> {
        let pruned = self.backend.prune_completed_jobs(queue, older_than).await?;
        tracing::debug!(%queue, pruned, "Pruned {pruned} completed jobs from {queue}");
        Ok(pruned)
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, ErrorType},
        job::DEFAULT_QUEUE,
        worker::WorkerStatus,
    };

    fn queue() -> JobQueue {
        let config = QueueConfig::default().with_retry_policy(RetryPolicy::fixed(TimeDelta::zero()));
        JobQueue::new(InMemoryBackend::new()).with_config(config)
    }

    fn error() -> ErrorRecord {
        ErrorRecord::new(ErrorType::Other("custom".to_owned()), "failed").with_detail("trace")
    }

    #[tokio::test]
    async fn failures_retry_until_max_attempts_then_archive() {
        let queue = queue();
        let job_id = queue
            .push(EnqueuableJob::new("executor", json!(1)).with_max_attempts(3))
            .await
            .unwrap();

        for attempt in 1..=2 {
            let job = queue.pop(DEFAULT_QUEUE).await.unwrap().unwrap();
            assert_eq!(job.attempts, attempt);
            assert_matches!(
                queue.handle_failure(&job, error()).await,
                Ok(FailureOutcome::Retrying { .. })
            );
        }

        let job = queue.pop(DEFAULT_QUEUE).await.unwrap().unwrap();
        assert_eq!(job.attempts, 3);
        assert_matches!(
            queue.handle_failure(&job, error()).await,
            Ok(FailureOutcome::Archived(_))
        );

        assert!(queue.job(job_id).await.unwrap().is_none());
        let failed = queue.failed_jobs(DEFAULT_QUEUE, 10, 0).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 3);
        assert_eq!(failed[0].message, "failed");
        assert_eq!(failed[0].detail, "trace");
    }

    #[tokio::test]
    async fn handle_failure_uses_retry_policy() {
        let queue = JobQueue::new(InMemoryBackend::new()).with_config(
            QueueConfig::default().with_retry_policy(RetryPolicy::fixed(TimeDelta::hours(1))),
        );
        queue
            .push(EnqueuableJob::new("executor", json!(1)))
            .await
            .unwrap();
        let job = queue.pop(DEFAULT_QUEUE).await.unwrap().unwrap();

        assert_eq!(
            queue.handle_failure(&job, error()).await.unwrap(),
            FailureOutcome::Retrying {
                delay: TimeDelta::hours(1)
            }
        );
        assert!(queue.pop(DEFAULT_QUEUE).await.unwrap().is_none());
        assert_eq!(queue.stats(DEFAULT_QUEUE).await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn retry_failed_job_boosts_priority() {
        let queue = queue().with_config(QueueConfig::default().with_retry_priority_boost(7));
        let job_id = queue
            .push(
                EnqueuableJob::new("executor", json!(1))
                    .with_priority(2)
                    .with_max_attempts(1),
            )
            .await
            .unwrap();
        let job = queue.pop(DEFAULT_QUEUE).await.unwrap().unwrap();
        let FailureOutcome::Archived(failed_id) = queue.handle_failure(&job, error()).await.unwrap()
        else {
            panic!("job should be archived");
        };

        let new_id = queue.retry_failed_job(failed_id, DEFAULT_QUEUE).await.unwrap();

        assert_ne!(new_id, job_id);
        let job = queue.job(new_id).await.unwrap().unwrap();
        assert_eq!(job.priority, 9);
        assert_eq!(job.attempts, 0);
        assert_matches!(
            queue.retry_failed_job(failed_id, DEFAULT_QUEUE).await,
            Err(HopperError::Backend(BackendError::FailedJobNotFound(_)))
        );
    }

    #[tokio::test]
    async fn progress_round_trip() {
        let queue = queue();
        let job_id = queue
            .push(EnqueuableJob::new("executor", json!(1)))
            .await
            .unwrap();

        assert_eq!(queue.progress(job_id).await.unwrap(), Progress::default());

        queue
            .update_progress(job_id, 50, Some(json!({ "rows": 10 })))
            .await
            .unwrap();
        let progress = queue.progress(job_id).await.unwrap();
        assert_eq!(progress.percent, 50);
        assert_eq!(progress.data, Some(json!({ "rows": 10 })));
    }

    #[tokio::test]
    async fn progress_above_hundred_is_rejected() {
        let queue = queue();
        let job_id = queue
            .push(EnqueuableJob::new("executor", json!(1)))
            .await
            .unwrap();

        assert_matches!(
            queue.update_progress(job_id, 101, None).await,
            Err(HopperError::InvalidProgress(101))
        );
        assert_eq!(queue.progress(job_id).await.unwrap().percent, 0);
    }

    #[tokio::test]
    async fn progress_of_unknown_job() {
        assert_matches!(
            queue().progress(42.into()).await,
            Err(HopperError::Backend(BackendError::JobNotFound(_)))
        );
    }

    #[tokio::test]
    async fn control_worker_sets_status() {
        let queue = queue();
        let worker_id = WorkerId::from("worker-1");
        queue
            .backend()
            .register_worker(&worker_id, DEFAULT_QUEUE)
            .await
            .unwrap();

        queue
            .control_worker(&worker_id, WorkerAction::Pause)
            .await
            .unwrap();
        let workers = queue.workers(Some(DEFAULT_QUEUE)).await.unwrap();
        assert_eq!(workers[0].status, WorkerStatus::Paused);

        queue
            .control_worker(&worker_id, WorkerAction::Resume)
            .await
            .unwrap();
        let workers = queue.workers(None).await.unwrap();
        assert_eq!(workers[0].status, WorkerStatus::Running);
    }

    #[tokio::test]
    async fn control_unknown_worker() {
        assert_matches!(
            queue()
                .control_worker(&WorkerId::from("missing"), WorkerAction::Stop)
                .await,
            Err(HopperError::Backend(BackendError::WorkerNotFound(_)))
        );
    }

    #[tokio::test]
    async fn cleanup_stale_workers_uses_configured_timeout() {
        let queue = queue().with_config(
            QueueConfig::default().with_stale_worker_timeout(TimeDelta::milliseconds(20)),
        );
        let worker_id = WorkerId::from("worker-1");
        queue
            .backend()
            .register_worker(&worker_id, DEFAULT_QUEUE)
            .await
            .unwrap();
        queue
            .push(EnqueuableJob::new("executor", json!(1)))
            .await
            .unwrap();
        let job = queue.reserve_for(DEFAULT_QUEUE, &worker_id).await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let report = queue.cleanup_stale_workers().await.unwrap();

        assert_eq!(report.workers, vec![worker_id]);
        assert_eq!(report.released, vec![job.id]);
        assert!(queue.workers(None).await.unwrap().is_empty());
        assert_eq!(queue.pop(DEFAULT_QUEUE).await.unwrap().unwrap().id, job.id);
    }

    #[tokio::test]
    async fn reclaimed_job_cannot_be_settled_by_former_holder() {
        let queue = queue().with_config(
            QueueConfig::default().with_stale_worker_timeout(TimeDelta::milliseconds(20)),
        );
        let stale = WorkerId::from("worker-a");
        let fresh = WorkerId::from("worker-b");
        queue
            .backend()
            .register_worker(&stale, DEFAULT_QUEUE)
            .await
            .unwrap();
        queue
            .push(EnqueuableJob::new("executor", json!(1)))
            .await
            .unwrap();
        let abandoned = queue.reserve_for(DEFAULT_QUEUE, &stale).await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        queue.cleanup_stale_workers().await.unwrap();
        queue
            .backend()
            .register_worker(&fresh, DEFAULT_QUEUE)
            .await
            .unwrap();
        let job = queue.reserve_for(DEFAULT_QUEUE, &fresh).await.unwrap().unwrap();
        assert_eq!(job.id, abandoned.id);

        assert_matches!(
            queue.handle_failure(&abandoned, error()).await,
            Err(HopperError::Backend(BackendError::ReservationLost(_)))
        );
        assert_matches!(
            queue.complete(&abandoned).await,
            Err(HopperError::Backend(BackendError::ReservationLost(_)))
        );
        assert!(queue.pop(DEFAULT_QUEUE).await.unwrap().is_none());
        let held = queue.job(job.id).await.unwrap().unwrap();
        assert_eq!(held.reserved_by, Some(fresh));

        queue.complete(&job).await.unwrap();
        assert_eq!(queue.stats(DEFAULT_QUEUE).await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn unreserved_job_cannot_be_completed() {
        let queue = queue();
        let job_id = queue
            .push(EnqueuableJob::new("executor", json!(1)))
            .await
            .unwrap();
        let job = queue.job(job_id).await.unwrap().unwrap();

        assert_matches!(
            queue.complete(&job).await,
            Err(HopperError::Backend(BackendError::ReservationLost(id))) if id == job_id
        );
    }
}
