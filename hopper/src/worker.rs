//! The worker loop.
//!
//! A [`Worker`] consumes one queue, one job at a time. It registers itself in the worker
//! registry, reserves jobs under its own id, dispatches them to the executor registered for
//! their job type and keeps its heartbeat fresh. Operators steer it through
//! [`crate::JobQueue::control_worker`]; the worker reads its status back after every job.
use std::{panic::AssertUnwindSafe, time::Duration};

use futures::FutureExt;
use rand::Rng;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    backend::{self, ErrorRecord, ErrorType},
    executor::Executor,
    job::{
        registry::JobRegistry,
        runner::{settle, JobOutcome},
    },
    queue::{FailureOutcome, JobQueue},
    HopperError,
};

mod registry;

pub use registry::{UnknownWorkerStatus, WorkerAction, WorkerId, WorkerRecord, WorkerStatus};

/// How a [`Worker`] waits and reports while running.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// How long to sleep when the queue is empty before polling again. With `None` the worker
    /// returns as soon as the queue is empty.
    pub poll_interval: Option<Duration>,
    /// How often the heartbeat is refreshed while a job runs.
    pub heartbeat_interval: Duration,
    /// Cancelling this token ends a polling worker's idle wait. A running job is always
    /// finished first.
    pub shutdown: CancellationToken,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: None,
            heartbeat_interval: Duration::from_secs(30),
            shutdown: CancellationToken::new(),
        }
    }
}

impl WorkerOptions {
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval: Some(poll_interval),
            ..self
        }
    }

    pub fn with_heartbeat_interval(self, heartbeat_interval: Duration) -> Self {
        Self {
            heartbeat_interval,
            ..self
        }
    }

    pub fn with_shutdown(self, shutdown: CancellationToken) -> Self {
        Self { shutdown, ..self }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The queue had no available job and no poll interval was set.
    QueueExhausted,
    MaxJobsReached,
    Paused,
    Stopped,
    /// The worker's record was removed from the registry, usually by stale reaping.
    Deregistered,
    /// The shutdown token was cancelled.
    Shutdown,
}

/// Returned by [`Worker::work`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkSummary {
    pub worker_id: WorkerId,
    pub processed: u64,
    pub failed: u64,
    pub released: u64,
    pub exit_reason: ExitReason,
}

#[derive(Debug, Default)]
struct Counters {
    processed: u64,
    failed: u64,
    released: u64,
    lost: u64,
}

impl Counters {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.processed += 1,
            JobOutcome::Released => self.released += 1,
            JobOutcome::Failed(_) => self.failed += 1,
            JobOutcome::Lost => self.lost += 1,
        }
    }

    fn handled(&self) -> u64 {
        self.processed + self.failed + self.released + self.lost
    }
}

pub struct Worker {
    queue: JobQueue,
    registry: JobRegistry,
    options: WorkerOptions,
    id: WorkerId,
}

impl Worker {
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            registry: JobRegistry::default(),
            options: WorkerOptions::default(),
            id: WorkerId::generate(),
        }
    }

    pub fn with_id(self, id: impl Into<WorkerId>) -> Self {
        Self {
            id: id.into(),
            ..self
        }
    }

    pub fn with_executor<E>(mut self) -> Self
    where
        E: Executor + 'static,
        E::Data: DeserializeOwned + Send + 'static,
    {
        self.registry.register::<E>();
        self
    }

    pub fn with_options(self, options: WorkerOptions) -> Self {
        Self { options, ..self }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Processes jobs from `queue` until there is a reason to stop, handling at most
    /// `max_jobs` jobs when given.
    ///
    /// The worker's registry record is removed on every exit path, including storage errors
    /// and panics escaping the loop; storage errors are then returned and panics resumed.
    #[instrument(skip(self), fields(worker_id = %self.id))]
    pub async fn work(
        &self,
        queue: &str,
        max_jobs: Option<u64>,
    ) -> Result<WorkSummary, HopperError> {
        if self.registry.is_empty() {
            return Err(HopperError::NoExecutors);
        }

        self.queue.backend().register_worker(&self.id, queue).await?;
        tracing::info!(worker_id = %self.id, %queue, "Worker {} started on {queue}", self.id);

        let mut counters = Counters::default();
        let result = AssertUnwindSafe(self.run_loop(queue, max_jobs, &mut counters))
            .catch_unwind()
            .await;

        let unregistered = self
            .queue
            .backend()
            .unregister_worker(&self.id)
            .await
            .inspect_err(|error| {
                tracing::error!(
                    ?error,
                    worker_id = %self.id,
                    "Failed to unregister worker {}, error: {error}",
                    self.id
                )
            });

        let exit_reason = match result {
            Ok(result) => result?,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        unregistered?;

        tracing::info!(
            worker_id = %self.id,
            ?exit_reason,
            processed = counters.processed,
            failed = counters.failed,
            "Worker {} exited",
            self.id
        );
        Ok(WorkSummary {
            worker_id: self.id.clone(),
            processed: counters.processed,
            failed: counters.failed,
            released: counters.released,
            exit_reason,
        })
    }

    async fn run_loop(
        &self,
        queue: &str,
        max_jobs: Option<u64>,
        counters: &mut Counters,
    ) -> Result<ExitReason, HopperError> {
        loop {
            if max_jobs.is_some_and(|max_jobs| counters.handled() >= max_jobs) {
                return Ok(ExitReason::MaxJobsReached);
            }
            if self.options.shutdown.is_cancelled() {
                return Ok(ExitReason::Shutdown);
            }

            let Some(job) = self.queue.reserve_for(queue, &self.id).await? else {
                let Some(poll_interval) = self.options.poll_interval else {
                    return Ok(ExitReason::QueueExhausted);
                };
                if let Some(exit_reason) = self.heartbeat(counters).await? {
                    return Ok(exit_reason);
                }
                tokio::select! {
                    _ = self.options.shutdown.cancelled() => return Ok(ExitReason::Shutdown),
                    _ = tokio::time::sleep(jittered(poll_interval)) => continue,
                }
            };

            let outcome = self.execute(job, counters).await?;
            counters.record(outcome);

            if let Some(exit_reason) = self.heartbeat(counters).await? {
                return Ok(exit_reason);
            }
        }
    }

    async fn execute(
        &self,
        job: backend::Job,
        counters: &Counters,
    ) -> Result<JobOutcome, HopperError> {
        let job_id = job.id;
        let Some(runner) = self.registry.get(&job.job_type) else {
            let error = ErrorRecord::new(
                ErrorType::UnknownJobType,
                format!("No executor registered for job type `{}`", job.job_type),
            );
            let archived = match job.reservation() {
                Ok(reservation) => self.queue.archive(reservation, error).await,
                Err(lost) => Err(lost.into()),
            };
            return settle(
                job_id,
                archived.map(|failed_job_id| {
                    JobOutcome::Failed(FailureOutcome::Archived(failed_job_id))
                }),
            );
        };

        let run = runner.run(job, &self.queue);
        tokio::pin!(run);

        let period = self.options.heartbeat_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                outcome = &mut run => return outcome,
                _ = ticker.tick() => {
                    let _ = self
                        .queue
                        .backend()
                        .record_heartbeat(&self.id, counters.processed, counters.failed)
                        .await
                        .inspect_err(|error| {
                            tracing::warn!(
                                ?error,
                                %job_id,
                                "Failed to record heartbeat while running job {job_id}"
                            )
                        });
                }
            }
        }
    }

    /// Refreshes the heartbeat and maps the status read back to a reason to exit.
    async fn heartbeat(&self, counters: &Counters) -> Result<Option<ExitReason>, HopperError> {
        let status = self
            .queue
            .backend()
            .record_heartbeat(&self.id, counters.processed, counters.failed)
            .await?;
        Ok(match status {
            Some(WorkerStatus::Running) => None,
            Some(WorkerStatus::Paused) => Some(ExitReason::Paused),
            Some(WorkerStatus::Stopped) => Some(ExitReason::Stopped),
            None => Some(ExitReason::Deregistered),
        })
    }
}

fn jittered(interval: Duration) -> Duration {
    let max_jitter = interval.as_millis() as u64 / 10;
    interval + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    };

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use serde_json::json;

    use super::*;
    use crate::{
        backend::{
            memory::InMemoryBackend, Backend, BackendError, EnqueuableJob, FailedJob,
            FailedJobId, QueueStats, ReapReport, Reservation,
        },
        executor::{
            test::{MockError, MockExecutionResult, MockReturnExecutor, SimpleExecutor},
            ExecutionContext, ExecutionResult,
        },
        job::{Job, JobId, Progress, DEFAULT_QUEUE},
    };

    fn queue() -> JobQueue {
        JobQueue::new(InMemoryBackend::new())
    }

    async fn push(queue: &JobQueue, data: MockExecutionResult) -> JobId {
        MockReturnExecutor::builder()
            .with_data(data)
            .enqueue(queue)
            .await
            .unwrap()
    }

    async fn wait_for(flag: &AtomicBool) {
        while !flag.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn drains_queue_and_unregisters() {
        let queue = queue();
        for _ in 0..3 {
            push(&queue, MockExecutionResult::Done).await;
        }
        let worker = Worker::new(queue.clone()).with_executor::<MockReturnExecutor>();

        let summary = worker.work(DEFAULT_QUEUE, None).await.unwrap();

        assert_eq!(
            summary,
            WorkSummary {
                worker_id: worker.id().clone(),
                processed: 3,
                failed: 0,
                released: 0,
                exit_reason: ExitReason::QueueExhausted,
            }
        );
        assert!(queue.workers(None).await.unwrap().is_empty());
        assert_eq!(queue.stats(DEFAULT_QUEUE).await.unwrap().completed, 3);
    }

    #[tokio::test]
    async fn failing_job_is_archived_after_max_attempts() {
        let queue = queue();
        let job_id = push(
            &queue,
            MockExecutionResult::Error {
                error: MockError("always".to_owned()),
            },
        )
        .await;
        let worker = Worker::new(queue.clone()).with_executor::<MockReturnExecutor>();

        let summary = worker.work(DEFAULT_QUEUE, None).await.unwrap();

        assert_eq!(summary.failed, 3);
        assert_eq!(summary.processed, 0);
        assert!(queue.job(job_id).await.unwrap().is_none());
        let failed = queue.failed_jobs(DEFAULT_QUEUE, 10, 0).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 3);
        assert_eq!(failed[0].message, "always");
    }

    #[tokio::test]
    async fn panicking_job_does_not_stop_worker() {
        let queue = queue();
        MockReturnExecutor::builder()
            .with_data(MockExecutionResult::Panic)
            .with_max_attempts(1)
            .enqueue(&queue)
            .await
            .unwrap();
        push(&queue, MockExecutionResult::Done).await;
        let worker = Worker::new(queue.clone()).with_executor::<MockReturnExecutor>();

        let summary = worker.work(DEFAULT_QUEUE, None).await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.processed, 1);
        let failed = queue.failed_jobs(DEFAULT_QUEUE, 10, 0).await.unwrap();
        assert_eq!(failed[0].error_type, ErrorType::Panic);
    }

    #[tokio::test]
    async fn released_job_keeps_its_attempts() {
        let queue = queue();
        let job_id = push(
            &queue,
            MockExecutionResult::Release {
                delay: Duration::from_secs(3600),
            },
        )
        .await;
        let worker = Worker::new(queue.clone()).with_executor::<MockReturnExecutor>();

        let summary = worker.work(DEFAULT_QUEUE, None).await.unwrap();

        assert_eq!(summary.released, 1);
        assert_eq!(summary.exit_reason, ExitReason::QueueExhausted);
        let job = queue.job(job_id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 0);
        assert_eq!(queue.stats(DEFAULT_QUEUE).await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn stops_after_max_jobs() {
        let queue = queue();
        for _ in 0..5 {
            push(&queue, MockExecutionResult::Done).await;
        }
        let worker = Worker::new(queue.clone()).with_executor::<MockReturnExecutor>();

        let summary = worker.work(DEFAULT_QUEUE, Some(2)).await.unwrap();

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.exit_reason, ExitReason::MaxJobsReached);
        assert_eq!(queue.stats(DEFAULT_QUEUE).await.unwrap().pending, 3);
    }

    #[tokio::test]
    async fn unknown_job_type_is_archived() {
        let queue = queue();
        queue
            .push(EnqueuableJob::new("unregistered", json!(null)))
            .await
            .unwrap();
        let worker = Worker::new(queue.clone()).with_executor::<SimpleExecutor>();

        let summary = worker.work(DEFAULT_QUEUE, None).await.unwrap();

        assert_eq!(summary.failed, 1);
        let failed = queue.failed_jobs(DEFAULT_QUEUE, 10, 0).await.unwrap();
        assert_eq!(failed[0].error_type, ErrorType::UnknownJobType);
        assert_eq!(failed[0].attempts, 1);
    }

    #[tokio::test]
    async fn requires_an_executor() {
        let queue = queue();

        assert_matches!(
            Worker::new(queue.clone()).work(DEFAULT_QUEUE, None).await,
            Err(HopperError::NoExecutors)
        );
        assert!(queue.workers(None).await.unwrap().is_empty());
    }

    static PROGRESS_REPORTED: AtomicBool = AtomicBool::new(false);
    static PROGRESS_RELEASED: AtomicBool = AtomicBool::new(false);

    struct ProgressExecutor;

    #[async_trait]
    impl Executor for ProgressExecutor {
        type Data = ();
        const NAME: &'static str = "progress_executor";
        const REPORTS_PROGRESS: bool = true;

        async fn execute(_job: Job<Self::Data>, context: ExecutionContext) -> ExecutionResult {
            let Some(progress) = context.progress() else {
                return ExecutionResult::from(MockError("no progress reporter".to_owned()));
            };
            progress
                .update(50, json!({ "stage": "halfway" }))
                .await
                .unwrap();
            PROGRESS_REPORTED.store(true, Ordering::SeqCst);
            wait_for(&PROGRESS_RELEASED).await;
            progress.percent(100).await.unwrap();
            ExecutionResult::Done
        }
    }

    #[tokio::test]
    async fn progress_is_visible_while_job_runs() {
        let queue = queue();
        let job_id = ProgressExecutor::builder().enqueue(&queue).await.unwrap();
        let worker = Worker::new(queue.clone()).with_executor::<ProgressExecutor>();
        let handle = tokio::spawn(async move { worker.work(DEFAULT_QUEUE, None).await });

        wait_for(&PROGRESS_REPORTED).await;
        assert_eq!(
            queue.progress(job_id).await.unwrap(),
            Progress {
                percent: 50,
                data: Some(json!({ "stage": "halfway" })),
            }
        );
        assert!(queue.job(job_id).await.unwrap().unwrap().completed_at.is_none());

        PROGRESS_RELEASED.store(true, Ordering::SeqCst);
        let summary = handle.await.unwrap().unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(queue.progress(job_id).await.unwrap().percent, 100);
    }

    static STOP_STARTED: AtomicBool = AtomicBool::new(false);
    static STOP_RELEASED: AtomicBool = AtomicBool::new(false);

    struct BlockingExecutor;

    #[async_trait]
    impl Executor for BlockingExecutor {
        type Data = ();
        const NAME: &'static str = "blocking_executor";

        async fn execute(_job: Job<Self::Data>, context: ExecutionContext) -> ExecutionResult {
            assert!(context.progress().is_none());
            STOP_STARTED.store(true, Ordering::SeqCst);
            wait_for(&STOP_RELEASED).await;
            ExecutionResult::Done
        }
    }

    #[tokio::test]
    async fn stop_is_honoured_after_current_job() {
        let queue = queue();
        for _ in 0..3 {
            BlockingExecutor::builder().enqueue(&queue).await.unwrap();
        }
        let worker = Worker::new(queue.clone())
            .with_id("worker-stop")
            .with_executor::<BlockingExecutor>();
        let handle = tokio::spawn(async move { worker.work(DEFAULT_QUEUE, None).await });

        wait_for(&STOP_STARTED).await;
        queue
            .control_worker(&WorkerId::from("worker-stop"), WorkerAction::Stop)
            .await
            .unwrap();
        STOP_RELEASED.store(true, Ordering::SeqCst);
        let summary = handle.await.unwrap().unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.exit_reason, ExitReason::Stopped);
        assert_eq!(queue.stats(DEFAULT_QUEUE).await.unwrap().pending, 2);
        assert!(queue.workers(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn paused_worker_exits_while_polling() {
        let queue = queue();
        let worker = Worker::new(queue.clone())
            .with_id("worker-pause")
            .with_executor::<MockReturnExecutor>()
            .with_options(WorkerOptions::default().with_poll_interval(Duration::from_millis(10)));
        let handle = tokio::spawn(async move { worker.work(DEFAULT_QUEUE, None).await });

        while queue.workers(None).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        queue
            .control_worker(&WorkerId::from("worker-pause"), WorkerAction::Pause)
            .await
            .unwrap();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.exit_reason, ExitReason::Paused);
        assert!(queue.workers(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_ends_idle_polling() {
        let queue = queue();
        let shutdown = CancellationToken::new();
        let worker = Worker::new(queue.clone())
            .with_executor::<MockReturnExecutor>()
            .with_options(
                WorkerOptions::default()
                    .with_poll_interval(Duration::from_secs(60))
                    .with_shutdown(shutdown.clone()),
            );
        let handle = tokio::spawn(async move { worker.work(DEFAULT_QUEUE, None).await });

        while queue.workers(None).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        shutdown.cancel();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.exit_reason, ExitReason::Shutdown);
        assert!(queue.workers(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reaped_worker_is_deregistered() {
        let queue = queue();
        let worker = Worker::new(queue.clone())
            .with_id("worker-reaped")
            .with_executor::<BlockingExecutorForReap>();
        for _ in 0..2 {
            BlockingExecutorForReap::builder().enqueue(&queue).await.unwrap();
        }
        let handle = tokio::spawn(async move { worker.work(DEFAULT_QUEUE, None).await });

        wait_for(&REAP_STARTED).await;
        queue
            .backend()
            .unregister_worker(&WorkerId::from("worker-reaped"))
            .await
            .unwrap();
        REAP_RELEASED.store(true, Ordering::SeqCst);

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.exit_reason, ExitReason::Deregistered);
        assert_eq!(summary.processed, 1);
        assert_eq!(queue.stats(DEFAULT_QUEUE).await.unwrap().pending, 1);
    }

    static REAP_STARTED: AtomicBool = AtomicBool::new(false);
    static REAP_RELEASED: AtomicBool = AtomicBool::new(false);

    struct BlockingExecutorForReap;

    #[async_trait]
    impl Executor for BlockingExecutorForReap {
        type Data = ();
        const NAME: &'static str = "reap_executor";

        async fn execute(_job: Job<Self::Data>, _context: ExecutionContext) -> ExecutionResult {
            REAP_STARTED.store(true, Ordering::SeqCst);
            wait_for(&REAP_RELEASED).await;
            ExecutionResult::Done
        }
    }

    /// Wraps [`InMemoryBackend`], failing the calls it is told to fail and counting
    /// unregistrations.
    #[derive(Default)]
    struct FlakyBackend {
        inner: InMemoryBackend,
        fail_reserve: bool,
        fail_unregister: bool,
        unregistered: AtomicUsize,
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        async fn push(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
            self.inner.push(job).await
        }

        async fn reserve(
            &self,
            queue: &str,
            worker_id: Option<&WorkerId>,
        ) -> Result<Option<backend::Job>, BackendError> {
            if self.fail_reserve {
                return Err(BackendError::BadState);
            }
            self.inner.reserve(queue, worker_id).await
        }

        async fn mark_job_complete(&self, reservation: Reservation) -> Result<(), BackendError> {
            self.inner.mark_job_complete(reservation).await
        }

        async fn release_job(
            &self,
            reservation: Reservation,
            delay: TimeDelta,
        ) -> Result<(), BackendError> {
            self.inner.release_job(reservation, delay).await
        }

        async fn mark_job_retryable(
            &self,
            reservation: Reservation,
            delay: TimeDelta,
        ) -> Result<(), BackendError> {
            self.inner.mark_job_retryable(reservation, delay).await
        }

        async fn archive_job(
            &self,
            reservation: Reservation,
            error: ErrorRecord,
        ) -> Result<FailedJobId, BackendError> {
            self.inner.archive_job(reservation, error).await
        }

        async fn update_progress(
            &self,
            id: JobId,
            progress: Progress,
        ) -> Result<(), BackendError> {
            self.inner.update_progress(id, progress).await
        }

        async fn job(&self, id: JobId) -> Result<Option<backend::Job>, BackendError> {
            self.inner.job(id).await
        }

        async fn failed_jobs(
            &self,
            queue: &str,
            limit: u32,
            offset: u32,
        ) -> Result<Vec<FailedJob>, BackendError> {
            self.inner.failed_jobs(queue, limit, offset).await
        }

        async fn retry_failed_job(
            &self,
            id: FailedJobId,
            queue: &str,
            priority_boost: i32,
        ) -> Result<JobId, BackendError> {
            self.inner.retry_failed_job(id, queue, priority_boost).await
        }

        async fn queue_stats(&self, queue: &str) -> Result<QueueStats, BackendError> {
            self.inner.queue_stats(queue).await
        }

        async fn prune_completed_jobs(
            &self,
            queue: &str,
            older_than: TimeDelta,
        ) -> Result<u64, BackendError> {
            self.inner.prune_completed_jobs(queue, older_than).await
        }

        async fn register_worker(&self, id: &WorkerId, queue: &str) -> Result<(), BackendError> {
            self.inner.register_worker(id, queue).await
        }

        async fn record_heartbeat(
            &self,
            id: &WorkerId,
            processed: u64,
            failed: u64,
        ) -> Result<Option<WorkerStatus>, BackendError> {
            self.inner.record_heartbeat(id, processed, failed).await
        }

        async fn set_worker_status(
            &self,
            id: &WorkerId,
            status: WorkerStatus,
        ) -> Result<(), BackendError> {
            self.inner.set_worker_status(id, status).await
        }

        async fn unregister_worker(&self, id: &WorkerId) -> Result<(), BackendError> {
            self.unregistered.fetch_add(1, Ordering::SeqCst);
            if self.fail_unregister {
                return Err(BackendError::BadState);
            }
            self.inner.unregister_worker(id).await
        }

        async fn workers(&self, queue: Option<&str>) -> Result<Vec<WorkerRecord>, BackendError> {
            self.inner.workers(queue).await
        }

        async fn reap_stale_workers(
            &self,
            timeout: TimeDelta,
        ) -> Result<ReapReport, BackendError> {
            self.inner.reap_stale_workers(timeout).await
        }
    }

    #[tokio::test]
    async fn storage_error_still_unregisters() {
        let backend = Arc::new(FlakyBackend {
            fail_reserve: true,
            ..Default::default()
        });
        let queue = JobQueue::from_arc(backend.clone());
        let worker = Worker::new(queue.clone()).with_executor::<SimpleExecutor>();

        assert_matches!(
            worker.work(DEFAULT_QUEUE, None).await,
            Err(HopperError::Backend(BackendError::BadState))
        );
        assert_eq!(backend.unregistered.load(Ordering::SeqCst), 1);
        assert!(queue.workers(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unregister_error_is_reported() {
        let backend = Arc::new(FlakyBackend {
            fail_unregister: true,
            ..Default::default()
        });
        let worker =
            Worker::new(JobQueue::from_arc(backend.clone())).with_executor::<SimpleExecutor>();

        assert_matches!(
            worker.work(DEFAULT_QUEUE, None).await,
            Err(HopperError::Backend(BackendError::BadState))
        );
        assert_eq!(backend.unregistered.load(Ordering::SeqCst), 1);
    }
}
