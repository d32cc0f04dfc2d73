//! Test suite for ensuring a correct implementation of a backend.
use std::{sync::Arc, time::Duration};

use chrono::TimeDelta;
use futures::future::join_all;
use tokio::sync::Barrier;

use super::*;

const DEFAULT_JOB_TYPE: &str = "executor";
const OTHER_QUEUE: &str = "other";

impl EnqueuableJob {
    pub(crate) fn mock_job() -> Self {
        Self::new(DEFAULT_JOB_TYPE, serde_json::json!({ "data": "data" }))
    }
}

/// Create test suite for hopper backends.
///
/// For backend implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use hopper::test_suite;
/// use hopper::backend::memory::InMemoryBackend;
/// test_suite!(for: InMemoryBackend::new());
/// ```
///
/// If you are using a different async test attribute you can configure the macro to use that
/// instead. For example when using `sqlx::test` you could do the following:
///
/// ```ignore
/// use hopper::test_suite;
/// test_suite!(
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     backend: BackendImplementation::from_pool(pool).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), backend: $backend);
    };
    (attr: $attr:meta, args: $args:tt, backend: $backend:expr) => {
        $crate::test_suite!(
            @tests attr: $attr, args: $args, backend: $backend,
            tests: [
                push_assigns_distinct_ids,
                reserve_empty_queue,
                reserve_marks_job_reserved,
                reserve_ignores_other_queues,
                reserve_orders_by_priority_then_age,
                reserve_respects_delay,
                reserve_is_exclusive_under_contention,
                reserve_single_job_across_tasks,
                mark_job_complete,
                mark_job_complete_requires_reservation,
                release_job_returns_attempt,
                release_job_with_delay,
                mark_job_retryable_keeps_attempt,
                archive_job,
                archive_job_requires_reservation,
                reclaimed_reservation_is_rejected,
                failed_jobs_most_recent_first,
                retry_failed_job,
                retry_failed_job_wrong_queue,
                update_progress_overwrites,
                queue_stats,
                prune_completed_jobs,
                worker_lifecycle,
                register_worker_resets_record,
                set_worker_status_not_found,
                reap_stale_workers_keeps_fresh_workers,
                reap_stale_workers_resolves_orphans,
                reap_stale_workers_expires_anonymous_reservations,
            ]
        );
    };
    (@tests attr: $attr:meta, args: $args:tt, backend: $backend:expr, tests: [$($test:ident),* $(,)?]) => {
        $(
            #[$attr]
            async fn $test $args {
                let backend = $backend;
                $crate::backend::testing::$test(backend).await;
            }
        )*
    };
}

#[doc(hidden)]
#[async_trait::async_trait]
pub trait BackendTesting: Backend {
    async fn get_job(&self, id: JobId) -> Job {
        self.job(id).await.unwrap().expect("job should exist")
    }

    async fn push_mock(&self) -> JobId {
        self.push(EnqueuableJob::mock_job()).await.unwrap()
    }

    async fn reserve_next(&self) -> Job {
        self.reserve(DEFAULT_QUEUE, None)
            .await
            .unwrap()
            .expect("a job should be available")
    }

    async fn archive_mock(&self, job: &Job) -> FailedJobId {
        self.archive_job(
            job.reservation().unwrap(),
            ErrorRecord::new(ErrorType::Panic, "boom"),
        )
        .await
        .unwrap()
    }
}

impl<T: Backend> BackendTesting for T {}

#[doc(hidden)]
pub async fn push_assigns_distinct_ids(backend: impl Backend) {
    let id1 = backend.push_mock().await;
    let id2 = backend.push_mock().await;

    assert_ne!(id1, id2);
    let job = backend.get_job(id1).await;
    assert_eq!(job.attempts, 0);
    assert_eq!(job.state(Utc::now()), JobState::Queued);
    assert_eq!(job.job_type, DEFAULT_JOB_TYPE);
}

#[doc(hidden)]
pub async fn reserve_empty_queue(backend: impl Backend) {
    assert!(backend.reserve(DEFAULT_QUEUE, None).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn reserve_marks_job_reserved(backend: impl Backend) {
    let worker_id = WorkerId::from("worker-1");
    let id = backend.push_mock().await;

    let job = backend
        .reserve(DEFAULT_QUEUE, Some(&worker_id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(job.id, id);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.reserved_by, Some(worker_id));
    assert!(job.reserved_at.is_some());
    assert_eq!(backend.get_job(id).await.state(Utc::now()), JobState::Reserved);
    assert!(backend.reserve(DEFAULT_QUEUE, None).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn reserve_ignores_other_queues(backend: impl Backend) {
    let id = backend
        .push(EnqueuableJob::mock_job().on_queue(OTHER_QUEUE))
        .await
        .unwrap();

    assert!(backend.reserve(DEFAULT_QUEUE, None).await.unwrap().is_none());
    let job = backend.reserve(OTHER_QUEUE, None).await.unwrap().unwrap();
    assert_eq!(job.id, id);
}

#[doc(hidden)]
pub async fn reserve_orders_by_priority_then_age(backend: impl Backend) {
    let low = backend
        .push(EnqueuableJob::mock_job().with_priority(-5))
        .await
        .unwrap();
    let first = backend.push_mock().await;
    let second = backend.push_mock().await;
    let high = backend
        .push(EnqueuableJob::mock_job().with_priority(10))
        .await
        .unwrap();

    for expected in [high, first, second, low] {
        assert_eq!(backend.reserve_next().await.id, expected);
    }
}

#[doc(hidden)]
pub async fn reserve_respects_delay(backend: impl Backend) {
    let id = backend
        .push(EnqueuableJob::mock_job().with_delay(TimeDelta::milliseconds(200)))
        .await
        .unwrap();

    assert_eq!(backend.get_job(id).await.state(Utc::now()), JobState::Delayed);
    assert!(backend.reserve(DEFAULT_QUEUE, None).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(backend.reserve_next().await.id, id);
}

#[doc(hidden)]
pub async fn reserve_is_exclusive_under_contention(backend: impl Backend) {
    let mut pushed = Vec::new();
    for _ in 0..5 {
        pushed.push(backend.push_mock().await);
    }

    let reserved = join_all((0..10).map(|_| backend.reserve(DEFAULT_QUEUE, None))).await;
    let mut reserved = reserved
        .into_iter()
        .filter_map(|result| result.unwrap())
        .map(|job| job.id)
        .collect::<Vec<_>>();
    reserved.sort();

    assert_eq!(reserved, pushed);
}

#[doc(hidden)]
pub async fn reserve_single_job_across_tasks<B>(backend: B)
where
    B: Backend + Clone + 'static,
{
    const TASKS: usize = 8;
    let id = backend.push_mock().await;
    let barrier = Arc::new(Barrier::new(TASKS));

    let handles = (0..TASKS).map(|_| {
        let backend = backend.clone();
        let barrier = barrier.clone();
        tokio::spawn(async move {
            barrier.wait().await;
            backend
                .reserve(DEFAULT_QUEUE, None)
                .await
                .unwrap()
                .map(|job| job.id)
        })
    });
    let reserved = join_all(handles)
        .await
        .into_iter()
        .filter_map(|result| result.unwrap())
        .collect::<Vec<_>>();

    assert_eq!(reserved, vec![id]);
}

#[doc(hidden)]
pub async fn mark_job_complete(backend: impl Backend) {
    let id = backend.push_mock().await;
    let reservation = backend.reserve_next().await.reservation().unwrap();

    assert!(backend.mark_job_complete(reservation).await.is_ok());

    let job = backend.get_job(id).await;
    assert!(job.completed_at.is_some());
    assert_eq!(job.state(Utc::now()), JobState::Completed);
    assert!(backend.reserve(DEFAULT_QUEUE, None).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn mark_job_complete_requires_reservation(backend: impl Backend) {
    let id = backend.push_mock().await;
    let unreserved = Reservation {
        job_id: id,
        reserved_at: Utc::now(),
    };
    assert!(matches!(
        backend.mark_job_complete(unreserved).await,
        Err(BackendError::ReservationLost(lost)) if lost == id
    ));
    let missing = Reservation {
        job_id: 42.into(),
        reserved_at: Utc::now(),
    };
    assert!(matches!(
        backend.mark_job_complete(missing).await,
        Err(BackendError::ReservationLost(_))
    ));

    let reservation = backend.reserve_next().await.reservation().unwrap();
    backend.mark_job_complete(reservation).await.unwrap();
    assert!(matches!(
        backend.mark_job_complete(reservation).await,
        Err(BackendError::ReservationLost(_))
    ));
}

#[doc(hidden)]
pub async fn release_job_returns_attempt(backend: impl Backend) {
    let id = backend.push_mock().await;
    let reservation = backend.reserve_next().await.reservation().unwrap();

    backend
        .release_job(reservation, TimeDelta::zero())
        .await
        .unwrap();

    let job = backend.get_job(id).await;
    assert_eq!(job.attempts, 0);
    assert!(job.reserved_at.is_none());
    assert!(job.reserved_by.is_none());
    assert_eq!(backend.reserve_next().await.attempts, 1);
}

#[doc(hidden)]
pub async fn release_job_with_delay(backend: impl Backend) {
    let id = backend.push_mock().await;
    let reservation = backend.reserve_next().await.reservation().unwrap();

    backend
        .release_job(reservation, TimeDelta::hours(1))
        .await
        .unwrap();

    assert_eq!(backend.get_job(id).await.state(Utc::now()), JobState::Delayed);
    assert!(backend.reserve(DEFAULT_QUEUE, None).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn mark_job_retryable_keeps_attempt(backend: impl Backend) {
    let id = backend.push_mock().await;
    let reservation = backend.reserve_next().await.reservation().unwrap();

    backend
        .mark_job_retryable(reservation, TimeDelta::zero())
        .await
        .unwrap();

    let job = backend.get_job(id).await;
    assert_eq!(job.attempts, 1);
    assert!(job.reserved_at.is_none());
    assert_eq!(backend.reserve_next().await.attempts, 2);
}

#[doc(hidden)]
pub async fn archive_job(backend: impl Backend) {
    let id = backend
        .push(EnqueuableJob::mock_job().with_priority(3))
        .await
        .unwrap();
    let reservation = backend.reserve_next().await.reservation().unwrap();

    let error = ErrorRecord::new(ErrorType::Other("invalid".to_owned()), "Bad input")
        .with_detail("field `x` missing");
    let failed_id = backend.archive_job(reservation, error).await.unwrap();

    assert!(backend.job(id).await.unwrap().is_none());
    let failed = backend.failed_jobs(DEFAULT_QUEUE, 10, 0).await.unwrap();
    assert_eq!(failed.len(), 1);
    let failed = &failed[0];
    assert_eq!(failed.id, failed_id);
    assert_eq!(failed.job_type, DEFAULT_JOB_TYPE);
    assert_eq!(failed.priority, 3);
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.error_type, ErrorType::Other("invalid".to_owned()));
    assert_eq!(failed.message, "Bad input");
    assert_eq!(failed.detail, "field `x` missing");
    assert_eq!(failed.payload, EnqueuableJob::mock_job().payload);
}

#[doc(hidden)]
pub async fn archive_job_requires_reservation(backend: impl Backend) {
    let id = backend.push_mock().await;
    let unreserved = Reservation {
        job_id: id,
        reserved_at: Utc::now(),
    };

    assert!(matches!(
        backend
            .archive_job(unreserved, ErrorRecord::new(ErrorType::Panic, "boom"))
            .await,
        Err(BackendError::ReservationLost(lost)) if lost == id
    ));
    assert!(backend.job(id).await.unwrap().is_some());
    assert!(backend
        .failed_jobs(DEFAULT_QUEUE, 10, 0)
        .await
        .unwrap()
        .is_empty());
}

#[doc(hidden)]
pub async fn reclaimed_reservation_is_rejected(backend: impl Backend) {
    let former = WorkerId::from("worker-a");
    let current = WorkerId::from("worker-b");
    let id = backend.push_mock().await;
    backend.register_worker(&former, DEFAULT_QUEUE).await.unwrap();
    let abandoned = backend
        .reserve(DEFAULT_QUEUE, Some(&former))
        .await
        .unwrap()
        .unwrap()
        .reservation()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let report = backend
        .reap_stale_workers(TimeDelta::milliseconds(50))
        .await
        .unwrap();
    assert_eq!(report.released, vec![id]);

    backend.register_worker(&current, DEFAULT_QUEUE).await.unwrap();
    let held = backend
        .reserve(DEFAULT_QUEUE, Some(&current))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(held.id, id);

    assert!(matches!(
        backend.mark_job_retryable(abandoned, TimeDelta::zero()).await,
        Err(BackendError::ReservationLost(_))
    ));
    assert!(matches!(
        backend.release_job(abandoned, TimeDelta::zero()).await,
        Err(BackendError::ReservationLost(_))
    ));
    assert!(matches!(
        backend.mark_job_complete(abandoned).await,
        Err(BackendError::ReservationLost(_))
    ));
    assert!(matches!(
        backend
            .archive_job(abandoned, ErrorRecord::new(ErrorType::Panic, "boom"))
            .await,
        Err(BackendError::ReservationLost(_))
    ));

    assert!(backend.reserve(DEFAULT_QUEUE, None).await.unwrap().is_none());
    let job = backend.get_job(id).await;
    assert_eq!(job.reserved_by, Some(current));
    assert_eq!(job.attempts, 2);
    assert!(job.completed_at.is_none());

    backend
        .mark_job_complete(held.reservation().unwrap())
        .await
        .unwrap();
    assert_eq!(backend.get_job(id).await.state(Utc::now()), JobState::Completed);
}

#[doc(hidden)]
pub async fn failed_jobs_most_recent_first(backend: impl Backend) {
    let mut archived = Vec::new();
    for _ in 0..3 {
        backend.push_mock().await;
        let job = backend.reserve_next().await;
        archived.push(backend.archive_mock(&job).await);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    backend
        .push(EnqueuableJob::mock_job().on_queue(OTHER_QUEUE))
        .await
        .unwrap();
    let other = backend.reserve(OTHER_QUEUE, None).await.unwrap().unwrap();
    backend.archive_mock(&other).await;

    let page = backend.failed_jobs(DEFAULT_QUEUE, 2, 0).await.unwrap();
    assert_eq!(
        page.iter().map(|job| job.id).collect::<Vec<_>>(),
        vec![archived[2], archived[1]]
    );

    let page = backend.failed_jobs(DEFAULT_QUEUE, 2, 2).await.unwrap();
    assert_eq!(
        page.iter().map(|job| job.id).collect::<Vec<_>>(),
        vec![archived[0]]
    );
}

#[doc(hidden)]
pub async fn retry_failed_job(backend: impl Backend) {
    let id = backend
        .push(EnqueuableJob::mock_job().with_priority(5).with_max_attempts(2))
        .await
        .unwrap();
    let job = backend.reserve_next().await;
    assert_eq!(job.id, id);
    let failed_id = backend.archive_mock(&job).await;

    let new_id = backend
        .retry_failed_job(failed_id, DEFAULT_QUEUE, 10)
        .await
        .unwrap();

    let job = backend.get_job(new_id).await;
    assert_eq!(job.priority, 15);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 2);
    assert_eq!(job.payload, EnqueuableJob::mock_job().payload);
    assert_eq!(job.state(Utc::now()), JobState::Queued);
    assert!(backend
        .failed_jobs(DEFAULT_QUEUE, 10, 0)
        .await
        .unwrap()
        .is_empty());
}

#[doc(hidden)]
pub async fn retry_failed_job_wrong_queue(backend: impl Backend) {
    backend.push_mock().await;
    let job = backend.reserve_next().await;
    let failed_id = backend.archive_mock(&job).await;

    assert!(matches!(
        backend.retry_failed_job(failed_id, OTHER_QUEUE, 10).await,
        Err(BackendError::FailedJobNotFound(_))
    ));
    assert_eq!(
        backend.failed_jobs(DEFAULT_QUEUE, 10, 0).await.unwrap().len(),
        1
    );
}

#[doc(hidden)]
pub async fn update_progress_overwrites(backend: impl Backend) {
    let id = backend.push_mock().await;

    backend
        .update_progress(
            id,
            Progress {
                percent: 40,
                data: Some(serde_json::json!({ "step": "download" })),
            },
        )
        .await
        .unwrap();
    assert_eq!(
        backend.get_job(id).await.progress(),
        Progress {
            percent: 40,
            data: Some(serde_json::json!({ "step": "download" })),
        }
    );

    backend
        .update_progress(
            id,
            Progress {
                percent: 75,
                data: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(
        backend.get_job(id).await.progress(),
        Progress {
            percent: 75,
            data: None,
        }
    );

    assert!(matches!(
        backend.update_progress(42.into(), Progress::default()).await,
        Err(BackendError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn queue_stats(backend: impl Backend) {
    let completed = backend.push_mock().await;
    let _reserved = backend.push_mock().await;
    let archived = backend.push_mock().await;
    let _pending = backend.push_mock().await;
    backend
        .push(EnqueuableJob::mock_job().with_delay(TimeDelta::hours(1)))
        .await
        .unwrap();
    backend
        .push(EnqueuableJob::mock_job().on_queue(OTHER_QUEUE))
        .await
        .unwrap();

    let job = backend.reserve_next().await;
    assert_eq!(job.id, completed);
    backend
        .mark_job_complete(job.reservation().unwrap())
        .await
        .unwrap();
    backend.reserve_next().await;
    let job = backend.reserve_next().await;
    assert_eq!(job.id, archived);
    backend.archive_mock(&job).await;

    let running = WorkerId::from("worker-running");
    let paused = WorkerId::from("worker-paused");
    backend.register_worker(&running, DEFAULT_QUEUE).await.unwrap();
    backend.register_worker(&paused, DEFAULT_QUEUE).await.unwrap();
    backend
        .set_worker_status(&paused, WorkerStatus::Paused)
        .await
        .unwrap();

    let stats = backend.queue_stats(DEFAULT_QUEUE).await.unwrap();
    assert_eq!(
        stats,
        QueueStats {
            total: 3,
            pending: 1,
            delayed: 1,
            reserved: 1,
            completed: 1,
            failed: 1,
            active_workers: 1,
        }
    );

    let stats = backend.queue_stats("empty").await.unwrap();
    assert_eq!(stats, QueueStats::default());
}

#[doc(hidden)]
pub async fn prune_completed_jobs(backend: impl Backend) {
    let old = backend.push_mock().await;
    let pending = backend.push_mock().await;
    let other = backend
        .push(EnqueuableJob::mock_job().on_queue(OTHER_QUEUE))
        .await
        .unwrap();
    for job in [
        backend.reserve_next().await,
        backend.reserve(OTHER_QUEUE, None).await.unwrap().unwrap(),
    ] {
        backend
            .mark_job_complete(job.reservation().unwrap())
            .await
            .unwrap();
    }

    assert_eq!(
        backend
            .prune_completed_jobs(DEFAULT_QUEUE, TimeDelta::hours(1))
            .await
            .unwrap(),
        0
    );

    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(
        backend
            .prune_completed_jobs(DEFAULT_QUEUE, TimeDelta::milliseconds(5))
            .await
            .unwrap(),
        1
    );
    assert!(backend.job(old).await.unwrap().is_none());
    assert!(backend.job(pending).await.unwrap().is_some());
    assert!(backend.job(other).await.unwrap().is_some());
}

#[doc(hidden)]
pub async fn worker_lifecycle(backend: impl Backend) {
    let id = WorkerId::from("worker-1");
    backend.register_worker(&id, DEFAULT_QUEUE).await.unwrap();

    let workers = backend.workers(Some(DEFAULT_QUEUE)).await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].worker_id, id);
    assert_eq!(workers[0].status, WorkerStatus::Running);
    assert!(backend.workers(Some(OTHER_QUEUE)).await.unwrap().is_empty());
    assert_eq!(backend.workers(None).await.unwrap().len(), 1);

    assert_eq!(
        backend.record_heartbeat(&id, 5, 1).await.unwrap(),
        Some(WorkerStatus::Running)
    );
    let worker = backend.workers(None).await.unwrap().remove(0);
    assert_eq!(worker.processed_count, 5);
    assert_eq!(worker.failed_count, 1);

    backend
        .set_worker_status(&id, WorkerStatus::Paused)
        .await
        .unwrap();
    assert_eq!(
        backend.record_heartbeat(&id, 5, 1).await.unwrap(),
        Some(WorkerStatus::Paused)
    );

    backend.unregister_worker(&id).await.unwrap();
    assert_eq!(backend.record_heartbeat(&id, 5, 1).await.unwrap(), None);
    assert!(backend.workers(None).await.unwrap().is_empty());
    assert!(backend.unregister_worker(&id).await.is_ok());
}

#[doc(hidden)]
pub async fn register_worker_resets_record(backend: impl Backend) {
    let id = WorkerId::from("worker-1");
    backend.register_worker(&id, DEFAULT_QUEUE).await.unwrap();
    backend.record_heartbeat(&id, 7, 2).await.unwrap();
    backend
        .set_worker_status(&id, WorkerStatus::Stopped)
        .await
        .unwrap();

    backend.register_worker(&id, OTHER_QUEUE).await.unwrap();

    let workers = backend.workers(None).await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].queue, OTHER_QUEUE);
    assert_eq!(workers[0].status, WorkerStatus::Running);
    assert_eq!(workers[0].processed_count, 0);
    assert_eq!(workers[0].failed_count, 0);
}

#[doc(hidden)]
pub async fn set_worker_status_not_found(backend: impl Backend) {
    assert!(matches!(
        backend
            .set_worker_status(&WorkerId::from("missing"), WorkerStatus::Stopped)
            .await,
        Err(BackendError::WorkerNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn reap_stale_workers_keeps_fresh_workers(backend: impl Backend) {
    let stale = WorkerId::from("worker-stale");
    let fresh = WorkerId::from("worker-fresh");
    backend.register_worker(&stale, DEFAULT_QUEUE).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    backend.register_worker(&fresh, DEFAULT_QUEUE).await.unwrap();

    let report = backend
        .reap_stale_workers(TimeDelta::milliseconds(50))
        .await
        .unwrap();

    assert_eq!(report.workers, vec![stale]);
    let workers = backend.workers(None).await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].worker_id, fresh);

    let report = backend
        .reap_stale_workers(TimeDelta::minutes(5))
        .await
        .unwrap();
    assert!(report.is_empty());
}

#[doc(hidden)]
pub async fn reap_stale_workers_resolves_orphans(backend: impl Backend) {
    let crashed = WorkerId::from("worker-crashed");
    let alive = WorkerId::from("worker-alive");
    let retried = backend.push_mock().await;
    let exhausted = backend
        .push(EnqueuableJob::mock_job().with_max_attempts(1))
        .await
        .unwrap();
    let held = backend.push_mock().await;

    backend.register_worker(&crashed, DEFAULT_QUEUE).await.unwrap();
    backend.reserve(DEFAULT_QUEUE, Some(&crashed)).await.unwrap();
    backend.reserve(DEFAULT_QUEUE, Some(&crashed)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    backend.register_worker(&alive, DEFAULT_QUEUE).await.unwrap();
    backend.reserve(DEFAULT_QUEUE, Some(&alive)).await.unwrap();

    let report = backend
        .reap_stale_workers(TimeDelta::milliseconds(50))
        .await
        .unwrap();

    assert_eq!(report.workers, vec![crashed]);
    assert_eq!(report.released, vec![retried]);
    assert_eq!(report.archived, vec![exhausted]);

    let job = backend.get_job(retried).await;
    assert_eq!(job.state(Utc::now()), JobState::Queued);
    assert_eq!(job.attempts, 1);
    assert!(job.reserved_by.is_none());

    assert!(backend.job(exhausted).await.unwrap().is_none());
    let failed = backend.failed_jobs(DEFAULT_QUEUE, 10, 0).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error_type, ErrorType::Orphaned);

    assert_eq!(
        backend.get_job(held).await.state(Utc::now()),
        JobState::Reserved
    );
}

#[doc(hidden)]
pub async fn reap_stale_workers_expires_anonymous_reservations(backend: impl Backend) {
    let id = backend.push_mock().await;
    backend.reserve_next().await;

    let report = backend
        .reap_stale_workers(TimeDelta::minutes(5))
        .await
        .unwrap();
    assert!(report.is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let report = backend
        .reap_stale_workers(TimeDelta::milliseconds(50))
        .await
        .unwrap();

    assert_eq!(report.released, vec![id]);
    assert_eq!(backend.get_job(id).await.state(Utc::now()), JobState::Queued);
}
