//! Provides an in memory implementation of [`Backend`].
//!
//! All three collections live behind a single lock, so every operation is atomic with respect
//! to every other one. It is a correct rather than a fast implementation, meant for tests and
//! single process use.
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use super::{
    Backend, BackendError, EnqueuableJob, ErrorRecord, FailedJob, FailedJobId, Job, QueueStats,
    ReapReport, Reservation,
};
use crate::{
    job::{JobId, Progress},
    worker::{WorkerId, WorkerRecord, WorkerStatus},
};

/// An in memory implementation of [`Backend`].
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<RwLock<State>>,
}

#[derive(Default)]
struct State {
    jobs: Vec<Job>,
    failed_jobs: Vec<FailedJob>,
    workers: BTreeMap<WorkerId, WorkerRecord>,
    job_id_counter: i64,
    failed_job_id_counter: i64,
}

impl InMemoryBackend {
    /// Creates a new instance of [`InMemoryBackend`].
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, BackendError> {
        self.state.read().map_err(|_| BackendError::BadState)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, BackendError> {
        self.state.write().map_err(|_| BackendError::BadState)
    }
}

impl State {
    fn job_mut(&mut self, id: JobId) -> Result<&mut Job, BackendError> {
        self.jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or(BackendError::JobNotFound(id))
    }

    fn held_job_index(&self, reservation: Reservation) -> Result<usize, BackendError> {
        self.jobs
            .iter()
            .position(|job| {
                job.id == reservation.job_id
                    && job.reserved_at == Some(reservation.reserved_at)
                    && job.completed_at.is_none()
            })
            .ok_or(BackendError::ReservationLost(reservation.job_id))
    }

    fn held_job_mut(&mut self, reservation: Reservation) -> Result<&mut Job, BackendError> {
        let index = self.held_job_index(reservation)?;
        Ok(&mut self.jobs[index])
    }

    fn insert_job(&mut self, job: EnqueuableJob) -> JobId {
        self.job_id_counter += 1;
        let id = JobId::from(self.job_id_counter);
        let now = Utc::now();
        self.jobs.push(Job {
            id,
            queue: job.queue,
            job_type: job.job_type,
            payload: job.payload,
            priority: job.priority,
            attempts: 0,
            max_attempts: job.max_attempts,
            progress: 0,
            progress_data: None,
            created_at: now,
            available_at: after(now, job.delay),
            reserved_at: None,
            reserved_by: None,
            completed_at: None,
        });
        id
    }

    fn archive(
        &mut self,
        reservation: Reservation,
        error: ErrorRecord,
    ) -> Result<FailedJobId, BackendError> {
        let index = self.held_job_index(reservation)?;
        let job = self.jobs.remove(index);

        self.failed_job_id_counter += 1;
        let failed_id = FailedJobId::from(self.failed_job_id_counter);
        self.failed_jobs.push(FailedJob {
            id: failed_id,
            queue: job.queue,
            job_type: job.job_type,
            payload: job.payload,
            priority: job.priority,
            max_attempts: job.max_attempts,
            attempts: job.attempts,
            error_type: error.error_type,
            message: error.message,
            detail: error.detail,
            failed_at: Utc::now(),
        });
        Ok(failed_id)
    }
}

fn after(now: DateTime<Utc>, delay: TimeDelta) -> DateTime<Utc> {
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn before(now: DateTime<Utc>, age: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Job {
    fn clear_reservation(&mut self) {
        self.reserved_at = None;
        self.reserved_by = None;
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn push(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        Ok(self.write()?.insert_job(job))
    }

    async fn reserve(
        &self,
        queue: &str,
        worker_id: Option<&WorkerId>,
    ) -> Result<Option<Job>, BackendError> {
        let now = Utc::now();
        let mut state = self.write()?;
        let next = state
            .jobs
            .iter_mut()
            .filter(|job| {
                job.queue == queue
                    && job.reserved_at.is_none()
                    && job.completed_at.is_none()
                    && job.available_at <= now
            })
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            });

        Ok(next.map(|job| {
            job.reserved_at = Some(now);
            job.reserved_by = worker_id.cloned();
            job.attempts = job.attempts.saturating_add(1);
            job.clone()
        }))
    }

    async fn mark_job_complete(&self, reservation: Reservation) -> Result<(), BackendError> {
        let mut state = self.write()?;
        let job = state.held_job_mut(reservation)?;
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn release_job(
        &self,
        reservation: Reservation,
        delay: TimeDelta,
    ) -> Result<(), BackendError> {
        let mut state = self.write()?;
        let job = state.held_job_mut(reservation)?;
        job.clear_reservation();
        job.attempts = job.attempts.saturating_sub(1);
        job.available_at = after(Utc::now(), delay);
        Ok(())
    }

    async fn mark_job_retryable(
        &self,
        reservation: Reservation,
        delay: TimeDelta,
    ) -> Result<(), BackendError> {
        let mut state = self.write()?;
        let job = state.held_job_mut(reservation)?;
        job.clear_reservation();
        job.available_at = after(Utc::now(), delay);
        Ok(())
    }

    async fn archive_job(
        &self,
        reservation: Reservation,
        error: ErrorRecord,
    ) -> Result<FailedJobId, BackendError> {
        self.write()?.archive(reservation, error)
    }

    async fn update_progress(&self, id: JobId, progress: Progress) -> Result<(), BackendError> {
        let mut state = self.write()?;
        let job = state.job_mut(id)?;
        job.progress = progress.percent;
        job.progress_data = progress.data;
        Ok(())
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        Ok(self.read()?.jobs.iter().find(|job| job.id == id).cloned())
    }

    async fn failed_jobs(
        &self,
        queue: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<FailedJob>, BackendError> {
        let state = self.read()?;
        let mut failed_jobs = state
            .failed_jobs
            .iter()
            .filter(|job| job.queue == queue)
            .collect::<Vec<_>>();
        failed_jobs.sort_by(|a, b| b.failed_at.cmp(&a.failed_at).then(b.id.cmp(&a.id)));
        Ok(failed_jobs
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn retry_failed_job(
        &self,
        id: FailedJobId,
        queue: &str,
        priority_boost: i32,
    ) -> Result<JobId, BackendError> {
        let mut state = self.write()?;
        let index = state
            .failed_jobs
            .iter()
            .position(|job| job.id == id && job.queue == queue)
            .ok_or(BackendError::FailedJobNotFound(id))?;
        let failed = state.failed_jobs.remove(index);
        Ok(state.insert_job(EnqueuableJob {
            queue: failed.queue,
            job_type: failed.job_type,
            payload: failed.payload,
            priority: failed.priority.saturating_add(priority_boost),
            max_attempts: failed.max_attempts,
            delay: TimeDelta::zero(),
        }))
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, BackendError> {
        let now = Utc::now();
        let state = self.read()?;
        let mut stats = QueueStats::default();
        for job in state.jobs.iter().filter(|job| job.queue == queue) {
            match job.state(now) {
                crate::job::JobState::Delayed => stats.delayed += 1,
                crate::job::JobState::Queued => stats.pending += 1,
                crate::job::JobState::Reserved => stats.reserved += 1,
                crate::job::JobState::Completed => stats.completed += 1,
            }
        }
        stats.total = stats.pending + stats.delayed + stats.reserved;
        stats.failed = state
            .failed_jobs
            .iter()
            .filter(|job| job.queue == queue)
            .count() as u64;
        stats.active_workers = state
            .workers
            .values()
            .filter(|worker| worker.queue == queue && worker.status == WorkerStatus::Running)
            .count() as u64;
        Ok(stats)
    }

    async fn prune_completed_jobs(
        &self,
        queue: &str,
        older_than: TimeDelta,
    ) -> Result<u64, BackendError> {
        let cutoff = before(Utc::now(), older_than);
        let mut state = self.write()?;
        let before = state.jobs.len();
        state.jobs.retain(|job| {
            job.queue != queue || job.completed_at.map_or(true, |at| at >= cutoff)
        });
        Ok((before - state.jobs.len()) as u64)
    }

    async fn register_worker(&self, id: &WorkerId, queue: &str) -> Result<(), BackendError> {
        let now = Utc::now();
        self.write()?.workers.insert(
            id.clone(),
            WorkerRecord {
                worker_id: id.clone(),
                queue: queue.to_owned(),
                status: WorkerStatus::Running,
                processed_count: 0,
                failed_count: 0,
                last_heartbeat: now,
                started_at: now,
            },
        );
        Ok(())
    }

    async fn record_heartbeat(
        &self,
        id: &WorkerId,
        processed: u64,
        failed: u64,
    ) -> Result<Option<WorkerStatus>, BackendError> {
        let mut state = self.write()?;
        Ok(state.workers.get_mut(id).map(|worker| {
            worker.processed_count = processed;
            worker.failed_count = failed;
            worker.last_heartbeat = Utc::now();
            worker.status
        }))
    }

    async fn set_worker_status(
        &self,
        id: &WorkerId,
        status: WorkerStatus,
    ) -> Result<(), BackendError> {
        let mut state = self.write()?;
        let worker = state
            .workers
            .get_mut(id)
            .ok_or_else(|| BackendError::WorkerNotFound(id.clone()))?;
        worker.status = status;
        Ok(())
    }

    async fn unregister_worker(&self, id: &WorkerId) -> Result<(), BackendError> {
        self.write()?.workers.remove(id);
        Ok(())
    }

    async fn workers(&self, queue: Option<&str>) -> Result<Vec<WorkerRecord>, BackendError> {
        Ok(self
            .read()?
            .workers
            .values()
            .filter(|worker| queue.map_or(true, |queue| worker.queue == queue))
            .cloned()
            .collect())
    }

    async fn reap_stale_workers(&self, timeout: TimeDelta) -> Result<ReapReport, BackendError> {
        let now = Utc::now();
        let cutoff = before(now, timeout);
        let mut state = self.write()?;
        let mut report = ReapReport::default();

        state.workers.retain(|id, worker| {
            let stale = worker.is_stale(now, timeout);
            if stale {
                report.workers.push(id.clone());
            }
            !stale
        });

        let orphans = state
            .jobs
            .iter()
            .filter(|job| job.completed_at.is_none())
            .filter_map(|job| {
                let reserved_at = job.reserved_at?;
                let orphaned = match &job.reserved_by {
                    Some(holder) => !state.workers.contains_key(holder),
                    None => reserved_at < cutoff,
                };
                let reservation = Reservation {
                    job_id: job.id,
                    reserved_at,
                };
                orphaned.then(|| {
                    (
                        reservation,
                        job.has_attempts_remaining(),
                        job.reserved_by.clone(),
                    )
                })
            })
            .collect::<Vec<_>>();

        for (reservation, has_attempts_remaining, holder) in orphans {
            if has_attempts_remaining {
                let job = state.held_job_mut(reservation)?;
                job.clear_reservation();
                job.available_at = now;
                report.released.push(reservation.job_id);
            } else {
                state.archive(reservation, ErrorRecord::orphaned(holder.as_ref()))?;
                report.archived.push(reservation.job_id);
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_suite;
    use assert_matches::assert_matches;

    test_suite!(for: InMemoryBackend::new());

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reserve_single_job_across_threads() {
        for _ in 0..20 {
            crate::backend::testing::reserve_single_job_across_tasks(InMemoryBackend::new())
                .await;
        }
    }

    #[tokio::test]
    async fn poisoned_lock_reports_bad_state() {
        let backend = InMemoryBackend::new();
        let id = backend
            .push(EnqueuableJob::new("executor", serde_json::Value::Null))
            .await
            .unwrap();

        tokio::task::spawn({
            let backend = backend.clone();
            async move {
                let _guard = backend.state.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(
            backend
                .push(EnqueuableJob::new("executor", serde_json::Value::Null))
                .await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.reserve("default", None).await,
            Err(BackendError::BadState)
        );
        let reservation = Reservation {
            job_id: id,
            reserved_at: Utc::now(),
        };
        assert_matches!(
            backend.mark_job_complete(reservation).await,
            Err(BackendError::BadState)
        );
        assert_matches!(
            backend.reap_stale_workers(TimeDelta::minutes(5)).await,
            Err(BackendError::BadState)
        );
    }
}
