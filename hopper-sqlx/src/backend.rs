use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use hopper::{
    backend::{
        Backend, BackendError, EnqueuableJob, ErrorRecord, FailedJob, FailedJobId, Job,
        QueueStats, ReapReport, Reservation,
    },
    job::{JobId, Progress},
    worker::{WorkerId, WorkerRecord, WorkerStatus},
};
use tracing::instrument;

use crate::{
    map_err,
    query::{FailedJobsQuery, ToQuery, WorkersQuery},
    types, PgBackend,
};

impl PgBackend {
    fn handle_update(
        result: sqlx::Result<u64>,
        not_found: BackendError,
    ) -> Result<(), BackendError> {
        match result {
            Ok(0) => Err(not_found),
            Ok(1) => Ok(()),
            Ok(_) => Err(BackendError::BadState),
            Err(error) => Err(map_err(error)),
        }
    }

    async fn reap(&self, timeout: TimeDelta) -> sqlx::Result<ReapReport> {
        let now = Utc::now();
        let cutoff = now
            .checked_sub_signed(timeout)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let mut tx = self.begin().await?;

        let workers: Vec<String> = sqlx::query_scalar(
            "DELETE FROM hopper_workers WHERE last_heartbeat < $1 RETURNING worker_id",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let orphans: Vec<types::Orphan> = sqlx::query_as(
            r#"SELECT id, reserved_at, reserved_by, attempts >= max_attempts AS exhausted
            FROM hopper_jobs
            WHERE completed_at IS NULL
            AND reserved_at IS NOT NULL
            AND (
                (
                    reserved_by IS NOT NULL
                    AND NOT EXISTS (
                        SELECT 1 FROM hopper_workers
                        WHERE hopper_workers.worker_id = hopper_jobs.reserved_by
                    )
                )
                OR (reserved_by IS NULL AND reserved_at < $1)
            )
            ORDER BY id
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut report = ReapReport {
            workers: workers.into_iter().map(WorkerId::from).collect(),
            ..Default::default()
        };
        let mut released = Vec::new();
        for orphan in orphans {
            if orphan.exhausted {
                let reservation = orphan.reservation();
                let holder = orphan.reserved_by.map(WorkerId::from);
                let error = ErrorRecord::orphaned(holder.as_ref());
                if Self::archive(&mut *tx, reservation, error).await?.is_some() {
                    report.archived.push(orphan.id.into());
                }
            } else {
                released.push(orphan.id);
            }
        }

        if !released.is_empty() {
            sqlx::query(
                r#"UPDATE hopper_jobs
                SET reserved_at = NULL, reserved_by = NULL, available_at = $2
                WHERE id = ANY($1)
                "#,
            )
            .bind(&released)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            report.released = released.into_iter().map(JobId::from).collect();
        }

        tx.commit().await?;
        Ok(report)
    }
}

#[async_trait]
impl Backend for PgBackend {
    async fn push(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        self.insert_job(job).await.map_err(map_err)
    }

    #[instrument(skip(self))]
    async fn reserve(
        &self,
        queue: &str,
        worker_id: Option<&WorkerId>,
    ) -> Result<Option<Job>, BackendError> {
        self.reserve_job(queue, worker_id)
            .await
            .map_err(map_err)?
            .map(TryFrom::try_from)
            .transpose()
    }

    async fn mark_job_complete(&self, reservation: Reservation) -> Result<(), BackendError> {
        let result = self._mark_job_complete(reservation).await;
        Self::handle_update(result, BackendError::ReservationLost(reservation.job_id))
    }

    async fn release_job(
        &self,
        reservation: Reservation,
        delay: TimeDelta,
    ) -> Result<(), BackendError> {
        let result = self.clear_reservation(reservation, delay, true).await;
        Self::handle_update(result, BackendError::ReservationLost(reservation.job_id))
    }

    async fn mark_job_retryable(
        &self,
        reservation: Reservation,
        delay: TimeDelta,
    ) -> Result<(), BackendError> {
        let result = self.clear_reservation(reservation, delay, false).await;
        Self::handle_update(result, BackendError::ReservationLost(reservation.job_id))
    }

    #[instrument(skip(self, error), fields(error_type = %error.error_type))]
    async fn archive_job(
        &self,
        reservation: Reservation,
        error: ErrorRecord,
    ) -> Result<FailedJobId, BackendError> {
        Self::archive(&self.pool, reservation, error)
            .await
            .map_err(map_err)?
            .map(FailedJobId::from)
            .ok_or(BackendError::ReservationLost(reservation.job_id))
    }

    async fn update_progress(&self, id: JobId, progress: Progress) -> Result<(), BackendError> {
        let result = self._update_progress(id, progress).await;
        Self::handle_update(result, BackendError::JobNotFound(id))
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        sqlx::query_as::<_, types::Job>("SELECT * FROM hopper_jobs WHERE id = $1")
            .bind(i64::from(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .map(TryFrom::try_from)
            .transpose()
    }

    async fn failed_jobs(
        &self,
        queue: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<FailedJob>, BackendError> {
        let query = FailedJobsQuery {
            queue,
            limit,
            offset,
        };
        let mut builder = query.query();
        let rows: Vec<types::FailedJob> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        rows.into_iter().map(TryFrom::try_from).collect()
    }

    async fn retry_failed_job(
        &self,
        id: FailedJobId,
        queue: &str,
        priority_boost: i32,
    ) -> Result<JobId, BackendError> {
        self.retry(id.into(), queue, priority_boost)
            .await
            .map_err(map_err)?
            .map(JobId::from)
            .ok_or(BackendError::FailedJobNotFound(id))
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, BackendError> {
        self.stats(queue).await.map_err(map_err)?.try_into()
    }

    async fn prune_completed_jobs(
        &self,
        queue: &str,
        older_than: TimeDelta,
    ) -> Result<u64, BackendError> {
        self.delete_completed(queue, older_than)
            .await
            .map_err(map_err)
    }

    async fn register_worker(&self, id: &WorkerId, queue: &str) -> Result<(), BackendError> {
        self.upsert_worker(id, queue).await.map_err(map_err)
    }

    async fn record_heartbeat(
        &self,
        id: &WorkerId,
        processed: u64,
        failed: u64,
    ) -> Result<Option<WorkerStatus>, BackendError> {
        Ok(self
            .heartbeat(id, processed, failed)
            .await
            .map_err(map_err)?
            .map(Into::into))
    }

    async fn set_worker_status(
        &self,
        id: &WorkerId,
        status: WorkerStatus,
    ) -> Result<(), BackendError> {
        let result = self.update_worker_status(id, status.into()).await;
        Self::handle_update(result, BackendError::WorkerNotFound(id.clone()))
    }

    async fn unregister_worker(&self, id: &WorkerId) -> Result<(), BackendError> {
        self.delete_worker(id).await.map_err(map_err)
    }

    async fn workers(&self, queue: Option<&str>) -> Result<Vec<WorkerRecord>, BackendError> {
        let query = WorkersQuery { queue };
        let mut builder = query.query();
        let rows: Vec<types::WorkerRecord> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        rows.into_iter().map(TryFrom::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn reap_stale_workers(&self, timeout: TimeDelta) -> Result<ReapReport, BackendError> {
        let report = self.reap(timeout).await.map_err(map_err)?;
        if !report.is_empty() {
            tracing::info!(
                workers = report.workers.len(),
                released = report.released.len(),
                archived = report.archived.len(),
                "Reaped stale workers"
            );
        }
        Ok(report)
    }
}
