//! A PostgreSQL [`Backend`](hopper::backend::Backend) for hopper.
//!
//! The three collections are the tables `hopper_jobs`, `hopper_failed_jobs` and
//! `hopper_workers`. Their schema ships with this crate and is applied by [`migrate`].
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use hopper::JobQueue;
//! use hopper_sqlx::PgBackend;
//!
//! let backend = PgBackend::from_db_url("postgresql://localhost/hopper").await?;
//! hopper_sqlx::migrate(&backend).await?;
//! let queue = JobQueue::new(backend);
//! # Ok(())
//! # }
//! ```
use std::ops::Deref;

use chrono::{DateTime, TimeDelta, Utc};
use hopper::{
    backend::{BackendError, EnqueuableJob, ErrorRecord, Reservation},
    job::{JobId, Progress},
    worker::WorkerId,
};
use sqlx::{postgres::PgPoolOptions, PgExecutor, PgPool};

mod backend;
mod query;
mod types;

use types::*;

const TABLES: [&str; 3] = ["hopper_jobs", "hopper_failed_jobs", "hopper_workers"];

#[derive(Clone, Debug)]
pub struct PgBackend {
    pool: PgPool,
}

impl Deref for PgBackend {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

/// Applies the hopper schema to the database behind `pool`.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!().run(pool).await
}

pub(crate) fn map_err(error: sqlx::Error) -> BackendError {
    BackendError::Storage(Box::new(error))
}

/// The instant `delay` from `now`, clamped to the latest representable time.
pub(crate) fn after(now: DateTime<Utc>, delay: TimeDelta) -> DateTime<Utc> {
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl PgBackend {
    /// Wraps an existing pool, failing with [`BackendError::MissingCollection`] when the schema
    /// has not been applied.
    pub async fn from_pool(pool: PgPool) -> Result<Self, BackendError> {
        for table in TABLES {
            let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
                .bind(table)
                .fetch_one(&pool)
                .await
                .map_err(map_err)?;
            if !exists {
                return Err(BackendError::MissingCollection(table.to_owned()));
            }
        }
        Ok(Self { pool })
    }

    pub async fn from_db_url(db_url: &str) -> Result<Self, BackendError> {
        let pool = PgPoolOptions::new()
            .connect(db_url)
            .await
            .map_err(map_err)?;
        Self::from_pool(pool).await
    }

    async fn insert_job(&self, job: EnqueuableJob) -> sqlx::Result<JobId> {
        let now = Utc::now();
        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO hopper_jobs (
                queue,
                job_type,
                payload,
                priority,
                max_attempts,
                created_at,
                available_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(job.queue)
        .bind(job.job_type)
        .bind(job.payload)
        .bind(job.priority)
        .bind(i32::from(job.max_attempts))
        .bind(now)
        .bind(after(now, job.delay))
        .fetch_one(self.deref())
        .await?;
        Ok(id.into())
    }

    async fn reserve_job(
        &self,
        queue: &str,
        worker_id: Option<&WorkerId>,
    ) -> sqlx::Result<Option<Job>> {
        let now = Utc::now();
        sqlx::query_as(
            r#"UPDATE hopper_jobs
            SET
                reserved_at = $2,
                reserved_by = $3,
                attempts = attempts + 1
            WHERE id = (
                SELECT id FROM hopper_jobs
                WHERE queue = $1
                AND reserved_at IS NULL
                AND completed_at IS NULL
                AND available_at <= $2
                ORDER BY priority DESC, created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(now)
        .bind(worker_id.map(WorkerId::as_str))
        .fetch_optional(self.deref())
        .await
    }

    async fn _mark_job_complete(&self, reservation: Reservation) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            r#"UPDATE hopper_jobs
            SET completed_at = $3
            WHERE id = $1 AND reserved_at = $2 AND completed_at IS NULL"#,
        )
        .bind(i64::from(reservation.job_id))
        .bind(reservation.reserved_at)
        .bind(Utc::now())
        .execute(self.deref())
        .await?
        .rows_affected())
    }

    async fn clear_reservation(
        &self,
        reservation: Reservation,
        delay: TimeDelta,
        refund_attempt: bool,
    ) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            r#"UPDATE hopper_jobs
            SET
                reserved_at = NULL,
                reserved_by = NULL,
                attempts = CASE WHEN $4 THEN GREATEST(attempts - 1, 0) ELSE attempts END,
                available_at = $3
            WHERE id = $1 AND reserved_at = $2 AND completed_at IS NULL"#,
        )
        .bind(i64::from(reservation.job_id))
        .bind(reservation.reserved_at)
        .bind(after(Utc::now(), delay))
        .bind(refund_attempt)
        .execute(self.deref())
        .await?
        .rows_affected())
    }

    async fn archive<'e>(
        executor: impl PgExecutor<'e>,
        reservation: Reservation,
        error: ErrorRecord,
    ) -> sqlx::Result<Option<i64>> {
        sqlx::query_scalar(
            r#"WITH archived AS (
                DELETE FROM hopper_jobs
                WHERE id = $1 AND reserved_at = $6 AND completed_at IS NULL
                RETURNING queue, job_type, payload, priority, max_attempts, attempts
            )
            INSERT INTO hopper_failed_jobs (
                queue,
                job_type,
                payload,
                priority,
                max_attempts,
                attempts,
                error_type,
                message,
                detail,
                failed_at
            )
            SELECT queue, job_type, payload, priority, max_attempts, attempts, $2, $3, $4, $5
            FROM archived
            RETURNING id
            "#,
        )
        .bind(i64::from(reservation.job_id))
        .bind(error.error_type.as_str())
        .bind(error.message)
        .bind(error.detail)
        .bind(Utc::now())
        .bind(reservation.reserved_at)
        .fetch_optional(executor)
        .await
    }

    async fn _update_progress(&self, id: JobId, progress: Progress) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            "UPDATE hopper_jobs SET progress = $2, progress_data = $3 WHERE id = $1",
        )
        .bind(i64::from(id))
        .bind(i16::from(progress.percent))
        .bind(progress.data)
        .execute(self.deref())
        .await?
        .rows_affected())
    }

    async fn retry(&self, id: i64, queue: &str, priority_boost: i32) -> sqlx::Result<Option<i64>> {
        let now = Utc::now();
        sqlx::query_scalar(
            r#"WITH retried AS (
                DELETE FROM hopper_failed_jobs WHERE id = $1 AND queue = $2
                RETURNING queue, job_type, payload, priority, max_attempts
            )
            INSERT INTO hopper_jobs (
                queue,
                job_type,
                payload,
                priority,
                max_attempts,
                created_at,
                available_at
            )
            SELECT
                queue,
                job_type,
                payload,
                LEAST(GREATEST(priority::bigint + $3, -2147483648), 2147483647)::integer,
                max_attempts,
                $4,
                $4
            FROM retried
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(queue)
        .bind(i64::from(priority_boost))
        .bind(now)
        .fetch_optional(self.deref())
        .await
    }

    async fn stats(&self, queue: &str) -> sqlx::Result<QueueStats> {
        sqlx::query_as(
            r#"SELECT
                COUNT(*) FILTER (
                    WHERE completed_at IS NULL AND reserved_at IS NULL AND available_at <= $2
                ) AS pending,
                COUNT(*) FILTER (
                    WHERE completed_at IS NULL AND reserved_at IS NULL AND available_at > $2
                ) AS delayed,
                COUNT(*) FILTER (
                    WHERE completed_at IS NULL AND reserved_at IS NOT NULL
                ) AS reserved,
                COUNT(*) FILTER (WHERE completed_at IS NOT NULL) AS completed,
                (SELECT COUNT(*) FROM hopper_failed_jobs WHERE queue = $1) AS failed,
                (
                    SELECT COUNT(*) FROM hopper_workers
                    WHERE queue = $1 AND status = 'running'
                ) AS active_workers
            FROM hopper_jobs
            WHERE queue = $1
            "#,
        )
        .bind(queue)
        .bind(Utc::now())
        .fetch_one(self.deref())
        .await
    }

    async fn delete_completed(&self, queue: &str, older_than: TimeDelta) -> sqlx::Result<u64> {
        let Some(cutoff) = Utc::now().checked_sub_signed(older_than) else {
            return Ok(0);
        };
        Ok(
            sqlx::query("DELETE FROM hopper_jobs WHERE queue = $1 AND completed_at < $2")
                .bind(queue)
                .bind(cutoff)
                .execute(self.deref())
                .await?
                .rows_affected(),
        )
    }

    async fn upsert_worker(&self, id: &WorkerId, queue: &str) -> sqlx::Result<()> {
        sqlx::query(
            r#"INSERT INTO hopper_workers (
                worker_id,
                queue,
                status,
                processed_count,
                failed_count,
                last_heartbeat,
                started_at
            ) VALUES ($1, $2, 'running', 0, 0, $3, $3)
            ON CONFLICT (worker_id) DO UPDATE SET
                queue = EXCLUDED.queue,
                status = EXCLUDED.status,
                processed_count = 0,
                failed_count = 0,
                last_heartbeat = EXCLUDED.last_heartbeat,
                started_at = EXCLUDED.started_at
            "#,
        )
        .bind(id.as_str())
        .bind(queue)
        .bind(Utc::now())
        .execute(self.deref())
        .await?;
        Ok(())
    }

    async fn heartbeat(
        &self,
        id: &WorkerId,
        processed: u64,
        failed: u64,
    ) -> sqlx::Result<Option<WorkerStatus>> {
        sqlx::query_scalar(
            r#"UPDATE hopper_workers
            SET processed_count = $2, failed_count = $3, last_heartbeat = $4
            WHERE worker_id = $1
            RETURNING status
            "#,
        )
        .bind(id.as_str())
        .bind(i64::try_from(processed).unwrap_or(i64::MAX))
        .bind(i64::try_from(failed).unwrap_or(i64::MAX))
        .bind(Utc::now())
        .fetch_optional(self.deref())
        .await
    }

    async fn update_worker_status(
        &self,
        id: &WorkerId,
        status: WorkerStatus,
    ) -> sqlx::Result<u64> {
        Ok(
            sqlx::query("UPDATE hopper_workers SET status = $2 WHERE worker_id = $1")
                .bind(id.as_str())
                .bind(status)
                .execute(self.deref())
                .await?
                .rows_affected(),
        )
    }

    async fn delete_worker(&self, id: &WorkerId) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM hopper_workers WHERE worker_id = $1")
            .bind(id.as_str())
            .execute(self.deref())
            .await?;
        Ok(())
    }
}
