use std::{marker::PhantomData, time::Duration};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::task::JoinError;
use tracing::{instrument, Instrument};

use crate::{
    backend::{self, BackendError, ErrorRecord, ErrorType},
    executor::{ExecutionContext, ExecutionError, ExecutionResult, Executor},
    queue::{FailureOutcome, JobQueue},
    HopperError,
};

use super::{Job, JobId};

/// What a single reserved job ended as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Completed,
    Released,
    Failed(FailureOutcome),
    /// The reservation was reclaimed while the job ran, so its result was discarded.
    Lost,
}

/// Turns a lost reservation into [`JobOutcome::Lost`].
///
/// The job is back in the pool or held by another worker by then, and must not be touched.
pub(crate) fn settle(
    job_id: JobId,
    result: Result<JobOutcome, HopperError>,
) -> Result<JobOutcome, HopperError> {
    match result {
        Err(HopperError::Backend(BackendError::ReservationLost(_))) => {
            tracing::warn!(
                %job_id,
                "Reservation of job {job_id} was reclaimed before it finished, dropping its outcome"
            );
            Ok(JobOutcome::Lost)
        }
        result => result,
    }
}

/// Runs a reserved job whose executor is only known at runtime.
#[async_trait]
pub(crate) trait ErasedRunner: Send + Sync {
    async fn run(&self, job: backend::Job, queue: &JobQueue) -> Result<JobOutcome, HopperError>;
}

pub(crate) struct JobRunner<E> {
    _executor: PhantomData<fn() -> E>,
}

impl<E> JobRunner<E> {
    pub(crate) fn new() -> Self {
        Self {
            _executor: PhantomData,
        }
    }
}

#[async_trait]
impl<E> ErasedRunner for JobRunner<E>
where
    E: Executor + 'static,
    E::Data: DeserializeOwned + Send + 'static,
{
    #[instrument(skip_all, fields(job_id = %job.id, job_type = E::NAME, attempt = job.attempts))]
    async fn run(&self, job: backend::Job, queue: &JobQueue) -> Result<JobOutcome, HopperError> {
        let job_id = job.id;
        settle(job_id, Self::execute(job, queue).await)
    }
}

impl<E> JobRunner<E>
where
    E: Executor + 'static,
    E::Data: DeserializeOwned + Send + 'static,
{
    async fn execute(job: backend::Job, queue: &JobQueue) -> Result<JobOutcome, HopperError> {
        let job_id = job.id;
        let reservation = job.reservation()?;
        let job: Job<E::Data> = match job.try_into() {
            Ok(job) => job,
            Err(error) => {
                let record = ErrorRecord::new(
                    ErrorType::Decode,
                    format!("Failed to decode payload for {}: {error}", E::NAME),
                )
                .with_detail(format!("{error:?}"));
                let failed_job_id = queue.archive(reservation, record).await?;
                return Ok(JobOutcome::Failed(FailureOutcome::Archived(failed_job_id)));
            }
        };

        let is_final_attempt = job.is_final_attempt();
        let delay = E::retry_policy(&job).delay(job.attempts);
        let timeout = E::timeout(&job);
        let context = ExecutionContext::new(job_id, queue.clone(), E::REPORTS_PROGRESS);

        tracing::debug!(%job_id, "Executing job {job_id}");
        let execution = async move {
            match timeout {
                Some(duration) => tokio::time::timeout(duration, E::execute(job, context))
                    .await
                    .map_err(|_elapsed| duration),
                None => Ok(E::execute(job, context).await),
            }
        }
        .in_current_span();

        let error = match tokio::spawn(execution).await {
            Ok(Ok(ExecutionResult::Done)) => {
                queue.complete_reservation(reservation).await?;
                return Ok(JobOutcome::Completed);
            }
            Ok(Ok(ExecutionResult::Release { delay })) => {
                queue.release_reservation(reservation, delay).await?;
                return Ok(JobOutcome::Released);
            }
            Ok(Ok(ExecutionResult::Error { error })) => ErrorRecord::from(error),
            Ok(Err(duration)) => timeout_record(duration),
            Err(error) => panic_record(error),
        };

        let outcome = queue
            .fail_attempt(reservation, is_final_attempt, error, delay)
            .await?;
        Ok(JobOutcome::Failed(outcome))
    }
}

fn panic_record(error: JoinError) -> ErrorRecord {
    let msg = error.to_string();
    let message = match error.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or(msg),
        Err(_) => msg,
    };
    ErrorRecord::new(ErrorType::Panic, message)
}

fn timeout_record(duration: Duration) -> ErrorRecord {
    ErrorRecord::new(
        ErrorType::Timeout,
        format!("Job failed to complete within timeout: {duration:?}"),
    )
}

impl From<Box<dyn ExecutionError>> for ErrorRecord {
    fn from(value: Box<dyn ExecutionError>) -> Self {
        Self::new(value.error_type().into(), value.to_string()).with_detail(value.detail())
    }
}
