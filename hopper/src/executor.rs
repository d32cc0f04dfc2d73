use std::{error::Error, time::Duration};

use async_trait::async_trait;
use chrono::TimeDelta;
use serde::Serialize;

use crate::{
    job::{builder::JobBuilder, Job, JobId, Progress},
    queue::JobQueue,
    retry::RetryPolicy,
    HopperError,
};

/// An enqueuable job type.
///
/// Implementors are registered on a [`crate::worker::Worker`] with
/// [`crate::worker::Worker::with_executor`], and jobs are pushed for them through
/// [`Executor::builder`].
#[async_trait]
pub trait Executor {
    /// The type representing the job's payload.
    ///
    /// If this is not needed it can be set to unit `()`.
    type Data;
    /// The name of the job type.
    ///
    /// This is stored with every job and used to find the executor when the job is reserved,
    /// so it should be unique among the executors sharing a job store.
    ///
    /// The motivation for using a static string here is to enable developers to rename their
    /// rust types without breaking the jobs already stored.
    const NAME: &'static str;
    /// The maximum number of attempts before a failing job is archived.
    ///
    /// When pushing any given job this can be overridden via [`JobBuilder::with_max_attempts`].
    const MAX_ATTEMPTS: u16 = 3;
    /// The default priority of jobs of this type. Higher runs first.
    const PRIORITY: i32 = 0;
    /// Whether [`ExecutionContext::progress`] yields a reporter for jobs of this type.
    const REPORTS_PROGRESS: bool = false;

    async fn execute(job: Job<Self::Data>, context: ExecutionContext) -> ExecutionResult;

    /// The policy deciding how long a failed job waits before its next attempt.
    fn retry_policy(_job: &Job<Self::Data>) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// The time a single attempt may run before it is treated as failed. `None` lets the
    /// attempt run indefinitely.
    fn timeout(_job: &Job<Self::Data>) -> Option<Duration> {
        None
    }

    fn builder() -> JobBuilder<Self>
    where
        Self: Sized,
        Self::Data: Serialize,
    {
        Default::default()
    }
}

/// What an attempt produced.
pub enum ExecutionResult {
    Done,
    /// Hands the job back without counting the attempt, making it available after `delay`.
    Release { delay: TimeDelta },
    Error { error: Box<dyn ExecutionError> },
}

impl<T> From<T> for ExecutionResult
where
    T: ExecutionError + 'static,
{
    fn from(value: T) -> Self {
        Self::Error {
            error: Box::new(value),
        }
    }
}

impl ExecutionResult {
    pub fn from_result<E>(result: Result<(), E>) -> Self
    where
        E: ExecutionError + 'static,
    {
        match result {
            Ok(()) => Self::Done,
            Err(error) => error.into(),
        }
    }
}

/// An error returned by an [`Executor`].
///
/// The message stored with the failure is the error's [`std::fmt::Display`] output.
pub trait ExecutionError: Error + Send {
    /// A stable tag describing the kind of failure.
    fn error_type(&self) -> &'static str;

    /// Diagnostic detail stored alongside the message.
    fn detail(&self) -> String {
        format!("{self:?}")
    }
}

/// Handed to every [`Executor::execute`] call.
#[derive(Clone)]
pub struct ExecutionContext {
    job_id: JobId,
    queue: JobQueue,
    reports_progress: bool,
}

impl ExecutionContext {
    pub(crate) fn new(job_id: JobId, queue: JobQueue, reports_progress: bool) -> Self {
        Self {
            job_id,
            queue,
            reports_progress,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// The queue the job was reserved from, for pushing follow up work.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// A progress reporter for the running job, if its executor sets
    /// [`Executor::REPORTS_PROGRESS`].
    pub fn progress(&self) -> Option<ProgressReporter> {
        self.reports_progress.then(|| ProgressReporter {
            job_id: self.job_id,
            queue: self.queue.clone(),
        })
    }
}

/// Writes progress of a running job straight to the job store.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    queue: JobQueue,
}

impl ProgressReporter {
    pub async fn percent(&self, percent: u8) -> Result<(), HopperError> {
        self.queue.update_progress(self.job_id, percent, None).await
    }

    /// Replaces the job's progress with `percent` and `data`.
    pub async fn update<T>(&self, percent: u8, data: T) -> Result<(), HopperError>
    where
        T: Serialize,
    {
        let data = serde_json::to_value(data)?;
        self.queue
            .update_progress(self.job_id, percent, Some(data))
            .await
    }

    pub async fn current(&self) -> Result<Progress, HopperError> {
        self.queue.progress(self.job_id).await
    }
}
