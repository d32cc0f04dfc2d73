use std::marker::PhantomData;

use chrono::TimeDelta;
use serde::Serialize;

use crate::{backend::EnqueuableJob, executor::Executor, queue::JobQueue, HopperError};

use super::{JobId, DEFAULT_QUEUE};

/// Builds a job for the executor `E`, see [`Executor::builder`].
pub struct JobBuilder<E>
where
    E: Executor,
    E::Data: Serialize,
{
    data: Option<E::Data>,
    queue: String,
    delay: TimeDelta,
    priority: i32,
    max_attempts: u16,
    _executor: PhantomData<E>,
}

impl<E> Default for JobBuilder<E>
where
    E: Executor,
    E::Data: Serialize,
{
    fn default() -> Self {
        Self {
            data: None,
            queue: DEFAULT_QUEUE.to_owned(),
            delay: TimeDelta::zero(),
            priority: E::PRIORITY,
            max_attempts: E::MAX_ATTEMPTS,
            _executor: PhantomData,
        }
    }
}

impl<E> JobBuilder<E>
where
    E: Executor,
    E::Data: Serialize,
{
    pub fn with_data(self, data: E::Data) -> Self {
        Self {
            data: Some(data),
            ..self
        }
    }

    pub fn on_queue(self, queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..self
        }
    }

    pub fn with_delay(self, delay: TimeDelta) -> Self {
        Self { delay, ..self }
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

    /// Pushes the job. Without data the payload is `null`.
    pub async fn enqueue(self, queue: &JobQueue) -> Result<JobId, HopperError> {
        let payload = serde_json::to_value(self.data)?;
        let job = EnqueuableJob::new(E::NAME, payload)
            .on_queue(self.queue)
            .with_delay(self.delay)
            .with_priority(self.priority)
            .with_max_attempts(self.max_attempts);

        queue.push(job).await
    }
}
