//! A durable, priority ordered job queue with cooperative worker coordination.
//!
//! Producers push jobs to a [`JobQueue`]; any number of [`worker::Worker`]s, in any number of
//! processes, reserve and run them. Storage is pluggable through [`backend::Backend`].
//!
//! # Example
//!
//! ```
//! use hopper::backend::memory::InMemoryBackend;
//! use hopper::prelude::*;
//!
//! struct SendEmail;
//!
//! #[async_trait::async_trait]
//! impl Executor for SendEmail {
//!     type Data = String;
//!     const NAME: &'static str = "send_email";
//!
//!     async fn execute(job: Job<Self::Data>, _context: ExecutionContext) -> ExecutionResult {
//!         println!("Sending email to {}", job.data);
//!         ExecutionResult::Done
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), HopperError> {
//! let queue = JobQueue::new(InMemoryBackend::new());
//!
//! SendEmail::builder()
//!     .with_data("user@example.com".to_owned())
//!     .enqueue(&queue)
//!     .await?;
//!
//! let summary = Worker::new(queue.clone())
//!     .with_executor::<SendEmail>()
//!     .work(DEFAULT_QUEUE, None)
//!     .await?;
//!
//! assert_eq!(summary.processed, 1);
//! assert_eq!(summary.exit_reason, ExitReason::QueueExhausted);
//! # Ok(())
//! # }
//! ```
pub mod backend;
pub mod executor;
pub mod job;
pub mod prelude;
pub mod queue;
pub mod retry;
pub mod worker;

use backend::BackendError;
use thiserror::Error;

pub use queue::{JobQueue, QueueConfig};

#[derive(Debug, Error)]
pub enum HopperError {
    #[error("Error communicating with the backend")]
    Backend(#[from] BackendError),
    #[error("Error encoding or decoding value")]
    Encode(#[from] serde_json::Error),
    #[error("Progress must be at most 100 percent, got {0}")]
    InvalidProgress(u8),
    #[error("A worker needs at least one executor")]
    NoExecutors,
}
