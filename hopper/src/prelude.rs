//! The purpose of this module is to alleviate the need to import many of the `[hopper]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use hopper::prelude::*;
//! ```
pub use crate::backend::{EnqueuableJob, ErrorType, FailedJob, QueueStats};
pub use crate::executor::{
    ExecutionContext, ExecutionError, ExecutionResult, Executor, ProgressReporter,
};
pub use crate::job::{Job, JobId, JobState, Progress, DEFAULT_QUEUE};
pub use crate::queue::{FailureOutcome, JobQueue, QueueConfig};
pub use crate::retry::{Jitter, RetryPolicy};
pub use crate::worker::{
    ExitReason, WorkSummary, Worker, WorkerAction, WorkerId, WorkerOptions, WorkerStatus,
};
pub use crate::HopperError;
