//! Retry delays for use as part of [`crate::Executor::retry_policy`].
//!
//! A [`RetryPolicy`] maps the number of the attempt that just failed to the time the job waits
//! before it becomes available again. Three curves are provided:
//!
//! 1. Fixed
//! 2. Linear
//! 3. Exponential
//!
//! each of which can be capped with [`RetryPolicy::with_max`] and spread out with a [`Jitter`].
//!
//! All of the constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use hopper::prelude::*;
//! # use chrono::TimeDelta;
//! let policy = RetryPolicy::linear(TimeDelta::seconds(20))
//!     .with_max(TimeDelta::seconds(60))
//!     .with_jitter(Jitter::Absolute(TimeDelta::seconds(10)));
//!
//! assert!(policy.delay(1) >= TimeDelta::seconds(10));
//! assert!(policy.delay(1) <= TimeDelta::seconds(30));
//! // The max is applied before the jitter
//! assert!(policy.delay(10) >= TimeDelta::seconds(50));
//! assert!(policy.delay(10) <= TimeDelta::seconds(70));
//! ```
use chrono::TimeDelta;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Curve {
    Fixed(TimeDelta),
    Linear(TimeDelta),
    Exponential(TimeDelta),
}

/// A random jitter to be applied to a given delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter to be added to the delay in the range `-delta..=delta`.
    Absolute(TimeDelta),
    /// A random jitter to be added as a proportion of the current delay.
    Relative(f64),
}

impl Jitter {
    fn apply(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        }
        .abs();
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value
            .checked_add(&TimeDelta::milliseconds(jitter))
            .unwrap_or(value)
    }
}

/// How long a job waits before its next attempt after a failure.
///
/// The default policy waits a fixed 60 seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    curve: Curve,
    max: Option<TimeDelta>,
    min: TimeDelta,
    jitter: Option<Jitter>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(TimeDelta::seconds(60))
    }
}

impl RetryPolicy {
    const fn new(curve: Curve) -> Self {
        Self {
            curve,
            max: None,
            min: TimeDelta::zero(),
            jitter: None,
        }
    }

    /// Always waits `delay`, whatever the attempt.
    ///
    /// ```
    /// # use hopper::prelude::*;
    /// # use chrono::TimeDelta;
    /// let policy = RetryPolicy::fixed(TimeDelta::seconds(10));
    ///
    /// assert_eq!(policy.delay(1), TimeDelta::seconds(10));
    /// assert_eq!(policy.delay(3), TimeDelta::seconds(10));
    /// ```
    pub const fn fixed(delay: TimeDelta) -> Self {
        Self::new(Curve::Fixed(delay))
    }

    /// Waits `factor * attempt`.
    pub const fn linear(factor: TimeDelta) -> Self {
        Self::new(Curve::Linear(factor))
    }

    /// Waits `base * 2^(attempt - 1)`. Setting a maximum with [`RetryPolicy::with_max`] is
    /// advisable.
    ///
    /// ```
    /// # use hopper::prelude::*;
    /// # use chrono::TimeDelta;
    /// let policy =
    ///     RetryPolicy::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(30));
    ///
    /// assert_eq!(policy.delay(1), TimeDelta::seconds(2));
    /// assert_eq!(policy.delay(2), TimeDelta::seconds(4));
    /// assert_eq!(policy.delay(4), TimeDelta::seconds(16));
    /// assert_eq!(policy.delay(5), TimeDelta::seconds(30));
    /// ```
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Curve::Exponential(base))
    }

    /// Clamps the delay, before jitter, to `max`.
    pub const fn with_max(mut self, max: TimeDelta) -> Self {
        self.max = Some(max);
        self
    }

    /// Clamps the delay, after jitter, to at least `min`.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// The delay to wait after attempt number `attempt` failed. Attempts start at 1.
    pub fn delay(&self, attempt: u16) -> TimeDelta {
        let attempt = attempt.max(1);
        let mut delay = match self.curve {
            Curve::Fixed(delay) => delay,
            Curve::Linear(factor) => factor
                .checked_mul(attempt.into())
                .unwrap_or(TimeDelta::MAX),
            Curve::Exponential(base) => 2_i32
                .checked_pow(u32::from(attempt) - 1)
                .and_then(|multiplier| base.checked_mul(multiplier))
                .unwrap_or(TimeDelta::MAX),
        };

        if let Some(max) = self.max {
            delay = delay.min(max);
        }

        if let Some(jitter) = self.jitter {
            delay = jitter.apply(delay);
        }

        delay.max(self.min)
    }
}
