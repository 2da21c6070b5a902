//! Redelivery policy: how many times, and how long to wait in between.
//!
//! A [`RedeliveryPolicy`] only answers "may attempt `n` be redelivered?" and
//! "how long before it?". Classifying failures and driving the state machine
//! is the job of the [`ErrorHandler`](crate::error_handler::ErrorHandler).
//!
//! # Example
//!
//! ```rust
//! use courier_runtime::redelivery::RedeliveryPolicy;
//! use std::time::Duration;
//!
//! let policy = RedeliveryPolicy::builder()
//!     .max_redeliveries(5)
//!     .redelivery_delay(Duration::from_millis(100))
//!     .exponential_backoff(2.0)
//!     .max_delay(Duration::from_secs(10))
//!     .build();
//!
//! assert!(policy.should_redeliver(4));
//! assert!(!policy.should_redeliver(5));
//! assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
//! ```

use std::time::Duration;

/// Redelivery policy configuration.
///
/// # Default Values
///
/// - `max_redeliveries`: 0 (failures propagate on first occurrence)
/// - `redelivery_delay`: 1 second
/// - `max_delay`: 60 seconds
/// - `backoff_multiplier`: 2.0, applied only with exponential backoff enabled
/// - `jitter`: disabled
#[derive(Debug, Clone, PartialEq)]
pub struct RedeliveryPolicy {
    /// Maximum number of redeliveries (not counting the first attempt)
    pub max_redeliveries: u32,
    /// Delay before the first redelivery
    pub redelivery_delay: Duration,
    /// Cap for exponential backoff
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether the delay grows by `backoff_multiplier` on each redelivery
    pub use_exponential_backoff: bool,
    /// Whether delays are randomly scaled into `[0.5, 1.0]` of their value
    pub jitter: bool,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_redeliveries: 0,
            redelivery_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            use_exponential_backoff: false,
            jitter: false,
        }
    }
}

impl RedeliveryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RedeliveryPolicyBuilder {
        RedeliveryPolicyBuilder {
            max_redeliveries: None,
            redelivery_delay: None,
            max_delay: None,
            backoff_multiplier: None,
            jitter: false,
        }
    }

    /// A policy that never redelivers.
    #[must_use]
    pub fn no_redelivery() -> Self {
        Self::default()
    }

    /// Whether a failure after `attempts` redeliveries may be redelivered again.
    #[must_use]
    pub const fn should_redeliver(&self, attempts: u32) -> bool {
        attempts < self.max_redeliveries
    }

    /// Delay before redelivery number `attempt` (1-based).
    ///
    /// Fixed policies always wait `redelivery_delay`. Exponential policies wait
    /// `redelivery_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = if self.use_exponential_backoff && attempt > 1 {
            // Note: exponent is bounded by max_redeliveries which stays far below i32::MAX
            #[allow(clippy::cast_possible_wrap)]
            let factor = self.backoff_multiplier.powi((attempt - 1) as i32);
            #[allow(clippy::cast_precision_loss)]
            let millis = self.redelivery_delay.as_millis() as f64 * factor;
            #[allow(clippy::cast_precision_loss)]
            let cap = self.max_delay.as_millis() as f64;
            if millis.is_finite() && millis < cap {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let delay = Duration::from_millis(millis as u64);
                delay
            } else {
                self.max_delay
            }
        } else {
            self.redelivery_delay.min(self.max_delay)
        };

        if self.jitter {
            use rand::Rng;
            let scale = rand::thread_rng().gen_range(0.5..=1.0);
            base.mul_f64(scale)
        } else {
            base
        }
    }
}

/// Builder for [`RedeliveryPolicy`].
#[derive(Debug, Clone)]
pub struct RedeliveryPolicyBuilder {
    max_redeliveries: Option<u32>,
    redelivery_delay: Option<Duration>,
    max_delay: Option<Duration>,
    backoff_multiplier: Option<f64>,
    jitter: bool,
}

impl RedeliveryPolicyBuilder {
    /// Set maximum number of redeliveries.
    #[must_use]
    pub const fn max_redeliveries(mut self, max_redeliveries: u32) -> Self {
        self.max_redeliveries = Some(max_redeliveries);
        self
    }

    /// Set delay before the first redelivery.
    #[must_use]
    pub const fn redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Enable exponential backoff with the given multiplier.
    #[must_use]
    pub const fn exponential_backoff(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = Some(multiplier);
        self
    }

    /// Randomly scale delays into `[0.5, 1.0]` of their value.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Build the [`RedeliveryPolicy`].
    #[must_use]
    pub fn build(self) -> RedeliveryPolicy {
        let defaults = RedeliveryPolicy::default();
        RedeliveryPolicy {
            max_redeliveries: self.max_redeliveries.unwrap_or(defaults.max_redeliveries),
            redelivery_delay: self.redelivery_delay.unwrap_or(defaults.redelivery_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            backoff_multiplier: self.backoff_multiplier.unwrap_or(defaults.backoff_multiplier),
            use_exponential_backoff: self.backoff_multiplier.is_some(),
            jitter: self.jitter,
        }
    }
}
