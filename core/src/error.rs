//! Failures captured on an [`Exchange`](crate::exchange::Exchange).
//!
//! Every failure a step, a transport, or the reply coordinator can produce is an
//! [`ExchangeError`]. Failures are values: they are stored in the exchange's
//! failure slot, cloned into the redelivery state, and matched by the error
//! handler's rules. There is no type hierarchy to introspect; steps tag their
//! own failures with a `kind` string instead.
//!
//! # Taxonomy
//!
//! | Variant | Produced by | Surfaced to caller |
//! |---------|-------------|--------------------|
//! | `Timeout` | reply sweep | yes |
//! | `Rollback` | a step requesting rollback | as a rollback outcome |
//! | `Exhausted` | error handler, after redelivery | yes, wrapping the last cause |
//! | `Step` | application steps | only if unguarded or exhausted |
//! | `Transport` | transport collaborator | yes |
//! | `Remote` | a reply carrying a fault | yes |
//! | `Shutdown` | coordinator or handler stopping | yes |
//! | `Superseded` | a continuation dropped without firing | yes |

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// A failure captured while moving an exchange through a pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeError {
    /// No reply arrived before the request deadline.
    #[error("No reply received for correlation id '{correlation_id}' within {timeout:?}")]
    Timeout {
        /// Correlation id the request was registered under
        correlation_id: String,
        /// The requested timeout
        timeout: Duration,
    },

    /// A step asked for the exchange to be rolled back.
    #[error("Intended rollback: {reason}")]
    Rollback {
        /// Why the rollback was requested
        reason: String,
    },

    /// Redelivery gave up; `cause` is the failure of the last attempt.
    #[error("Redelivery exhausted after {attempts} attempts: {cause}")]
    Exhausted {
        /// Number of redeliveries performed (excluding the first attempt)
        attempts: u32,
        /// Failure of the final attempt
        cause: Box<ExchangeError>,
    },

    /// An application step failed.
    #[error("{kind}: {message}")]
    Step {
        /// Classification tag used by failure rules (e.g. `"illegal_argument"`)
        kind: String,
        /// Human readable description
        message: String,
    },

    /// The transport collaborator could not send or resolve.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The remote side answered with a fault instead of a reply.
    #[error("Remote fault: {0}")]
    Remote(String),

    /// The owning component is shutting down.
    #[error("Shutting down: {0}")]
    Shutdown(String),

    /// The continuation was dropped without being invoked.
    #[error("Continuation dropped before completion")]
    Superseded,
}

impl ExchangeError {
    /// Convenience constructor for [`ExchangeError::Step`].
    #[must_use]
    pub fn step(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Step {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`ExchangeError::Rollback`].
    #[must_use]
    pub fn rollback(reason: impl Into<String>) -> Self {
        Self::Rollback {
            reason: reason.into(),
        }
    }

    /// The `kind` tag of a step failure, if this is one.
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::Step { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Whether this is a reply timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this is a rollback request.
    #[must_use]
    pub const fn is_rollback(&self) -> bool {
        matches!(self, Self::Rollback { .. })
    }

    /// Whether redelivery was exhausted.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// Innermost failure, unwrapping any `Exhausted` layers.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::Exhausted { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}
