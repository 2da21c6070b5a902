//! Health reporting for long-lived runtime components.
//!
//! Each component answers for itself with a [`HealthCheck`]
//! ([`ReplyCoordinator::health`](crate::coordinator::ReplyCoordinator::health),
//! [`ErrorHandler::health`](crate::error_handler::ErrorHandler::health)); a
//! [`HealthReport`] folds several checks into the status of the whole engine.
//!
//! # Example
//!
//! ```rust
//! use courier_runtime::health::{HealthCheck, HealthReport, HealthStatus};
//!
//! let report = HealthReport::new(vec![
//!     HealthCheck::healthy("error-handler"),
//!     HealthCheck::degraded("reply-coordinator", "Reply address not resolved"),
//! ]);
//!
//! assert_eq!(report.status, HealthStatus::Degraded);
//! assert!(report.check("reply-coordinator").is_some());
//! ```

use crate::lifecycle::LifecycleState;
use chrono::{DateTime, Utc};
use std::fmt;

/// Health of a component, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthStatus {
    /// Serving requests normally
    Healthy,

    /// Running, but some requests cannot be served yet (for example the reply
    /// address is still unresolved)
    Degraded,

    /// Not running
    Unhealthy,
}

impl HealthStatus {
    /// Whether the status is [`HealthStatus::Healthy`].
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Whether the status is [`HealthStatus::Degraded`].
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded)
    }

    /// Whether the status is [`HealthStatus::Unhealthy`].
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    /// Status implied by a lifecycle state: only a started component is
    /// healthy, a starting one is degraded.
    #[must_use]
    pub const fn from_lifecycle(state: LifecycleState) -> Self {
        match state {
            LifecycleState::Started => Self::Healthy,
            LifecycleState::Starting => Self::Degraded,
            LifecycleState::Created | LifecycleState::Stopping | LifecycleState::Stopped => {
                Self::Unhealthy
            }
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        })
    }
}

/// One component's answer to "are you healthy?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// Component name
    pub component: String,
    /// Reported status
    pub status: HealthStatus,
    /// Why the component is not healthy
    pub message: Option<String>,
    /// Extra key/value details (lifecycle state, pending requests, ...)
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    fn new(component: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            component: component.into(),
            status,
            message,
            metadata: Vec::new(),
        }
    }

    /// A healthy component.
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self::new(component, HealthStatus::Healthy, None)
    }

    /// A degraded component, with the reason.
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(component, HealthStatus::Degraded, Some(message.into()))
    }

    /// An unhealthy component, with the reason.
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(component, HealthStatus::Unhealthy, Some(message.into()))
    }

    /// Attach a detail.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.push((key.into(), value.to_string()));
        self
    }

    /// Look up a detail.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

/// Engine-wide health: the worst of its component checks.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Worst status among the checks (`Healthy` when there are none)
    pub status: HealthStatus,
    /// Component checks, in the order given
    pub checks: Vec<HealthCheck>,
    /// When the report was assembled
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// Fold `checks` into a report.
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|check| check.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            status,
            checks,
            timestamp: Utc::now(),
        }
    }

    /// The check reported by `component`, if any.
    #[must_use]
    pub fn check(&self, component: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|check| check.component == component)
    }
}
