//! Explicit lifecycle state machine, composed into long-lived components.
//!
//! ```text
//! Created ──start──▶ Starting ──▶ Started ──stop──▶ Stopping ──▶ Stopped
//!                       │                                            │
//!                       └──────────── abort ───────▶ Stopped ◀───────┘
//!                                                      │
//!                                                      └──start──▶ Starting
//! ```
//!
//! Components own a [`Lifecycle`] and drive it from their own `start`/`stop`
//! methods. The lifecycle also carries a shutdown signal that interruptible
//! waits (redelivery delays, the sweeper) subscribe to.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;
use tokio::sync::watch;

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// Constructed, never started
    Created = 0,
    /// `start` in progress
    Starting = 1,
    /// Running
    Started = 2,
    /// `stop` in progress
    Stopping = 3,
    /// Stopped; may be started again
    Stopped = 4,
}

impl LifecycleState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Starting => write!(f, "starting"),
            Self::Started => write!(f, "started"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Illegal lifecycle transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{component}: cannot go from {from} to {to}")]
pub struct LifecycleError {
    /// Component name
    pub component: String,
    /// State the component was in
    pub from: LifecycleState,
    /// State that was requested
    pub to: LifecycleState,
}

/// Lifecycle state holder with a shutdown signal.
#[derive(Debug)]
pub struct Lifecycle {
    component: String,
    state: AtomicU8,
    shutdown: watch::Sender<bool>,
}

impl Lifecycle {
    /// Create a lifecycle in the `Created` state.
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            component: component.into(),
            state: AtomicU8::new(LifecycleState::Created as u8),
            shutdown,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether work may be accepted (`Starting` or `Started`).
    #[must_use]
    pub fn is_run_allowed(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::Starting | LifecycleState::Started
        )
    }

    /// Whether the component is fully started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state() == LifecycleState::Started
    }

    /// Enter `Starting` from `Created` or `Stopped`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] from any other state.
    pub fn begin_start(&self) -> Result<(), LifecycleError> {
        self.transition(
            &[LifecycleState::Created, LifecycleState::Stopped],
            LifecycleState::Starting,
        )?;
        self.shutdown.send_replace(false);
        tracing::debug!(component = %self.component, "Starting");
        Ok(())
    }

    /// Enter `Started` from `Starting`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] if the component is not starting.
    pub fn complete_start(&self) -> Result<(), LifecycleError> {
        self.transition(&[LifecycleState::Starting], LifecycleState::Started)?;
        tracing::info!(component = %self.component, "Started");
        Ok(())
    }

    /// Abandon a failed start; goes straight to `Stopped`.
    pub fn abort_start(&self) {
        self.shutdown.send_replace(true);
        self.state
            .store(LifecycleState::Stopped as u8, Ordering::Release);
        tracing::warn!(component = %self.component, "Start aborted");
    }

    /// Enter `Stopping` and raise the shutdown signal.
    ///
    /// Returns `false` when the component is not running (already stopping,
    /// stopped, or never started); stopping is idempotent.
    pub fn begin_stop(&self) -> bool {
        let stopping = self
            .transition(
                &[LifecycleState::Starting, LifecycleState::Started],
                LifecycleState::Stopping,
            )
            .is_ok();
        if stopping {
            self.shutdown.send_replace(true);
            tracing::debug!(component = %self.component, "Stopping");
        }
        stopping
    }

    /// Enter `Stopped`.
    pub fn complete_stop(&self) {
        self.state
            .store(LifecycleState::Stopped as u8, Ordering::Release);
        tracing::info!(component = %self.component, "Stopped");
    }

    /// Subscribe to the shutdown signal (`true` once stopping).
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Component name.
    #[must_use]
    pub fn component(&self) -> &str {
        &self.component
    }

    fn transition(
        &self,
        allowed: &[LifecycleState],
        to: LifecycleState,
    ) -> Result<(), LifecycleError> {
        for from in allowed {
            if self
                .state
                .compare_exchange(*from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
        Err(LifecycleError {
            component: self.component.clone(),
            from: self.state(),
            to,
        })
    }
}

/// Wait until the shutdown signal is raised.
///
/// Returns immediately if it is already raised; a dropped sender counts as shutdown.
pub async fn shutdown_requested(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|stopping| *stopping).await;
}
