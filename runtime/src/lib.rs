//! # Courier Runtime
//!
//! Runtime machinery for the Courier mediation engine.
//!
//! This crate provides the components that move exchanges through pipelines
//! and across asynchronous transports:
//!
//! ## Core Components
//!
//! - **Reply Coordinator**: request/reply over a transport, with correlation,
//!   timeout sweeping, and early-reply handling ([`coordinator`])
//! - **Correlation Registry**: the concurrent map of outstanding requests
//!   ([`registry`])
//! - **Error Handler**: failure classification and redelivery around guarded
//!   regions ([`error_handler`], [`redelivery`])
//! - **Pipeline Executor**: runs one logical delivery and reports its outcome
//!   ([`pipeline`])
//! - **Lifecycle**: explicit start/stop state machine shared by the long-lived
//!   components ([`lifecycle`])
//!
//! ## Example
//!
//! ```rust
//! use courier_core::{Exchange, ExchangeError, Message, step_fn};
//! use courier_runtime::error_handler::{ErrorHandler, guard};
//! use courier_runtime::pipeline::{Pipeline, PipelineExecutor};
//! use courier_runtime::redelivery::RedeliveryPolicy;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let calls = Arc::new(AtomicU32::new(0));
//! let flaky = {
//!     let calls = Arc::clone(&calls);
//!     step_fn("flaky", move |_| {
//!         if calls.fetch_add(1, Ordering::SeqCst) < 2 {
//!             Err(ExchangeError::step("io", "not yet"))
//!         } else {
//!             Ok(())
//!         }
//!     })
//! };
//!
//! let handler = ErrorHandler::builder()
//!     .redelivery(
//!         RedeliveryPolicy::builder()
//!             .max_redeliveries(3)
//!             .redelivery_delay(Duration::ZERO)
//!             .build(),
//!     )
//!     .build();
//!
//! let executor = PipelineExecutor::new(Pipeline::new("orders").then(guard(flaky, handler)));
//! let outcome = executor.process(Exchange::new(Message::new("order"))).await;
//!
//! assert!(outcome.is_completed());
//! assert_eq!(outcome.exchange().redelivery().attempts(), 2);
//! # });
//! ```

/// Thread affinity for transacted exchanges
pub mod affinity;

/// Request/reply coordination over asynchronous transports
pub mod coordinator;

/// Failure classification and redelivery state machine
pub mod error_handler;

/// Component health reporting
pub mod health;

/// Component lifecycle state machine
pub mod lifecycle;

/// Prometheus metrics for observability
pub mod metrics;

/// Pipelines and the pipeline executor
pub mod pipeline;

/// Redelivery policy
pub mod redelivery;

/// Registry of outstanding requests
pub mod registry;

pub use coordinator::{CoordinatorConfig, ReplyCoordinator, RequestReply, request_reply};
pub use error_handler::{Disposition, ErrorHandler, FailureRule, Guard, guard};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use lifecycle::{Lifecycle, LifecycleError, LifecycleState};
pub use pipeline::{Pipeline, PipelineExecutor};
pub use redelivery::RedeliveryPolicy;
pub use registry::CorrelationRegistry;

/// Error types for the runtime components
pub mod error {
    use crate::lifecycle::LifecycleError;
    use std::time::Duration;
    use thiserror::Error;

    /// Errors returned by runtime components (as opposed to failures captured
    /// on an exchange)
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum RuntimeError {
        /// A start or stop was requested from the wrong state
        #[error(transparent)]
        Lifecycle(#[from] LifecycleError),

        /// Shutdown timed out waiting for in-flight work
        ///
        /// The component is stopped anyway; the count is what was still running.
        #[error("Shutdown timed out with {0} tasks still running")]
        ShutdownTimeout(usize),

        /// The transport did not resolve the reply address in time
        #[error("Reply address was not resolved within {0:?}")]
        ReplyAddressTimeout(Duration),
    }
}
