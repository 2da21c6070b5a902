//! # Courier Testing
//!
//! Testing utilities for the Courier mediation engine.
//!
//! This crate provides:
//! - [`LoopbackTransport`]: an in-memory transport that answers its own requests
//! - Scripted steps: [`FlakyStep`] (fails a fixed number of times) and
//!   [`ThreadProbe`] (records which thread ran it)
//! - [`init_tracing`] for readable logs in tests
//!
//! ## Example
//!
//! ```ignore
//! use courier_testing::{LoopbackTransport, init_tracing};
//! use courier_runtime::{CoordinatorConfig, ReplyCoordinator};
//!
//! #[tokio::test]
//! async fn test_round_trip() {
//!     init_tracing();
//!     let transport = Arc::new(LoopbackTransport::new().with_assigned_ids(true));
//!     let coordinator = ReplyCoordinator::new(transport.clone(), CoordinatorConfig::default());
//!     coordinator.start().await.unwrap();
//!
//!     let exchange = coordinator.request(Exchange::new(Message::new("Hello"))).await.unwrap();
//!     assert_eq!(exchange.outbound().unwrap().body(), "Bye Hello");
//! }
//! ```

/// In-memory loopback transport
pub mod loopback;

/// Scripted steps for exercising pipelines and error handlers
pub mod steps;

pub use loopback::{LoopbackTransport, SentRequest};
pub use steps::{FlakyStep, ThreadProbe};

use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a `tracing` subscriber writing to the test output.
///
/// Honours `RUST_LOG` (default `debug` for courier crates). Safe to call from
/// every test; only the first call installs the subscriber.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("courier_runtime=debug,courier_core=debug")
        });
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(false)
            .try_init();
    });
}
