//! # Courier Core
//!
//! Core types for the Courier mediation engine.
//!
//! This crate holds the data carried through pipelines and the contracts the
//! runtime is built on. It contains no scheduling, registry, or retry logic;
//! those live in `courier-runtime`.
//!
//! ## Core Concepts
//!
//! - **Exchange**: the unit of work (inbound/outbound message, failure slot,
//!   transacted flag, redelivery state, properties)
//! - **Continuation**: the one-shot callback that resumes a suspended step
//! - **Step**: a processing step that takes and returns an exchange
//! - **Transport**: the collaborator that sends requests and delivers replies
//!
//! ## Example
//!
//! ```
//! use courier_core::{Exchange, ExchangeError, Message, Step, step_fn};
//!
//! # tokio_test::block_on(async {
//! let validate = step_fn("validate", |exchange| {
//!     if exchange.inbound().body().is_null() {
//!         return Err(ExchangeError::step("illegal_argument", "empty body"));
//!     }
//!     Ok(())
//! });
//!
//! let exchange = validate.process(Exchange::new(Message::new("Hello"))).await;
//! assert!(!exchange.is_failed());
//! # });
//! ```

pub mod continuation;
pub mod error;
pub mod exchange;
pub mod step;
pub mod transport;

pub use continuation::{Continuation, Resumed, Suspension, continuation};
pub use error::ExchangeError;
pub use exchange::{CORRELATION_ID_HEADER, Exchange, FAULT_HEADER, Message, Outcome, RedeliveryState};
pub use step::{Step, StepFuture, async_step_fn, step_fn};
pub use transport::{InboundListener, Transport};
