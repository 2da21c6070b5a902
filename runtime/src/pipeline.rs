//! Pipelines and the executor that runs them.
//!
//! A [`Pipeline`] runs its steps in order, handing the exchange from one to the
//! next. It stops at the first step that leaves a failure or a rollback mark;
//! a failure raised outside any [`Guard`](crate::error_handler::Guard) reaches
//! the caller as-is, without redelivery.
//!
//! The [`PipelineExecutor`] is the entry point for one logical delivery: it
//! resets the redelivery state, pins transacted exchanges to a single thread,
//! turns a panicking step into a failure, and classifies the result as an
//! [`Outcome`].
//!
//! # Example
//!
//! ```rust
//! use courier_core::{Exchange, Message, step_fn};
//! use courier_runtime::pipeline::{Pipeline, PipelineExecutor};
//!
//! # tokio_test::block_on(async {
//! let pipeline = Pipeline::new("greet")
//!     .then(step_fn("hello", |exchange| {
//!         exchange.outbound_mut().set_body("Hello");
//!         Ok(())
//!     }))
//!     .then(step_fn("audit", |exchange| {
//!         exchange.set_property("audited", true);
//!         Ok(())
//!     }));
//!
//! let outcome = PipelineExecutor::new(pipeline)
//!     .process(Exchange::new(Message::new("in")))
//!     .await;
//! assert!(outcome.is_completed());
//! # });
//! ```

use crate::affinity;
use crate::metrics::PipelineMetrics;
use courier_core::{Exchange, ExchangeError, Outcome, Step, StepFuture};
use futures::FutureExt;
use smallvec::SmallVec;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

/// Ordered sequence of steps.
#[derive(Clone)]
pub struct Pipeline {
    name: String,
    steps: SmallVec<[Arc<dyn Step>; 8]>,
}

impl Pipeline {
    /// Create an empty pipeline.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: SmallVec::new(),
        }
    }

    /// Append a step.
    #[must_use]
    pub fn then(self, step: impl Step + 'static) -> Self {
        self.then_arc(Arc::new(step))
    }

    /// Append a shared step.
    #[must_use]
    pub fn then_arc(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the pipeline has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Step for Pipeline {
    fn process(&self, mut exchange: Exchange) -> StepFuture<'_> {
        Box::pin(async move {
            for step in &self.steps {
                if exchange.is_failed() || exchange.is_rollback_only() {
                    tracing::debug!(
                        pipeline = %self.name,
                        exchange_id = %exchange.id(),
                        skipped = %step.name(),
                        failed = exchange.is_failed(),
                        rollback_only = exchange.is_rollback_only(),
                        "Stopping pipeline"
                    );
                    break;
                }
                tracing::trace!(pipeline = %self.name, step = %step.name(), "Running step");
                exchange = step.process(exchange).await;
            }
            exchange
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let steps: Vec<&str> = self.steps.iter().map(|step| step.name()).collect();
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("steps", &steps)
            .finish()
    }
}

/// Runs a step (usually a [`Pipeline`]) as one logical delivery.
#[derive(Clone)]
pub struct PipelineExecutor {
    root: Arc<dyn Step>,
}

impl PipelineExecutor {
    /// Create an executor for `root`.
    #[must_use]
    pub fn new(root: impl Step + 'static) -> Self {
        Self {
            root: Arc::new(root),
        }
    }

    /// Create an executor for a shared step.
    #[must_use]
    pub fn from_arc(root: Arc<dyn Step>) -> Self {
        Self { root }
    }

    /// Run one logical delivery of `exchange` to completion.
    ///
    /// Transacted exchanges run entirely on one thread. A panicking step fails
    /// the exchange with an `ExchangeError::Step` of kind `"panic"`; the
    /// exchange is then the one that entered the pipeline.
    pub async fn process(&self, mut exchange: Exchange) -> Outcome {
        exchange.begin_delivery();
        let started = Instant::now();
        let snapshot = exchange.clone();
        let transacted = exchange.is_transacted();

        let root = Arc::clone(&self.root);
        let run = async move { AssertUnwindSafe(root.process(exchange)).catch_unwind().await };
        let result = if transacted {
            affinity::run_pinned(run).await
        } else {
            Ok(run.await)
        };

        let exchange = match result {
            Ok(Ok(exchange)) => exchange,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    exchange_id = %snapshot.id(),
                    step = %self.root.name(),
                    panic = %message,
                    "Step panicked"
                );
                fail(snapshot, ExchangeError::step("panic", message))
            }
            Err(failure) => fail(snapshot, failure),
        };

        let elapsed = started.elapsed();
        let outcome = exchange.outcome();
        match &outcome {
            Outcome::Completed(exchange) => {
                tracing::debug!(exchange_id = %exchange.id(), elapsed_ms = elapsed.as_millis(), "Exchange completed");
                PipelineMetrics::record_completed(elapsed);
            }
            Outcome::Failed(exchange) => {
                tracing::warn!(
                    exchange_id = %exchange.id(),
                    error = ?exchange.failure(),
                    elapsed_ms = elapsed.as_millis(),
                    "Exchange failed"
                );
                PipelineMetrics::record_failed(elapsed);
            }
            Outcome::RolledBack(exchange) => {
                tracing::warn!(
                    exchange_id = %exchange.id(),
                    error = ?exchange.failure(),
                    "Exchange rolled back"
                );
                PipelineMetrics::record_rolled_back(elapsed);
            }
        }
        outcome
    }
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("root", &self.root.name())
            .finish()
    }
}

fn fail(mut exchange: Exchange, failure: ExchangeError) -> Exchange {
    exchange.set_failure(failure);
    exchange
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "step panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_handler::{ErrorHandler, FailureRule, guard};
    use crate::redelivery::RedeliveryPolicy;
    use courier_core::{Message, async_step_fn, step_fn};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn counter_step(name: &str, counter: &Arc<AtomicU32>) -> impl Step + 'static {
        let counter = Arc::clone(counter);
        step_fn(name.to_string(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_pipeline_stops_at_first_failure() {
        let after = Arc::new(AtomicU32::new(0));
        let pipeline = Pipeline::new("p")
            .then(step_fn("fail", |_| Err(ExchangeError::step("io", "down"))))
            .then(counter_step("after", &after));

        let outcome = PipelineExecutor::new(pipeline)
            .process(Exchange::new(Message::new("x")))
            .await;

        assert!(outcome.is_failed());
        assert_eq!(after.load(Ordering::SeqCst), 0);
        assert_eq!(
            outcome.exchange().failure(),
            Some(&ExchangeError::step("io", "down"))
        );
    }

    #[tokio::test]
    async fn test_handled_failure_continues_downstream() {
        let after = Arc::new(AtomicU32::new(0));
        let handler = ErrorHandler::builder()
            .rule(FailureRule::on_kind("illegal_argument").handled(step_fn("recover", |exchange| {
                exchange.outbound_mut().set_body("recovered");
                Ok(())
            })))
            .build();
        let pipeline = Pipeline::new("p")
            .then(guard(
                step_fn("throw", |_| Err(ExchangeError::step("illegal_argument", "Damn"))),
                handler,
            ))
            .then(counter_step("after", &after));

        let outcome = PipelineExecutor::new(pipeline)
            .process(Exchange::new(Message::new("x")))
            .await;

        assert!(outcome.is_completed());
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert!(outcome.exchange().redelivery().is_handled());
    }

    #[tokio::test]
    async fn test_rollback_mark_stops_pipeline() {
        let after = Arc::new(AtomicU32::new(0));
        let pipeline = Pipeline::new("p")
            .then(step_fn("rollback", |exchange| {
                exchange.mark_rollback_only();
                Ok(())
            }))
            .then(counter_step("after", &after));

        let outcome = PipelineExecutor::new(pipeline)
            .process(Exchange::new(Message::new("x")))
            .await;

        assert!(outcome.is_rolled_back());
        assert_eq!(after.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_step_becomes_failure() {
        let pipeline = Pipeline::new("p").then(async_step_fn("explode", |exchange| async move {
            if exchange.inbound().body() == "boom" {
                #[allow(clippy::panic)]
                {
                    panic!("step exploded");
                }
            }
            exchange
        }));

        let outcome = PipelineExecutor::new(pipeline)
            .process(Exchange::new(Message::new("boom")))
            .await;

        assert!(outcome.is_failed());
        assert_eq!(outcome.exchange().failure().and_then(ExchangeError::kind), Some("panic"));
        assert_eq!(outcome.exchange().inbound().body(), "boom");
    }

    #[tokio::test]
    async fn test_new_delivery_resets_attempts() {
        let handler = ErrorHandler::builder()
            .redelivery(
                RedeliveryPolicy::builder()
                    .max_redeliveries(2)
                    .redelivery_delay(Duration::ZERO)
                    .build(),
            )
            .build();
        let executor = PipelineExecutor::new(guard(
            step_fn("fail", |_| Err(ExchangeError::step("io", "down"))),
            handler,
        ));

        let first = executor
            .process(Exchange::new(Message::new("x")))
            .await
            .into_exchange();
        assert_eq!(first.redelivery().attempts(), 2);

        let mut again = first;
        again.take_failure();
        let second = executor.process(again).await;
        assert_eq!(second.exchange().redelivery().attempts(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_transacted_exchange_runs_pinned() {
        let pipeline = Pipeline::new("p").then(async_step_fn("probe", |mut exchange| async move {
            exchange.set_property("pinned", affinity::is_pinned());
            exchange
        }));

        let outcome = PipelineExecutor::new(pipeline)
            .process(Exchange::new(Message::new("x")).with_transacted(true))
            .await;

        assert!(outcome.is_completed());
        assert_eq!(outcome.exchange().property("pinned"), Some(&true.into()));
    }
}
