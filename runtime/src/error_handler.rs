//! Redelivery-governed error handler.
//!
//! A [`Guard`] wraps a region of a pipeline. When the region leaves a failure
//! on the exchange, the [`ErrorHandler`] classifies it and decides what
//! happens next:
//!
//! ```text
//! RUNNING ──failure──▶ ON_FAILURE ─┬─▶ REDELIVER ──delay──▶ RUNNING (region restarts)
//!                                  ├─▶ HANDLED ──alternate path──▶ downstream
//!                                  ├─▶ ROLLBACK ──▶ terminal (rollback outcome)
//!                                  └─▶ EXHAUSTED ──▶ terminal (wrapped failure)
//! ```
//!
//! Classification uses an ordered list of [`FailureRule`]s, evaluated
//! top-to-bottom; the first rule whose predicate matches decides. A failure no
//! rule matches is redelivered per the handler's policy and then propagated.
//!
//! Rollback always wins: if a step marked the exchange rollback-only or
//! captured an `ExchangeError::Rollback`, no redelivery is attempted and the
//! attempt count is left untouched.
//!
//! # Thread continuity
//!
//! A transacted exchange runs the region, each redelivery, and each delay on a
//! single thread (see [`crate::affinity`]). Other exchanges may resume on a
//! different worker after any delay or suspension.
//!
//! # Example
//!
//! ```rust
//! use courier_core::{Exchange, ExchangeError, Message, Step, step_fn};
//! use courier_runtime::error_handler::{ErrorHandler, FailureRule, guard};
//! use courier_runtime::redelivery::RedeliveryPolicy;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let handler = ErrorHandler::builder()
//!     .redelivery(
//!         RedeliveryPolicy::builder()
//!             .max_redeliveries(3)
//!             .redelivery_delay(Duration::ZERO)
//!             .build(),
//!     )
//!     .rule(FailureRule::on_kind("illegal_argument").handled(step_fn("fallback", |exchange| {
//!         exchange.outbound_mut().set_body("fallback");
//!         Ok(())
//!     })))
//!     .build();
//!
//! let region = step_fn("throw", |_| Err(ExchangeError::step("illegal_argument", "Damn")));
//! let exchange = guard(region, handler).process(Exchange::new(Message::new("Hello"))).await;
//!
//! assert!(!exchange.is_failed());
//! assert!(exchange.redelivery().is_handled());
//! assert_eq!(exchange.redelivery().attempts(), 3);
//! # });
//! ```

use crate::affinity;
use crate::error::RuntimeError;
use crate::health::HealthCheck;
use crate::lifecycle::{Lifecycle, LifecycleError, LifecycleState, shutdown_requested};
use crate::metrics::RedeliveryMetrics;
use crate::redelivery::RedeliveryPolicy;
use courier_core::{Exchange, ExchangeError, Step, StepFuture};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Predicate deciding whether a rule applies to a failure.
pub type FailurePredicate = Arc<dyn Fn(&ExchangeError) -> bool + Send + Sync>;

/// What to do with a failure once redelivery is no longer possible.
#[derive(Clone)]
pub enum Disposition {
    /// Wrap the failure and propagate it to the pipeline's caller.
    Propagate,
    /// Mark the failure handled and run an alternate path instead; routing
    /// continues downstream.
    Handled(Arc<dyn Step>),
    /// Ignore the failure and continue downstream.
    Continued,
    /// Roll back immediately, without redelivery.
    Rollback,
}

impl fmt::Debug for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Propagate => write!(f, "Propagate"),
            Self::Handled(path) => write!(f, "Handled({})", path.name()),
            Self::Continued => write!(f, "Continued"),
            Self::Rollback => write!(f, "Rollback"),
        }
    }
}

/// One classification rule: predicate to disposition.
#[derive(Clone)]
pub struct FailureRule {
    name: String,
    predicate: FailurePredicate,
    disposition: Disposition,
    redelivery: Option<RedeliveryPolicy>,
    redeliverable: bool,
}

impl FailureRule {
    /// Rule matching failures for which `predicate` returns `true`.
    ///
    /// Defaults: redeliverable per the handler's policy, then propagated.
    pub fn when<P>(name: impl Into<String>, predicate: P) -> Self
    where
        P: Fn(&ExchangeError) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
            disposition: Disposition::Propagate,
            redelivery: None,
            redeliverable: true,
        }
    }

    /// Rule matching step failures tagged with `kind`.
    #[must_use]
    pub fn on_kind(kind: impl Into<String>) -> Self {
        let kind = kind.into();
        let name = format!("kind={kind}");
        Self::when(name, move |failure| failure.kind() == Some(kind.as_str()))
    }

    /// Rule matching every failure.
    #[must_use]
    pub fn any() -> Self {
        Self::when("any", |_| true)
    }

    /// Convert matching failures into a normal outcome by running `path`.
    #[must_use]
    pub fn handled(self, path: impl Step + 'static) -> Self {
        self.handled_by(Arc::new(path))
    }

    /// Like [`FailureRule::handled`], with a shared path.
    #[must_use]
    pub fn handled_by(mut self, path: Arc<dyn Step>) -> Self {
        self.disposition = Disposition::Handled(path);
        self
    }

    /// Ignore matching failures and continue.
    #[must_use]
    pub fn continued(mut self) -> Self {
        self.disposition = Disposition::Continued;
        self
    }

    /// Roll back on matching failures, without redelivery.
    #[must_use]
    pub fn rollback(mut self) -> Self {
        self.disposition = Disposition::Rollback;
        self
    }

    /// Use `policy` instead of the handler's policy for matching failures.
    #[must_use]
    pub fn with_redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery = Some(policy);
        self
    }

    /// Never redeliver matching failures.
    #[must_use]
    pub const fn not_redeliverable(mut self) -> Self {
        self.redeliverable = false;
        self
    }

    /// Whether the rule applies to `failure`.
    #[must_use]
    pub fn matches(&self, failure: &ExchangeError) -> bool {
        (self.predicate)(failure)
    }

    /// Rule name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The rule's disposition.
    #[must_use]
    pub const fn disposition(&self) -> &Disposition {
        &self.disposition
    }
}

impl fmt::Debug for FailureRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureRule")
            .field("name", &self.name)
            .field("disposition", &self.disposition)
            .field("redelivery", &self.redelivery)
            .field("redeliverable", &self.redeliverable)
            .finish_non_exhaustive()
    }
}

/// Outcome of classifying the exchange after a run of the guarded region.
enum Decision {
    Proceed,
    Redeliver(Duration),
    Handled(Arc<dyn Step>),
    Continued,
    Rollback,
    Exhausted,
}

struct HandlerInner {
    policy: RedeliveryPolicy,
    rules: SmallVec<[FailureRule; 4]>,
    lifecycle: Lifecycle,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Guard that decrements the in-flight counter on drop.
struct InFlightGuard(Arc<HandlerInner>);

impl InFlightGuard {
    fn enter(inner: &Arc<HandlerInner>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(inner))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Classifies failures and drives redelivery for guarded regions.
///
/// Cheap to clone; clones share rules, lifecycle, and in-flight tracking.
/// A freshly built handler accepts work immediately. Once [`stop`](Self::stop)
/// is called, pending redelivery delays are interrupted and no new redelivery
/// is attempted.
#[derive(Clone)]
pub struct ErrorHandler {
    inner: Arc<HandlerInner>,
}

impl ErrorHandler {
    /// Create a handler builder.
    #[must_use]
    pub fn builder() -> ErrorHandlerBuilder {
        ErrorHandlerBuilder {
            policy: RedeliveryPolicy::default(),
            rules: SmallVec::new(),
        }
    }

    /// The handler's default redelivery policy.
    #[must_use]
    pub fn policy(&self) -> &RedeliveryPolicy {
        &self.inner.policy
    }

    /// Number of guarded regions currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    /// Health of the handler.
    ///
    /// A handler that was never started still accepts work and reports
    /// healthy; a stopping or stopped one refuses redelivery and is unhealthy.
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        let state = self.state();
        let check = match state {
            LifecycleState::Created | LifecycleState::Started => HealthCheck::healthy("error-handler"),
            LifecycleState::Starting => HealthCheck::degraded("error-handler", "Handler is starting"),
            LifecycleState::Stopping | LifecycleState::Stopped => {
                HealthCheck::unhealthy("error-handler", format!("Handler is {state}"))
            }
        };
        check
            .with_metadata("state", state)
            .with_metadata("in_flight", self.in_flight())
    }

    /// Start the handler.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] if the handler is already running.
    pub fn start(&self) -> Result<(), LifecycleError> {
        self.inner.lifecycle.begin_start()?;
        self.inner.lifecycle.complete_start()
    }

    /// Stop the handler: interrupt redelivery delays, then wait up to `grace`
    /// for in-flight guarded regions to finish.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ShutdownTimeout`] if regions were still running
    /// when `grace` elapsed; the handler is stopped either way. Returns
    /// [`RuntimeError::Lifecycle`] if a concurrent `start` got in the way.
    pub async fn stop(&self, grace: Duration) -> Result<(), RuntimeError> {
        let lifecycle = &self.inner.lifecycle;
        if lifecycle.state() == LifecycleState::Created {
            // never started: go through Starting so the shutdown signal is raised
            lifecycle.begin_start()?;
        }
        if !lifecycle.begin_stop() {
            return Ok(());
        }

        let drained = tokio::time::timeout(grace, self.wait_idle()).await.is_ok();
        lifecycle.complete_stop();

        if drained {
            Ok(())
        } else {
            let remaining = self.in_flight();
            tracing::error!(remaining, "Error handler stopped with regions still in flight");
            Err(RuntimeError::ShutdownTimeout(remaining))
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn classify(&self, failure: &ExchangeError) -> Option<&FailureRule> {
        self.inner.rules.iter().find(|rule| rule.matches(failure))
    }

    /// Classify the exchange after a run of the region.
    ///
    /// `entry_attempts` is the delivery's attempt count when this guard was
    /// entered; the redelivery budget only counts attempts made since then.
    fn decide(&self, exchange: &mut Exchange, entry_attempts: u32) -> Decision {
        let Some(failure) = exchange.failure().cloned() else {
            return if exchange.is_rollback_only() {
                Decision::Rollback
            } else {
                Decision::Proceed
            };
        };

        if exchange.is_rollback_only() || failure.is_rollback() {
            exchange.mark_rollback_only();
            return Decision::Rollback;
        }

        let rule = self.classify(&failure);
        if let Some(rule) = rule {
            tracing::debug!(
                exchange_id = %exchange.id(),
                rule = %rule.name(),
                error = %failure,
                "Failure matched rule"
            );
            if matches!(rule.disposition, Disposition::Rollback) {
                exchange.mark_rollback_only();
                return Decision::Rollback;
            }
        }

        let policy = rule
            .and_then(|rule| rule.redelivery.as_ref())
            .unwrap_or(&self.inner.policy);
        let redeliverable = rule.is_none_or(|rule| rule.redeliverable);
        let attempts = exchange.redelivery().attempts().saturating_sub(entry_attempts);

        if redeliverable && policy.should_redeliver(attempts) {
            exchange.redelivery_mut().record_attempt(failure);
            return Decision::Redeliver(policy.delay_for_attempt(attempts + 1));
        }

        exchange.redelivery_mut().record_failure(failure);
        match rule.map(|rule| &rule.disposition) {
            Some(Disposition::Handled(path)) => Decision::Handled(Arc::clone(path)),
            Some(Disposition::Continued) => Decision::Continued,
            _ => Decision::Exhausted,
        }
    }

    /// Run `region` under this handler's state machine.
    async fn run_guarded(self, region: Arc<dyn Step>, mut exchange: Exchange) -> Exchange {
        let _in_flight = InFlightGuard::enter(&self.inner);
        let mut shutdown = self.inner.lifecycle.shutdown_signal();
        let entry_attempts = exchange.redelivery().attempts();

        loop {
            exchange = region.process(exchange).await;

            match self.decide(&mut exchange, entry_attempts) {
                Decision::Proceed => return exchange,
                Decision::Redeliver(delay) => {
                    let attempt = exchange.redelivery().attempts().saturating_sub(entry_attempts);
                    tracing::warn!(
                        exchange_id = %exchange.id(),
                        region = %region.name(),
                        attempt,
                        max_redeliveries = self.inner.policy.max_redeliveries,
                        delay_ms = delay.as_millis(),
                        error = ?exchange.failure(),
                        "Guarded region failed, redelivering"
                    );
                    RedeliveryMetrics::record_attempt();

                    let interrupted = if *shutdown.borrow() {
                        true
                    } else if delay.is_zero() {
                        false
                    } else {
                        tokio::select! {
                            () = tokio::time::sleep(delay) => false,
                            () = shutdown_requested(&mut shutdown) => true,
                        }
                    };
                    if interrupted {
                        tracing::warn!(
                            exchange_id = %exchange.id(),
                            attempt,
                            "Redelivery interrupted by shutdown"
                        );
                        exchange.set_failure(ExchangeError::Shutdown(format!(
                            "redelivery attempt {attempt} of exchange {} interrupted",
                            exchange.id()
                        )));
                        return exchange;
                    }

                    exchange.take_failure();
                }
                Decision::Handled(path) => {
                    tracing::info!(
                        exchange_id = %exchange.id(),
                        path = %path.name(),
                        error = ?exchange.failure(),
                        "Failure handled"
                    );
                    RedeliveryMetrics::record_handled();
                    exchange.redelivery_mut().mark_handled();
                    exchange.take_failure();
                    let mut exchange = path.process(exchange).await;
                    let attempts = exchange.redelivery().attempts().saturating_sub(entry_attempts);
                    match exchange.take_failure() {
                        Some(cause) if !cause.is_exhausted() && !cause.is_rollback() => {
                            tracing::error!(
                                exchange_id = %exchange.id(),
                                path = %path.name(),
                                error = %cause,
                                "Handled path failed"
                            );
                            exchange.set_failure(ExchangeError::Exhausted {
                                attempts,
                                cause: Box::new(cause),
                            });
                        }
                        Some(cause) => exchange.set_failure(cause),
                        None => {}
                    }
                    return exchange;
                }
                Decision::Continued => {
                    tracing::info!(
                        exchange_id = %exchange.id(),
                        error = ?exchange.failure(),
                        "Failure ignored, continuing"
                    );
                    RedeliveryMetrics::record_handled();
                    exchange.redelivery_mut().mark_continued();
                    exchange.take_failure();
                    return exchange;
                }
                Decision::Rollback => {
                    tracing::warn!(
                        exchange_id = %exchange.id(),
                        attempts = exchange.redelivery().attempts(),
                        error = ?exchange.failure(),
                        "Rollback requested, redelivery skipped"
                    );
                    RedeliveryMetrics::record_rollback();
                    return exchange;
                }
                Decision::Exhausted => {
                    let attempts = exchange.redelivery().attempts().saturating_sub(entry_attempts);
                    if let Some(cause) = exchange.take_failure() {
                        tracing::error!(
                            exchange_id = %exchange.id(),
                            region = %region.name(),
                            attempts,
                            error = %cause,
                            "Redelivery exhausted"
                        );
                        exchange.set_failure(ExchangeError::Exhausted {
                            attempts,
                            cause: Box::new(cause),
                        });
                    }
                    RedeliveryMetrics::record_exhausted();
                    return exchange;
                }
            }
        }
    }
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("policy", &self.inner.policy)
            .field("rules", &self.inner.rules)
            .field("state", &self.inner.lifecycle.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Builder for [`ErrorHandler`].
#[derive(Debug)]
pub struct ErrorHandlerBuilder {
    policy: RedeliveryPolicy,
    rules: SmallVec<[FailureRule; 4]>,
}

impl ErrorHandlerBuilder {
    /// Default redelivery policy for failures without a rule override.
    #[must_use]
    pub fn redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Append a rule; rules are evaluated in insertion order.
    #[must_use]
    pub fn rule(mut self, rule: FailureRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Build the handler.
    #[must_use]
    pub fn build(self) -> ErrorHandler {
        ErrorHandler {
            inner: Arc::new(HandlerInner {
                policy: self.policy,
                rules: self.rules,
                lifecycle: Lifecycle::new("error-handler"),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }
}

/// A region wrapped with an error handler.
#[derive(Clone)]
pub struct Guard {
    name: String,
    region: Arc<dyn Step>,
    handler: ErrorHandler,
}

impl Guard {
    /// Wrap `region` with `handler`.
    pub fn new(region: Arc<dyn Step>, handler: ErrorHandler) -> Self {
        let name = format!("guard({})", region.name());
        Self {
            name,
            region,
            handler,
        }
    }

    /// The handler guarding the region.
    #[must_use]
    pub const fn handler(&self) -> &ErrorHandler {
        &self.handler
    }
}

impl Step for Guard {
    fn process(&self, exchange: Exchange) -> StepFuture<'_> {
        let region = Arc::clone(&self.region);
        let handler = self.handler.clone();

        Box::pin(async move {
            if !exchange.is_transacted() || affinity::is_pinned() {
                return handler.run_guarded(region, exchange).await;
            }

            let snapshot = exchange.clone();
            match affinity::run_pinned(handler.run_guarded(region, exchange)).await {
                Ok(exchange) => exchange,
                Err(failure) => {
                    let mut exchange = snapshot;
                    exchange.set_failure(failure);
                    exchange
                }
            }
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard")
            .field("name", &self.name)
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

/// Wrap `region` with the error-handler state machine.
pub fn guard(region: impl Step + 'static, handler: ErrorHandler) -> Guard {
    Guard::new(Arc::new(region), handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{Message, step_fn};
    use std::sync::atomic::AtomicU32;

    fn policy(max_redeliveries: u32) -> RedeliveryPolicy {
        RedeliveryPolicy::builder()
            .max_redeliveries(max_redeliveries)
            .redelivery_delay(Duration::ZERO)
            .build()
    }

    fn counting_failure(
        counter: &Arc<AtomicU32>,
        succeed_from: u32,
        failure: ExchangeError,
    ) -> impl Step + 'static {
        let counter = Arc::clone(counter);
        step_fn("counting", move |_| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt >= succeed_from {
                Ok(())
            } else {
                Err(failure.clone())
            }
        })
    }

    #[tokio::test]
    #[allow(clippy::panic)] // Tests are allowed to panic on failures
    async fn test_exhausted_after_max_redeliveries() {
        let executions = Arc::new(AtomicU32::new(0));
        let handler = ErrorHandler::builder().redelivery(policy(5)).build();
        let region = counting_failure(&executions, u32::MAX, ExchangeError::step("io", "Damn"));

        let exchange = guard(region, handler)
            .process(Exchange::new(Message::new("Hello")))
            .await;

        assert_eq!(executions.load(Ordering::SeqCst), 6);
        assert_eq!(exchange.redelivery().attempts(), 5);
        match exchange.failure() {
            Some(ExchangeError::Exhausted { attempts, cause }) => {
                assert_eq!(*attempts, 5);
                assert_eq!(**cause, ExchangeError::step("io", "Damn"));
            }
            other => panic!("expected exhausted failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_redelivery_recovers() {
        let executions = Arc::new(AtomicU32::new(0));
        let handler = ErrorHandler::builder().redelivery(policy(3)).build();
        let region = counting_failure(&executions, 2, ExchangeError::step("io", "flaky"));

        let exchange = guard(region, handler)
            .process(Exchange::new(Message::new("Hello")))
            .await;

        assert!(!exchange.is_failed());
        assert_eq!(executions.load(Ordering::SeqCst), 2);
        assert_eq!(exchange.redelivery().attempts(), 1);
        assert_eq!(
            exchange.redelivery().last_failure(),
            Some(&ExchangeError::step("io", "flaky"))
        );
    }

    #[tokio::test]
    async fn test_rollback_request_short_circuits() {
        let executions = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&executions);
        let region = step_fn("rollback", move |exchange| {
            counter.fetch_add(1, Ordering::SeqCst);
            exchange.mark_rollback_only();
            Err(ExchangeError::step("io", "would normally be retried"))
        });
        let handler = ErrorHandler::builder().redelivery(policy(5)).build();

        let exchange = guard(region, handler)
            .process(Exchange::new(Message::new("Hello")))
            .await;

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(exchange.redelivery().attempts(), 0);
        assert!(exchange.outcome().is_rolled_back());
    }

    #[tokio::test]
    async fn test_rollback_after_redeliveries_keeps_attempt_count() {
        let executions = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&executions);
        let region = step_fn("late-rollback", move |_| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < 3 {
                Err(ExchangeError::step("io", "flaky"))
            } else {
                Err(ExchangeError::rollback("giving up"))
            }
        });
        let handler = ErrorHandler::builder().redelivery(policy(5)).build();

        let exchange = guard(region, handler)
            .process(Exchange::new(Message::new("Hello")))
            .await;

        assert_eq!(executions.load(Ordering::SeqCst), 3);
        assert_eq!(exchange.redelivery().attempts(), 2);
        assert!(exchange.is_rollback_only());
    }

    #[tokio::test]
    async fn test_rollback_rule() {
        let executions = Arc::new(AtomicU32::new(0));
        let handler = ErrorHandler::builder()
            .redelivery(policy(5))
            .rule(FailureRule::on_kind("fatal").rollback())
            .build();
        let region = counting_failure(&executions, u32::MAX, ExchangeError::step("fatal", "corrupt"));

        let exchange = guard(region, handler)
            .process(Exchange::new(Message::new("Hello")))
            .await;

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert!(exchange.outcome().is_rolled_back());
    }

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let executions = Arc::new(AtomicU32::new(0));
        let handler = ErrorHandler::builder()
            .redelivery(policy(5))
            .rule(FailureRule::on_kind("validation").not_redeliverable())
            .rule(FailureRule::any().continued())
            .build();
        let region = counting_failure(
            &executions,
            u32::MAX,
            ExchangeError::step("validation", "bad input"),
        );

        let exchange = guard(region, handler)
            .process(Exchange::new(Message::new("Hello")))
            .await;

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert!(matches!(
            exchange.failure(),
            Some(ExchangeError::Exhausted { attempts: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_continued_rule_clears_failure() {
        let handler = ErrorHandler::builder()
            .rule(FailureRule::on_kind("noise").continued())
            .build();
        let region = step_fn("noisy", |_| Err(ExchangeError::step("noise", "ignored")));

        let exchange = guard(region, handler)
            .process(Exchange::new(Message::new("Hello")))
            .await;

        assert!(!exchange.is_failed());
        assert!(exchange.redelivery().is_continued());
    }

    #[tokio::test]
    async fn test_rule_redelivery_override() {
        let executions = Arc::new(AtomicU32::new(0));
        let handler = ErrorHandler::builder()
            .redelivery(policy(1))
            .rule(FailureRule::on_kind("io").with_redelivery(policy(4)))
            .build();
        let region = counting_failure(&executions, u32::MAX, ExchangeError::step("io", "down"));

        let exchange = guard(region, handler)
            .process(Exchange::new(Message::new("Hello")))
            .await;

        assert_eq!(executions.load(Ordering::SeqCst), 5);
        assert!(exchange.failure().is_some_and(ExchangeError::is_exhausted));
    }

    #[tokio::test]
    async fn test_handled_path_runs_after_redelivery() {
        let executions = Arc::new(AtomicU32::new(0));
        let handler = ErrorHandler::builder()
            .redelivery(policy(2))
            .rule(FailureRule::on_kind("illegal_argument").handled(step_fn(
                "error-path",
                |exchange| {
                    exchange.outbound_mut().set_body("Bye Camel");
                    Ok(())
                },
            )))
            .build();
        let region = counting_failure(
            &executions,
            u32::MAX,
            ExchangeError::step("illegal_argument", "Damn"),
        );

        let exchange = guard(region, handler)
            .process(Exchange::new(Message::new("Hello Camel")))
            .await;

        assert_eq!(executions.load(Ordering::SeqCst), 3);
        assert!(!exchange.is_failed());
        assert!(exchange.redelivery().is_handled());
        assert_eq!(
            exchange.outbound().map(|m| m.body().clone()),
            Some("Bye Camel".into())
        );
    }

    #[tokio::test]
    async fn test_sequential_guards_each_get_full_budget() {
        let first_runs = Arc::new(AtomicU32::new(0));
        let second_runs = Arc::new(AtomicU32::new(0));
        let first = guard(
            counting_failure(&first_runs, 3, ExchangeError::step("io", "a")),
            ErrorHandler::builder().redelivery(policy(3)).build(),
        );
        let second = guard(
            counting_failure(&second_runs, 3, ExchangeError::step("io", "b")),
            ErrorHandler::builder().redelivery(policy(3)).build(),
        );

        let exchange = first.process(Exchange::new(Message::new("Hello"))).await;
        let exchange = second.process(exchange).await;

        assert!(!exchange.is_failed(), "unexpected failure: {:?}", exchange.failure());
        assert_eq!(first_runs.load(Ordering::SeqCst), 3);
        assert_eq!(second_runs.load(Ordering::SeqCst), 3);
        assert_eq!(exchange.redelivery().attempts(), 4);
    }

    #[tokio::test]
    #[allow(clippy::panic)] // Tests are allowed to panic on failures
    async fn test_exhausted_counts_only_own_redeliveries() {
        let executions = Arc::new(AtomicU32::new(0));
        let mut exchange = Exchange::new(Message::new("Hello"));
        exchange
            .redelivery_mut()
            .record_attempt(ExchangeError::step("io", "earlier"));
        let handler = ErrorHandler::builder().redelivery(policy(2)).build();
        let region = counting_failure(&executions, u32::MAX, ExchangeError::step("io", "down"));

        let exchange = guard(region, handler).process(exchange).await;

        assert_eq!(executions.load(Ordering::SeqCst), 3);
        assert_eq!(exchange.redelivery().attempts(), 3);
        match exchange.failure() {
            Some(ExchangeError::Exhausted { attempts, .. }) => assert_eq!(*attempts, 2),
            other => panic!("expected exhausted failure, got {other:?}"),
        }
    }

    #[tokio::test]
    #[allow(clippy::panic)] // Tests are allowed to panic on failures
    async fn test_failing_handled_path_is_wrapped() {
        let handler = ErrorHandler::builder()
            .redelivery(policy(1))
            .rule(FailureRule::on_kind("illegal_argument").handled(step_fn(
                "broken-path",
                |_| Err(ExchangeError::step("io", "path down")),
            )))
            .build();
        let region = step_fn("throw", |_| Err(ExchangeError::step("illegal_argument", "Damn")));

        let exchange = guard(region, handler)
            .process(Exchange::new(Message::new("Hello")))
            .await;

        assert!(exchange.redelivery().is_handled());
        match exchange.failure() {
            Some(ExchangeError::Exhausted { attempts, cause }) => {
                assert_eq!(*attempts, 1);
                assert_eq!(**cause, ExchangeError::step("io", "path down"));
            }
            other => panic!("expected exhausted failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failing_handled_path_keeps_rollback() {
        let handler = ErrorHandler::builder()
            .rule(FailureRule::any().handled(step_fn("abort", |_| {
                Err(ExchangeError::rollback("abort"))
            })))
            .build();
        let region = step_fn("throw", |_| Err(ExchangeError::step("io", "Damn")));

        let exchange = guard(region, handler)
            .process(Exchange::new(Message::new("Hello")))
            .await;

        assert!(exchange.failure().is_some_and(ExchangeError::is_rollback));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_interrupts_redelivery_delay() {
        let handler = ErrorHandler::builder()
            .redelivery(
                RedeliveryPolicy::builder()
                    .max_redeliveries(3)
                    .redelivery_delay(Duration::from_secs(30))
                    .build(),
            )
            .build();
        handler.start().unwrap();

        let guarded = guard(
            step_fn("slow-fail", |_| Err(ExchangeError::step("io", "down"))),
            handler.clone(),
        );
        let task = tokio::spawn(async move {
            guarded.process(Exchange::new(Message::new("Hello"))).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.in_flight(), 1);

        let started = std::time::Instant::now();
        handler.stop(Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(handler.state(), LifecycleState::Stopped);

        let exchange = task.await.unwrap();
        assert!(matches!(exchange.failure(), Some(ExchangeError::Shutdown(_))));
        assert_eq!(exchange.redelivery().attempts(), 1);
    }

    #[tokio::test]
    async fn test_stop_without_start_refuses_redelivery() {
        let executions = Arc::new(AtomicU32::new(0));
        let handler = ErrorHandler::builder().redelivery(policy(5)).build();
        handler.stop(Duration::from_millis(100)).await.unwrap();

        let region = counting_failure(&executions, u32::MAX, ExchangeError::step("io", "down"));
        let exchange = guard(region, handler)
            .process(Exchange::new(Message::new("Hello")))
            .await;

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert!(matches!(exchange.failure(), Some(ExchangeError::Shutdown(_))));
    }

    #[tokio::test]
    async fn test_health_follows_lifecycle() {
        let handler = ErrorHandler::builder().build();
        assert!(handler.health().status.is_healthy());

        handler.start().unwrap();
        assert_eq!(handler.health().metadata("state"), Some("started"));

        handler.stop(Duration::from_millis(100)).await.unwrap();
        let health = handler.health();
        assert!(health.status.is_unhealthy());
        assert_eq!(health.metadata("in_flight"), Some("0"));
    }
}
