//! Reply coordinator: request/reply over an asynchronous transport.
//!
//! The coordinator owns a [`CorrelationRegistry`], the transport handle, a
//! sweeper task, and the cached reply-to address. A request flows like this:
//!
//! 1. resolve the reply address (bounded wait, cached afterwards)
//! 2. choose a provisional correlation id and send through the transport
//! 3. register the suspended exchange, switching to the transport-assigned id
//!    if the transport returned one
//! 4. resume the exchange when the reply arrives or the sweep times it out
//!
//! Replies are delivered by the transport to the coordinator's
//! [`InboundListener`]. A reply whose id is not (yet) registered waits up to
//! [`CoordinatorConfig::early_reply_wait`] for the registration before it is
//! dropped as an orphan.
//!
//! # Example
//!
//! ```ignore
//! let coordinator = ReplyCoordinator::new(transport, CoordinatorConfig::default());
//! coordinator.start().await?;
//!
//! let exchange = coordinator
//!     .request(Exchange::new(Message::new("Hello")))
//!     .await?;
//! assert_eq!(exchange.outbound().map(Message::body), Some(&"Bye".into()));
//!
//! coordinator.stop().await?;
//! ```

use crate::error::RuntimeError;
use crate::health::{HealthCheck, HealthStatus};
use crate::lifecycle::{Lifecycle, LifecycleState, shutdown_requested};
use crate::metrics::CorrelationMetrics;
use crate::registry::{CorrelationRegistry, ReplyHolder};
use courier_core::{
    CORRELATION_ID_HEADER, Exchange, ExchangeError, FAULT_HEADER, InboundListener, Message, Step,
    StepFuture, Suspension, Transport, continuation,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Configuration for [`ReplyCoordinator`].
///
/// # Example
///
/// ```rust
/// use courier_runtime::coordinator::CoordinatorConfig;
/// use std::time::Duration;
///
/// let config = CoordinatorConfig::default()
///     .with_default_request_timeout(Duration::from_secs(5))
///     .with_transfer_faults(true);
///
/// assert_eq!(config.sweep_interval, Duration::from_millis(1000));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// How often the sweep looks for expired requests
    pub sweep_interval: Duration,
    /// How long an early reply waits for its request to be registered
    pub early_reply_wait: Duration,
    /// How long a request waits for the reply address to be resolved
    pub reply_address_timeout: Duration,
    /// Timeout used by [`ReplyCoordinator::request`]
    pub default_request_timeout: Duration,
    /// How long `stop` waits for background tasks
    pub shutdown_grace: Duration,
    /// Whether a reply carrying a `Fault` header fails the exchange
    pub transfer_faults: bool,
}

impl CoordinatorConfig {
    /// Set the sweep interval
    #[must_use]
    pub const fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the early-reply wait
    #[must_use]
    pub const fn with_early_reply_wait(mut self, wait: Duration) -> Self {
        self.early_reply_wait = wait;
        self
    }

    /// Set the reply address timeout
    #[must_use]
    pub const fn with_reply_address_timeout(mut self, timeout: Duration) -> Self {
        self.reply_address_timeout = timeout;
        self
    }

    /// Set the default request timeout
    #[must_use]
    pub const fn with_default_request_timeout(mut self, timeout: Duration) -> Self {
        self.default_request_timeout = timeout;
        self
    }

    /// Set the shutdown grace period
    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Enable or disable fault transfer
    #[must_use]
    pub const fn with_transfer_faults(mut self, transfer_faults: bool) -> Self {
        self.transfer_faults = transfer_faults;
        self
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(1000),
            early_reply_wait: Duration::from_secs(5),
            reply_address_timeout: Duration::from_secs(10),
            default_request_timeout: Duration::from_secs(20),
            shutdown_grace: Duration::from_secs(5),
            transfer_faults: false,
        }
    }
}

struct CoordinatorInner {
    config: CoordinatorConfig,
    transport: Arc<dyn Transport>,
    registry: CorrelationRegistry,
    lifecycle: Lifecycle,
    reply_address: watch::Sender<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Correlates asynchronous replies with suspended requests.
///
/// Cheap to clone; clones share the registry and background tasks.
#[derive(Clone)]
pub struct ReplyCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl ReplyCoordinator {
    /// Create a stopped coordinator over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: CoordinatorConfig) -> Self {
        let (reply_address, _) = watch::channel(None);
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                transport,
                registry: CorrelationRegistry::new(),
                lifecycle: Lifecycle::new("reply-coordinator"),
                reply_address,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start the coordinator.
    ///
    /// Registers the inbound listener with the transport, then spawns reply
    /// address resolution and the sweeper.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Lifecycle`] if the coordinator is already running.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let lifecycle = &self.inner.lifecycle;
        lifecycle.begin_start()?;

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .transport
            .register_inbound_listener(Arc::new(ReplyListener {
                coordinator: weak.clone(),
            }));

        let resolver = tokio::spawn(resolve_reply_address(
            Arc::clone(&self.inner.transport),
            weak.clone(),
            lifecycle.shutdown_signal(),
        ));
        let sweeper = tokio::spawn(run_sweeper(
            weak,
            self.inner.config.sweep_interval,
            lifecycle.shutdown_signal(),
        ));
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([resolver, sweeper]);

        if let Err(error) = lifecycle.complete_start() {
            lifecycle.abort_start();
            return Err(error.into());
        }
        tracing::info!(
            sweep_interval_ms = self.inner.config.sweep_interval.as_millis(),
            "Reply coordinator started"
        );
        Ok(())
    }

    /// Stop the coordinator.
    ///
    /// Halts the sweeper (waiting at most the shutdown grace period), then
    /// resumes every outstanding request with [`ExchangeError::Shutdown`].
    /// Stopping a coordinator that is not running does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ShutdownTimeout`] if background tasks did not
    /// finish within the grace period; they are aborted and outstanding
    /// requests are still finalised.
    pub async fn stop(&self) -> Result<(), RuntimeError> {
        let lifecycle = &self.inner.lifecycle;
        if !lifecycle.begin_stop() {
            return Ok(());
        }

        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let joined = tokio::time::timeout(
            self.inner.config.shutdown_grace,
            futures::future::join_all(tasks),
        )
        .await
        .is_ok();
        if !joined {
            for abort in &aborts {
                abort.abort();
            }
        }

        let pending = self.inner.registry.drain();
        if !pending.is_empty() {
            tracing::warn!(
                count = pending.len(),
                "Finalising outstanding requests on shutdown"
            );
        }
        for holder in pending {
            finalise_on_shutdown(holder);
        }

        lifecycle.complete_stop();
        if joined {
            Ok(())
        } else {
            tracing::error!("Reply coordinator tasks did not stop within the grace period");
            Err(RuntimeError::ShutdownTimeout(aborts.len()))
        }
    }

    /// Register an outstanding request and return its suspension.
    ///
    /// The suspension resolves once a reply is processed, the sweep times the
    /// request out, or the coordinator stops. A coordinator that is not running
    /// resolves it immediately with [`ExchangeError::Shutdown`] on the exchange.
    pub fn register(
        &self,
        mut exchange: Exchange,
        correlation_id: impl Into<String>,
        timeout: Duration,
    ) -> Suspension {
        let (continuation, suspension) = continuation();
        let correlation_id = correlation_id.into();

        if !self.inner.lifecycle.is_run_allowed() {
            tracing::warn!(
                correlation_id = %correlation_id,
                state = %self.inner.lifecycle.state(),
                "Reply coordinator not running, rejecting request"
            );
            exchange.set_failure(ExchangeError::Shutdown(format!(
                "reply coordinator is {}",
                self.inner.lifecycle.state()
            )));
            continuation.done_sync(exchange);
            return suspension;
        }

        self.inner
            .registry
            .register(correlation_id.clone(), exchange, continuation, timeout);

        // stop() may have drained the registry between the check and the insert
        if !self.inner.lifecycle.is_run_allowed() {
            if let Some(holder) = self.inner.registry.remove(&correlation_id) {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    "Reply coordinator stopped during registration"
                );
                finalise_on_shutdown(holder);
            }
        }
        suspension
    }

    /// Register an outstanding request and wait for its resolution.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::Superseded`] if the registration was replaced
    /// by another request with the same correlation id. Timeouts and faults
    /// are reported on the returned exchange, not here.
    pub async fn await_reply(
        &self,
        exchange: Exchange,
        correlation_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Exchange, ExchangeError> {
        let resumed = self.register(exchange, correlation_id, timeout).await?;
        Ok(resumed.exchange)
    }

    /// Switch a registration from its provisional id to the assigned id.
    ///
    /// Returns `false` if the request was already finalised.
    pub fn update_correlation_id(&self, provisional: &str, assigned: &str) -> bool {
        let updated = self.inner.registry.rekey(provisional, assigned);
        if updated {
            tracing::debug!(provisional, assigned, "Updated correlation id");
        }
        updated
    }

    /// Send the exchange as a request and wait for the reply, using the
    /// default request timeout.
    ///
    /// # Errors
    ///
    /// See [`ReplyCoordinator::request_with_timeout`].
    pub async fn request(&self, exchange: Exchange) -> Result<Exchange, ExchangeError> {
        self.request_with_timeout(exchange, self.inner.config.default_request_timeout)
            .await
    }

    /// Send the exchange as a request and wait up to `timeout` for the reply.
    ///
    /// The provisional correlation id is the inbound message's `CorrelationId`
    /// header, or a fresh UUID. The exchange is registered once the transport
    /// has accepted it; a reply racing ahead of the registration is held by the
    /// early-reply wait.
    ///
    /// A failed send, an unresolved reply address, a timeout, and a transferred
    /// fault are all reported on the returned exchange's failure slot.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::Superseded`] if another request registered the
    /// same correlation id while this one was outstanding.
    #[tracing::instrument(skip(self, exchange), fields(exchange_id = %exchange.id()))]
    pub async fn request_with_timeout(
        &self,
        mut exchange: Exchange,
        timeout: Duration,
    ) -> Result<Exchange, ExchangeError> {
        let reply_to = match self.reply_address().await {
            Ok(address) => address,
            Err(error) => {
                exchange.set_failure(ExchangeError::Transport(error.to_string()));
                return Ok(exchange);
            }
        };

        let provisional = exchange
            .inbound()
            .correlation_id()
            .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);

        let assigned = match self
            .inner
            .transport
            .send_outbound(&exchange, &reply_to, &provisional)
            .await
        {
            Ok(assigned) => assigned,
            Err(failure) => {
                tracing::warn!(
                    correlation_id = %provisional,
                    error = %failure,
                    "Failed to send request"
                );
                exchange.set_failure(failure);
                return Ok(exchange);
            }
        };

        tracing::debug!(
            correlation_id = %provisional,
            assigned = ?assigned,
            reply_to = %reply_to,
            "Request sent"
        );
        let suspension = self.register(exchange, provisional.as_str(), timeout);
        if let Some(assigned) = assigned.filter(|assigned| *assigned != provisional) {
            self.update_correlation_id(&provisional, &assigned);
        }

        Ok(suspension.await?.exchange)
    }

    /// Handle one inbound reply from the transport.
    ///
    /// Replies without a correlation id are dropped as malformed. Replies whose
    /// id is not registered wait up to the early-reply window, then are dropped
    /// as orphans. Neither case is reported back to the sender.
    #[tracing::instrument(skip(self, message))]
    pub async fn on_inbound_reply(&self, message: Message) {
        let Some(correlation_id) = message.correlation_id().map(str::to_string) else {
            tracing::warn!(headers = ?message.headers(), "Ignoring reply with no correlation id");
            CorrelationMetrics::record_malformed();
            return;
        };
        tracing::debug!(correlation_id = %correlation_id, "Received reply");

        let registry = &self.inner.registry;
        let reply = match registry.resolve(&correlation_id, message) {
            Ok(holder) => {
                self.process_reply(holder);
                return;
            }
            Err(reply) => reply,
        };

        tracing::warn!(
            correlation_id = %correlation_id,
            "Early reply received, waiting for its request to be registered"
        );
        CorrelationMetrics::record_early_reply();

        let registered = registry
            .wait_for_registration(&correlation_id, self.inner.config.early_reply_wait)
            .await;
        let unmatched = if registered {
            match registry.resolve(&correlation_id, reply) {
                Ok(holder) => {
                    tracing::debug!(correlation_id = %correlation_id, "Early reply matched");
                    self.process_reply(holder);
                    return;
                }
                Err(reply) => reply,
            }
        } else {
            reply
        };

        tracing::warn!(
            correlation_id = %correlation_id,
            body = %unmatched.body(),
            "Dropping reply with unknown correlation id"
        );
        CorrelationMetrics::record_orphan();
    }

    /// Hand a resolved request back to its suspended step.
    ///
    /// A timed-out request gets [`ExchangeError::Timeout`]. A reply becomes the
    /// outbound message, with the original correlation id restored if the
    /// request was rekeyed; with fault transfer enabled, a reply carrying a
    /// `Fault` header becomes [`ExchangeError::Remote`] instead.
    pub fn process_reply(&self, holder: ReplyHolder) {
        let ReplyHolder {
            correlation_id,
            original_correlation_id,
            timed_out,
            reply,
            request_timeout,
            created_at,
            mut exchange,
            continuation,
        } = holder;

        if timed_out {
            exchange.set_failure(ExchangeError::Timeout {
                correlation_id: original_correlation_id.unwrap_or(correlation_id),
                timeout: request_timeout,
            });
        } else if let Some(mut reply) = reply {
            let latency = (chrono::Utc::now() - created_at)
                .to_std()
                .unwrap_or_default();
            CorrelationMetrics::record_match(latency);

            if let Some(original) = original_correlation_id {
                reply.set_header(CORRELATION_ID_HEADER, original);
            }
            let fault = reply
                .header(FAULT_HEADER)
                .filter(|_| self.inner.config.transfer_faults)
                .map(str::to_string);
            match fault {
                Some(fault) => {
                    tracing::debug!(correlation_id = %correlation_id, fault = %fault, "Reply carries a fault");
                    exchange.set_failure(ExchangeError::Remote(fault));
                }
                None => {
                    tracing::debug!(
                        correlation_id = %correlation_id,
                        latency_ms = latency.as_millis(),
                        "Reply matched"
                    );
                    exchange.set_outbound(reply);
                }
            }
        }

        if !continuation.done(exchange) {
            tracing::debug!("Requester stopped waiting before its reply was processed");
        }
    }

    /// The reply-to address, waiting up to the configured timeout for the
    /// transport to resolve it. Cached once known.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ReplyAddressTimeout`] if the address was not
    /// resolved in time.
    pub async fn reply_address(&self) -> Result<String, RuntimeError> {
        let mut receiver = self.inner.reply_address.subscribe();
        let cached = receiver.borrow().clone();
        if let Some(address) = cached {
            return Ok(address);
        }

        tracing::trace!("Waiting for reply address to be resolved");
        let timeout = self.inner.config.reply_address_timeout;
        let resolved = tokio::time::timeout(timeout, receiver.wait_for(Option::is_some))
            .await
            .ok()
            .and_then(Result::ok)
            .and_then(|address| address.clone());

        resolved.ok_or_else(|| {
            tracing::warn!(?timeout, "Reply address was not resolved in time");
            RuntimeError::ReplyAddressTimeout(timeout)
        })
    }

    /// Publish the reply-to address, waking requests waiting for it.
    pub fn set_reply_address(&self, address: impl Into<String>) {
        let address = address.into();
        tracing::trace!(reply_to = %address, "Reply address set");
        self.inner.reply_address.send_replace(Some(address));
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.registry.len()
    }

    /// The underlying registry.
    #[must_use]
    pub fn registry(&self) -> &CorrelationRegistry {
        &self.inner.registry
    }

    /// The coordinator's configuration.
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    /// Health of the coordinator.
    ///
    /// Unhealthy unless running; degraded while starting or while the reply
    /// address is unresolved.
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        let state = self.state();
        let check = match HealthStatus::from_lifecycle(state) {
            HealthStatus::Unhealthy => {
                HealthCheck::unhealthy("reply-coordinator", format!("Coordinator is {state}"))
            }
            HealthStatus::Degraded => HealthCheck::degraded("reply-coordinator", "Coordinator is starting"),
            HealthStatus::Healthy if self.inner.reply_address.borrow().is_none() => {
                HealthCheck::degraded("reply-coordinator", "Reply address not resolved")
            }
            HealthStatus::Healthy => HealthCheck::healthy("reply-coordinator"),
        };

        check
            .with_metadata("state", state)
            .with_metadata("pending", self.pending())
    }
}

impl std::fmt::Debug for ReplyCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyCoordinator")
            .field("config", &self.inner.config)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// Listener registered with the transport; holds the coordinator weakly.
struct ReplyListener {
    coordinator: Weak<CoordinatorInner>,
}

impl InboundListener for ReplyListener {
    fn on_message(&self, message: Message) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match self.coordinator.upgrade() {
                Some(inner) => ReplyCoordinator { inner }.on_inbound_reply(message).await,
                None => tracing::debug!("Reply coordinator dropped, ignoring reply"),
            }
        })
    }
}

/// Resume a request that can no longer be answered because the coordinator stopped.
fn finalise_on_shutdown(holder: ReplyHolder) {
    let ReplyHolder {
        correlation_id,
        mut exchange,
        continuation,
        ..
    } = holder;
    exchange.set_failure(ExchangeError::Shutdown(format!(
        "reply coordinator stopped while awaiting correlation id '{correlation_id}'"
    )));
    continuation.done(exchange);
}

async fn resolve_reply_address(
    transport: Arc<dyn Transport>,
    coordinator: Weak<CoordinatorInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::select! {
        resolved = transport.resolve_reply_address() => match resolved {
            Ok(address) => {
                if let Some(inner) = coordinator.upgrade() {
                    ReplyCoordinator { inner }.set_reply_address(address);
                }
            }
            Err(error) => tracing::error!(error = %error, "Failed to resolve reply address"),
        },
        () = shutdown_requested(&mut shutdown) => {}
    }
}

async fn run_sweeper(
    coordinator: Weak<CoordinatorInner>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = shutdown_requested(&mut shutdown) => break,
        }
        let Some(inner) = coordinator.upgrade() else {
            break;
        };
        let coordinator = ReplyCoordinator { inner };
        for holder in coordinator.inner.registry.sweep(Instant::now()) {
            tracing::warn!(
                correlation_id = %holder.correlation_id,
                timeout_ms = holder.request_timeout.as_millis(),
                "Request timed out waiting for reply"
            );
            CorrelationMetrics::record_timeout();
            coordinator.process_reply(holder);
        }
    }
    tracing::debug!("Sweeper stopped");
}

/// A [`Step`] performing request/reply through a coordinator.
#[derive(Debug, Clone)]
pub struct RequestReply {
    coordinator: ReplyCoordinator,
    timeout: Option<Duration>,
}

impl RequestReply {
    /// Use `timeout` instead of the coordinator's default request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Step for RequestReply {
    fn process(&self, exchange: Exchange) -> StepFuture<'_> {
        Box::pin(async move {
            let timeout = self
                .timeout
                .unwrap_or(self.coordinator.inner.config.default_request_timeout);
            // the registry owns the exchange while suspended; keep a copy in
            // case the registration is superseded
            let snapshot = exchange.clone();
            match self.coordinator.request_with_timeout(exchange, timeout).await {
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
        "request-reply"
    }
}

/// Request/reply step over `coordinator`.
#[must_use]
pub fn request_reply(coordinator: &ReplyCoordinator) -> RequestReply {
    RequestReply {
        coordinator: coordinator.clone(),
        timeout: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_testing::LoopbackTransport;

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig::default()
            .with_sweep_interval(Duration::from_millis(20))
            .with_early_reply_wait(Duration::from_millis(300))
            .with_reply_address_timeout(Duration::from_millis(200))
            .with_shutdown_grace(Duration::from_secs(1))
    }

    async fn started(transport: &Arc<LoopbackTransport>, config: CoordinatorConfig) -> ReplyCoordinator {
        let coordinator = ReplyCoordinator::new(transport.clone(), config);
        coordinator.start().await.unwrap();
        coordinator
    }

    #[tokio::test]
    async fn test_round_trip_restores_original_correlation_id() {
        let transport = Arc::new(LoopbackTransport::new().with_assigned_ids(true));
        let coordinator = started(&transport, fast_config()).await;

        let inbound = Message::new("Hello").with_header(CORRELATION_ID_HEADER, "abc-1");
        let exchange = coordinator.request(Exchange::new(inbound)).await.unwrap();

        assert!(!exchange.is_failed());
        let reply = exchange.outbound().unwrap();
        assert_eq!(reply.correlation_id(), Some("abc-1"));
        assert_eq!(reply.body(), "Bye Hello");
        assert_eq!(coordinator.pending(), 0);

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    #[allow(clippy::panic)] // Tests are allowed to panic on failures
    async fn test_unanswered_request_times_out_once() {
        let transport = Arc::new(LoopbackTransport::new().silent());
        let coordinator = started(&transport, fast_config()).await;

        let started_at = Instant::now();
        let exchange = coordinator
            .request_with_timeout(Exchange::new(Message::new("Hello")), Duration::from_millis(100))
            .await
            .unwrap();

        assert!(started_at.elapsed() >= Duration::from_millis(100));
        assert!(started_at.elapsed() < Duration::from_millis(100) + Duration::from_secs(1));
        match exchange.failure() {
            Some(ExchangeError::Timeout { timeout, .. }) => {
                assert_eq!(*timeout, Duration::from_millis(100));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(exchange.outbound().is_none());
        assert_eq!(coordinator.pending(), 0);

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_early_reply_is_matched_once_registered() {
        let transport = Arc::new(LoopbackTransport::new().silent());
        let coordinator = started(&transport, fast_config()).await;

        let early = tokio::spawn({
            let coordinator = coordinator.clone();
            async move {
                coordinator
                    .on_inbound_reply(
                        Message::new("early").with_header(CORRELATION_ID_HEADER, "late-id"),
                    )
                    .await;
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let exchange = coordinator
            .await_reply(Exchange::new(Message::new("Hello")), "late-id", Duration::from_secs(5))
            .await
            .unwrap();
        early.await.unwrap();

        assert_eq!(exchange.outbound().unwrap().body(), "early");
        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_beyond_early_window_is_dropped() {
        let transport = Arc::new(LoopbackTransport::new().silent());
        let config = fast_config().with_early_reply_wait(Duration::from_millis(50));
        let coordinator = started(&transport, config).await;

        coordinator
            .on_inbound_reply(Message::new("orphan").with_header(CORRELATION_ID_HEADER, "nobody"))
            .await;

        let exchange = coordinator
            .await_reply(Exchange::new(Message::new("Hello")), "nobody", Duration::from_millis(60))
            .await
            .unwrap();
        assert!(exchange.failure().is_some_and(ExchangeError::is_timeout));

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_without_correlation_id_is_ignored() {
        let transport = Arc::new(LoopbackTransport::new().silent());
        let coordinator = started(&transport, fast_config()).await;

        let suspension = coordinator.register(
            Exchange::new(Message::new("Hello")),
            "c-1",
            Duration::from_secs(5),
        );
        coordinator.on_inbound_reply(Message::new("no id")).await;
        assert_eq!(coordinator.pending(), 1);

        coordinator
            .on_inbound_reply(Message::new("Bye").with_header(CORRELATION_ID_HEADER, "c-1"))
            .await;
        let resumed = suspension.await.unwrap();
        assert!(!resumed.completed_synchronously);
        assert_eq!(resumed.exchange.outbound().unwrap().body(), "Bye");

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_fault_transfer() {
        let transport = Arc::new(LoopbackTransport::new().silent());
        let coordinator = started(&transport, fast_config().with_transfer_faults(true)).await;

        let suspension = coordinator.register(
            Exchange::new(Message::new("Hello")),
            "c-1",
            Duration::from_secs(5),
        );
        coordinator
            .on_inbound_reply(
                Message::new("ignored")
                    .with_header(CORRELATION_ID_HEADER, "c-1")
                    .with_header(FAULT_HEADER, "remote exploded"),
            )
            .await;

        let exchange = suspension.await.unwrap().exchange;
        assert_eq!(
            exchange.failure(),
            Some(&ExchangeError::Remote("remote exploded".to_string()))
        );
        assert!(exchange.outbound().is_none());

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_finalises_pending_requests() {
        let transport = Arc::new(LoopbackTransport::new().silent());
        let coordinator = started(&transport, fast_config()).await;

        let suspension = coordinator.register(
            Exchange::new(Message::new("Hello")),
            "c-1",
            Duration::from_secs(60),
        );
        coordinator.stop().await.unwrap();

        let exchange = suspension.await.unwrap().exchange;
        assert!(matches!(exchange.failure(), Some(ExchangeError::Shutdown(_))));
        assert_eq!(coordinator.state(), LifecycleState::Stopped);
        assert!(coordinator.health().status.is_unhealthy());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_registrations_racing_stop_are_all_finalised() {
        let transport = Arc::new(LoopbackTransport::new().silent());
        let coordinator = started(&transport, fast_config()).await;

        let registrars: Vec<_> = (0..4)
            .map(|worker| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    let mut suspensions = Vec::new();
                    for i in 0..200 {
                        suspensions.push(coordinator.register(
                            Exchange::new(Message::new("Hello")),
                            format!("w{worker}-{i}"),
                            Duration::from_secs(60),
                        ));
                        tokio::task::yield_now().await;
                    }
                    suspensions
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(1)).await;
        coordinator.stop().await.unwrap();

        for registrar in registrars {
            for suspension in registrar.await.unwrap() {
                let resumed = tokio::time::timeout(Duration::from_secs(2), suspension).await;
                assert!(resumed.is_ok(), "registration left dangling after stop");
                let resumed = resumed.unwrap().unwrap();
                assert!(matches!(
                    resumed.exchange.failure(),
                    Some(ExchangeError::Shutdown(_))
                ));
            }
        }
        assert_eq!(coordinator.pending(), 0);
    }

    #[tokio::test]
    async fn test_register_before_start_is_rejected() {
        let transport = Arc::new(LoopbackTransport::new());
        let coordinator = ReplyCoordinator::new(transport, fast_config());

        let resumed = coordinator
            .register(Exchange::new(Message::new("Hello")), "c-1", Duration::from_secs(1))
            .await
            .unwrap();

        assert!(resumed.completed_synchronously);
        assert!(matches!(resumed.exchange.failure(), Some(ExchangeError::Shutdown(_))));
        assert_eq!(coordinator.pending(), 0);
    }

    #[tokio::test]
    async fn test_reply_address_bounded_wait() {
        let transport = Arc::new(
            LoopbackTransport::new().with_reply_address_delay(Duration::from_secs(60)),
        );
        let coordinator = started(&transport, fast_config()).await;

        assert!(coordinator.health().status.is_degraded());
        let started_at = Instant::now();
        let error = coordinator.reply_address().await.unwrap_err();
        assert!(matches!(error, RuntimeError::ReplyAddressTimeout(_)));
        assert!(started_at.elapsed() >= Duration::from_millis(200));

        coordinator.set_reply_address("queue:late");
        assert_eq!(coordinator.reply_address().await.unwrap(), "queue:late");
        assert!(coordinator.health().status.is_healthy());

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_failure_leaves_nothing_registered() {
        let transport = Arc::new(LoopbackTransport::new().failing_sends("broker unavailable"));
        let coordinator = started(&transport, fast_config()).await;

        let exchange = coordinator
            .request(Exchange::new(Message::new("Hello")))
            .await
            .unwrap();

        assert!(matches!(exchange.failure(), Some(ExchangeError::Transport(_))));
        assert_eq!(coordinator.pending(), 0);

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let transport = Arc::new(LoopbackTransport::new());
        let coordinator = started(&transport, fast_config()).await;

        assert!(matches!(
            coordinator.start().await,
            Err(RuntimeError::Lifecycle(_))
        ));
        coordinator.stop().await.unwrap();
        coordinator.stop().await.unwrap();
    }
}
