//! Scripted steps.

use courier_core::{Exchange, ExchangeError, Step, StepFuture, continuation};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::ThreadId;
use std::time::Duration;

/// A step that fails its first `failures` executions, then succeeds.
///
/// Every execution records the thread it started on and the thread it
/// finished on. In asynchronous mode the step hands the exchange to a separate
/// OS thread and resumes through a continuation, the way a step waiting on an
/// external system would.
///
/// Clones share counters and recordings.
#[derive(Clone)]
pub struct FlakyStep {
    name: String,
    failures: u32,
    failure: ExchangeError,
    completion_delay: Option<Duration>,
    executions: Arc<AtomicU32>,
    threads: Arc<Mutex<Vec<(ThreadId, ThreadId)>>>,
}

impl FlakyStep {
    /// Fail the first `failures` executions with `failure`.
    #[must_use]
    pub fn new(failures: u32, failure: ExchangeError) -> Self {
        Self {
            name: "flaky".to_string(),
            failures,
            failure,
            completion_delay: None,
            executions: Arc::new(AtomicU32::new(0)),
            threads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A step that never succeeds.
    #[must_use]
    pub fn always(failure: ExchangeError) -> Self {
        Self::new(u32::MAX, failure)
    }

    /// Name used in logs.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Complete every execution from a separate OS thread after `delay`.
    #[must_use]
    pub const fn asynchronous(mut self, delay: Duration) -> Self {
        self.completion_delay = Some(delay);
        self
    }

    /// Number of executions so far.
    #[must_use]
    pub fn executions(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }

    /// `(started on, finished on)` thread of every execution.
    #[must_use]
    pub fn threads(&self) -> Vec<(ThreadId, ThreadId)> {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn outcome(&self, mut exchange: Exchange, execution: u32) -> Exchange {
        if execution <= self.failures {
            exchange.set_failure(self.failure.clone());
        } else {
            exchange
                .outbound_mut()
                .set_body(format!("{} succeeded on execution {execution}", self.name));
        }
        exchange
    }
}

impl Step for FlakyStep {
    fn process(&self, exchange: Exchange) -> StepFuture<'_> {
        Box::pin(async move {
            let execution = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
            let started_on = std::thread::current().id();

            let exchange = match self.completion_delay {
                None => self.outcome(exchange, execution),
                Some(delay) => {
                    let snapshot = exchange.clone();
                    let (continuation, suspension) = continuation();
                    std::thread::spawn(move || {
                        std::thread::sleep(delay);
                        continuation.done(exchange);
                    });
                    match suspension.await {
                        Ok(resumed) => self.outcome(resumed.exchange, execution),
                        Err(failure) => {
                            let mut exchange = snapshot;
                            exchange.set_failure(failure);
                            exchange
                        }
                    }
                }
            };

            self.threads
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((started_on, std::thread::current().id()));
            exchange
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A step that records the thread it runs on and passes the exchange through.
#[derive(Clone, Default)]
pub struct ThreadProbe {
    threads: Arc<Mutex<Vec<ThreadId>>>,
}

impl ThreadProbe {
    /// Create a probe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Threads observed so far, in execution order.
    #[must_use]
    pub fn threads(&self) -> Vec<ThreadId> {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Step for ThreadProbe {
    fn process(&self, exchange: Exchange) -> StepFuture<'_> {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(std::thread::current().id());
        Box::pin(std::future::ready(exchange))
    }

    fn name(&self) -> &str {
        "thread-probe"
    }
}
