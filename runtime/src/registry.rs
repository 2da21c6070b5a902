//! Correlation registry: outstanding requests keyed by correlation id.
//!
//! The registry is the only structure mutated concurrently by several actors:
//! callers registering requests, transport listeners resolving replies, and the
//! sweeper finalising expired entries. All three remove entries through
//! [`DashMap`]'s atomic removal, so an entry is consumed exactly once: by a
//! matching reply, by the sweep, or by shutdown, never by two of them.
//!
//! # Early replies
//!
//! A reply may arrive before its request is registered under the id the reply
//! carries (the provisional-to-assigned switch happens after the send returns).
//! [`CorrelationRegistry::wait_for_registration`] parks the listener on a
//! per-id [`Notify`] that registration and rekeying signal, bounded by a
//! timeout, instead of re-polling the map.

use crate::metrics::CorrelationMetrics;
use chrono::{DateTime, Utc};
use courier_core::{Continuation, Exchange, Message};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// An outstanding request.
#[derive(Debug)]
pub struct PendingEntry {
    /// Id the entry is currently registered under
    pub correlation_id: String,
    /// Id the request was first registered under, if it was rekeyed
    pub original_correlation_id: Option<String>,
    /// When the request was registered
    pub created_at: DateTime<Utc>,
    /// When the sweep may finalise the entry
    pub deadline: Instant,
    /// Requested timeout
    pub timeout: Duration,
    /// The exchange awaiting resolution
    pub exchange: Exchange,
    /// Continuation resuming the suspended step
    pub continuation: Continuation,
}

impl PendingEntry {
    fn into_holder(self, reply: Option<Message>, timed_out: bool) -> ReplyHolder {
        ReplyHolder {
            correlation_id: self.correlation_id,
            original_correlation_id: self.original_correlation_id,
            timed_out,
            reply,
            request_timeout: self.timeout,
            created_at: self.created_at,
            exchange: self.exchange,
            continuation: self.continuation,
        }
    }
}

/// A matched or timed-out request, ready to be handed back to its step.
#[derive(Debug)]
pub struct ReplyHolder {
    /// Id the entry was resolved under
    pub correlation_id: String,
    /// Pre-substitution id to restore on the reply, if the request was rekeyed
    pub original_correlation_id: Option<String>,
    /// Whether the deadline passed without a reply
    pub timed_out: bool,
    /// The reply message (`None` on timeout)
    pub reply: Option<Message>,
    /// Timeout the request was registered with
    pub request_timeout: Duration,
    /// When the request was registered
    pub created_at: DateTime<Utc>,
    /// The exchange awaiting resolution
    pub exchange: Exchange,
    /// Continuation to notify
    pub continuation: Continuation,
}

/// Returned by [`CorrelationRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationHandle {
    /// Id the request is registered under
    pub correlation_id: String,
    /// When the sweep may finalise the request
    pub deadline: Instant,
}

/// Concurrent registry of outstanding requests.
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    entries: DashMap<String, PendingEntry>,
    waiters: DashMap<String, Arc<Notify>>,
}

impl CorrelationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outstanding request.
    ///
    /// Registering an id that is still live replaces the previous entry; that
    /// entry's continuation is dropped, so its suspension resolves with
    /// `ExchangeError::Superseded`. This is tolerated but logged as a caller error.
    pub fn register(
        &self,
        correlation_id: impl Into<String>,
        exchange: Exchange,
        continuation: Continuation,
        timeout: Duration,
    ) -> CorrelationHandle {
        let correlation_id = correlation_id.into();
        let deadline = Instant::now() + timeout;
        let entry = PendingEntry {
            correlation_id: correlation_id.clone(),
            original_correlation_id: None,
            created_at: Utc::now(),
            deadline,
            timeout,
            exchange,
            continuation,
        };

        if let Some(previous) = self.entries.insert(correlation_id.clone(), entry) {
            tracing::warn!(
                correlation_id = %correlation_id,
                exchange_id = %previous.exchange.id(),
                "Correlation id registered twice, replacing the previous request"
            );
        }
        self.notify_registered(&correlation_id);
        CorrelationMetrics::record_pending(self.entries.len());

        tracing::trace!(correlation_id = %correlation_id, ?timeout, "Registered request");
        CorrelationHandle {
            correlation_id,
            deadline,
        }
    }

    /// Move an entry from its provisional id to the transport-assigned id.
    ///
    /// The provisional id is remembered as the original id unless the entry was
    /// already rekeyed. Returns `false` if no entry is registered under
    /// `provisional` (it was already resolved or swept).
    pub fn rekey(&self, provisional: &str, assigned: &str) -> bool {
        if provisional == assigned {
            return self.entries.contains_key(provisional);
        }
        let Some((_, mut entry)) = self.entries.remove(provisional) else {
            tracing::debug!(
                provisional,
                assigned,
                "No entry to rekey, request already finalised"
            );
            return false;
        };

        entry
            .original_correlation_id
            .get_or_insert_with(|| provisional.to_string());
        entry.correlation_id = assigned.to_string();
        if let Some(previous) = self.entries.insert(assigned.to_string(), entry) {
            tracing::warn!(
                correlation_id = %assigned,
                exchange_id = %previous.exchange.id(),
                "Assigned correlation id already registered, replacing the previous request"
            );
        }
        self.notify_registered(assigned);

        tracing::trace!(provisional, assigned, "Rekeyed request");
        true
    }

    /// Resolve a reply: atomically remove the entry registered under `correlation_id`.
    ///
    /// `Ok` means the reply matched; the entry can no longer be swept.
    ///
    /// # Errors
    ///
    /// Hands the reply back unchanged if no entry is registered under
    /// `correlation_id`.
    pub fn resolve(&self, correlation_id: &str, reply: Message) -> Result<ReplyHolder, Message> {
        let Some((_, entry)) = self.entries.remove(correlation_id) else {
            return Err(reply);
        };
        CorrelationMetrics::record_pending(self.entries.len());
        Ok(entry.into_holder(Some(reply), false))
    }

    /// Remove the entry registered under `correlation_id` without a reply.
    pub fn remove(&self, correlation_id: &str) -> Option<ReplyHolder> {
        let (_, entry) = self.entries.remove(correlation_id)?;
        CorrelationMetrics::record_pending(self.entries.len());
        Some(entry.into_holder(None, false))
    }

    /// Remove and return every entry whose deadline is at or before `now`.
    pub fn sweep(&self, now: Instant) -> Vec<ReplyHolder> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let holders: Vec<ReplyHolder> = expired
            .into_iter()
            .filter_map(|id| self.entries.remove_if(&id, |_, entry| entry.deadline <= now))
            .map(|(_, entry)| entry.into_holder(None, true))
            .collect();

        if !holders.is_empty() {
            CorrelationMetrics::record_pending(self.entries.len());
            tracing::debug!(count = holders.len(), "Swept timed out requests");
        }
        holders
    }

    /// Remove and return every entry, regardless of deadline.
    pub fn drain(&self) -> Vec<ReplyHolder> {
        let ids: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        let holders: Vec<ReplyHolder> = ids
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .map(|(_, entry)| entry.into_holder(None, false))
            .collect();
        CorrelationMetrics::record_pending(self.entries.len());
        holders
    }

    /// Wait until `correlation_id` is registered, for at most `max_wait`.
    ///
    /// Returns whether it is registered when the wait ends.
    pub async fn wait_for_registration(&self, correlation_id: &str, max_wait: Duration) -> bool {
        let notify = Arc::clone(
            self.waiters
                .entry(correlation_id.to_string())
                .or_insert_with(|| Arc::new(Notify::new()))
                .value(),
        );
        let deadline = tokio::time::Instant::now() + max_wait;

        let registered = loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.entries.contains_key(correlation_id) {
                break true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break self.entries.contains_key(correlation_id);
            }
        };

        drop(notify);
        self.waiters
            .remove_if(correlation_id, |_, waiter| Arc::strong_count(waiter) == 1);
        registered
    }

    /// Whether an entry is registered under `correlation_id`.
    #[must_use]
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries.contains_key(correlation_id)
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no request is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn notify_registered(&self, correlation_id: &str) {
        if let Some(waiter) = self.waiters.get(correlation_id) {
            waiter.notify_waiters();
        }
    }
}
