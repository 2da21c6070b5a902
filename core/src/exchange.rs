//! The unit of work carried through a pipeline.
//!
//! An [`Exchange`] has no behavior of its own beyond state. It is moved, never
//! shared: each step receives it by value and hands it back, and while a
//! request is outstanding it is parked inside the reply coordinator's registry.
//!
//! # Example
//!
//! ```
//! use courier_core::exchange::{Exchange, Message};
//!
//! let mut exchange = Exchange::new(Message::new("Hello Camel")).with_transacted(true);
//! exchange.set_property("route", "inbox");
//! exchange.outbound_mut().set_body("Bye Camel");
//!
//! assert!(exchange.is_transacted());
//! assert_eq!(exchange.outbound().map(|m| m.body().clone()), Some("Bye Camel".into()));
//! ```

use crate::error::ExchangeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Header carrying the correlation id of a request or reply.
pub const CORRELATION_ID_HEADER: &str = "CorrelationId";

/// Header marking a reply as a remote fault; its value is the fault description.
pub const FAULT_HEADER: &str = "Fault";

/// A message: string headers plus an opaque JSON body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    headers: BTreeMap<String, String>,
    body: Value,
}

impl Message {
    /// Create a message with the given body and no headers.
    #[must_use]
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Builder-style header setter.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// The message body.
    #[must_use]
    pub const fn body(&self) -> &Value {
        &self.body
    }

    /// Replace the message body.
    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.body = body.into();
    }

    /// Look up a header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Set a header, replacing any previous value.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    /// Remove a header, returning its value.
    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.remove(name)
    }

    /// All headers.
    #[must_use]
    pub const fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// The correlation id header, if present and non-empty.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.header(CORRELATION_ID_HEADER).filter(|id| !id.is_empty())
    }
}

/// Per-delivery bookkeeping owned by the error handler.
///
/// `attempts` only grows during one logical delivery; it is reset by
/// [`Exchange::begin_delivery`], never by a redelivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeliveryState {
    attempts: u32,
    last_failure: Option<ExchangeError>,
    handled: bool,
    continued: bool,
    rollback_only: bool,
}

impl RedeliveryState {
    /// Number of redeliveries performed so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Failure captured by the most recent failed attempt.
    #[must_use]
    pub const fn last_failure(&self) -> Option<&ExchangeError> {
        self.last_failure.as_ref()
    }

    /// Whether a failure was converted to a normal outcome by policy.
    #[must_use]
    pub const fn is_handled(&self) -> bool {
        self.handled
    }

    /// Whether a failure was ignored by policy and routing continued.
    #[must_use]
    pub const fn is_continued(&self) -> bool {
        self.continued
    }

    /// Whether a rollback was requested.
    #[must_use]
    pub const fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Count one more redelivery and remember the failure that caused it.
    pub fn record_attempt(&mut self, failure: ExchangeError) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_failure = Some(failure);
    }

    /// Remember the failure of the final attempt without counting a redelivery.
    pub fn record_failure(&mut self, failure: ExchangeError) {
        self.last_failure = Some(failure);
    }

    /// Mark the failure as handled.
    pub const fn mark_handled(&mut self) {
        self.handled = true;
    }

    /// Mark the failure as continued.
    pub const fn mark_continued(&mut self) {
        self.continued = true;
    }

    /// Request rollback.
    pub const fn mark_rollback_only(&mut self) {
        self.rollback_only = true;
    }
}

/// The unit of work flowing through a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    id: String,
    inbound: Message,
    outbound: Option<Message>,
    failure: Option<ExchangeError>,
    transacted: bool,
    redelivery: RedeliveryState,
    properties: HashMap<String, Value>,
}

impl Exchange {
    /// Create an exchange for an inbound message with a fresh id.
    #[must_use]
    pub fn new(inbound: Message) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            inbound,
            outbound: None,
            failure: None,
            transacted: false,
            redelivery: RedeliveryState::default(),
            properties: HashMap::new(),
        }
    }

    /// Mark the exchange as transacted (or not).
    #[must_use]
    pub const fn with_transacted(mut self, transacted: bool) -> Self {
        self.transacted = transacted;
        self
    }

    /// Unique exchange id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The inbound message.
    #[must_use]
    pub const fn inbound(&self) -> &Message {
        &self.inbound
    }

    /// Mutable access to the inbound message.
    pub const fn inbound_mut(&mut self) -> &mut Message {
        &mut self.inbound
    }

    /// The outbound message, if any step produced one.
    #[must_use]
    pub const fn outbound(&self) -> Option<&Message> {
        self.outbound.as_ref()
    }

    /// Mutable access to the outbound message, creating an empty one on first use.
    pub fn outbound_mut(&mut self) -> &mut Message {
        self.outbound.get_or_insert_with(Message::default)
    }

    /// Replace the outbound message.
    pub fn set_outbound(&mut self, message: Message) {
        self.outbound = Some(message);
    }

    /// Take the outbound message, leaving none.
    pub const fn take_outbound(&mut self) -> Option<Message> {
        self.outbound.take()
    }

    /// The captured failure, if any.
    #[must_use]
    pub const fn failure(&self) -> Option<&ExchangeError> {
        self.failure.as_ref()
    }

    /// Capture a failure. Any previous failure is replaced.
    pub fn set_failure(&mut self, failure: ExchangeError) {
        self.failure = Some(failure);
    }

    /// Take the captured failure, clearing the slot.
    pub const fn take_failure(&mut self) -> Option<ExchangeError> {
        self.failure.take()
    }

    /// Whether a failure is captured.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Whether the exchange runs inside a transaction.
    #[must_use]
    pub const fn is_transacted(&self) -> bool {
        self.transacted
    }

    /// Redelivery bookkeeping.
    #[must_use]
    pub const fn redelivery(&self) -> &RedeliveryState {
        &self.redelivery
    }

    /// Mutable redelivery bookkeeping.
    pub const fn redelivery_mut(&mut self) -> &mut RedeliveryState {
        &mut self.redelivery
    }

    /// Request that the exchange is rolled back instead of redelivered.
    pub const fn mark_rollback_only(&mut self) {
        self.redelivery.mark_rollback_only();
    }

    /// Whether rollback was requested.
    #[must_use]
    pub const fn is_rollback_only(&self) -> bool {
        self.redelivery.is_rollback_only()
    }

    /// Start a new logical delivery: clears redelivery bookkeeping.
    pub fn begin_delivery(&mut self) {
        self.redelivery = RedeliveryState::default();
    }

    /// Look up a property.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Set a property.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Remove a property.
    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    /// Classify the terminal state of the exchange.
    #[must_use]
    pub fn outcome(self) -> Outcome {
        if self.is_rollback_only() || self.failure.as_ref().is_some_and(ExchangeError::is_rollback) {
            Outcome::RolledBack(self)
        } else if self.failure.is_some() {
            Outcome::Failed(self)
        } else {
            Outcome::Completed(self)
        }
    }
}

/// Terminal state of an exchange after its pipeline finished.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Delivered; any failure on the way was handled.
    Completed(Exchange),
    /// A failure escaped the pipeline (unguarded, or redelivery exhausted).
    Failed(Exchange),
    /// Rollback was requested; not an ordinary failure.
    RolledBack(Exchange),
}

impl Outcome {
    /// The exchange, whatever the outcome.
    #[must_use]
    pub fn into_exchange(self) -> Exchange {
        match self {
            Self::Completed(exchange) | Self::Failed(exchange) | Self::RolledBack(exchange) => {
                exchange
            }
        }
    }

    /// Borrow the exchange.
    #[must_use]
    pub const fn exchange(&self) -> &Exchange {
        match self {
            Self::Completed(exchange) | Self::Failed(exchange) | Self::RolledBack(exchange) => {
                exchange
            }
        }
    }

    /// Whether the exchange completed.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Whether the exchange failed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Whether the exchange was rolled back.
    #[must_use]
    pub const fn is_rolled_back(&self) -> bool {
        matches!(self, Self::RolledBack(_))
    }
}
