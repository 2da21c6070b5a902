//! Contracts with the transport collaborator.
//!
//! The core never speaks a wire protocol. It consumes a transport only through
//! three narrow operations: send an outbound request, deliver inbound replies
//! to a listener, and resolve the address replies should be sent to.
//!
//! # Correlation ids
//!
//! The caller always proposes a locally generated *provisional* correlation
//! id. A transport that assigns its own ids (for example a broker message id)
//! returns `Some(assigned)` from [`Transport::send_outbound`]; replies will then
//! carry the assigned id, and the reply coordinator switches its registration
//! over. Because the switch happens after the send returns, a fast reply can
//! arrive before it; the coordinator tolerates that race.
//!
//! # Implementations
//!
//! - `LoopbackTransport` in `courier-testing` - in-memory, for tests

use crate::error::ExchangeError;
use crate::exchange::{Exchange, Message};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Receiver of inbound replies, implemented by the reply coordinator.
pub trait InboundListener: Send + Sync {
    /// Handle one inbound message.
    ///
    /// Implementations must not fail: malformed or foreign messages are
    /// dropped and logged.
    fn on_message(&self, message: Message) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// A pluggable transport.
pub trait Transport: Send + Sync {
    /// Send the exchange's request to the remote side.
    ///
    /// # Arguments
    ///
    /// - `exchange`: the exchange whose inbound message is the request payload
    /// - `reply_to`: address the remote side should reply to
    /// - `correlation_id`: the provisional correlation id chosen by the caller
    ///
    /// # Returns
    ///
    /// `Some(id)` if the transport assigned its own correlation id.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::Transport`] if the request could not be sent.
    fn send_outbound<'a>(
        &'a self,
        exchange: &'a Exchange,
        reply_to: &'a str,
        correlation_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, ExchangeError>> + Send + 'a>>;

    /// Register the listener that receives every inbound reply.
    fn register_inbound_listener(&self, listener: Arc<dyn InboundListener>);

    /// Resolve the reply-to address. May complete long after it is called.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::Transport`] if resolution failed.
    fn resolve_reply_address(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<String, ExchangeError>> + Send + '_>>;
}
