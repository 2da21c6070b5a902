//! An in-memory transport that replies to its own requests.
//!
//! Every accepted request is recorded and, unless the transport is silent,
//! answered from a separate task after a configurable latency. The reply is
//! built by a responder function (by default `"Bye <request body>"`) and
//! carries the correlation id the transport used: the caller's provisional id,
//! or a transport-assigned `loopback-N` id when id assignment is enabled.
//!
//! With assigned ids and zero latency the reply usually reaches the listener
//! before the caller has switched its registration to the assigned id, which
//! is exactly the early-reply race a coordinator must tolerate.

use courier_core::{
    CORRELATION_ID_HEADER, Exchange, ExchangeError, InboundListener, Message, Transport,
};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

type Responder = Arc<dyn Fn(&Message) -> Message + Send + Sync>;

/// A request accepted by [`LoopbackTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentRequest {
    /// Provisional id proposed by the caller
    pub provisional_id: String,
    /// Id the reply carries (assigned or provisional)
    pub correlation_id: String,
    /// Reply-to address passed by the caller
    pub reply_to: String,
    /// Request body
    pub body: Value,
}

/// In-memory [`Transport`] for tests.
pub struct LoopbackTransport {
    listener: Mutex<Option<Arc<dyn InboundListener>>>,
    sent: Mutex<Vec<SentRequest>>,
    sequence: AtomicU64,
    reply_latency: Duration,
    assign_ids: bool,
    silent: bool,
    send_failure: Option<String>,
    reply_address: String,
    reply_address_delay: Duration,
    reply_address_failure: Option<String>,
    responder: Responder,
}

impl LoopbackTransport {
    /// Transport replying immediately with `"Bye <body>"`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listener: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
            reply_latency: Duration::ZERO,
            assign_ids: false,
            silent: false,
            send_failure: None,
            reply_address: "loopback:replies".to_string(),
            reply_address_delay: Duration::ZERO,
            reply_address_failure: None,
            responder: Arc::new(default_reply),
        }
    }

    /// Delay each reply by `latency`.
    #[must_use]
    pub const fn with_reply_latency(mut self, latency: Duration) -> Self {
        self.reply_latency = latency;
        self
    }

    /// Substitute transport-assigned correlation ids for the caller's.
    #[must_use]
    pub const fn with_assigned_ids(mut self, assign_ids: bool) -> Self {
        self.assign_ids = assign_ids;
        self
    }

    /// Accept requests but never reply.
    #[must_use]
    pub const fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Reject every send with `ExchangeError::Transport(reason)`.
    #[must_use]
    pub fn failing_sends(mut self, reason: impl Into<String>) -> Self {
        self.send_failure = Some(reason.into());
        self
    }

    /// Resolve the reply address to `address`.
    #[must_use]
    pub fn with_reply_address(mut self, address: impl Into<String>) -> Self {
        self.reply_address = address.into();
        self
    }

    /// Take `delay` to resolve the reply address.
    #[must_use]
    pub const fn with_reply_address_delay(mut self, delay: Duration) -> Self {
        self.reply_address_delay = delay;
        self
    }

    /// Fail reply address resolution with `reason`.
    #[must_use]
    pub fn failing_reply_address(mut self, reason: impl Into<String>) -> Self {
        self.reply_address_failure = Some(reason.into());
        self
    }

    /// Build replies with `responder` instead of `"Bye <body>"`.
    ///
    /// The correlation id header is set on the result afterwards.
    #[must_use]
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&Message) -> Message + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }

    /// Requests accepted so far.
    #[must_use]
    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of requests accepted so far.
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether a listener has been registered.
    #[must_use]
    pub fn has_listener(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Push a raw inbound message to the registered listener, as if it had
    /// arrived from the remote side. Returns `false` if no listener is set.
    pub async fn deliver(&self, message: Message) -> bool {
        let listener = self.current_listener();
        match listener {
            Some(listener) => {
                listener.on_message(message).await;
                true
            }
            None => false,
        }
    }

    fn current_listener(&self) -> Option<Arc<dyn InboundListener>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("reply_latency", &self.reply_latency)
            .field("assign_ids", &self.assign_ids)
            .field("silent", &self.silent)
            .field("sent", &self.sent_count())
            .finish_non_exhaustive()
    }
}

impl Transport for LoopbackTransport {
    fn send_outbound<'a>(
        &'a self,
        exchange: &'a Exchange,
        reply_to: &'a str,
        correlation_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, ExchangeError>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(reason) = &self.send_failure {
                return Err(ExchangeError::Transport(reason.clone()));
            }

            let assigned = self.assign_ids.then(|| {
                format!("loopback-{}", self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
            });
            let reply_id = assigned.clone().unwrap_or_else(|| correlation_id.to_string());

            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(SentRequest {
                    provisional_id: correlation_id.to_string(),
                    correlation_id: reply_id.clone(),
                    reply_to: reply_to.to_string(),
                    body: exchange.inbound().body().clone(),
                });

            if !self.silent {
                match self.current_listener() {
                    Some(listener) => {
                        let mut reply = (self.responder)(exchange.inbound());
                        reply.set_header(CORRELATION_ID_HEADER, reply_id);
                        let latency = self.reply_latency;
                        tokio::spawn(async move {
                            if !latency.is_zero() {
                                tokio::time::sleep(latency).await;
                            }
                            listener.on_message(reply).await;
                        });
                    }
                    None => tracing::warn!("Loopback request sent with no listener registered"),
                }
            }

            Ok(assigned)
        })
    }

    fn register_inbound_listener(&self, listener: Arc<dyn InboundListener>) {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    fn resolve_reply_address(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<String, ExchangeError>> + Send + '_>> {
        Box::pin(async move {
            if !self.reply_address_delay.is_zero() {
                tokio::time::sleep(self.reply_address_delay).await;
            }
            match &self.reply_address_failure {
                Some(reason) => Err(ExchangeError::Transport(reason.clone())),
                None => Ok(self.reply_address.clone()),
            }
        })
    }
}

fn default_reply(request: &Message) -> Message {
    let body = match request.body() {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    Message::new(format!("Bye {body}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collecting(Mutex<Vec<Message>>);

    impl InboundListener for Collecting {
        fn on_message(&self, message: Message) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            self.0.lock().unwrap().push(message);
            Box::pin(std::future::ready(()))
        }
    }

    #[tokio::test]
    async fn test_reply_carries_assigned_id() {
        let transport = LoopbackTransport::new().with_assigned_ids(true);
        let listener = Arc::new(Collecting(Mutex::new(Vec::new())));
        transport.register_inbound_listener(listener.clone());

        let exchange = Exchange::new(Message::new("Hello"));
        let assigned = transport
            .send_outbound(&exchange, "loopback:replies", "provisional")
            .await
            .unwrap();
        assert_eq!(assigned.as_deref(), Some("loopback-1"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let replies = listener.0.lock().unwrap().clone();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].correlation_id(), Some("loopback-1"));
        assert_eq!(replies[0].body(), "Bye Hello");
        assert_eq!(transport.sent()[0].provisional_id, "provisional");
    }

    #[tokio::test]
    async fn test_failing_sends_record_nothing() {
        let transport = LoopbackTransport::new().failing_sends("down");
        let exchange = Exchange::new(Message::new("Hello"));

        let error = transport
            .send_outbound(&exchange, "loopback:replies", "c-1")
            .await
            .unwrap_err();
        assert_eq!(error, ExchangeError::Transport("down".to_string()));
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_reply_address_resolution() {
        let transport = LoopbackTransport::new().with_reply_address("queue:replies");
        assert_eq!(transport.resolve_reply_address().await.unwrap(), "queue:replies");

        let failing = LoopbackTransport::new().failing_reply_address("no such queue");
        assert!(failing.resolve_reply_address().await.is_err());
    }
}
