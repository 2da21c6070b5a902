//! Async continuation: how a suspended step is resumed.
//!
//! A step that cannot finish on the current call stack (it is waiting for a
//! reply, or for a redelivery delay) splits a [`continuation()`] pair. It hands
//! the [`Continuation`] (together with the exchange) to whoever will produce
//! the result, and awaits the [`Suspension`].
//!
//! The continuation is consumed when fired, so it can complete at most once.
//! If it is dropped without firing, the suspension resolves with
//! [`ExchangeError::Superseded`] instead of hanging forever.
//!
//! The thread that fires the continuation is whichever thread produced the
//! resolution (a listener, the sweeper, a timer). Callers must not assume the
//! suspended step resumes on the thread that suspended it unless the exchange
//! is pinned by a transaction.
//!
//! ```
//! use courier_core::continuation::continuation;
//! use courier_core::exchange::{Exchange, Message};
//!
//! # tokio_test::block_on(async {
//! let (continuation, suspension) = continuation();
//! std::thread::spawn(move || {
//!     continuation.done(Exchange::new(Message::new("reply")));
//! });
//!
//! let resumed = suspension.await.unwrap();
//! assert!(!resumed.completed_synchronously);
//! # });
//! ```

use crate::error::ExchangeError;
use crate::exchange::Exchange;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Result delivered through a continuation.
#[derive(Debug)]
pub struct Resumed {
    /// The exchange, handed back to the suspended step
    pub exchange: Exchange,
    /// Whether the work finished on the caller's stack without suspending
    pub completed_synchronously: bool,
}

/// Completion half: fire exactly once to resume the suspended step.
#[derive(Debug)]
pub struct Continuation {
    sender: oneshot::Sender<Resumed>,
}

impl Continuation {
    /// Signal asynchronous completion.
    ///
    /// Returns `false` if the suspended side is gone (the step was cancelled);
    /// the exchange is dropped in that case.
    pub fn done(self, exchange: Exchange) -> bool {
        self.complete(exchange, false)
    }

    /// Signal completion on the same call stack that received the continuation.
    pub fn done_sync(self, exchange: Exchange) -> bool {
        self.complete(exchange, true)
    }

    /// Whether the suspended side stopped waiting.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.sender.is_closed()
    }

    fn complete(self, exchange: Exchange, completed_synchronously: bool) -> bool {
        self.sender
            .send(Resumed {
                exchange,
                completed_synchronously,
            })
            .is_ok()
    }
}

/// Awaiting half of a continuation.
#[derive(Debug)]
pub struct Suspension {
    receiver: oneshot::Receiver<Resumed>,
}

impl Future for Suspension {
    type Output = Result<Resumed, ExchangeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| ExchangeError::Superseded))
    }
}

/// Create a linked continuation/suspension pair.
#[must_use]
pub fn continuation() -> (Continuation, Suspension) {
    let (sender, receiver) = oneshot::channel();
    (Continuation { sender }, Suspension { receiver })
}
