//! Thread affinity for transacted exchanges.
//!
//! A transaction is bound to the thread that began it, so a transacted exchange
//! must run its guarded region, every redelivery, and every delay on one OS
//! thread. [`run_pinned`] moves a future onto a dedicated blocking-pool thread
//! and polls it there to completion; wakeups from other threads (a reply
//! listener, the timer driver) only unpark that thread.
//!
//! Pinning nests: code already running on a pinned thread just awaits inline.
//!
//! Non-transacted exchanges use ordinary tasks and may resume on any worker
//! thread after a suspension point.

use courier_core::ExchangeError;
use std::cell::Cell;
use std::future::Future;

thread_local! {
    static PINNED: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is driving a pinned future.
#[must_use]
pub fn is_pinned() -> bool {
    PINNED.with(Cell::get)
}

struct PinnedGuard;

impl PinnedGuard {
    fn enter() -> Self {
        PINNED.with(|pinned| pinned.set(true));
        Self
    }
}

impl Drop for PinnedGuard {
    fn drop(&mut self) {
        PINNED.with(|pinned| pinned.set(false));
    }
}

/// Run `future` to completion on a single OS thread.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns [`ExchangeError::Step`] with kind `"panic"` if the future panicked.
pub async fn run_pinned<F>(future: F) -> Result<F::Output, ExchangeError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    if is_pinned() {
        return Ok(future.await);
    }

    let handle = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || {
        let _guard = PinnedGuard::enter();
        handle.block_on(future)
    })
    .await
    .map_err(|join_error| {
        tracing::error!(error = %join_error, "Pinned execution panicked");
        ExchangeError::step("panic", join_error.to_string())
    })
}
