//! Pipeline steps.
//!
//! A [`Step`] takes ownership of an exchange and eventually hands it back.
//! Failures are not returned as `Err`; they are captured in the exchange's
//! failure slot so the error handler can classify them and the exchange can
//! keep flowing to whoever decides its fate.
//!
//! # Dyn Compatibility
//!
//! This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
//! so pipelines can hold heterogeneous steps as `Arc<dyn Step>`.

use crate::error::ExchangeError;
use crate::exchange::Exchange;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by [`Step::process`].
pub type StepFuture<'a> = Pin<Box<dyn Future<Output = Exchange> + Send + 'a>>;

/// A processing step in a pipeline.
pub trait Step: Send + Sync {
    /// Process the exchange and hand it back.
    ///
    /// A step signals failure by capturing an [`ExchangeError`] on the exchange
    /// (see [`Exchange::set_failure`]) and requests rollback with
    /// [`Exchange::mark_rollback_only`].
    fn process(&self, exchange: Exchange) -> StepFuture<'_>;

    /// Short name used in logs.
    fn name(&self) -> &str {
        "step"
    }
}

impl<S: Step + ?Sized> Step for Arc<S> {
    fn process(&self, exchange: Exchange) -> StepFuture<'_> {
        (**self).process(exchange)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Step built from a synchronous closure.
///
/// `Err` returned by the closure is captured on the exchange.
pub struct FnStep<F> {
    name: String,
    f: F,
}

impl<F> Step for FnStep<F>
where
    F: Fn(&mut Exchange) -> Result<(), ExchangeError> + Send + Sync,
{
    fn process(&self, mut exchange: Exchange) -> StepFuture<'_> {
        if let Err(failure) = (self.f)(&mut exchange) {
            exchange.set_failure(failure);
        }
        Box::pin(std::future::ready(exchange))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Step built from an asynchronous closure that owns the exchange.
pub struct AsyncFnStep<F> {
    name: String,
    f: F,
}

impl<F, Fut> Step for AsyncFnStep<F>
where
    F: Fn(Exchange) -> Fut + Send + Sync,
    Fut: Future<Output = Exchange> + Send + 'static,
{
    fn process(&self, exchange: Exchange) -> StepFuture<'_> {
        Box::pin((self.f)(exchange))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wrap a synchronous closure as a step.
///
/// ```
/// use courier_core::error::ExchangeError;
/// use courier_core::step::step_fn;
///
/// let fail = step_fn("throw", |_exchange| Err(ExchangeError::step("illegal_argument", "Damn")));
/// ```
pub fn step_fn<F>(name: impl Into<String>, f: F) -> FnStep<F>
where
    F: Fn(&mut Exchange) -> Result<(), ExchangeError> + Send + Sync,
{
    FnStep {
        name: name.into(),
        f,
    }
}

/// Wrap an asynchronous closure as a step.
pub fn async_step_fn<F, Fut>(name: impl Into<String>, f: F) -> AsyncFnStep<F>
where
    F: Fn(Exchange) -> Fut + Send + Sync,
    Fut: Future<Output = Exchange> + Send + 'static,
{
    AsyncFnStep {
        name: name.into(),
        f,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Message;

    #[tokio::test]
    async fn test_fn_step_captures_error() {
        let step = step_fn("fail", |_| Err(ExchangeError::step("io", "boom")));
        let exchange = step.process(Exchange::new(Message::new("x"))).await;

        assert_eq!(exchange.failure().and_then(ExchangeError::kind), Some("io"));
        assert_eq!(step.name(), "fail");
    }

    #[tokio::test]
    async fn test_async_fn_step_hands_back_exchange() {
        let step = async_step_fn("upper", |mut exchange: Exchange| async move {
            let body = exchange.inbound().body().as_str().unwrap_or_default().to_uppercase();
            exchange.outbound_mut().set_body(body);
            exchange
        });

        let exchange = step.process(Exchange::new(Message::new("bye"))).await;
        assert_eq!(exchange.outbound().map(|m| m.body().clone()), Some("BYE".into()));
    }

    #[tokio::test]
    async fn test_arc_step_delegates() {
        let step: Arc<dyn Step> = Arc::new(step_fn("noop", |_| Ok(())));
        let exchange = step.process(Exchange::new(Message::new("x"))).await;

        assert!(!exchange.is_failed());
        assert_eq!(Step::name(&step), "noop");
    }
}
