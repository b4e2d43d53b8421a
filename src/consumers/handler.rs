//! The callbacks a [`Subscription`] drives.
//!
//! [`Subscription`]: crate::consumers::Subscription
use std::future::Future;

use crate::consumers::MessageEnvelope;
use crate::Error;

/// Implementers of `ConsumeHandler` process the messages delivered to a [`Subscription`].
///
/// # Scope
///
/// The handler owns the settlement of the message: it must call [`MessageEnvelope::ack`]
/// or [`MessageEnvelope::nack`] once it is done with it. Until then the message counts
/// against the prefetch bound of the subscription.
///
/// Every invocation runs as its own task: handlers for different messages run concurrently
/// and may complete in any order.
///
/// # Implementers
///
/// `ConsumeHandler` is implemented for all async functions and closures with a matching
/// signature - `Fn(MessageEnvelope) -> impl Future<Output = ()>`.
///
/// [`Subscription`]: crate::consumers::Subscription
#[async_trait::async_trait]
pub trait ConsumeHandler: Send + Sync + 'static {
    async fn on_consumed(&self, envelope: MessageEnvelope);
}

#[async_trait::async_trait]
impl<F, Fut> ConsumeHandler for F
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_consumed(&self, envelope: MessageEnvelope) {
        (self)(envelope).await
    }
}

/// Implementers of `FailureHandler` are notified every time a [`Subscription`] loses its
/// channel and every time an attempt to resubscribe fails.
///
/// The subscription recovers on its own: the handler is an observation point (logging,
/// alerting, metrics), it is not expected to take corrective action.
///
/// [`Subscription`]: crate::consumers::Subscription
#[async_trait::async_trait]
pub trait FailureHandler: Send + Sync + 'static {
    async fn on_failure(&self, error: Error);
}

#[async_trait::async_trait]
impl<F, Fut> FailureHandler for F
where
    F: Fn(Error) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_failure(&self, error: Error) {
        (self)(error).await
    }
}

/// A failure handler that does nothing beyond the logging the subscription already does.
pub struct IgnoreFailures;

#[async_trait::async_trait]
impl FailureHandler for IgnoreFailures {
    async fn on_failure(&self, _error: Error) {}
}
