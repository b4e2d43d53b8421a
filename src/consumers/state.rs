/// The lifecycle of a [`Subscription`](crate::consumers::Subscription).
///
/// ```text
/// Idle | Stopped  -> Starting -> Consuming        (or back to Idle | Stopped on failure)
/// Consuming       -> Failed -> Resubscribing -> Consuming
/// any             -> Stopping -> Stopped
/// any             -> Disposed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// Created, never started.
    Idle,
    /// Acquiring a channel and registering the consumer.
    Starting,
    /// Messages are flowing.
    Consuming,
    /// The channel was found dead.
    Failed,
    /// Waiting for the next attempt to register the consumer on a fresh channel.
    Resubscribing,
    /// Draining in-flight handlers.
    Stopping,
    /// No consumer registered; can be started again.
    Stopped,
    Disposed,
}

impl SubscriptionState {
    /// `true` for the states in which no consumer is registered and no background
    /// activity is running.
    pub fn is_at_rest(&self) -> bool {
        matches!(
            self,
            SubscriptionState::Idle | SubscriptionState::Stopped | SubscriptionState::Disposed
        )
    }
}

/// A state change, as broadcast by [`Subscription::transitions`].
///
/// [`Subscription::transitions`]: crate::consumers::Subscription::transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SubscriptionState,
    pub to: SubscriptionState,
}
