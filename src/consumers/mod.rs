//! Facilities to consume messages from a RabbitMq queue. Check out [`SubscriptionFactory`] as a
//! starting point.
pub use envelope::MessageEnvelope;
pub use factory::SubscriptionFactory;
pub use handler::{ConsumeHandler, FailureHandler, IgnoreFailures};
pub use settings::{
    SubscriptionSettings, DEFAULT_CHECK_CHANNEL_PERIOD, DEFAULT_PREFETCH_BOUND,
    DEFAULT_RESUBSCRIBE_DELAY,
};
pub use state::{SubscriptionState, Transition};
pub use subscription::Subscription;

mod envelope;
mod factory;
mod handler;
mod settings;
mod state;
mod subscription;
