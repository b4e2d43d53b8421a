//! `resilient-consumer` consumes messages from a RabbitMq queue, built on top of [`lapin`],
//! and keeps doing so when channels and connections break.
//!
//! [`ConnectionService`](crate::pool::ConnectionService) owns the connection to the broker,
//! [`SubscriptionFactory`](crate::consumers::SubscriptionFactory) creates
//! [`Subscription`](crate::consumers::Subscription)s on top of it: they are the best
//! starting points to learn more about what `resilient-consumer` provides.

pub mod amqp;
pub mod consumers;
pub mod pool;
pub mod transport;

mod error;

pub use error::Error;
