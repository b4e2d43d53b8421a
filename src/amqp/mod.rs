//! Helpers for connecting to a rabbitmq broker

mod channel;
pub mod configuration;
pub mod convenience;
mod factory;
pub use factory::ConnectionFactory;
pub use lapin::{Channel, Connection};

pub use lapin::{types, BasicProperties};
