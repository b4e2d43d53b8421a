//! Provides the connection service: a single connection to the broker with a bounded pool
//! of channels, built on [`deadpool`].
//!
//! This module provides three key guarantees:
//! - No more than `max_channels` channels are open at the same time.
//! - Channels are created one at a time, and only over a healthy connection.
//! - Broken channels are never handed out again.

mod channel;
mod connection;
mod error;

pub(crate) use channel::ChannelHandle;
pub use channel::PooledChannel;
pub use connection::ConnectionService;
