//! The connection service: one connection, a bounded set of channels.
use deadpool::managed::{Object, Timeouts};
use std::time::Duration;
use tracing::warn;

use super::channel::{ChannelManager, ChannelPool, PooledChannel};
use super::error::classify;
use crate::amqp::configuration::ConnectionSettings;
use crate::amqp::ConnectionFactory;
use crate::transport::{BrokerChannel, Connector};
use crate::Error;

/// `ConnectionService` owns one long-lived connection to the broker and hands out at most
/// `max_channels` channels multiplexed over it.
///
/// The connection is established lazily, on the first channel request, and it is never
/// re-established in the background: a broken connection is replaced only when somebody
/// asks for a new channel (or calls [`ConnectionService::ensure_connected`]).
///
/// ```rust,no_run
/// use resilient_consumer::amqp::configuration::ConnectionSettings;
/// use resilient_consumer::pool::ConnectionService;
///
/// async fn example() -> Result<(), resilient_consumer::Error> {
///     let connection_service = ConnectionService::from_settings(&ConnectionSettings::default())?;
///     let channel = connection_service.acquire_channel().await?;
///     // [...]
///     connection_service.release_channel(&channel).await;
///     connection_service.dispose().await;
///     Ok(())
/// }
/// ```
pub struct ConnectionService<C: Connector> {
    pool: ChannelPool<C>,
    max_channels: usize,
    send_timeout: Duration,
}

impl ConnectionService<ConnectionFactory> {
    /// Build a connection service talking to RabbitMq via `lapin`.
    pub fn from_settings(settings: &ConnectionSettings) -> Result<Self, Error> {
        let factory = ConnectionFactory::new_from_config(settings)
            .map_err(|e| Error::Configuration(format!("{e:#}")))?;
        Self::new(factory, settings)
    }
}

impl<C: Connector> ConnectionService<C> {
    /// No I/O happens here - the connection is established on first use.
    pub fn new(connector: C, settings: &ConnectionSettings) -> Result<Self, Error> {
        settings.validate()?;
        let pool = ChannelPool::builder(ChannelManager::new(connector))
            .max_size(settings.max_channels)
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build channel pool: {e}")))?;
        Ok(Self {
            pool,
            max_channels: settings.max_channels,
            send_timeout: settings.send_timeout(),
        })
    }

    /// Establish the connection if there is none (or the current one is broken).
    ///
    /// It is a no-op if we are already connected.
    #[tracing::instrument(name = "ensure_connected", skip(self))]
    pub async fn ensure_connected(&self) -> Result<(), Error> {
        self.pool.manager().ensure_connected().await
    }

    /// Open a new channel, counted against `max_channels`.
    ///
    /// It fails immediately with [`Error::CapacityExceeded`] if all slots are taken - callers
    /// are never queued waiting for a channel to be released.
    #[tracing::instrument(name = "acquire_channel", skip(self))]
    pub async fn acquire_channel(&self) -> Result<PooledChannel<C>, Error> {
        let timeouts = Timeouts {
            wait: Some(Duration::ZERO),
            ..Timeouts::default()
        };
        let object = self
            .pool
            .timeout_get(&timeouts)
            .await
            .map_err(|e| classify(e, self.max_channels))?;
        Ok(PooledChannel::new(object, self.send_timeout))
    }

    /// Close `channel`, if still open, and free its slot.
    ///
    /// Releasing a channel twice is a no-op.
    pub async fn release_channel(&self, channel: &PooledChannel<C>) {
        if !channel.mark_released() {
            return;
        }
        if channel.raw().is_open() {
            if let Err(e) = channel.raw().close().await {
                warn!("Failed to close a released channel: {:?}", e);
            }
        }
        if let Some(object) = channel.take_slot() {
            let _ = Object::take(object);
        }
    }

    /// Whether the connection is up, as last reported by the connection itself.
    pub fn is_connected(&self) -> bool {
        self.pool.manager().is_connected()
    }

    /// Number of channels currently handed out.
    pub fn open_channels(&self) -> usize {
        let status = self.pool.status();
        status.size.saturating_sub(status.available.max(0) as usize)
    }

    pub fn max_channels(&self) -> usize {
        self.max_channels
    }

    /// Close the connection together with all its channels.
    ///
    /// Channel requests fail with [`Error::Connection`] afterwards.
    #[tracing::instrument(name = "dispose_connection_service", skip(self))]
    pub async fn dispose(&self) {
        self.pool.close();
        self.pool.manager().dispose().await;
    }
}
