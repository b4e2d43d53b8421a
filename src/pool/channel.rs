//! Implements [`Manager`] for broker channels.
use deadpool::managed::{self, Manager, Object};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::warn;

use crate::transport::{BrokerChannel, BrokerConnection, Connector};
use crate::Error;

/// `ChannelPool` bounds the number of channels open over the connection.
pub(crate) type ChannelPool<C> = managed::Pool<ChannelManager<C>>;

/// `ChannelManager` implements [`Manager`] to hand out channels multiplexed over a single,
/// lazily established connection.
///
/// Channel creation holds the connection lock: two channels are never created concurrently
/// and a channel is never created over an absent or broken connection.
pub(crate) struct ChannelManager<C: Connector> {
    connector: C,
    connection: tokio::sync::Mutex<Option<C::Connection>>,
    /// Health flag of the current connection, flipped by its failure callback.
    health: RwLock<Arc<AtomicBool>>,
    disposed: AtomicBool,
}

impl<C: Connector> ChannelManager<C> {
    pub(crate) fn new(connector: C) -> Self {
        Self {
            connector,
            connection: tokio::sync::Mutex::new(None),
            health: RwLock::new(Arc::new(AtomicBool::new(false))),
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.health
            .read()
            .map(|health| health.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub(crate) async fn ensure_connected(&self) -> Result<(), Error> {
        let mut connection = self.connection.lock().await;
        self.connect_locked(&mut connection).await?;
        Ok(())
    }

    /// Returns the current connection, replacing it if it is absent or broken.
    async fn connect_locked<'a>(
        &self,
        slot: &'a mut Option<C::Connection>,
    ) -> Result<&'a C::Connection, Error> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Connection(anyhow::anyhow!(
                "The connection service has been disposed."
            )));
        }
        let healthy = slot
            .as_ref()
            .map(|connection| connection.is_connected() && self.is_connected())
            .unwrap_or(false);
        if !healthy {
            if slot.take().is_some() {
                tracing::info!("Replacing broken RabbitMq connection");
            }
            let connection = self.connector.connect().await.map_err(Error::Connection)?;
            let health = Arc::new(AtomicBool::new(true));
            connection.on_failure({
                let health = Arc::clone(&health);
                Box::new(move |e| {
                    warn!("RabbitMQ broken connection: {:?}", e);
                    health.store(false, Ordering::SeqCst);
                })
            });
            if let Ok(mut current) = self.health.write() {
                *current = health;
            }
            *slot = Some(connection);
        }
        slot.as_ref().ok_or_else(|| {
            Error::Connection(anyhow::anyhow!("No RabbitMq connection after connecting."))
        })
    }

    pub(crate) async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let connection = self.connection.lock().await.take();
        if let Ok(health) = self.health.read() {
            health.store(false, Ordering::SeqCst);
        }
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!("Failed to close the RabbitMq connection: {:?}", e);
            }
        }
    }
}

#[async_trait::async_trait]
impl<C: Connector> Manager for ChannelManager<C> {
    type Type = C::Channel;
    type Error = Error;

    async fn create(&self) -> Result<C::Channel, Error> {
        let mut slot = self.connection.lock().await;
        let connection = self.connect_locked(&mut slot).await?;
        connection.create_channel().await.map_err(Error::Connection)
    }

    async fn recycle(&self, obj: &mut C::Channel) -> managed::RecycleResult<Error> {
        if obj.is_open() && self.is_connected() {
            Ok(())
        } else {
            Err(managed::RecycleError::StaticMessage(
                "Channel is not in an healthy state",
            ))
        }
    }
}

/// A channel handed out by [`ConnectionService::acquire_channel`].
///
/// Give it back with [`ConnectionService::release_channel`]. A `PooledChannel` dropped
/// without being released goes back to the pool and is reused only if still healthy.
///
/// [`ConnectionService::acquire_channel`]: super::ConnectionService::acquire_channel
/// [`ConnectionService::release_channel`]: super::ConnectionService::release_channel
pub struct PooledChannel<C: Connector> {
    handle: ChannelHandle<C::Channel>,
    slot: Mutex<Option<Object<ChannelManager<C>>>>,
}

impl<C: Connector> PooledChannel<C> {
    pub(crate) fn new(object: Object<ChannelManager<C>>, send_timeout: Duration) -> Self {
        Self {
            handle: ChannelHandle {
                channel: (*object).clone(),
                released: Arc::new(AtomicBool::new(false)),
                send_timeout,
            },
            slot: Mutex::new(Some(object)),
        }
    }

    /// The underlying broker channel.
    pub fn raw(&self) -> &C::Channel {
        &self.handle.channel
    }

    /// `false` once the channel has been released or closed.
    pub fn is_usable(&self) -> bool {
        self.handle.is_usable()
    }

    pub fn send_timeout(&self) -> Duration {
        self.handle.send_timeout
    }

    pub(crate) fn handle(&self) -> ChannelHandle<C::Channel> {
        self.handle.clone()
    }

    /// Returns `false` if the channel had already been released.
    pub(crate) fn mark_released(&self) -> bool {
        !self.handle.released.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn take_slot(&self) -> Option<Object<ChannelManager<C>>> {
        self.slot.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// A cheap, cloneable view on a pooled channel, used to settle deliveries.
#[derive(Clone)]
pub(crate) struct ChannelHandle<Ch> {
    channel: Ch,
    released: Arc<AtomicBool>,
    send_timeout: Duration,
}

impl<Ch: BrokerChannel> ChannelHandle<Ch> {
    pub(crate) fn is_usable(&self) -> bool {
        !self.released.load(Ordering::SeqCst) && self.channel.is_open()
    }

    pub(crate) fn channel(&self) -> &Ch {
        &self.channel
    }

    pub(crate) fn send_timeout(&self) -> Duration {
        self.send_timeout
    }
}
