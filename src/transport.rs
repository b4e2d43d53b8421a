//! The broker primitives a subscription is built on.
//!
//! [`Connector`], [`BrokerConnection`] and [`BrokerChannel`] cover exactly what the
//! subscription needs from a broker client library: opening and closing connections
//! and channels, registering and cancelling consumers with a prefetch bound and
//! acking/nacking deliveries by delivery tag.
//!
//! The `lapin`-backed implementation lives in [`crate::amqp`]: [`ConnectionFactory`]
//! implements [`Connector`], [`lapin::Connection`] implements [`BrokerConnection`] and
//! [`lapin::Channel`] implements [`BrokerChannel`].
//!
//! [`ConnectionFactory`]: crate::amqp::ConnectionFactory
use amq_protocol_types::{DeliveryTag, ShortString};
use futures_util::stream::BoxStream;
use lapin::BasicProperties;

/// A stream of deliveries pushed by the broker to a registered consumer.
///
/// The stream ends when the consumer is cancelled, either by us or by the broker.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, anyhow::Error>>;

/// Callback invoked when the broker closes a connection or the network drops it.
pub type FailureCallback = Box<dyn Fn(anyhow::Error) + Send + Sync + 'static>;

/// A message pushed by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The delivery tag of the message.
    pub delivery_tag: DeliveryTag,

    /// The exchange of the message. May be an empty string
    /// if the default exchange is used.
    pub exchange: ShortString,

    /// The routing key of the message. May be an empty string
    /// if no routing key is specified.
    pub routing_key: ShortString,

    /// Whether this message was redelivered
    pub redelivered: bool,

    /// Contains the properties and the headers of the
    /// message.
    pub properties: BasicProperties,

    /// The payload of the message in binary format.
    pub data: Vec<u8>,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: value.delivery_tag,
            exchange: value.exchange,
            routing_key: value.routing_key,
            redelivered: value.redelivered,
            properties: value.properties,
            data: value.data,
        }
    }
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// The queue survives a broker restart.
    pub durable: bool,
    /// The queue is deleted when its last consumer goes away.
    pub auto_delete: bool,
}

/// Opens physical connections to the broker.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: BrokerConnection<Channel = Self::Channel>;
    type Channel: BrokerChannel;

    /// Open a new connection.
    ///
    /// Fails if the broker is unreachable or rejects our credentials.
    async fn connect(&self) -> Result<Self::Connection, anyhow::Error>;
}

/// A physical connection, multiplexing channels.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    /// Whether the connection is usable, as last reported by the client library.
    fn is_connected(&self) -> bool;

    /// Register a callback fired when the connection fails.
    fn on_failure(&self, callback: FailureCallback);

    async fn create_channel(&self) -> Result<Self::Channel, anyhow::Error>;

    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// A channel over a [`BrokerConnection`].
///
/// Handles are cheap to clone and all clones refer to the same broker-side channel.
#[async_trait::async_trait]
pub trait BrokerChannel: Clone + Send + Sync + 'static {
    /// Whether the channel can still be used.
    ///
    /// This is a status lookup, not a round-trip to the broker.
    fn is_open(&self) -> bool;

    /// Limit the number of unacknowledged messages the broker pushes to consumers on
    /// this channel.
    async fn set_prefetch(&self, prefetch_count: u16) -> Result<(), anyhow::Error>;

    async fn declare_queue(
        &self,
        queue_name: &str,
        options: QueueOptions,
    ) -> Result<(), anyhow::Error>;

    /// Register a consumer on `queue_name`.
    async fn consume(
        &self,
        queue_name: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, anyhow::Error>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error>;

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), anyhow::Error>;

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), anyhow::Error>;

    async fn close(&self) -> Result<(), anyhow::Error>;
}
