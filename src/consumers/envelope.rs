use amq_protocol_types::{DeliveryTag, ShortString};
use anyhow::Context;
use lapin::BasicProperties;
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::amqp::convenience::BasicPropertiesExt;
use crate::pool::ChannelHandle;
use crate::transport::{BrokerChannel, Delivery};
use crate::Error;

/// A message delivered to a [`Subscription`], ready for processing.
///
/// Every envelope must be settled - acked or nacked - exactly once by the handler that
/// received it (unless the subscription runs in auto-ack mode).
///
/// # Stale deliveries
///
/// An envelope is bound to the channel that delivered it. If that channel dies and the
/// subscription resubscribes on a fresh one, settling the envelope fails with
/// [`Error::StaleDelivery`]: the broker will redeliver the message on its own.
///
/// [`Subscription`]: crate::consumers::Subscription
pub struct MessageEnvelope {
    delivery: Delivery,
    queue_name: String,
    callbacks: AckNackCallbacks,
}

impl MessageEnvelope {
    pub(crate) fn new<Ch: BrokerChannel>(
        delivery: Delivery,
        queue_name: String,
        channel: ChannelHandle<Ch>,
        auto_ack: bool,
    ) -> Self {
        let target: Option<Arc<dyn Settle>> = if auto_ack {
            None
        } else {
            Some(Arc::new(channel))
        };
        let callbacks = AckNackCallbacks {
            delivery_tag: delivery.delivery_tag,
            target,
            settled: AtomicBool::new(false),
        };
        Self {
            delivery,
            queue_name,
            callbacks,
        }
    }

    /// The payload of the message in binary format.
    pub fn payload(&self) -> &[u8] {
        &self.delivery.data
    }

    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery.delivery_tag
    }

    pub fn exchange(&self) -> &ShortString {
        &self.delivery.exchange
    }

    pub fn routing_key(&self) -> &ShortString {
        &self.delivery.routing_key
    }

    /// Whether the broker has already tried to deliver this message before.
    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.delivery.properties
    }

    /// Lookup a string header.
    pub fn header_str(&self, name: &str) -> Option<Cow<'_, str>> {
        self.delivery.properties.get_header_str(name)
    }

    /// The queue the message was consumed from.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Whether the envelope has already been acked or nacked.
    pub fn is_settled(&self) -> bool {
        self.callbacks.settled.load(Ordering::SeqCst)
    }

    /// Acknowledge the message: the broker will forget about it.
    pub async fn ack(&self) -> Result<(), Error> {
        self.callbacks.settle(Settlement::Ack).await
    }

    /// Reject the message. It is put back in the queue if `requeue` is `true`, otherwise it
    /// is dead-lettered (or discarded, if the queue has no dead-letter exchange).
    pub async fn nack(&self, requeue: bool) -> Result<(), Error> {
        self.callbacks.settle(Settlement::Nack { requeue }).await
    }
}

impl fmt::Debug for MessageEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEnvelope")
            .field("queue_name", &self.queue_name)
            .field("delivery_tag", &self.delivery.delivery_tag)
            .field("routing_key", &self.delivery.routing_key)
            .field("redelivered", &self.delivery.redelivered)
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    Nack { requeue: bool },
}

/// The ack/nack pair of an envelope, bound to the channel and delivery tag of the message.
struct AckNackCallbacks {
    delivery_tag: DeliveryTag,
    /// `None` in auto-ack mode.
    target: Option<Arc<dyn Settle>>,
    settled: AtomicBool,
}

impl AckNackCallbacks {
    async fn settle(&self, settlement: Settlement) -> Result<(), Error> {
        let delivery_tag = self.delivery_tag;
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadySettled { delivery_tag });
        }
        let Some(target) = &self.target else {
            return Ok(());
        };
        if !target.is_usable() {
            return Err(Error::StaleDelivery { delivery_tag });
        }
        let outcome = match settlement {
            Settlement::Ack => target.ack(delivery_tag).await,
            Settlement::Nack { requeue } => target.nack(delivery_tag, requeue).await,
        };
        outcome.map_err(|e| {
            // The channel may have died while the request was in flight.
            if target.is_usable() {
                Error::Channel(e)
            } else {
                Error::StaleDelivery { delivery_tag }
            }
        })
    }
}

/// Settles deliveries on the channel they came from.
#[async_trait::async_trait]
pub(crate) trait Settle: Send + Sync + 'static {
    fn is_usable(&self) -> bool;

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), anyhow::Error>;

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl<Ch: BrokerChannel> Settle for ChannelHandle<Ch> {
    fn is_usable(&self) -> bool {
        ChannelHandle::is_usable(self)
    }

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), anyhow::Error> {
        tokio::time::timeout(self.send_timeout(), self.channel().ack(delivery_tag))
            .await
            .context("Timed out while acking a delivery.")?
    }

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), anyhow::Error> {
        tokio::time::timeout(
            self.send_timeout(),
            self.channel().nack(delivery_tag, requeue),
        )
        .await
        .context("Timed out while nacking a delivery.")?
    }
}
