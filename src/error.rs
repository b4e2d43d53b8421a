use amq_protocol_types::DeliveryTag;

use crate::consumers::SubscriptionState;

/// The error type returned by the connection service, subscriptions and message envelopes.
///
/// Check out each variant to understand when it is returned and whether it is worth
/// retrying.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The physical connection to the broker is unavailable or was rejected
    /// (unreachable host, wrong credentials, timeout, disposed connection service).
    #[error("Failed to establish a connection with the RabbitMq broker")]
    Connection(#[source] anyhow::Error),
    /// All the channel slots of the connection service are in use.
    #[error("The channel pool is exhausted: {max_channels} channels are already open")]
    CapacityExceeded { max_channels: usize },
    /// The broker refused to register a consumer - e.g. the queue is missing or has been
    /// declared with incompatible arguments.
    #[error("The broker refused to register a consumer on queue `{queue}`")]
    ConsumerRegistration {
        queue: String,
        #[source]
        source: anyhow::Error,
    },
    /// An ack/nack was attempted on a delivery whose channel has been closed or recycled.
    ///
    /// The broker will redeliver the message: this is not an error to be retried locally.
    #[error("Delivery {delivery_tag} belongs to a channel that has been closed or recycled")]
    StaleDelivery { delivery_tag: DeliveryTag },
    /// The delivery has already been acked or nacked.
    #[error("Delivery {delivery_tag} has already been acknowledged")]
    AlreadySettled { delivery_tag: DeliveryTag },
    /// Invalid parameters, surfaced synchronously at construction.
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    /// The channel used by a subscription is no longer usable.
    #[error("The channel consuming from queue `{queue}` is no longer open")]
    ChannelClosed { queue: String },
    /// The broker terminated the consumer's delivery stream.
    #[error("The broker cancelled the consumer on queue `{queue}`")]
    ConsumerCancelled { queue: String },
    /// A broker call on a live channel failed or timed out.
    #[error("A channel operation failed")]
    Channel(#[source] anyhow::Error),
    /// A lifecycle method was invoked in a state that does not support it.
    #[error("Cannot {operation} a subscription in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SubscriptionState,
    },
}

impl Error {
    /// `true` for the errors a subscription absorbs by resubscribing.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Connection(_)
                | Error::CapacityExceeded { .. }
                | Error::ConsumerRegistration { .. }
                | Error::ChannelClosed { .. }
                | Error::ConsumerCancelled { .. }
                | Error::Channel(_)
        )
    }
}
