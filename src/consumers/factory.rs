use std::sync::Arc;
use std::time::Duration;

use crate::consumers::{Subscription, SubscriptionSettings};
use crate::pool::ConnectionService;
use crate::transport::Connector;
use crate::Error;

/// Creates [`Subscription`]s bound to a [`ConnectionService`].
///
/// Configuration is validated upfront: an invalid configuration never reaches the broker.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use resilient_consumer::amqp::configuration::ConnectionSettings;
/// use resilient_consumer::consumers::{IgnoreFailures, MessageEnvelope, SubscriptionFactory};
/// use resilient_consumer::pool::ConnectionService;
///
/// async fn example() -> Result<(), resilient_consumer::Error> {
///     let connection_service = Arc::new(ConnectionService::from_settings(&ConnectionSettings::default())?);
///     let factory = SubscriptionFactory::new(connection_service.clone());
///     let subscription = factory.create(
///         "payouts",
///         true,
///         false,
///         260,
///         Duration::from_secs(2),
///         Duration::from_secs(4),
///     )?;
///     subscription
///         .start_consuming(
///             |envelope: MessageEnvelope| async move {
///                 let _ = envelope.ack().await;
///             },
///             IgnoreFailures,
///         )
///         .await?;
///     // [...]
///     subscription.dispose().await;
///     connection_service.dispose().await;
///     Ok(())
/// }
/// ```
pub struct SubscriptionFactory<C: Connector> {
    connection_service: Arc<ConnectionService<C>>,
}

impl<C: Connector> Clone for SubscriptionFactory<C> {
    fn clone(&self) -> Self {
        Self {
            connection_service: Arc::clone(&self.connection_service),
        }
    }
}

impl<C: Connector> SubscriptionFactory<C> {
    pub fn new(connection_service: Arc<ConnectionService<C>>) -> Self {
        Self { connection_service }
    }

    /// Create an idle subscription to `queue_name`, acking and nacking messages explicitly.
    ///
    /// It fails with [`Error::Configuration`] if the queue name is blank, if
    /// `prefetch_bound` is negative (or does not fit the AMQP prefetch count) or if either
    /// duration is zero.
    pub fn create(
        &self,
        queue_name: impl Into<String>,
        durable: bool,
        auto_delete: bool,
        prefetch_bound: i32,
        check_channel_period: Duration,
        resubscribe_delay: Duration,
    ) -> Result<Subscription<C>, Error> {
        self.create_from_settings(SubscriptionSettings {
            queue_name: queue_name.into(),
            durable,
            auto_delete,
            auto_ack: false,
            prefetch_bound,
            check_channel_period,
            resubscribe_delay,
        })
    }

    /// Create an idle subscription from deserialised settings.
    pub fn create_from_settings(
        &self,
        settings: SubscriptionSettings,
    ) -> Result<Subscription<C>, Error> {
        let config = settings.validate()?;
        Ok(Subscription::new(
            Arc::clone(&self.connection_service),
            config,
        ))
    }
}
