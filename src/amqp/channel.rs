//! Implements the broker traits for [`lapin::Connection`] and [`lapin::Channel`].
use amq_protocol_types::{DeliveryTag, FieldTable};
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    QueueDeclareOptions,
};

use crate::transport::{
    BrokerChannel, BrokerConnection, Delivery, DeliveryStream, FailureCallback, QueueOptions,
};

/// AMQP reply code for a normal shutdown.
const REPLY_SUCCESS: u16 = 200;

#[async_trait::async_trait]
impl BrokerConnection for lapin::Connection {
    type Channel = lapin::Channel;

    fn is_connected(&self) -> bool {
        self.status().connected()
    }

    fn on_failure(&self, callback: FailureCallback) {
        self.on_error(move |e| callback(e.into()));
    }

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn create_channel(&self) -> Result<lapin::Channel, anyhow::Error> {
        Ok(lapin::Connection::create_channel(self).await?)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        Ok(lapin::Connection::close(self, REPLY_SUCCESS, "connection service disposed").await?)
    }
}

#[async_trait::async_trait]
impl BrokerChannel for lapin::Channel {
    fn is_open(&self) -> bool {
        self.status().connected()
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> Result<(), anyhow::Error> {
        Ok(self
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?)
    }

    async fn declare_queue(
        &self,
        queue_name: &str,
        options: QueueOptions,
    ) -> Result<(), anyhow::Error> {
        let options = QueueDeclareOptions {
            passive: false,
            durable: options.durable,
            exclusive: false,
            auto_delete: options.auto_delete,
            nowait: false,
        };
        self.queue_declare(queue_name, options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue_name: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, anyhow::Error> {
        let consumer = self
            .basic_consume(
                queue_name,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(anyhow::Error::from))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error> {
        Ok(self
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?)
    }

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), anyhow::Error> {
        Ok(self
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await?)
    }

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), anyhow::Error> {
        Ok(self
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        Ok(lapin::Channel::close(self, REPLY_SUCCESS, "channel released").await?)
    }
}
