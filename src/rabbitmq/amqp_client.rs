// src/rabbitmq/amqp_client.rs

use std::sync::Arc;

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, QueueBindOptions, QueuePurgeOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::convert;
use crate::broker::{
    BrokerChannel, BrokerConnection, BrokerConnector, CloseSignal, DeliveryStream,
    MessageProperties, QueueInfo,
};
use crate::config::{ConnectionOptions, ConsumeOptions, ExchangeOptions, QueueOptions};
use crate::errors::{HutchError, Result};
use crate::exchange::ExchangeType;

const REPLY_SUCCESS: u16 = 200;

/// Opens real broker connections with lapin.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinConnector;

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn connect(
        &self,
        url: &str,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn BrokerConnection>> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &options.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        let connection = Connection::connect(url, properties).await.map_err(|e| {
            error!("Failed to connect to RabbitMQ: {}", e);
            HutchError::ConnectionError(e.to_string())
        })?;
        info!("Connected to RabbitMQ");

        let signal = CloseSignal::new();
        let on_error = signal.clone();
        connection.on_error(move |err| {
            error!("RabbitMQ connection error: {}", err);
            on_error.fire(Some(err.to_string()));
        });

        Ok(Arc::new(LapinConnection {
            connection: Arc::new(connection),
            signal,
        }))
    }
}

struct LapinConnection {
    connection: Arc<Connection>,
    signal: CloseSignal,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| HutchError::ChannelError(format!("Failed to create channel: {}", e)))?;
        debug!(channel = channel.id(), "Channel created");

        let signal = CloseSignal::new();
        // a dead connection takes its channels with it
        let connection_signal = self.signal.clone();
        let channel_signal = signal.clone();
        tokio::spawn(async move {
            tokio::select! {
                reason = connection_signal.wait() => {
                    channel_signal.fire(reason);
                }
                _ = channel_signal.wait() => {}
            }
        });

        Ok(Arc::new(LapinChannel { channel, signal }))
    }

    async fn close(&self) -> Result<()> {
        self.signal.fire(None);
        self.connection
            .close(REPLY_SUCCESS, "Normal shutdown")
            .await
            .map_err(HutchError::from)
    }

    async fn closed(&self) -> Option<HutchError> {
        self.signal.wait().await.map(HutchError::ConnectionError)
    }

    fn is_connected(&self) -> bool {
        !self.signal.is_fired() && self.connection.status().connected()
    }
}

struct LapinChannel {
    channel: Channel,
    signal: CloseSignal,
}

impl LapinChannel {
    /// Maps a lapin failure and, when it cost us the channel, records the close.
    fn fail(&self, err: lapin::Error) -> HutchError {
        if !self.channel.status().connected() {
            self.signal.fire(Some(err.to_string()));
        }
        HutchError::from(err)
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn id(&self) -> String {
        format!("lapin-{}", self.channel.id())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| self.fail(e))
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        options: &ExchangeOptions,
    ) -> Result<()> {
        let (declare, arguments) = convert::exchange_declare(options);
        self.channel
            .exchange_declare(name, convert::exchange_kind(kind), declare, arguments)
            .await
            .map_err(|e| HutchError::DeclareError {
                name: name.to_string(),
                reason: self.fail(e).to_string(),
            })
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<QueueInfo> {
        let (declare, arguments) = convert::queue_declare(options);
        let queue = self
            .channel
            .queue_declare(name, declare, arguments)
            .await
            .map_err(|e| HutchError::DeclareError {
                name: name.to_string(),
                reason: self.fail(e).to_string(),
            })?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| HutchError::BindError {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                key: routing_key.to_string(),
                reason: self.fail(e).to_string(),
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<bool> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                convert::basic_properties(properties),
            )
            .await
            .map_err(|e| HutchError::PublishError(self.fail(e).to_string()))?;
        // lapin buffers frames internally and reports no back-pressure
        Ok(true)
    }

    async fn drained(&self) {}

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| HutchError::ConsumeError(self.fail(e).to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = queue.to_string();
        let channel = self.channel.clone();
        let signal = self.signal.clone();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        if tx.send(convert::delivery(delivery)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(queue = %queue, "Error receiving message: {}", e);
                        if !channel.status().connected() {
                            warn!(queue = %queue, "Channel disconnected");
                            signal.fire(Some(e.to_string()));
                        }
                        break;
                    }
                }
            }
            debug!(queue = %queue, "Consumer stream finished");
        });

        Ok(rx)
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|e| HutchError::AckError(self.fail(e).to_string()))
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|e| HutchError::AckError(self.fail(e).to_string()))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| self.fail(e))
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32> {
        self.channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|e| self.fail(e))
    }

    async fn close(&self) -> Result<()> {
        if !self.signal.fire(None) {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "Normal shutdown")
            .await
            .map_err(HutchError::from)
    }

    async fn closed(&self) -> Option<HutchError> {
        self.signal.wait().await.map(HutchError::ChannelError)
    }
}
