use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{BrokerChannel, Delivery, MessageProperties};
use crate::config::NackOptions;
use crate::errors::Result;
use crate::messaging::codec::{self, Payload};

/// A decoded delivery handed to a queue's consumer.
///
/// Settling consumes the message, so each delivery is acked or nacked at most
/// once.
pub struct Message {
    payload: Payload,
    delivery_tag: u64,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: MessageProperties,
    channel: Arc<dyn BrokerChannel>,
    no_ack: bool,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("payload", &self.payload)
            .finish()
    }
}

impl Message {
    pub(crate) fn new(
        delivery: Delivery,
        payload: Payload,
        channel: Arc<dyn BrokerChannel>,
        no_ack: bool,
    ) -> Self {
        Self {
            payload,
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            channel,
            no_ack,
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        self.payload.parse()
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }

    /// Acknowledges the delivery.
    ///
    /// With a reply, and when the sender asked for one via `reply_to`, the
    /// reply is published to the nameless exchange under the sender's
    /// correlation id before the ack.
    pub async fn ack(self, reply: Option<Payload>) -> Result<()> {
        if let Some(reply) = reply {
            match self.properties.reply_to.as_deref() {
                Some(reply_to) => self.send_reply(reply_to, reply).await?,
                None => debug!(
                    delivery_tag = self.delivery_tag,
                    "Reply dropped: the message has no reply_to"
                ),
            }
        }

        if self.no_ack {
            return Ok(());
        }
        self.channel.ack(self.delivery_tag, false).await
    }

    pub async fn nack(self, options: NackOptions) -> Result<()> {
        if self.no_ack {
            warn!(
                delivery_tag = self.delivery_tag,
                "Ignoring nack for a message consumed without acknowledgment"
            );
            return Ok(());
        }
        self.channel
            .nack(self.delivery_tag, options.all_up_to, options.requeue)
            .await
    }

    async fn send_reply(&self, reply_to: &str, reply: Payload) -> Result<()> {
        let content_type = reply.content_type();
        let properties = MessageProperties {
            content_type: Some(content_type.to_string()),
            correlation_id: self.properties.correlation_id.clone(),
            message_id: Some(Uuid::new_v4().to_string()),
            timestamp: u64::try_from(Utc::now().timestamp()).ok(),
            ..MessageProperties::default()
        };
        let body = codec::encode(reply, content_type)?;

        debug!(
            reply_to = %reply_to,
            correlation_id = ?properties.correlation_id,
            "Sending reply"
        );
        self.channel.publish("", reply_to, body, properties).await?;
        Ok(())
    }
}
