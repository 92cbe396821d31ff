//! The surface consumed from the AMQP client.
//!
//! Exchanges and queues talk to the broker only through these traits, so the
//! lapin-backed implementation in [`crate::rabbitmq`] and the in-process
//! [`memory`] broker are interchangeable.

pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::config::{ConnectionOptions, ConsumeOptions, ExchangeOptions, QueueOptions};
use crate::errors::{HutchError, Result};
use crate::exchange::ExchangeType;

/// Deliveries for one consumer; the stream ends when the consumer is
/// cancelled or its channel closes.
pub type DeliveryStream = mpsc::UnboundedReceiver<Delivery>;

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;

    /// Resolves once the connection is gone: `None` for a requested close,
    /// the cause otherwise.
    async fn closed(&self) -> Option<HutchError>;

    fn is_connected(&self) -> bool;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Diagnostic identifier for logging.
    fn id(&self) -> String;

    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        options: &ExchangeOptions,
    ) -> Result<()>;

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<QueueInfo>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Returns `false` when the write buffer is saturated; [`drained`](Self::drained)
    /// then resolves once it has emptied.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<bool>;

    async fn drained(&self);

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn purge_queue(&self, queue: &str) -> Result<u32>;

    async fn close(&self) -> Result<()>;

    /// Same contract as [`BrokerConnection::closed`].
    async fn closed(&self) -> Option<HutchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: BTreeMap<String, HeaderValue>,
    /// 2 marks the message persistent.
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<u64>,
    pub app_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

/// One-time close notification shared by a connection or channel and
/// everything watching it.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<Option<Option<String>>>>,
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Records the close; only the first call has any effect.
    pub fn fire(&self, reason: Option<String>) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(reason);
            true
        })
    }

    pub fn is_fired(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Waits for [`fire`](Self::fire) and returns its reason.
    pub async fn wait(&self) -> Option<String> {
        let mut rx = self.tx.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(state) => state.clone().flatten(),
            Err(_) => None,
        };
        reason
    }
}
