//! Exchanges, queues and request/reply over AMQP, driven by lifecycle events.
//!
//! A [`ConnectionManager`] owns the broker connection and creates
//! [`Exchange`]s; exchanges create [`Queue`]s. Each exchange and queue works
//! on its own channel and can be used before it is ready, since operations
//! issued early are held and replayed in order once the broker side is set up.

pub mod broker;
pub mod config;
pub mod connection;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod messaging;
pub mod queue;
pub mod rabbitmq;

pub use broker::memory::MemoryBroker;
pub use broker::{HeaderValue, MessageProperties};
pub use config::{
    ConnectionOptions, ConsumeOptions, ExchangeOptions, HutchConfig, NackOptions, PublishOptions,
    QueueOptions,
};
pub use connection::ConnectionManager;
pub use errors::{HutchError, Result};
pub use exchange::{resolve_exchange_name, Exchange, ExchangeState, ExchangeType};
pub use message::Message;
pub use messaging::{ConnectionEvent, ExchangeEvent, Payload, QueueEvent, ReplyFuture};
pub use queue::{Queue, QueueState};
pub use rabbitmq::LapinConnector;
