// src/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

/// Errors raised by the hutch.
///
/// Every variant carries plain text so the error is `Clone` and can travel on
/// lifecycle events to any number of subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HutchError {
    #[error("A broker URL is required")]
    MissingUrl,

    #[error("An exchange type is required")]
    MissingExchangeType,

    #[error("Unknown exchange type: {0}")]
    UnknownExchangeType(String),

    #[error("No Tokio runtime is available to drive the connection")]
    NoRuntime,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Declare failed for {name}: {reason}")]
    DeclareError { name: String, reason: String },

    #[error("Binding {queue} to {exchange} with key {key:?} failed: {reason}")]
    BindError {
        queue: String,
        exchange: String,
        key: String,
        reason: String,
    },

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(String),

    #[error("Message deserialization error: {0}")]
    DeserializationError(String),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("{0} is closed")]
    Closed(String),

    #[error("{0} is already connected")]
    AlreadyConnected(String),

    #[error("Queue already has an active consumer ({0})")]
    AlreadyConsuming(String),

    #[error("Exchange {0:?} was created with replies disabled")]
    RepliesDisabled(String),

    #[error("The pending reply was dropped before a response arrived")]
    ReplyDropped,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Custom Result type for hutch operations
pub type Result<T> = std::result::Result<T, HutchError>;

// Converting from lapin errors
impl From<LapinError> for HutchError {
    fn from(error: LapinError) -> Self {
        // lapin's error enum is classified from its text
        let error_text = error.to_string();
        let lowered = error_text.to_lowercase();

        if lowered.contains("connection") || lowered.contains("io error") {
            HutchError::ConnectionError(error_text)
        } else if lowered.contains("channel") {
            HutchError::ChannelError(error_text)
        } else if lowered.contains("publish") {
            HutchError::PublishError(error_text)
        } else if lowered.contains("consume") {
            HutchError::ConsumeError(error_text)
        } else if lowered.contains("ack") {
            HutchError::AckError(error_text)
        } else {
            HutchError::Unknown(error_text)
        }
    }
}

impl From<SerdeError> for HutchError {
    fn from(error: SerdeError) -> Self {
        HutchError::SerializationError(error.to_string())
    }
}

impl From<Elapsed> for HutchError {
    fn from(_: Elapsed) -> Self {
        HutchError::TimeoutError("Connection timed out".to_string())
    }
}

impl From<std::env::VarError> for HutchError {
    fn from(err: std::env::VarError) -> Self {
        HutchError::ConfigError(format!("Environment variable error: {}", err))
    }
}

impl From<std::num::ParseIntError> for HutchError {
    fn from(err: std::num::ParseIntError) -> Self {
        HutchError::ConfigError(format!("Parse error: {}", err))
    }
}

impl From<String> for HutchError {
    fn from(message: String) -> Self {
        HutchError::Unknown(message)
    }
}

impl From<&str> for HutchError {
    fn from(message: &str) -> Self {
        HutchError::Unknown(message.to_string())
    }
}
