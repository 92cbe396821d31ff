// src/messaging/codec.rs

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::config::{BINARY_CONTENT_TYPE, JSON_CONTENT_TYPE};
use crate::errors::{HutchError, Result};

/// Message content as handed to and from callers.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    /// Deserializes JSON content, or raw bytes that happen to hold JSON.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        let parsed = match self {
            Payload::Json(value) => serde_json::from_value(value.clone()),
            Payload::Bytes(bytes) => serde_json::from_slice(bytes),
        };
        parsed.map_err(|e| HutchError::DeserializationError(e.to_string()))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Json(_) => None,
            Payload::Bytes(bytes) => Some(bytes),
        }
    }

    /// The content type a reply carrying this payload is stamped with.
    pub fn content_type(&self) -> &'static str {
        match self {
            Payload::Json(_) => JSON_CONTENT_TYPE,
            Payload::Bytes(_) => BINARY_CONTENT_TYPE,
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Bytes(bytes.to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Json(Value::String(text))
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Json(Value::String(text.to_string()))
    }
}

/// True for `application/json`, ignoring case and parameters such as charset.
pub fn is_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|essence| essence.eq_ignore_ascii_case(JSON_CONTENT_TYPE))
}

/// Body bytes for `payload` sent as `content_type`.
///
/// JSON content is serialized. Raw bytes always pass through untouched, and a
/// JSON string sent with a non-JSON type goes out as its UTF-8 text.
pub fn encode(payload: Payload, content_type: &str) -> Result<Vec<u8>> {
    match payload {
        Payload::Bytes(bytes) => Ok(bytes),
        Payload::Json(Value::String(text)) if !is_json(content_type) => Ok(text.into_bytes()),
        Payload::Json(value) => Ok(serde_json::to_vec(&value)?),
    }
}

/// Decodes a delivery body according to its content type. Missing or
/// non-JSON types yield raw bytes.
pub fn decode(body: Vec<u8>, content_type: Option<&str>) -> Result<Payload> {
    match content_type {
        Some(content_type) if is_json(content_type) => serde_json::from_slice(&body)
            .map(Payload::Json)
            .map_err(|e| HutchError::DeserializationError(e.to_string())),
        _ => Ok(Payload::Bytes(body)),
    }
}
