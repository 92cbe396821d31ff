// src/rabbitmq/convert.rs
// Translation between the hutch's option/property types and lapin's

use std::collections::BTreeMap;

use lapin::options::{ExchangeDeclareOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, ExchangeKind};
use tracing::debug;

use crate::broker::{Delivery, HeaderValue, MessageProperties};
use crate::config::{ExchangeOptions, QueueOptions};
use crate::exchange::ExchangeType;

pub(crate) fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Topic => ExchangeKind::Topic,
    }
}

pub(crate) fn exchange_declare(options: &ExchangeOptions) -> (ExchangeDeclareOptions, FieldTable) {
    let declare = ExchangeDeclareOptions {
        durable: options.durable,
        auto_delete: options.auto_delete,
        internal: options.internal,
        ..ExchangeDeclareOptions::default()
    };

    let mut arguments = FieldTable::default();
    if let Some(alternate) = &options.alternate_exchange {
        arguments.insert("alternate-exchange".into(), long_string(alternate));
    }
    (declare, arguments)
}

pub(crate) fn queue_declare(options: &QueueOptions) -> (QueueDeclareOptions, FieldTable) {
    let declare = QueueDeclareOptions {
        durable: options.durable,
        exclusive: options.exclusive,
        auto_delete: options.auto_delete,
        ..QueueDeclareOptions::default()
    };

    let mut arguments = FieldTable::default();
    if let Some(ttl) = options.message_ttl_ms {
        arguments.insert("x-message-ttl".into(), AMQPValue::LongLongInt(i64::from(ttl)));
    }
    if let Some(exchange) = &options.dead_letter_exchange {
        arguments.insert("x-dead-letter-exchange".into(), long_string(exchange));
    }
    if let Some(key) = &options.dead_letter_routing_key {
        arguments.insert("x-dead-letter-routing-key".into(), long_string(key));
    }
    if let Some(max) = options.max_length {
        arguments.insert("x-max-length".into(), AMQPValue::LongLongInt(i64::from(max)));
    }
    (declare, arguments)
}

pub(crate) fn basic_properties(properties: MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(content_type) = properties.content_type {
        basic = basic.with_content_type(content_type.into());
    }
    if let Some(encoding) = properties.content_encoding {
        basic = basic.with_content_encoding(encoding.into());
    }
    if !properties.headers.is_empty() {
        basic = basic.with_headers(field_table(&properties.headers));
    }
    if let Some(mode) = properties.delivery_mode {
        basic = basic.with_delivery_mode(mode);
    }
    if let Some(priority) = properties.priority {
        basic = basic.with_priority(priority);
    }
    if let Some(correlation_id) = properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.into());
    }
    if let Some(reply_to) = properties.reply_to {
        basic = basic.with_reply_to(reply_to.into());
    }
    if let Some(expiration) = properties.expiration {
        basic = basic.with_expiration(expiration.into());
    }
    if let Some(message_id) = properties.message_id {
        basic = basic.with_message_id(message_id.into());
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    if let Some(app_id) = properties.app_id {
        basic = basic.with_app_id(app_id.into());
    }
    basic
}

pub(crate) fn message_properties(basic: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: short(basic.content_type()),
        content_encoding: short(basic.content_encoding()),
        headers: basic.headers().as_ref().map(headers).unwrap_or_default(),
        delivery_mode: *basic.delivery_mode(),
        priority: *basic.priority(),
        correlation_id: short(basic.correlation_id()),
        reply_to: short(basic.reply_to()),
        expiration: short(basic.expiration()),
        message_id: short(basic.message_id()),
        timestamp: *basic.timestamp(),
        app_id: short(basic.app_id()),
    }
}

pub(crate) fn delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: message_properties(&delivery.properties),
        body: delivery.data,
    }
}

fn field_table(headers: &BTreeMap<String, HeaderValue>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        let value = match value {
            HeaderValue::Bool(flag) => AMQPValue::Boolean(*flag),
            HeaderValue::Int(number) => AMQPValue::LongLongInt(*number),
            HeaderValue::Float(number) => AMQPValue::Double(*number),
            HeaderValue::Str(text) => long_string(text),
        };
        table.insert(key.clone().into(), value);
    }
    table
}

fn headers(table: &FieldTable) -> BTreeMap<String, HeaderValue> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::Boolean(flag) => HeaderValue::Bool(*flag),
                AMQPValue::ShortShortInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::ShortShortUInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::ShortInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::ShortUInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::LongInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::LongUInt(n) => HeaderValue::Int(i64::from(*n)),
                AMQPValue::LongLongInt(n) => HeaderValue::Int(*n),
                AMQPValue::Float(n) => HeaderValue::Float(f64::from(*n)),
                AMQPValue::Double(n) => HeaderValue::Float(*n),
                AMQPValue::ShortString(text) => HeaderValue::Str(text.as_str().to_string()),
                AMQPValue::LongString(text) => {
                    HeaderValue::Str(String::from_utf8_lossy(text.as_bytes()).into_owned())
                }
                other => {
                    debug!(header = key.as_str(), "Skipping unsupported header value {:?}", other);
                    return None;
                }
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

fn long_string(text: &str) -> AMQPValue {
    AMQPValue::LongString(LongString::from(text.to_string()))
}

fn short(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|text| text.as_str().to_string())
}
