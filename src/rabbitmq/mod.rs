// src/rabbitmq/mod.rs
// lapin implementation of the broker traits

mod amqp_client;
mod convert;

pub use amqp_client::LapinConnector;
