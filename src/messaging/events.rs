// src/messaging/events.rs

use tokio::sync::broadcast;

use crate::errors::HutchError;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Error(HutchError),
    /// Carries the cause when the connection did not close on request.
    Close(Option<HutchError>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEvent {
    /// Attached to a broker connection.
    Connected,
    Ready,
    /// Every in-flight publish has been flushed.
    Drain,
    Close(Option<HutchError>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Connected,
    Ready,
    /// All routing keys requested at creation are bound.
    Bound,
    Consuming,
    /// A delivery could not be decoded; consumption continues.
    Error(HutchError),
    Close(Option<HutchError>),
}

/// Fan-out of lifecycle events. Subscribers only see events emitted after
/// they subscribe; emitting with nobody listening is not an error.
#[derive(Debug)]
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: E) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }
}
