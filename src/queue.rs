use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerChannel, BrokerConnection, DeliveryStream};
use crate::config::{ConsumeOptions, QueueOptions, DEFAULT_PREFETCH};
use crate::errors::{HutchError, Result};
use crate::message::Message;
use crate::messaging::codec;
use crate::messaging::events::{EventBus, QueueEvent};
use crate::messaging::lock;
use crate::messaging::readiness::ReadyGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Unconnected,
    ChannelOpen,
    Ready,
    Consuming,
    Closed,
}

#[derive(Clone)]
struct QueueLink {
    channel: Arc<dyn BrokerChannel>,
    /// Name as declared, which the broker picks for unnamed queues.
    name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueInternals {
    pub name: String,
    pub state: QueueState,
    pub channel: Option<String>,
    pub consumer_tag: Option<String>,
    pub pending_operations: usize,
    pub options: QueueOptions,
}

/// One broker queue on its own channel.
///
/// Handles are cheap to clone and all refer to the same queue.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    options: QueueOptions,
    state: watch::Sender<QueueState>,
    events: EventBus<QueueEvent>,
    gate: ReadyGate<QueueLink>,
    link: Mutex<Option<QueueLink>>,
    consumer_tag: Mutex<Option<String>>,
    close_cause: Mutex<Option<HutchError>>,
}

impl Queue {
    pub fn new(options: QueueOptions) -> Self {
        let (state, _rx) = watch::channel(QueueState::Unconnected);
        let label = if options.name.is_empty() {
            "queue".to_string()
        } else {
            format!("queue {}", options.name)
        };
        Self {
            inner: Arc::new(QueueInner {
                options,
                state,
                events: EventBus::new(),
                gate: ReadyGate::new(label),
                link: Mutex::new(None),
                consumer_tag: Mutex::new(None),
                close_cause: Mutex::new(None),
            }),
        }
    }

    /// Declared name once known, the requested one before that.
    pub fn name(&self) -> String {
        match &*lock(&self.inner.link) {
            Some(link) => link.name.clone(),
            None => self.inner.options.name.clone(),
        }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.inner.options
    }

    pub fn state(&self) -> QueueState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Opens the queue's channel, applies prefetch and declares the queue.
    pub async fn connect(&self, connection: &Arc<dyn BrokerConnection>) -> Result<()> {
        let claimed = self.inner.state.send_if_modified(|state| {
            if *state == QueueState::Unconnected {
                *state = QueueState::ChannelOpen;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(match self.state() {
                QueueState::Closed => self.inner.closed_error(),
                _ => HutchError::AlreadyConnected(self.inner.label()),
            });
        }

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(queue = %self.inner.options.name, "Failed to open channel: {}", e);
                self.inner.teardown(Some(e.clone()));
                return Err(e);
            }
        };
        if self.state() == QueueState::Closed {
            // closed while the channel was opening
            let _ = channel.close().await;
            return Err(self.inner.closed_error());
        }
        debug!(queue = %self.inner.options.name, channel = %channel.id(), "Channel open");
        self.inner.events.emit(QueueEvent::Connected);
        watch_channel(Arc::downgrade(&self.inner), channel.clone());

        match self.inner.declare(&channel).await {
            Ok(link) => {
                info!(queue = %link.name, "Queue ready");
                *lock(&self.inner.link) = Some(link.clone());
                let opened = self.inner.state.send_if_modified(|state| {
                    if *state == QueueState::ChannelOpen {
                        *state = QueueState::Ready;
                        true
                    } else {
                        false
                    }
                });
                if !opened {
                    // closed while declaring
                    lock(&self.inner.link).take();
                    let _ = channel.close().await;
                    return Err(self.inner.closed_error());
                }
                self.inner.events.emit(QueueEvent::Ready);
                self.inner.gate.open(link).await;
                Ok(())
            }
            Err(e) => {
                error!(queue = %self.inner.options.name, "Queue setup failed: {}", e);
                self.inner.teardown(Some(e.clone()));
                let _ = channel.close().await;
                Err(e)
            }
        }
    }

    /// Starts the queue's single consumer and returns its tag.
    ///
    /// Waits for the queue to become ready. Each delivery is decoded and
    /// handed to `handler` on its own task; bodies that fail to decode are
    /// rejected without requeue and reported as [`QueueEvent::Error`].
    pub async fn consume<F, Fut>(&self, handler: F, options: ConsumeOptions) -> Result<String>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4()));
        {
            let mut current = lock(&self.inner.consumer_tag);
            if let Some(active) = current.as_ref() {
                return Err(HutchError::AlreadyConsuming(active.clone()));
            }
            *current = Some(tag.clone());
        }

        let inner = self.inner.clone();
        let handler = Arc::new(handler);
        let op_tag = tag.clone();
        let started = self
            .inner
            .gate
            .run(move |link: QueueLink| async move {
                // cancelled before the queue was ready
                if lock(&inner.consumer_tag).as_deref() != Some(op_tag.as_str()) {
                    return Ok(());
                }

                let stream = link.channel.consume(&link.name, &op_tag, &options).await?;
                inner.state.send_if_modified(|state| {
                    if *state == QueueState::Ready {
                        *state = QueueState::Consuming;
                        true
                    } else {
                        false
                    }
                });
                info!(queue = %link.name, consumer = %op_tag, "Consuming");
                inner.events.emit(QueueEvent::Consuming);

                tokio::spawn(run_consumer(
                    Arc::downgrade(&inner),
                    link,
                    op_tag,
                    stream,
                    options.no_ack,
                    handler,
                ));
                Ok(())
            })
            .await;

        if let Err(e) = started {
            let mut current = lock(&self.inner.consumer_tag);
            if current.as_deref() == Some(tag.as_str()) {
                *current = None;
            }
            return Err(e);
        }
        Ok(tag)
    }

    /// Cancels the active consumer; does nothing when there is none.
    pub async fn cancel(&self) -> Result<()> {
        let Some(tag) = lock(&self.inner.consumer_tag).take() else {
            return Ok(());
        };

        let inner = self.inner.clone();
        self.inner
            .gate
            .run(move |link: QueueLink| async move {
                let cancelled = link.channel.cancel(&tag).await;
                if let Err(e) = cancelled {
                    // the consumer is still live on the broker
                    if *inner.state.borrow() == QueueState::Consuming {
                        lock(&inner.consumer_tag).get_or_insert(tag);
                    }
                    return Err(e);
                }
                inner.state.send_if_modified(|state| {
                    if *state == QueueState::Consuming {
                        *state = QueueState::Ready;
                        true
                    } else {
                        false
                    }
                });
                info!(queue = %link.name, consumer = %tag, "Consumer cancelled");
                Ok(())
            })
            .await
    }

    /// Removes every ready message. `None` when the queue has no open channel.
    pub async fn purge(&self) -> Result<Option<u32>> {
        let link = lock(&self.inner.link).clone();
        let Some(link) = link else {
            return Ok(None);
        };

        let purged = link.channel.purge_queue(&link.name).await?;
        debug!(queue = %link.name, purged, "Queue purged");
        Ok(Some(purged))
    }

    /// Binds the queue to `exchange` with `routing_key`, once ready.
    pub async fn bind(&self, exchange: &str, routing_key: &str) -> Result<()> {
        let exchange = exchange.to_string();
        let routing_key = routing_key.to_string();
        self.inner
            .gate
            .run(move |link: QueueLink| async move {
                link.channel
                    .bind_queue(&link.name, &exchange, &routing_key)
                    .await?;
                debug!(queue = %link.name, exchange = %exchange, key = %routing_key, "Queue bound");
                Ok(())
            })
            .await
    }

    /// Closes the channel. Further operations fail with `Closed`.
    pub async fn close(&self) -> Result<()> {
        let link = lock(&self.inner.link).clone();
        if !self.inner.teardown(None) {
            return Ok(());
        }
        match link {
            Some(link) => link.channel.close().await,
            None => Ok(()),
        }
    }

    /// Resolves once the queue is declared, or fails if it closes first.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let state = *rx
            .wait_for(|state| {
                matches!(
                    state,
                    QueueState::Ready | QueueState::Consuming | QueueState::Closed
                )
            })
            .await
            .map_err(|_| self.inner.closed_error())?;

        match state {
            QueueState::Closed => Err(self.inner.closed_error()),
            _ => Ok(()),
        }
    }

    /// Resolves with the close cause; `None` for a requested close.
    pub async fn closed(&self) -> Option<HutchError> {
        self.inner.wait_closed().await
    }

    pub fn internals(&self) -> QueueInternals {
        let link = lock(&self.inner.link).clone();
        QueueInternals {
            name: self.name(),
            state: self.state(),
            channel: link.map(|link| link.channel.id()),
            consumer_tag: lock(&self.inner.consumer_tag).clone(),
            pending_operations: self.inner.gate.backlog(),
            options: self.inner.options.clone(),
        }
    }

    pub(crate) fn mark_bound(&self) {
        self.inner.events.emit(QueueEvent::Bound);
    }
}

impl QueueInner {
    fn label(&self) -> String {
        format!("Queue {:?}", self.options.name)
    }

    fn closed_error(&self) -> HutchError {
        HutchError::Closed(self.label())
    }

    async fn declare(&self, channel: &Arc<dyn BrokerChannel>) -> Result<QueueLink> {
        let prefetch = self.options.prefetch.unwrap_or(DEFAULT_PREFETCH);
        if prefetch > 0 {
            channel.set_prefetch(prefetch).await?;
        }
        let info = channel
            .declare_queue(&self.options.name, &self.options)
            .await?;
        debug!(
            queue = %info.name,
            messages = info.message_count,
            consumers = info.consumer_count,
            "Queue declared"
        );
        Ok(QueueLink {
            channel: channel.clone(),
            name: info.name,
        })
    }

    /// Moves to `Closed` and announces it. Returns false if already closed.
    fn teardown(&self, cause: Option<HutchError>) -> bool {
        let first = self.state.send_if_modified(|state| {
            if *state == QueueState::Closed {
                return false;
            }
            *state = QueueState::Closed;
            true
        });
        if !first {
            return false;
        }

        *lock(&self.close_cause) = cause.clone();
        lock(&self.link).take();
        lock(&self.consumer_tag).take();
        self.gate.close();

        match &cause {
            Some(e) => warn!(queue = %self.options.name, "Queue closed: {}", e),
            None => info!(queue = %self.options.name, "Queue closed"),
        }
        self.events.emit(QueueEvent::Close(cause));
        true
    }

    async fn wait_closed(&self) -> Option<HutchError> {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == QueueState::Closed).await;
        lock(&self.close_cause).clone()
    }
}

fn watch_channel(inner: Weak<QueueInner>, channel: Arc<dyn BrokerChannel>) {
    tokio::spawn(async move {
        let cause = channel.closed().await;
        if let Some(inner) = inner.upgrade() {
            inner.teardown(cause);
        }
    });
}

async fn run_consumer<F, Fut>(
    inner: Weak<QueueInner>,
    link: QueueLink,
    tag: String,
    mut stream: DeliveryStream,
    no_ack: bool,
    handler: Arc<F>,
) where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    while let Some(delivery) = stream.recv().await {
        let delivery_tag = delivery.delivery_tag;
        let body = delivery.body.clone();
        let decoded = codec::decode(body, delivery.properties.content_type.as_deref());

        match decoded {
            Ok(payload) => {
                let message = Message::new(delivery, payload, link.channel.clone(), no_ack);
                let handler = handler.clone();
                tokio::spawn(async move { handler(message).await });
            }
            Err(e) => {
                warn!(queue = %link.name, delivery_tag, "Rejecting undecodable message: {}", e);
                if let Some(inner) = inner.upgrade() {
                    inner.events.emit(QueueEvent::Error(e));
                }
                if !no_ack {
                    if let Err(e) = link.channel.nack(delivery_tag, false, false).await {
                        error!(queue = %link.name, "Failed to reject message: {}", e);
                    }
                }
            }
        }
    }

    debug!(queue = %link.name, consumer = %tag, "Delivery stream ended");
    // the broker ended the consumer without a cancel from us
    if let Some(inner) = inner.upgrade() {
        let mut current = lock(&inner.consumer_tag);
        if current.as_deref() == Some(tag.as_str()) {
            *current = None;
            inner.state.send_if_modified(|state| {
                if *state == QueueState::Consuming {
                    *state = QueueState::Ready;
                    true
                } else {
                    false
                }
            });
        }
    }
}
