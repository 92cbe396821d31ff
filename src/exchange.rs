use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerChannel, BrokerConnection, MessageProperties};
use crate::config::{
    ConsumeOptions, ExchangeOptions, PublishOptions, QueueOptions, DEFAULT_PREFETCH,
};
use crate::errors::{HutchError, Result};
use crate::message::Message;
use crate::messaging::codec::{self, Payload};
use crate::messaging::correlation::{ReplyFuture, ReplyTable};
use crate::messaging::events::{EventBus, ExchangeEvent};
use crate::messaging::lock;
use crate::messaging::readiness::ReadyGate;
use crate::queue::Queue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
}

impl ExchangeType {
    /// The broker's pre-declared exchange of this type.
    pub fn default_name(self) -> &'static str {
        match self {
            ExchangeType::Direct => "amq.direct",
            ExchangeType::Fanout => "amq.fanout",
            ExchangeType::Topic => "amq.topic",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeType {
    type Err = HutchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeType::Direct),
            "fanout" => Ok(ExchangeType::Fanout),
            "topic" => Ok(ExchangeType::Topic),
            _ => Err(HutchError::UnknownExchangeType(s.to_string())),
        }
    }
}

/// Effective exchange name: no name means the type's default exchange, an
/// empty name is the nameless exchange, anything else is kept.
pub fn resolve_exchange_name(kind: Option<ExchangeType>, name: Option<&str>) -> Result<String> {
    let kind = kind.ok_or(HutchError::MissingExchangeType)?;
    Ok(match name {
        Some(name) => name.to_string(),
        None => kind.default_name().to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeState {
    Unconnected,
    ChannelOpen,
    Declared,
    Ready,
    Closed,
}

#[derive(Clone)]
struct ExchangeLink {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    reply_to: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExchangeInternals {
    pub name: String,
    pub kind: ExchangeType,
    pub state: ExchangeState,
    pub channel: Option<String>,
    pub reply_queue: Option<String>,
    pub pending_replies: usize,
    pub in_flight: usize,
    pub pending_operations: usize,
    pub options: ExchangeOptions,
}

/// One broker exchange on its own channel.
///
/// Publishing and requesting may start right away: anything sent before the
/// exchange is ready is held and flushed, in order, once it is.
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<ExchangeInner>,
}

struct ExchangeInner {
    name: String,
    kind: ExchangeType,
    options: ExchangeOptions,
    /// Given to queues created here that leave prefetch unset.
    prefetch: u16,
    state: watch::Sender<ExchangeState>,
    events: EventBus<ExchangeEvent>,
    gate: ReadyGate<ExchangeLink>,
    attached: AtomicBool,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    reply_queue: Mutex<Option<Queue>>,
    replies: ReplyTable,
    in_flight: AtomicUsize,
    close_cause: Mutex<Option<HutchError>>,
}

impl Exchange {
    pub fn new(
        kind: Option<ExchangeType>,
        name: Option<&str>,
        options: ExchangeOptions,
    ) -> Result<Self> {
        Self::with_prefetch(kind, name, options, DEFAULT_PREFETCH)
    }

    pub(crate) fn with_prefetch(
        kind: Option<ExchangeType>,
        name: Option<&str>,
        options: ExchangeOptions,
        prefetch: u16,
    ) -> Result<Self> {
        let name = resolve_exchange_name(kind, name)?;
        let kind = kind.ok_or(HutchError::MissingExchangeType)?;
        let (state, _rx) = watch::channel(ExchangeState::Unconnected);

        Ok(Self {
            inner: Arc::new(ExchangeInner {
                gate: ReadyGate::new(format!("Exchange {:?}", name)),
                name,
                kind,
                options,
                prefetch,
                state,
                events: EventBus::new(),
                attached: AtomicBool::new(false),
                channel: Mutex::new(None),
                reply_queue: Mutex::new(None),
                replies: ReplyTable::new(),
                in_flight: AtomicUsize::new(0),
                close_cause: Mutex::new(None),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> ExchangeType {
        self.inner.kind
    }

    pub fn options(&self) -> &ExchangeOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ExchangeState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.inner.events.subscribe()
    }

    /// Attaches to `connection`: opens a channel, declares the exchange and
    /// sets up the reply queue, then flushes everything sent so far.
    pub async fn connect(&self, connection: Arc<dyn BrokerConnection>) -> Result<()> {
        if self.state() == ExchangeState::Closed {
            return Err(self.inner.closed_error());
        }
        if self.inner.attached.swap(true, Ordering::SeqCst) {
            return Err(HutchError::AlreadyConnected(self.inner.label()));
        }
        self.inner.events.emit(ExchangeEvent::Connected);

        match self.inner.establish(connection).await {
            Ok(link) => {
                if !self.inner.advance(ExchangeState::Ready) {
                    return Err(self.inner.closed_error());
                }
                info!(exchange = %self.inner.name, kind = %self.inner.kind, "Exchange ready");
                self.inner.events.emit(ExchangeEvent::Ready);
                self.inner.gate.open(link).await;
                Ok(())
            }
            Err(e) => {
                error!(exchange = %self.inner.name, "Exchange setup failed: {}", e);
                let _ = self.inner.teardown(Some(e.clone())).await;
                Err(e)
            }
        }
    }

    /// Creates a queue that attaches once this exchange is ready.
    ///
    /// Unless the exchange is nameless, every requested routing key is bound
    /// (the queue's own name when none are given) and the queue then emits
    /// `Bound`. A failed binding, or the queue closing with an error, closes
    /// this exchange.
    pub fn queue(&self, mut options: QueueOptions) -> Result<Queue> {
        if self.state() == ExchangeState::Closed {
            return Err(self.inner.closed_error());
        }
        let runtime = Handle::try_current().map_err(|_| HutchError::NoRuntime)?;
        options.prefetch.get_or_insert(self.inner.prefetch);

        let queue = Queue::new(options);
        runtime.spawn(watch_queue(Arc::downgrade(&self.inner), queue.clone()));
        runtime.spawn(attach_queue(self.inner.clone(), queue.clone()));
        Ok(queue)
    }

    /// Publishes `payload`. Before the exchange is ready the send is held
    /// and performed on readiness.
    pub async fn publish(&self, payload: impl Into<Payload>, options: PublishOptions) -> Result<()> {
        self.send(payload.into(), options, None).await
    }

    /// Publishes `payload` and resolves with the consumer's reply.
    pub async fn request(
        &self,
        payload: impl Into<Payload>,
        options: PublishOptions,
    ) -> Result<ReplyFuture> {
        if self.inner.options.no_reply {
            return Err(HutchError::RepliesDisabled(self.inner.name.clone()));
        }

        let (correlation_id, reply) = self.inner.replies.register();
        // dropping this future before the send completes abandons the request
        let registration = self.inner.replies.hold(&correlation_id);
        self.send(payload.into(), options, Some(correlation_id.clone()))
            .await?;
        registration.keep();
        Ok(reply)
    }

    /// Closes the reply queue and the channel. Terminal.
    pub async fn close(&self) -> Result<()> {
        self.inner.teardown(None).await
    }

    /// Resolves once the exchange is ready, or fails if it closes first.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let state = *rx
            .wait_for(|state| matches!(state, ExchangeState::Ready | ExchangeState::Closed))
            .await
            .map_err(|_| self.inner.closed_error())?;

        match state {
            ExchangeState::Closed => Err(self.inner.closed_error()),
            _ => Ok(()),
        }
    }

    /// Resolves with the close cause; `None` for a requested close.
    pub async fn closed(&self) -> Option<HutchError> {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == ExchangeState::Closed).await;
        lock(&self.inner.close_cause).clone()
    }

    pub fn internals(&self) -> ExchangeInternals {
        let channel = lock(&self.inner.channel).as_ref().map(|c| c.id());
        let reply_queue = lock(&self.inner.reply_queue).as_ref().map(Queue::name);
        ExchangeInternals {
            name: self.inner.name.clone(),
            kind: self.inner.kind,
            state: self.state(),
            channel,
            reply_queue,
            pending_replies: self.inner.replies.len(),
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
            pending_operations: self.inner.gate.backlog(),
            options: self.inner.options.clone(),
        }
    }

    /// Closes an exchange that will never get a connection.
    pub(crate) async fn abandon(&self, cause: HutchError) {
        let _ = self.inner.teardown(Some(cause)).await;
    }

    async fn send(
        &self,
        payload: Payload,
        options: PublishOptions,
        correlation_id: Option<String>,
    ) -> Result<()> {
        let body = codec::encode(payload, &options.content_type)?;
        let mut properties = publish_properties(&options);
        properties.correlation_id = correlation_id;

        // settles even if the caller stops waiting or the gate drops the send
        let in_flight = InFlight::start(&self.inner);
        let weak = Arc::downgrade(&self.inner);
        let exchange = self.inner.name.clone();
        let sent = self
            .inner
            .gate
            .run(move |link: ExchangeLink| async move {
                if let Some(correlation_id) = &properties.correlation_id {
                    let waiting = weak
                        .upgrade()
                        .is_some_and(|inner| inner.replies.is_pending(correlation_id));
                    if !waiting {
                        debug!(
                            exchange = %exchange,
                            correlation_id = %correlation_id,
                            "Skipping request abandoned before it was sent"
                        );
                        return Ok(());
                    }
                    properties.reply_to = link.reply_to.clone();
                }
                debug!(
                    exchange = %exchange,
                    routing_key = %options.routing_key,
                    bytes = body.len(),
                    "Publishing message"
                );
                let flushed = link
                    .channel
                    .publish(&exchange, &options.routing_key, body, properties)
                    .await?;
                if !flushed {
                    let channel = link.channel;
                    tokio::spawn(async move {
                        channel.drained().await;
                        drop(in_flight);
                    });
                }
                Ok(())
            })
            .await;

        if let Err(e) = &sent {
            warn!(exchange = %self.inner.name, "Publish failed: {}", e);
        }
        sent
    }
}

/// Counts one send as in flight until dropped.
struct InFlight(Weak<ExchangeInner>);

impl InFlight {
    fn start(inner: &Arc<ExchangeInner>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(Arc::downgrade(inner))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(inner) = self.0.upgrade() {
            inner.finish_send();
        }
    }
}

impl ExchangeInner {
    fn label(&self) -> String {
        format!("Exchange {:?}", self.name)
    }

    fn closed_error(&self) -> HutchError {
        HutchError::Closed(self.label())
    }

    /// Moves forward unless the exchange closed in the meantime.
    fn advance(&self, next: ExchangeState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ExchangeState::Closed {
                return false;
            }
            *state = next;
            true
        })
    }

    async fn establish(self: &Arc<Self>, connection: Arc<dyn BrokerConnection>) -> Result<ExchangeLink> {
        let channel = connection.create_channel().await?;
        *lock(&self.channel) = Some(channel.clone());
        if !self.advance(ExchangeState::ChannelOpen) {
            let _ = channel.close().await;
            return Err(self.closed_error());
        }
        debug!(exchange = %self.name, channel = %channel.id(), "Channel open");
        watch_channel(Arc::downgrade(self), channel.clone());

        if !self.name.is_empty() {
            channel
                .declare_exchange(&self.name, self.kind, &self.options)
                .await?;
            if !self.advance(ExchangeState::Declared) {
                return Err(self.closed_error());
            }
            debug!(exchange = %self.name, "Exchange declared");
        }

        let reply_to = if self.options.no_reply {
            None
        } else {
            Some(self.open_reply_queue(&connection).await?)
        };

        Ok(ExchangeLink {
            connection,
            channel,
            reply_to,
        })
    }

    async fn open_reply_queue(self: &Arc<Self>, connection: &Arc<dyn BrokerConnection>) -> Result<String> {
        let queue = Queue::new(QueueOptions::reply());
        *lock(&self.reply_queue) = Some(queue.clone());
        tokio::spawn(watch_reply_queue(Arc::downgrade(self), queue.clone()));

        queue.connect(connection).await?;
        let weak = Arc::downgrade(self);
        queue
            .consume(
                move |message: Message| {
                    let inner = weak.clone();
                    async move {
                        if let Some(inner) = inner.upgrade() {
                            inner.deliver_reply(message);
                        }
                    }
                },
                ConsumeOptions {
                    no_ack: true,
                    exclusive: true,
                    consumer_tag: None,
                },
            )
            .await?;

        let name = queue.name();
        debug!(exchange = %self.name, reply_queue = %name, "Reply queue consuming");
        Ok(name)
    }

    fn deliver_reply(&self, message: Message) {
        let Some(correlation_id) = message.correlation_id().map(str::to_string) else {
            debug!(exchange = %self.name, "Ignoring reply without a correlation id");
            return;
        };
        if !self.replies.resolve(&correlation_id, message.into_payload()) {
            debug!(
                exchange = %self.name,
                correlation_id = %correlation_id,
                "Ignoring reply for an unknown request"
            );
        }
    }

    fn finish_send(&self) {
        let last = self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1;
        if last && *self.state.borrow() != ExchangeState::Closed {
            self.events.emit(ExchangeEvent::Drain);
        }
    }

    /// Moves to `Closed`, fails everything waiting and releases the reply
    /// queue and channel. Only the first call does anything.
    async fn teardown(&self, cause: Option<HutchError>) -> Result<()> {
        let first = self.state.send_if_modified(|state| {
            if *state == ExchangeState::Closed {
                return false;
            }
            *state = ExchangeState::Closed;
            true
        });
        if !first {
            return Ok(());
        }

        *lock(&self.close_cause) = cause.clone();
        let channel = lock(&self.channel).take();
        let reply_queue = lock(&self.reply_queue).take();
        self.gate.close();
        self.replies.clear();

        match &cause {
            Some(e) => warn!(exchange = %self.name, "Exchange closed: {}", e),
            None => info!(exchange = %self.name, "Exchange closed"),
        }
        self.events.emit(ExchangeEvent::Close(cause.clone()));

        if let Some(queue) = reply_queue {
            let _ = queue.close().await;
        }
        match channel {
            Some(channel) if cause.is_none() => channel.close().await,
            Some(channel) => {
                let _ = channel.close().await;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

fn publish_properties(options: &PublishOptions) -> MessageProperties {
    MessageProperties {
        content_type: Some(options.content_type.clone()),
        content_encoding: options.content_encoding.clone(),
        headers: options.headers.clone(),
        delivery_mode: options.persistent.then_some(2),
        priority: options.priority,
        expiration: options.expiration_ms.map(|ms| ms.to_string()),
        message_id: Some(
            options
                .message_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        ),
        timestamp: u64::try_from(Utc::now().timestamp()).ok(),
        app_id: options.app_id.clone(),
        ..MessageProperties::default()
    }
}

fn watch_channel(inner: Weak<ExchangeInner>, channel: Arc<dyn BrokerChannel>) {
    tokio::spawn(async move {
        let cause = channel.closed().await;
        if let Some(inner) = inner.upgrade() {
            let _ = inner.teardown(cause).await;
        }
    });
}

async fn watch_reply_queue(inner: Weak<ExchangeInner>, queue: Queue) {
    let cause = queue.closed().await;
    if let Some(inner) = inner.upgrade() {
        let _ = inner.teardown(cause).await;
    }
}

async fn watch_queue(inner: Weak<ExchangeInner>, queue: Queue) {
    if let Some(cause) = queue.closed().await {
        if let Some(inner) = inner.upgrade() {
            let _ = inner.teardown(Some(cause)).await;
        }
    }
}

async fn attach_queue(inner: Arc<ExchangeInner>, queue: Queue) {
    let link = match inner.gate.wait().await {
        Ok(link) => link,
        Err(e) => {
            debug!(exchange = %inner.name, queue = %queue.name(), "Queue not attached: {}", e);
            let _ = queue.close().await;
            return;
        }
    };

    if let Err(e) = queue.connect(&link.connection).await {
        // the queue's own close tears the exchange down
        error!(exchange = %inner.name, "Queue failed to attach: {}", e);
        return;
    }
    if inner.name.is_empty() {
        return;
    }

    let mut keys = queue.options().keys.clone();
    if keys.is_empty() {
        keys.push(queue.name());
    }
    let bindings = keys.iter().map(|key| queue.bind(&inner.name, key));
    match try_join_all(bindings).await {
        Ok(_) => {
            info!(exchange = %inner.name, queue = %queue.name(), keys = ?keys, "Queue bound");
            queue.mark_bound();
        }
        Err(e) => {
            error!(exchange = %inner.name, queue = %queue.name(), "Binding failed: {}", e);
            let _ = inner.teardown(Some(e)).await;
        }
    }
}
