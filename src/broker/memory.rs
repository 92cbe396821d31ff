//! In-process broker.
//!
//! Implements the broker traits without a network: direct, fanout and topic
//! routing, the nameless exchange, per-consumer prefetch, ack/nack with
//! requeue, purge, cancel, exclusive and auto-delete queues. The fault hooks
//! let tests drop channels or connections and fail bindings on demand.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use super::{
    BrokerChannel, BrokerConnection, BrokerConnector, CloseSignal, Delivery, DeliveryStream,
    MessageProperties, QueueInfo,
};
use crate::config::{ConnectionOptions, ConsumeOptions, ExchangeOptions, QueueOptions};
use crate::errors::{HutchError, Result};
use crate::exchange::ExchangeType;
use crate::messaging::lock;

#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    saturated: Arc<watch::Sender<bool>>,
    declares_held: Arc<watch::Sender<bool>>,
}

struct BrokerState {
    exchanges: HashMap<String, ExchangeEntry>,
    queues: HashMap<String, QueueEntry>,
    channels: HashMap<u64, ChannelEntry>,
    connections: HashMap<u64, CloseSignal>,
    next_id: u64,
    next_delivery_tag: u64,
    refuse_connections: bool,
    failing_keys: HashSet<String>,
    failing_cancels: bool,
    close_failure: Option<String>,
}

struct ExchangeEntry {
    kind: ExchangeType,
    /// (queue, routing key)
    bindings: Vec<(String, String)>,
}

struct QueueEntry {
    messages: VecDeque<Envelope>,
    consumers: Vec<ConsumerEntry>,
    cursor: usize,
    owner: Option<u64>,
    auto_delete: bool,
    had_consumer: bool,
}

#[derive(Clone)]
struct Envelope {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct ConsumerEntry {
    tag: String,
    channel: u64,
    no_ack: bool,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct ChannelEntry {
    connection: u64,
    prefetch: u16,
    signal: CloseSignal,
    unacked: BTreeMap<u64, Unacked>,
}

struct Unacked {
    queue: String,
    consumer: String,
    envelope: Envelope,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let mut exchanges = HashMap::new();
        for kind in [ExchangeType::Direct, ExchangeType::Fanout, ExchangeType::Topic] {
            exchanges.insert(
                kind.default_name().to_string(),
                ExchangeEntry {
                    kind,
                    bindings: Vec::new(),
                },
            );
        }

        let (saturated, _rx) = watch::channel(false);
        let (declares_held, _rx) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                exchanges,
                queues: HashMap::new(),
                channels: HashMap::new(),
                connections: HashMap::new(),
                next_id: 0,
                next_delivery_tag: 0,
                refuse_connections: false,
                failing_keys: HashSet::new(),
                failing_cancels: false,
                close_failure: None,
            })),
            saturated: Arc::new(saturated),
            declares_held: Arc::new(declares_held),
        }
    }

    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        Arc::new(self.clone())
    }

    // ---- fault hooks

    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.state).refuse_connections = refuse;
    }

    /// Every later bind with this routing key fails.
    pub fn fail_bindings_for(&self, key: impl Into<String>) {
        lock(&self.state).failing_keys.insert(key.into());
    }

    /// Consumer cancels fail while set; the channel stays open.
    pub fn fail_cancels(&self, fail: bool) {
        lock(&self.state).failing_cancels = fail;
    }

    /// The next connection close still tears the connection down but reports
    /// `reason` as an error.
    pub fn fail_close(&self, reason: impl Into<String>) {
        lock(&self.state).close_failure = Some(reason.into());
    }

    /// Queue declarations wait while held.
    pub fn hold_declares(&self, hold: bool) {
        self.declares_held.send_replace(hold);
    }

    /// Closes every open channel with `reason`, as a broker-side channel error would.
    pub fn drop_channels(&self, reason: &str) {
        let mut state = lock(&self.state);
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(id, Some(reason.to_string()));
        }
    }

    /// Closes the one channel whose `id()` is `channel_id`. Returns false if
    /// no such channel is open.
    pub fn drop_channel(&self, channel_id: &str, reason: &str) -> bool {
        let Some(id) = channel_id
            .strip_prefix("memory-")
            .and_then(|id| id.parse::<u64>().ok())
        else {
            return false;
        };
        let mut state = lock(&self.state);
        let open = state.channels.contains_key(&id);
        state.close_channel(id, Some(reason.to_string()));
        open
    }

    /// Severs every connection with `reason`.
    pub fn drop_connections(&self, reason: &str) {
        let mut state = lock(&self.state);
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id, Some(reason.to_string()));
        }
    }

    /// While saturated, publishes report a full write buffer and
    /// `drained` waits until this is switched off again.
    pub fn set_saturated(&self, saturated: bool) {
        self.saturated.send_replace(saturated);
    }

    // ---- inspection

    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        lock(&self.state).queues.get(queue).map(|q| q.messages.len())
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        lock(&self.state).queues.get(queue).map(|q| q.consumers.len())
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        lock(&self.state).exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        lock(&self.state).queues.contains_key(name)
    }

    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        lock(&self.state)
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }

    pub fn open_channels(&self) -> usize {
        lock(&self.state).channels.len()
    }

    fn with_channel<T>(
        &self,
        channel: u64,
        op: impl FnOnce(&mut BrokerState) -> Result<T>,
    ) -> Result<T> {
        let mut state = lock(&self.state);
        if !state.channels.contains_key(&channel) {
            return Err(HutchError::ChannelError(format!("channel {} is closed", channel)));
        }
        op(&mut state)
    }
}

impl BrokerState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }

        let entry = self.exchanges.get(exchange).ok_or_else(|| {
            HutchError::PublishError(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        let mut targets: Vec<String> = Vec::new();
        for (queue, key) in &entry.bindings {
            let matched = match entry.kind {
                ExchangeType::Direct => key == routing_key,
                ExchangeType::Fanout => true,
                ExchangeType::Topic => topic_matches(key, routing_key),
            };
            if matched && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        Ok(targets)
    }

    /// Hands queued messages to consumers that have prefetch room, round robin.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&idx| has_capacity(&self.channels, &queue.consumers[idx]));
            let Some(idx) = chosen else {
                return;
            };
            let Some(envelope) = queue.messages.pop_front() else {
                return;
            };

            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;
            queue.cursor = (idx + 1) % count;

            let consumer = &queue.consumers[idx];
            let delivery = Delivery {
                delivery_tag,
                exchange: envelope.exchange.clone(),
                routing_key: envelope.routing_key.clone(),
                redelivered: envelope.redelivered,
                body: envelope.body.clone(),
                properties: envelope.properties.clone(),
            };

            if consumer.tx.send(delivery).is_err() {
                // consumer stream dropped
                queue.messages.push_front(envelope);
                queue.consumers.remove(idx);
                queue.cursor = 0;
                continue;
            }

            if !consumer.no_ack {
                let unacked = Unacked {
                    queue: queue_name.to_string(),
                    consumer: consumer.tag.clone(),
                    envelope,
                };
                if let Some(channel) = self.channels.get_mut(&consumer.channel) {
                    channel.unacked.insert(delivery_tag, unacked);
                }
            }
        }
    }

    fn settle(&mut self, channel: u64, delivery_tag: u64, multiple: bool) -> Result<Vec<(u64, Unacked)>> {
        let entry = self
            .channels
            .get_mut(&channel)
            .ok_or_else(|| HutchError::AckError(format!("channel {} is closed", channel)))?;

        if multiple {
            let tags: Vec<u64> = entry.unacked.range(..=delivery_tag).map(|(tag, _)| *tag).collect();
            Ok(tags
                .into_iter()
                .filter_map(|tag| entry.unacked.remove(&tag).map(|u| (tag, u)))
                .collect())
        } else {
            entry
                .unacked
                .remove(&delivery_tag)
                .map(|u| vec![(delivery_tag, u)])
                .ok_or_else(|| {
                    HutchError::AckError(format!(
                        "PRECONDITION_FAILED - unknown delivery tag {}",
                        delivery_tag
                    ))
                })
        }
    }

    fn requeue(&mut self, mut settled: Vec<(u64, Unacked)>) -> HashSet<String> {
        let mut touched = HashSet::new();
        // highest tag first so the oldest delivery ends up at the front
        settled.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, unacked) in settled {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                let mut envelope = unacked.envelope;
                envelope.redelivered = true;
                queue.messages.push_front(envelope);
                touched.insert(unacked.queue);
            }
        }
        touched
    }

    fn remove_consumer(&mut self, channel: u64, tag: &str) -> Option<String> {
        let queue_name = self.queues.iter().find_map(|(name, queue)| {
            queue
                .consumers
                .iter()
                .any(|c| c.channel == channel && c.tag == tag)
                .then(|| name.clone())
        })?;

        let mut delete = false;
        if let Some(queue) = self.queues.get_mut(&queue_name) {
            queue.consumers.retain(|c| !(c.channel == channel && c.tag == tag));
            queue.cursor = 0;
            delete = queue.auto_delete && queue.had_consumer && queue.consumers.is_empty();
        }
        if delete {
            self.delete_queue(&queue_name);
        }
        Some(queue_name)
    }

    fn delete_queue(&mut self, name: &str) {
        debug!(queue = %name, "Deleting queue");
        self.queues.remove(name);
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(queue, _)| queue != name);
        }
    }

    fn close_channel(&mut self, id: u64, reason: Option<String>) {
        let Some(entry) = self.channels.remove(&id) else {
            return;
        };

        let settled: Vec<(u64, Unacked)> = entry.unacked.into_iter().collect();
        let mut touched = self.requeue(settled);

        let tags: Vec<String> = self
            .queues
            .values()
            .flat_map(|q| q.consumers.iter().filter(|c| c.channel == id).map(|c| c.tag.clone()))
            .collect();
        for tag in tags {
            if let Some(queue) = self.remove_consumer(id, &tag) {
                touched.insert(queue);
            }
        }

        entry.signal.fire(reason);
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, id: u64, reason: Option<String>) {
        let Some(signal) = self.connections.remove(&id) else {
            return;
        };

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == id)
            .map(|(channel, _)| *channel)
            .collect();
        for channel in channels {
            self.close_channel(channel, reason.clone());
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in exclusive {
            self.delete_queue(&queue);
        }

        signal.fire(reason);
    }
}

fn has_capacity(channels: &HashMap<u64, ChannelEntry>, consumer: &ConsumerEntry) -> bool {
    if consumer.no_ack {
        return true;
    }
    let Some(channel) = channels.get(&consumer.channel) else {
        return false;
    };
    if channel.prefetch == 0 {
        return true;
    }
    let outstanding = channel
        .unacked
        .values()
        .filter(|u| u.consumer == consumer.tag)
        .count();
    outstanding < usize::from(channel.prefetch)
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &words)
}

fn match_words(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| match_words(rest, &words[skip..])),
        Some((&"*", rest)) => words
            .split_first()
            .is_some_and(|(_, tail)| match_words(rest, tail)),
        Some((word, rest)) => words
            .split_first()
            .is_some_and(|(first, tail)| first == word && match_words(rest, tail)),
    }
}

fn as_count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(
        &self,
        _url: &str,
        _options: &ConnectionOptions,
    ) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = lock(&self.state);
        if state.refuse_connections {
            return Err(HutchError::ConnectionError("connection refused".to_string()));
        }
        let id = state.allocate_id();
        let signal = CloseSignal::new();
        state.connections.insert(id, signal.clone());
        debug!(connection = id, "Memory connection opened");

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
            signal,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    signal: CloseSignal,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = lock(&self.broker.state);
        if !state.connections.contains_key(&self.id) {
            return Err(HutchError::ConnectionError("connection is closed".to_string()));
        }
        let id = state.allocate_id();
        let signal = CloseSignal::new();
        state.channels.insert(
            id,
            ChannelEntry {
                connection: self.id,
                prefetch: 0,
                signal: signal.clone(),
                unacked: BTreeMap::new(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            connection: self.id,
            signal,
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut state = lock(&self.broker.state);
        state.close_connection(self.id, None);
        match state.close_failure.take() {
            Some(reason) => Err(HutchError::ConnectionError(reason)),
            None => Ok(()),
        }
    }

    async fn closed(&self) -> Option<HutchError> {
        self.signal.wait().await.map(HutchError::ConnectionError)
    }

    fn is_connected(&self) -> bool {
        !self.signal.is_fired()
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    connection: u64,
    signal: CloseSignal,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> String {
        format!("memory-{}", self.id)
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.broker.with_channel(self.id, |state| {
            if let Some(channel) = state.channels.get_mut(&self.id) {
                channel.prefetch = count;
            }
            Ok(())
        })
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        _options: &ExchangeOptions,
    ) -> Result<()> {
        self.broker.with_channel(self.id, |state| {
            if name.is_empty() {
                return Err(HutchError::DeclareError {
                    name: name.to_string(),
                    reason: "ACCESS_REFUSED - the default exchange cannot be declared".to_string(),
                });
            }
            match state.exchanges.get(name) {
                Some(existing) if existing.kind != kind => Err(HutchError::DeclareError {
                    name: name.to_string(),
                    reason: format!(
                        "PRECONDITION_FAILED - exchange is of type {}, not {}",
                        existing.kind, kind
                    ),
                }),
                Some(_) => Ok(()),
                None => {
                    state.exchanges.insert(
                        name.to_string(),
                        ExchangeEntry {
                            kind,
                            bindings: Vec::new(),
                        },
                    );
                    Ok(())
                }
            }
        })
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<QueueInfo> {
        let mut held = self.broker.declares_held.subscribe();
        let _ = held.wait_for(|held| !*held).await;
        self.broker.with_channel(self.id, |state| {
            let name = if name.is_empty() {
                format!("amq.gen-{}", Uuid::new_v4().simple())
            } else {
                name.to_string()
            };

            let queue = state.queues.entry(name.clone()).or_insert_with(|| QueueEntry {
                messages: VecDeque::new(),
                consumers: Vec::new(),
                cursor: 0,
                owner: options.exclusive.then_some(self.connection),
                auto_delete: options.auto_delete,
                had_consumer: false,
            });

            if queue.owner.is_some_and(|owner| owner != self.connection) {
                return Err(HutchError::DeclareError {
                    name,
                    reason: "RESOURCE_LOCKED - queue is exclusive to another connection"
                        .to_string(),
                });
            }

            Ok(QueueInfo {
                message_count: as_count(queue.messages.len()),
                consumer_count: as_count(queue.consumers.len()),
                name,
            })
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.broker.with_channel(self.id, |state| {
            let bind_error = |reason: String| HutchError::BindError {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                key: routing_key.to_string(),
                reason,
            };

            if state.failing_keys.contains(routing_key) {
                return Err(bind_error("binding refused by broker".to_string()));
            }
            if !state.queues.contains_key(queue) {
                return Err(bind_error(format!("NOT_FOUND - no queue '{}'", queue)));
            }
            let entry = state
                .exchanges
                .get_mut(exchange)
                .ok_or_else(|| bind_error(format!("NOT_FOUND - no exchange '{}'", exchange)))?;

            let binding = (queue.to_string(), routing_key.to_string());
            if !entry.bindings.contains(&binding) {
                entry.bindings.push(binding);
            }
            Ok(())
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<bool> {
        self.broker.with_channel(self.id, |state| {
            let targets = state.route(exchange, routing_key)?;
            let envelope = Envelope {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body,
                properties,
                redelivered: false,
            };
            for queue in &targets {
                if let Some(entry) = state.queues.get_mut(queue) {
                    entry.messages.push_back(envelope.clone());
                }
                state.dispatch(queue);
            }
            Ok(())
        })?;

        Ok(!*self.broker.saturated.borrow())
    }

    async fn drained(&self) {
        let mut rx = self.broker.saturated.subscribe();
        let _ = rx.wait_for(|saturated| !*saturated).await;
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream> {
        self.broker.with_channel(self.id, |state| {
            let entry = state.queues.get_mut(queue).ok_or_else(|| {
                HutchError::ConsumeError(format!("NOT_FOUND - no queue '{}'", queue))
            })?;
            if entry.consumers.iter().any(|c| c.tag == consumer_tag) {
                return Err(HutchError::ConsumeError(format!(
                    "NOT_ALLOWED - consumer tag {} is already in use",
                    consumer_tag
                )));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            entry.consumers.push(ConsumerEntry {
                tag: consumer_tag.to_string(),
                channel: self.id,
                no_ack: options.no_ack,
                tx,
            });
            entry.had_consumer = true;
            state.dispatch(queue);
            Ok(rx)
        })
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.broker.with_channel(self.id, |state| {
            let settled = state.settle(self.id, delivery_tag, multiple)?;
            let touched: HashSet<String> = settled.into_iter().map(|(_, u)| u.queue).collect();
            for queue in touched {
                state.dispatch(&queue);
            }
            Ok(())
        })
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.broker.with_channel(self.id, |state| {
            let settled = state.settle(self.id, delivery_tag, multiple)?;
            let touched: HashSet<String> = if requeue {
                state.requeue(settled)
            } else {
                settled.into_iter().map(|(_, u)| u.queue).collect()
            };
            for queue in touched {
                state.dispatch(&queue);
            }
            Ok(())
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.broker.with_channel(self.id, |state| {
            if state.failing_cancels {
                return Err(HutchError::ChannelError(format!(
                    "cannot cancel consumer '{}'",
                    consumer_tag
                )));
            }
            state.remove_consumer(self.id, consumer_tag);
            Ok(())
        })
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32> {
        self.broker.with_channel(self.id, |state| {
            let entry = state.queues.get_mut(queue).ok_or_else(|| {
                HutchError::ChannelError(format!("NOT_FOUND - no queue '{}'", queue))
            })?;
            let purged = as_count(entry.messages.len());
            entry.messages.clear();
            Ok(purged)
        })
    }

    async fn close(&self) -> Result<()> {
        lock(&self.broker.state).close_channel(self.id, None);
        Ok(())
    }

    async fn closed(&self) -> Option<HutchError> {
        self.signal.wait().await.map(HutchError::ChannelError)
    }
}
