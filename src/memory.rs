// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A single-process AMQP 0-9-1 broker model implementing the
//! [`protocol`](crate::protocol) traits. It keeps the broker-side rules the
//! runtime depends on: FIFO queues, per-channel delivery tags, round-robin
//! consumers with prefetch, channel exceptions that close the channel,
//! requeue on channel close, transactions, publisher confirms and dead
//! lettering.
//!
//! Message TTLs and headers exchange matching are not modelled; a headers
//! exchange routes nothing.
//!
//! ```
//! # async fn run() -> Result<(), amqp_runtime::errors::AmqpError> {
//! use amqp_runtime::{config::AmqpConfig, connection::Connection, memory::MemoryBroker};
//!
//! let broker = MemoryBroker::new();
//! let conn = Connection::open_with(&broker, AmqpConfig::default()).await?;
//! let channel = conn.open_channel().await?;
//! # let _ = channel;
//! # Ok(())
//! # }
//! ```

use crate::{
    config::AmqpConfig,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    protocol::{
        ConfirmEvent, Confirmation, ConsumeEvent, ConsumeStream, Delivery, HeaderValue,
        MessageProperties, ProtocolChannel, ProtocolConnection, ProtocolConnector,
    },
    queue::{
        QueueBinding, QueueDefinition, AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
        AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, AMQP_HEADERS_MAX_LENGTH,
    },
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_CHANNEL_MAX: u16 = 2047;

#[derive(Debug, Clone)]
struct Stored {
    body: Vec<u8>,
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    redelivered: bool,
    /// Place in the queue, assigned on enqueue.
    position: u64,
}

impl Stored {
    fn delivery(&self, delivery_tag: u64) -> Delivery {
        Delivery {
            delivery_tag,
            body: self.body.clone(),
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            redelivered: self.redelivered,
            properties: self.properties.clone(),
        }
    }
}

struct ExchangeState {
    kind: ExchangeKind,
    /// (queue, binding key)
    bindings: Vec<(String, String)>,
}

struct ConsumerEntry {
    tag: String,
    channel: u64,
    no_ack: bool,
    events: mpsc::UnboundedSender<ConsumeEvent>,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<Stored>,
    next_position: u64,
    consumers: Vec<ConsumerEntry>,
    cursor: usize,
    owner: Option<u64>,
    auto_delete: bool,
    had_consumer: bool,
    max_length: Option<usize>,
    dead_letter: Option<(String, Option<String>)>,
}

struct Unacked {
    queue: String,
    message: Stored,
}

struct Confirms {
    events: mpsc::UnboundedSender<ConfirmEvent>,
    next_sequence: u64,
    held: Option<u64>,
}

struct ChannelState {
    id: u16,
    connection: u64,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    tx: Option<Vec<(String, String, Stored)>>,
    confirms: Option<Confirms>,
}

#[derive(Default)]
struct ConnectionState {
    channels: BTreeMap<u16, u64>,
}

struct BrokerState {
    credentials: Option<(String, String)>,
    channel_max: u16,
    get_delay: Duration,
    hold_confirms: bool,
    nack_publishes: bool,
    next_key: u64,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
}

impl Default for BrokerState {
    fn default() -> Self {
        let exchanges = [
            ("amq.direct", ExchangeKind::Direct),
            ("amq.fanout", ExchangeKind::Fanout),
            ("amq.topic", ExchangeKind::Topic),
        ]
        .into_iter()
        .map(|(name, kind)| {
            (
                name.to_owned(),
                ExchangeState {
                    kind,
                    bindings: vec![],
                },
            )
        })
        .collect();

        BrokerState {
            credentials: None,
            channel_max: DEFAULT_CHANNEL_MAX,
            get_delay: Duration::ZERO,
            hold_confirms: false,
            nack_publishes: false,
            next_key: 1,
            connections: HashMap::new(),
            channels: HashMap::new(),
            exchanges,
            queues: HashMap::new(),
        }
    }
}

impl BrokerState {
    fn next_key(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, String> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let Some(state) = self.exchanges.get(exchange) else {
            return Err(format!("NOT_FOUND - no exchange '{}'", exchange));
        };

        let mut targets: Vec<String> = vec![];
        for (queue, key) in &state.bindings {
            let routed = match state.kind {
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(key, routing_key),
                ExchangeKind::Headers => false,
            };
            if routed && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }

        Ok(targets)
    }

    fn deliver(&mut self, exchange: &str, routing_key: &str, message: Stored) -> Result<(), String> {
        for queue in self.route(exchange, routing_key)? {
            self.enqueue(&queue, message.clone());
        }
        Ok(())
    }

    fn enqueue(&mut self, name: &str, mut message: Stored) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };

        message.position = queue.next_position;
        queue.next_position += 1;
        queue.messages.push_back(message);
        if let Some(max) = queue.max_length {
            while queue.messages.len() > max {
                queue.messages.pop_front();
            }
        }

        self.pump(name);
    }

    /// Puts a message back at its original place in the queue.
    fn requeue(&mut self, name: &str, mut message: Stored) {
        if let Some(queue) = self.queues.get_mut(name) {
            message.redelivered = true;
            let at = queue
                .messages
                .partition_point(|queued| queued.position < message.position);
            queue.messages.insert(at, message);
        }
    }

    fn dead_letter(&mut self, name: &str, message: Stored) {
        let Some((exchange, key)) = self.queues.get(name).and_then(|q| q.dead_letter.clone()) else {
            debug!(queue = name, "discarding rejected message");
            return;
        };

        let routing_key = key.unwrap_or_else(|| message.routing_key.clone());
        if let Err(reason) = self.deliver(&exchange, &routing_key, message) {
            warn!(queue = name, reason = reason.as_str(), "dead lettering failed");
        }
    }

    /// Hands ready messages to consumers, round-robin, within prefetch.
    fn pump(&mut self, name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(name) else {
                return;
            };
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|idx| {
                    let consumer = &queue.consumers[*idx];
                    self.channels.get(&consumer.channel).is_some_and(|ch| {
                        consumer.no_ack
                            || ch.prefetch == 0
                            || ch.unacked.len() < usize::from(ch.prefetch)
                    })
                });
            let Some(idx) = chosen else {
                return;
            };
            let Some(message) = queue.messages.pop_front() else {
                return;
            };

            let consumer = &queue.consumers[idx];
            let Some(channel) = self.channels.get_mut(&consumer.channel) else {
                return;
            };

            let tag = channel.next_tag;
            channel.next_tag += 1;
            let delivery = message.delivery(tag);

            if consumer.events.send(ConsumeEvent::Delivery(delivery)).is_err() {
                queue.consumers.remove(idx);
                queue.messages.push_front(message);
                continue;
            }

            if !consumer.no_ack {
                channel.unacked.insert(
                    tag,
                    Unacked {
                        queue: name.to_owned(),
                        message,
                    },
                );
            }
            queue.cursor = idx + 1;
        }
    }

    fn pump_all(&mut self) {
        let names = self.queues.keys().cloned().collect::<Vec<_>>();
        for name in names {
            self.pump(&name);
        }
    }

    fn delete_auto_queue(&mut self, name: &str) {
        let unused = self
            .queues
            .get(name)
            .is_some_and(|q| q.auto_delete && q.had_consumer && q.consumers.is_empty());
        if unused {
            self.remove_queue(name);
        }
    }

    fn remove_queue(&mut self, name: &str) -> bool {
        let Some(queue) = self.queues.remove(name) else {
            return false;
        };

        for consumer in queue.consumers {
            let _ = consumer.events.send(ConsumeEvent::Cancelled);
        }
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(q, _)| q != name);
        }

        debug!(queue = name, "queue deleted");
        true
    }

    /// Closes a channel: consumers go away and unacked messages are requeued.
    fn close_channel(&mut self, key: u64) {
        let Some(channel) = self.channels.remove(&key) else {
            return;
        };

        if let Some(conn) = self.connections.get_mut(&channel.connection) {
            conn.channels.remove(&channel.id);
        }

        for (_, unacked) in channel.unacked.into_iter().rev() {
            self.requeue(&unacked.queue, unacked.message);
        }

        let mut emptied = vec![];
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel != key);
            if queue.consumers.len() != before {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            self.delete_auto_queue(&name);
        }

        self.pump_all();
    }

    /// Raises a channel exception: the channel is closed by the broker.
    fn fail_channel(&mut self, key: u64, reason: String) -> AmqpError {
        warn!(reason = reason.as_str(), "channel exception");
        self.close_channel(key);
        AmqpError::ChannelError(reason)
    }

    fn close_connection(&mut self, key: u64) {
        let Some(conn) = self.connections.remove(&key) else {
            return;
        };

        for channel in conn.channels.into_values() {
            self.close_channel(channel);
        }

        let exclusive = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(key))
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();
        for name in exclusive {
            self.remove_queue(&name);
        }
    }

    fn channel_mut(&mut self, key: u64) -> Result<&mut ChannelState, AmqpError> {
        self.channels.get_mut(&key).ok_or(AmqpError::ChannelClosed)
    }

    fn publish(
        &mut self,
        key: u64,
        exchange: &str,
        routing_key: &str,
        message: Stored,
    ) -> Result<(), AmqpError> {
        let hold = self.hold_confirms;
        let reject = self.nack_publishes;
        let channel = self.channel_mut(key)?;

        if let Some(tx) = channel.tx.as_mut() {
            tx.push((exchange.to_owned(), routing_key.to_owned(), message));
            return Ok(());
        }

        let sequence = channel.confirms.as_mut().map(|confirms| {
            let sequence = confirms.next_sequence;
            confirms.next_sequence += 1;
            sequence
        });

        if let Err(reason) = self.deliver(exchange, routing_key, message) {
            return Err(self.fail_channel(key, reason));
        }

        if let (Some(sequence), Ok(channel)) = (sequence, self.channel_mut(key)) {
            if let Some(confirms) = channel.confirms.as_mut() {
                if reject {
                    let _ = confirms.events.send(ConfirmEvent {
                        sequence,
                        multiple: false,
                        confirmation: Confirmation::Nack("rejected by broker".to_owned()),
                    });
                } else if hold {
                    confirms.held = Some(sequence);
                } else {
                    let _ = confirms.events.send(ConfirmEvent {
                        sequence,
                        multiple: false,
                        confirmation: Confirmation::Ack,
                    });
                }
            }
        }

        Ok(())
    }

    fn settle(
        &mut self,
        key: u64,
        delivery_tag: u64,
        multiple: bool,
        requeue: Option<bool>,
    ) -> Result<(), AmqpError> {
        let channel = self.channel_mut(key)?;

        let tags = if multiple {
            channel
                .unacked
                .range(..=delivery_tag)
                .map(|(tag, _)| *tag)
                .collect::<Vec<_>>()
        } else {
            vec![delivery_tag]
        };

        if tags.is_empty() || !tags.iter().all(|tag| channel.unacked.contains_key(tag)) {
            return Err(self.fail_channel(
                key,
                format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag),
            ));
        }

        let settled = tags
            .iter()
            .filter_map(|tag| channel.unacked.remove(tag))
            .collect::<Vec<_>>();

        match requeue {
            None => {}
            Some(true) => {
                for unacked in settled.into_iter().rev() {
                    self.requeue(&unacked.queue, unacked.message);
                }
            }
            Some(false) => {
                for unacked in settled {
                    self.dead_letter(&unacked.queue, unacked.message);
                }
            }
        }

        self.pump_all();
        Ok(())
    }
}

fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], words: &[&str]) -> bool {
        match pattern.split_first() {
            None => words.is_empty(),
            Some((&"#", rest)) => (0..=words.len()).any(|skip| matches(rest, &words[skip..])),
            Some((&"*", rest)) => !words.is_empty() && matches(rest, &words[1..]),
            Some((word, rest)) => words.first() == Some(word) && matches(rest, &words[1..]),
        }
    }

    let pattern = pattern.split('.').collect::<Vec<_>>();
    let words = routing_key.split('.').collect::<Vec<_>>();
    matches(&pattern, &words)
}

/// An in-process broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// Refuses connections whose username or password differ.
    pub fn with_credentials(self, username: &str, password: &str) -> Self {
        self.lock().credentials = Some((username.to_owned(), password.to_owned()));
        self
    }

    /// Maximum number of channels per connection.
    pub fn with_channel_max(self, channel_max: u16) -> Self {
        self.lock().channel_max = channel_max;
        self
    }

    /// Delays every `basic.get` reply.
    pub fn delay_gets(&self, delay: Duration) {
        self.lock().get_delay = delay;
    }

    /// Stops sending publisher confirms until `release_confirms`.
    pub fn hold_confirms(&self) {
        self.lock().hold_confirms = true;
    }

    /// Acks every held publish with one cumulative confirm per channel.
    pub fn release_confirms(&self) {
        let mut state = self.lock();
        state.hold_confirms = false;

        for channel in state.channels.values_mut() {
            if let Some(confirms) = channel.confirms.as_mut() {
                if let Some(sequence) = confirms.held.take() {
                    let _ = confirms.events.send(ConfirmEvent {
                        sequence,
                        multiple: true,
                        confirmation: Confirmation::Ack,
                    });
                }
            }
        }
    }

    /// Nacks every confirmed publish from now on.
    pub fn nack_publishes(&self, nack: bool) {
        self.lock().nack_publishes = nack;
    }

    /// Ready messages in `queue`, `None` when it does not exist.
    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.messages.len())
    }

    /// Bodies of the ready messages in `queue`, oldest first.
    pub fn queued_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of open client connections.
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    /// Deletes a queue, cancelling its consumers.
    pub fn delete_queue(&self, queue: &str) -> bool {
        self.lock().remove_queue(queue)
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ProtocolConnector for MemoryBroker {
    async fn connect(&self, cfg: &AmqpConfig) -> Result<Arc<dyn ProtocolConnection>, AmqpError> {
        let mut state = self.lock();

        if let Some((username, password)) = &state.credentials {
            if *username != cfg.username || *password != cfg.password {
                return Err(AmqpError::ConnectionError(
                    "ACCESS_REFUSED - login refused".to_owned(),
                ));
            }
        }

        let key = state.next_key();
        state.connections.insert(key, ConnectionState::default());
        debug!(connection = key, "memory connection opened");

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            key,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    key: u64,
}

#[async_trait]
impl ProtocolConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.broker.lock().connections.contains_key(&self.key)
    }

    async fn open_channel(&self) -> Result<Arc<dyn ProtocolChannel>, AmqpError> {
        let mut state = self.broker.lock();
        let channel_max = state.channel_max;

        let Some(conn) = state.connections.get(&self.key) else {
            return Err(AmqpError::ChannelClosed);
        };
        let Some(id) = (1..=channel_max).find(|id| !conn.channels.contains_key(id)) else {
            return Err(AmqpError::ChannelError(format!(
                "channel_max of {} reached",
                channel_max
            )));
        };

        let key = state.next_key();
        state.channels.insert(
            key,
            ChannelState {
                id,
                connection: self.key,
                prefetch: 0,
                next_tag: 1,
                unacked: BTreeMap::new(),
                tx: None,
                confirms: None,
            },
        );
        if let Some(conn) = state.connections.get_mut(&self.key) {
            conn.channels.insert(id, key);
        }

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            key,
            id,
            connection: self.key,
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.lock().close_connection(self.key);
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    key: u64,
    id: u16,
    connection: u64,
}

#[async_trait]
impl ProtocolChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.broker.lock().channels.contains_key(&self.key)
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.key)?.prefetch = prefetch_count;
        state.pump_all();
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
        _mandatory: bool,
        _immediate: bool,
    ) -> Result<(), AmqpError> {
        let message = Stored {
            body: body.to_vec(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: properties.clone(),
            redelivered: false,
            position: 0,
        };

        self.broker
            .lock()
            .publish(self.key, exchange, routing_key, message)
    }

    async fn consume(&self, queue: &str, no_ack: bool) -> Result<ConsumeStream, AmqpError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.key)?;

        let Some(owner) = state.queues.get(queue).map(|q| q.owner) else {
            return Err(state.fail_channel(self.key, format!("NOT_FOUND - no queue '{}'", queue)));
        };
        if owner.is_some_and(|owner| owner != self.connection) {
            return Err(state.fail_channel(
                self.key,
                format!("RESOURCE_LOCKED - queue '{}' is exclusive", queue),
            ));
        }

        let tag = format!("amq.ctag-{}", Uuid::new_v4().simple());
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(q) = state.queues.get_mut(queue) {
            q.had_consumer = true;
            q.consumers.push(ConsumerEntry {
                tag: tag.clone(),
                channel: self.key,
                no_ack,
                events: tx,
            });
        }
        state.pump(queue);

        Ok(ConsumeStream { tag, events: rx })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.key)?;

        let owning = state
            .queues
            .iter_mut()
            .find(|(_, q)| q.consumers.iter().any(|c| c.tag == consumer_tag))
            .map(|(name, q)| {
                q.consumers.retain(|c| c.tag != consumer_tag);
                name.clone()
            });

        if let Some(name) = owning {
            state.delete_auto_queue(&name);
        }
        Ok(())
    }

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<Delivery>, AmqpError> {
        let delay = self.broker.lock().get_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.broker.lock();
        state.channel_mut(self.key)?;

        if !state.queues.contains_key(queue) {
            return Err(state.fail_channel(self.key, format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let Some(message) = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.messages.pop_front())
        else {
            return Ok(None);
        };

        let channel = state.channel_mut(self.key)?;
        let tag = channel.next_tag;
        channel.next_tag += 1;
        let delivery = message.delivery(tag);

        if !no_ack {
            channel.unacked.insert(
                tag,
                Unacked {
                    queue: queue.to_owned(),
                    message,
                },
            );
        }

        Ok(Some(delivery))
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.broker
            .lock()
            .settle(self.key, delivery_tag, multiple, None)
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.broker
            .lock()
            .settle(self.key, delivery_tag, multiple, Some(requeue))
    }

    async fn tx_select(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        let channel = state.channel_mut(self.key)?;
        channel.tx.get_or_insert_with(Vec::new);
        Ok(())
    }

    async fn tx_commit(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        let Some(pending) = state.channel_mut(self.key)?.tx.as_mut().map(std::mem::take) else {
            return Err(state.fail_channel(
                self.key,
                "PRECONDITION_FAILED - channel is not transactional".to_owned(),
            ));
        };

        for (exchange, routing_key, message) in pending {
            if let Err(reason) = state.deliver(&exchange, &routing_key, message) {
                return Err(state.fail_channel(self.key, reason));
            }
        }
        Ok(())
    }

    async fn tx_rollback(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        let transactional = state
            .channel_mut(self.key)?
            .tx
            .as_mut()
            .map(Vec::clear)
            .is_some();

        if !transactional {
            return Err(state.fail_channel(
                self.key,
                "PRECONDITION_FAILED - channel is not transactional".to_owned(),
            ));
        }
        Ok(())
    }

    async fn confirm_select(&self) -> Result<mpsc::UnboundedReceiver<ConfirmEvent>, AmqpError> {
        let mut state = self.broker.lock();
        let channel = state.channel_mut(self.key)?;

        let (tx, rx) = mpsc::unbounded_channel();
        channel.confirms = Some(Confirms {
            events: tx,
            next_sequence: 1,
            held: None,
        });
        Ok(rx)
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.key)?;

        match state.exchanges.get(def.name()).map(|existing| existing.kind) {
            Some(kind) if kind != def.kind => Err(state.fail_channel(
                self.key,
                format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}'",
                    def.name()
                ),
            )),
            Some(_) => Ok(()),
            None if def.passive => Err(state.fail_channel(
                self.key,
                format!("NOT_FOUND - no exchange '{}'", def.name()),
            )),
            None => {
                state.exchanges.insert(
                    def.name().to_owned(),
                    ExchangeState {
                        kind: def.kind,
                        bindings: vec![],
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.key)?;

        let name = if def.name().is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            def.name().to_owned()
        };

        if let Some(owner) = state.queues.get(&name).map(|existing| existing.owner) {
            if owner.is_some_and(|owner| owner != self.connection) {
                return Err(state.fail_channel(
                    self.key,
                    format!("RESOURCE_LOCKED - queue '{}' is exclusive", name),
                ));
            }
            return Ok(name);
        }

        if def.passive {
            return Err(state.fail_channel(self.key, format!("NOT_FOUND - no queue '{}'", name)));
        }

        let args = def.arguments();
        let text = |key: &str| args.get(key).and_then(HeaderValue::as_str).map(str::to_owned);
        let max_length = match args.get(AMQP_HEADERS_MAX_LENGTH) {
            Some(HeaderValue::Int(max)) => usize::try_from(*max).ok(),
            _ => None,
        };

        state.queues.insert(
            name.clone(),
            QueueState {
                owner: def.exclusive.then_some(self.connection),
                auto_delete: def.delete,
                max_length,
                dead_letter: text(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
                    .map(|exchange| (exchange, text(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY))),
                ..QueueState::default()
            },
        );

        debug!(queue = name.as_str(), "memory queue declared");
        Ok(name)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel_mut(self.key)?;

        if binding.exchange_name().is_empty() {
            return Err(state.fail_channel(
                self.key,
                "ACCESS_REFUSED - operation not permitted on the default exchange".to_owned(),
            ));
        }
        if !state.queues.contains_key(binding.queue_name()) {
            return Err(state.fail_channel(
                self.key,
                format!("NOT_FOUND - no queue '{}'", binding.queue_name()),
            ));
        }

        if !state.exchanges.contains_key(binding.exchange_name()) {
            return Err(state.fail_channel(
                self.key,
                format!("NOT_FOUND - no exchange '{}'", binding.exchange_name()),
            ));
        }

        let entry = (binding.queue_name().to_owned(), binding.key().to_owned());
        if let Some(exchange) = state.exchanges.get_mut(binding.exchange_name()) {
            if !exchange.bindings.contains(&entry) {
                exchange.bindings.push(entry);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.lock().close_channel(self.key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn channel(broker: &MemoryBroker) -> (Arc<dyn ProtocolConnection>, Arc<dyn ProtocolChannel>) {
        let conn = broker.connect(&AmqpConfig::default()).await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        (conn, channel)
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("#.eu", "orders.created.eu"));
        assert!(!topic_matches("orders.created", "orders.deleted"));
    }

    #[tokio::test]
    async fn round_robin_between_consumers() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        ch.declare_queue(&QueueDefinition::new("jobs")).await.unwrap();

        let mut first = ch.consume("jobs", true).await.unwrap();
        let mut second = ch.consume("jobs", true).await.unwrap();

        for body in [b"1", b"2", b"3", b"4"] {
            ch.publish("", "jobs", body, &MessageProperties::default(), false, false)
                .await
                .unwrap();
        }

        let body = |event: Option<ConsumeEvent>| match event {
            Some(ConsumeEvent::Delivery(d)) => d.body,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(body(first.events.recv().await), b"1");
        assert_eq!(body(second.events.recv().await), b"2");
        assert_eq!(body(first.events.recv().await), b"3");
        assert_eq!(body(second.events.recv().await), b"4");
    }

    #[tokio::test]
    async fn unknown_tag_closes_the_channel() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;

        let err = ch.ack(42, false).await.unwrap_err();

        assert!(matches!(err, AmqpError::ChannelError(reason) if reason.contains("42")));
        assert!(!ch.is_open());
        assert_eq!(ch.ack(1, false).await, Err(AmqpError::ChannelClosed));
    }

    #[tokio::test]
    async fn closing_a_channel_requeues_unacked() {
        let broker = MemoryBroker::new();
        let (conn, ch) = channel(&broker).await;
        ch.declare_queue(&QueueDefinition::new("jobs")).await.unwrap();
        ch.publish("", "jobs", b"work", &MessageProperties::default(), false, false)
            .await
            .unwrap();

        let first = ch.get("jobs", false).await.unwrap().unwrap();
        assert!(!first.redelivered);
        ch.close().await.unwrap();

        let other = conn.open_channel().await.unwrap();
        let again = other.get("jobs", false).await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.body, b"work");
    }

    #[tokio::test]
    async fn requeue_restores_the_original_position() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        ch.declare_queue(&QueueDefinition::new("jobs")).await.unwrap();
        for body in [b"a", b"b", b"c", b"d"] {
            ch.publish("", "jobs", body, &MessageProperties::default(), false, false)
                .await
                .unwrap();
        }

        let mut tags = vec![];
        for _ in 0..3 {
            tags.push(ch.get("jobs", false).await.unwrap().unwrap().delivery_tag);
        }
        for tag in tags {
            ch.nack(tag, false, true).await.unwrap();
        }

        assert_eq!(
            broker.queued_bodies("jobs"),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
    }

    #[tokio::test]
    async fn prefetch_limits_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        ch.declare_queue(&QueueDefinition::new("jobs")).await.unwrap();
        ch.qos(1).await.unwrap();

        let mut stream = ch.consume("jobs", false).await.unwrap();
        for body in [b"a", b"b"] {
            ch.publish("", "jobs", body, &MessageProperties::default(), false, false)
                .await
                .unwrap();
        }

        let Some(ConsumeEvent::Delivery(first)) = stream.events.recv().await else {
            panic!("expected a delivery");
        };
        assert!(stream.events.try_recv().is_err());
        assert_eq!(broker.queue_len("jobs"), Some(1));

        ch.ack(first.delivery_tag, false).await.unwrap();
        assert!(matches!(
            stream.events.recv().await,
            Some(ConsumeEvent::Delivery(d)) if d.body == b"b"
        ));
    }

    #[tokio::test]
    async fn rejected_messages_are_dead_lettered() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        let def = QueueDefinition::new("jobs").with_dlq();
        ch.declare_queue(&def.dlq().unwrap()).await.unwrap();
        ch.declare_queue(&def).await.unwrap();

        ch.publish("", "jobs", b"poison", &MessageProperties::default(), false, false)
            .await
            .unwrap();
        let delivery = ch.get("jobs", false).await.unwrap().unwrap();
        ch.nack(delivery.delivery_tag, false, false).await.unwrap();

        assert_eq!(broker.queued_bodies("jobs-dlq"), vec![b"poison".to_vec()]);
        assert_eq!(broker.queue_len("jobs"), Some(0));
    }

    #[tokio::test]
    async fn deleting_a_queue_cancels_consumers() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = channel(&broker).await;
        ch.declare_queue(&QueueDefinition::new("jobs")).await.unwrap();
        let mut stream = ch.consume("jobs", true).await.unwrap();

        assert!(broker.delete_queue("jobs"));
        assert!(matches!(
            stream.events.recv().await,
            Some(ConsumeEvent::Cancelled)
        ));
    }

    #[tokio::test]
    async fn credentials_are_checked() {
        let broker = MemoryBroker::new().with_credentials("app", "secret");

        let refused = broker.connect(&AmqpConfig::default()).await;
        assert!(matches!(refused, Err(AmqpError::ConnectionError(_))));

        let cfg = AmqpConfig {
            username: "app".to_owned(),
            password: "secret".to_owned(),
            ..AmqpConfig::default()
        };
        assert!(broker.connect(&cfg).await.is_ok());
    }
}
