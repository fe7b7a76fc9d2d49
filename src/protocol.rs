// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Protocol Seam
//!
//! The narrow interface this runtime consumes from a lower-level AMQP 0-9-1
//! implementation. Framing, sockets and method encoding live behind these
//! traits: [`crate::amqp`] implements them on top of lapin and
//! [`crate::memory`] implements them with an in-process broker.
//!
//! The records defined here are wire-neutral so the rest of the crate never
//! touches a protocol library type directly.

use crate::{
    config::AmqpConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;

/// Content type used for JSON bodies.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A typed header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// The subset of basic properties this runtime reads and writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub message_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Delivery mode 2 when set.
    pub persistent: bool,
    pub headers: HashMap<String, HeaderValue>,
}

impl MessageProperties {
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn with_message_type(mut self, kind: &str) -> Self {
        self.message_type = Some(kind.to_owned());
        self
    }

    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }
}

/// One message handed out by the broker.
///
/// A delivery is consumed exactly once, so it is intentionally not `Clone`.
#[derive(Debug, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
}

/// Events produced by a broker consumer.
#[derive(Debug)]
pub enum ConsumeEvent {
    Delivery(Delivery),
    /// The broker cancelled the consumer (e.g. the queue was deleted).
    Cancelled,
}

/// A started broker consumer. The stream ends when the channel goes away.
#[derive(Debug)]
pub struct ConsumeStream {
    pub tag: String,
    pub events: mpsc::UnboundedReceiver<ConsumeEvent>,
}

/// The broker's verdict on a confirmed publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack(String),
}

/// A publisher confirm keyed by the channel's publish sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmEvent {
    pub sequence: u64,
    /// Applies to every outstanding sequence number up to `sequence`.
    pub multiple: bool,
    pub confirmation: Confirmation,
}

/// Establishes broker connections.
#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    async fn connect(&self, cfg: &AmqpConfig) -> Result<Arc<dyn ProtocolConnection>, AmqpError>;
}

/// One transport connection.
#[async_trait]
pub trait ProtocolConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn open_channel(&self) -> Result<Arc<dyn ProtocolChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// One multiplexed channel.
///
/// Once `confirm_select` succeeded, the n-th publish on the channel carries
/// sequence number n (starting at 1), as mandated by the protocol.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProtocolChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
        mandatory: bool,
        immediate: bool,
    ) -> Result<(), AmqpError>;

    /// Starts a consumer with a broker-generated tag.
    async fn consume(&self, queue: &str, no_ack: bool) -> Result<ConsumeStream, AmqpError>;

    /// Cancels a consumer and waits for the broker's cancel-ok.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<Delivery>, AmqpError>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool)
        -> Result<(), AmqpError>;

    async fn tx_select(&self) -> Result<(), AmqpError>;

    async fn tx_commit(&self) -> Result<(), AmqpError>;

    async fn tx_rollback(&self) -> Result<(), AmqpError>;

    async fn confirm_select(&self) -> Result<mpsc::UnboundedReceiver<ConfirmEvent>, AmqpError>;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Returns the queue name, which the broker generates for an empty name.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
