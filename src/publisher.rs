// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Producer
//!
//! A [`Producer`] binds a channel to a destination and publishes message
//! bodies to it. The result of a publish depends on the channel mode: plain
//! channels report `Sent`, transactional channels `Buffered` until commit,
//! and confirm channels hand back a [`ConfirmFuture`].
//!
//! Every publish carries a fresh message id and the current OpenTelemetry
//! context in its headers.

use crate::{
    channel::ChannelHandle,
    confirm::{ConfirmFuture, ConfirmTracker},
    errors::AmqpError,
    otel,
    protocol::{Confirmation, MessageProperties, JSON_CONTENT_TYPE},
};
use futures_util::{pin_mut, Stream, StreamExt};
use opentelemetry::Context;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};
use uuid::Uuid;

/// Where a producer sends its messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// An exchange (empty name is the default exchange) with an optional fixed routing key.
    Exchange {
        exchange: String,
        routing_key: Option<String>,
    },
    /// A queue, reached through the default exchange.
    Queue(String),
}

impl Destination {
    pub fn exchange(exchange: &str, routing_key: Option<&str>) -> Destination {
        Destination::Exchange {
            exchange: exchange.to_owned(),
            routing_key: routing_key.map(str::to_owned),
        }
    }

    pub fn queue(queue: &str) -> Destination {
        Destination::Queue(queue.to_owned())
    }

    /// The `(exchange, routing key)` pair used for one publish.
    pub(crate) fn resolve<'a>(&'a self, key_override: Option<&'a str>) -> (&'a str, &'a str) {
        match self {
            Destination::Exchange {
                exchange,
                routing_key,
            } => (
                exchange.as_str(),
                key_override.or(routing_key.as_deref()).unwrap_or_default(),
            ),
            Destination::Queue(queue) => ("", key_override.unwrap_or(queue.as_str())),
        }
    }
}

/// Per-call publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub routing_key: Option<String>,
    pub mandatory: bool,
    pub immediate: bool,
    pub properties: MessageProperties,
}

impl PublishOptions {
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }
}

/// Outcome of a single publish.
#[derive(Debug)]
pub enum PublishResult {
    /// Normal channel: the frame was handed to the broker, nothing more.
    Sent,
    /// Transactional channel: visible to consumers only after commit.
    Buffered,
    /// Confirm channel: resolves when the broker acks or nacks.
    Confirm(ConfirmFuture),
}

impl PublishResult {
    /// Waits for whatever guarantee the channel mode offers.
    ///
    /// A broker nack surfaces as `PublishNacked`.
    pub async fn settle(self) -> Result<(), AmqpError> {
        match self {
            PublishResult::Sent | PublishResult::Buffered => Ok(()),
            PublishResult::Confirm(future) => {
                let sequence = future.sequence();
                match future.wait().await? {
                    Confirmation::Ack => Ok(()),
                    Confirmation::Nack(reason) => {
                        error!(sequence, reason = reason.as_str(), "publish nacked by the broker");
                        Err(AmqpError::PublishNacked(sequence))
                    }
                }
            }
        }
    }
}

/// Handle returned by [`Producer::enable_confirm`].
#[derive(Clone)]
pub struct ConfirmMode {
    tracker: Arc<ConfirmTracker>,
}

impl ConfirmMode {
    /// Publishes still waiting for a broker verdict.
    pub fn outstanding(&self) -> usize {
        self.tracker.outstanding()
    }

    /// Waits until every publish so far has been acked or nacked.
    pub async fn wait_for_confirms(&self, timeout: Duration) -> Result<(), AmqpError> {
        self.tracker.wait_for_confirms(timeout).await
    }
}

/// Publishes to one destination over one channel.
///
/// A channel is single-writer: concurrent publishes through producers that
/// share a channel are serialized by the channel.
#[derive(Debug, Clone)]
pub struct Producer {
    channel: Arc<ChannelHandle>,
    destination: Destination,
}

impl Producer {
    /// Binds `channel` to `destination`. No broker round-trip happens here.
    pub fn new(channel: Arc<ChannelHandle>, destination: Destination) -> Producer {
        Producer {
            channel,
            destination,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn channel(&self) -> &Arc<ChannelHandle> {
        &self.channel
    }

    /// Publishes one message body.
    pub async fn publish(
        &self,
        body: &[u8],
        opts: &PublishOptions,
    ) -> Result<PublishResult, AmqpError> {
        let (exchange, routing_key) = self.destination.resolve(opts.routing_key.as_deref());

        let mut properties = opts.properties.clone();
        if properties.message_id.is_none() {
            properties.message_id = Some(Uuid::new_v4().to_string());
        }
        otel::inject_context(&Context::current(), &mut properties.headers);

        self.channel
            .publish(
                exchange,
                routing_key,
                body,
                &properties,
                opts.mandatory,
                opts.immediate,
            )
            .await
            .inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "error publishing message"
                );
            })
    }

    /// Serializes `value` as JSON and publishes it.
    pub async fn publish_json<T>(
        &self,
        value: &T,
        opts: &PublishOptions,
    ) -> Result<PublishResult, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(value).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::PublishingError(err.to_string())
        })?;

        let mut opts = opts.clone();
        opts.properties.content_type = Some(JSON_CONTENT_TYPE.to_owned());
        self.publish(&body, &opts).await
    }

    /// Publishes every item of `bodies` in order.
    ///
    /// The next item is pulled only after the previous one was accepted by
    /// the channel and, in confirm mode, acked by the broker. Stops at the
    /// first failure; returns how many messages were published.
    pub async fn publish_all<S, B>(&self, bodies: S, opts: &PublishOptions) -> Result<usize, AmqpError>
    where
        S: Stream<Item = B>,
        B: AsRef<[u8]>,
    {
        pin_mut!(bodies);

        let mut published = 0;
        while let Some(body) = bodies.next().await {
            self.publish(body.as_ref(), opts).await?.settle().await?;
            published += 1;
        }

        debug!(published, "stream published");
        Ok(published)
    }

    /// Puts the channel into confirm mode. Fails on a transactional channel.
    pub async fn enable_confirm(&self) -> Result<ConfirmMode, AmqpError> {
        let tracker = self.channel.enable_confirm().await?;
        Ok(ConfirmMode { tracker })
    }

    /// Puts the channel into transactional mode. Fails on a confirm channel.
    pub async fn enable_transactions(&self) -> Result<(), AmqpError> {
        self.channel.enable_transactions().await
    }

    /// Makes every publish since the last commit/rollback visible atomically.
    pub async fn commit(&self) -> Result<(), AmqpError> {
        self.channel.commit().await
    }

    /// Discards every publish since the last commit/rollback.
    pub async fn rollback(&self) -> Result<(), AmqpError> {
        self.channel.rollback().await
    }
}
