// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! A [`Consumer`] binds a channel to a source queue and offers two mutually
//! exclusive usage modes: pulling single messages with `get`, or pushing
//! deliveries to a [`SubscriptionHandler`] with `subscribe`.
//!
//! In manual-ack mode the consumer remembers every delivery tag it handed out
//! until that tag is acked or nacked, so a tag can be settled at most once and
//! misuse is reported as `UnknownTag` instead of a broker channel exception.

use crate::{
    channel::ChannelHandle,
    config::GetTimeoutPolicy,
    dispatcher::{spawn_subscription, SubscriptionHandle, SubscriptionHandler},
    errors::AmqpError,
    protocol::{Delivery, ProtocolChannel},
    queue::{QueueBinding, QueueDefinition},
};
use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Who settles deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// The broker considers a message settled as soon as it is sent.
    Auto,
    /// Every delivery must be acked or nacked through the consumer.
    Manual,
}

/// Where a consumer reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// An existing queue.
    Queue(String),
    /// A queue declared and bound to `exchange` when the consumer is created.
    Exchange {
        exchange: String,
        queue: QueueDefinition,
        routing_key: String,
    },
}

impl Source {
    pub fn queue(name: &str) -> Source {
        Source::Queue(name.to_owned())
    }

    /// An exclusive, auto-deleted queue bound to `exchange`.
    ///
    /// An empty `queue` name lets the broker generate one.
    pub fn exchange(exchange: &str, queue: &str, routing_key: &str) -> Source {
        Source::Exchange {
            exchange: exchange.to_owned(),
            queue: QueueDefinition::new(queue).exclusive().delete(),
            routing_key: routing_key.to_owned(),
        }
    }
}

/// Options for a single `get`.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Overrides the connection's `get_timeout_ms`.
    pub timeout: Option<Duration>,
}

struct ConsumerInner {
    channel: Arc<ChannelHandle>,
    queue: String,
    exchange: Option<String>,
    ack_mode: AckMode,
    outstanding: Mutex<HashSet<u64>>,
    subscription: tokio::sync::Mutex<Option<SubscriptionHandle>>,
    pulls_in_flight: AtomicUsize,
}

/// Reads from one queue over one channel. Cheap to clone.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.inner.queue)
            .field("exchange", &self.inner.exchange)
            .field("ack_mode", &self.inner.ack_mode)
            .finish()
    }
}

struct PullGuard<'a>(&'a AtomicUsize);

impl Drop for PullGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Consumer {
    /// Binds `channel` to `source`.
    ///
    /// A `Source::Queue` costs no broker round-trip; a `Source::Exchange`
    /// declares its queue and binds it first.
    pub async fn new(
        channel: Arc<ChannelHandle>,
        source: Source,
        ack_mode: AckMode,
    ) -> Result<Consumer, AmqpError> {
        let (queue, exchange) = match source {
            Source::Queue(queue) => (queue, None),
            Source::Exchange {
                exchange,
                queue,
                routing_key,
            } => {
                let name = channel.declare_queue(&queue).await.inspect_err(|err| {
                    error!(error = err.to_string(), "failure to declare consumer queue");
                })?;

                channel
                    .bind_queue(
                        &QueueBinding::new(&name)
                            .exchange(&exchange)
                            .routing_key(&routing_key),
                    )
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "error to bind queue to exchange");
                        AmqpError::BindingExchangeToQueueError(exchange.clone(), name.clone())
                    })?;

                debug!(
                    queue = name.as_str(),
                    exchange = exchange.as_str(),
                    routing_key = routing_key.as_str(),
                    "consumer queue bound"
                );
                (name, Some(exchange))
            }
        };

        Ok(Consumer {
            inner: Arc::new(ConsumerInner {
                channel,
                queue,
                exchange,
                ack_mode,
                outstanding: Mutex::new(HashSet::new()),
                subscription: tokio::sync::Mutex::new(None),
                pulls_in_flight: AtomicUsize::new(0),
            }),
        })
    }

    /// The source queue name (broker-generated names included).
    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    pub fn exchange(&self) -> Option<&str> {
        self.inner.exchange.as_deref()
    }

    pub fn ack_mode(&self) -> AckMode {
        self.inner.ack_mode
    }

    pub fn channel(&self) -> &Arc<ChannelHandle> {
        &self.inner.channel
    }

    /// Pulls one message, `None` when the queue has no ready message.
    ///
    /// Waits at most the configured get timeout; what a timeout returns is
    /// decided by `get_timeout_policy`. In manual-ack mode a reply that
    /// arrives after the timeout is nacked back onto the queue. Refused while
    /// a subscription is active.
    pub async fn get(&self, opts: &GetOptions) -> Result<Option<Delivery>, AmqpError> {
        let channel = &self.inner.channel;
        channel.ensure_open()?;

        self.inner.pulls_in_flight.fetch_add(1, Ordering::AcqRel);
        let _pull = PullGuard(&self.inner.pulls_in_flight);

        if let Some(active) = self.inner.subscription.lock().await.as_ref() {
            if !active.is_ended() {
                return Err(AmqpError::ModeError(format!(
                    "get while subscription `{}` is active",
                    active.tag()
                )));
            }
        }

        let timeout = opts.timeout.unwrap_or_else(|| channel.config().get_timeout());

        let delivery = match self.inner.ack_mode {
            AckMode::Auto => {
                match tokio::time::timeout(timeout, channel.raw().get(&self.inner.queue, true))
                    .await
                {
                    Ok(result) => channel.observe(result)?,
                    Err(_) => return self.get_timed_out(),
                }
            }
            AckMode::Manual => {
                let raw = channel.raw().clone();
                let queue = self.inner.queue.clone();
                let mut pending = tokio::spawn(async move { raw.get(&queue, false).await });

                match tokio::time::timeout(timeout, &mut pending).await {
                    Ok(joined) => {
                        channel.observe(joined.map_err(|_| AmqpError::InternalError)?)?
                    }
                    Err(_) => {
                        tokio::spawn(release_late_get(channel.raw().clone(), pending));
                        return self.get_timed_out();
                    }
                }
            }
        };

        if let Some(delivery) = &delivery {
            self.track(delivery.delivery_tag);
        }

        Ok(delivery)
    }

    fn get_timed_out(&self) -> Result<Option<Delivery>, AmqpError> {
        warn!(queue = self.queue(), "basic.get timed out");
        match self.inner.channel.config().get_timeout_policy {
            GetTimeoutPolicy::Empty => Ok(None),
            GetTimeoutPolicy::Error => Err(AmqpError::Timeout("basic.get".to_owned())),
        }
    }

    /// Starts pushing deliveries to `handler` and returns immediately.
    ///
    /// The handler sees `Begin`, the messages, then `End`, asynchronously.
    /// Fails with `AlreadySubscribed` while another subscription is live.
    pub async fn subscribe<H>(&self, handler: H) -> Result<SubscriptionHandle, AmqpError>
    where
        H: SubscriptionHandler,
    {
        let channel = &self.inner.channel;
        channel.ensure_open()?;

        let mut slot = self.inner.subscription.lock().await;
        if let Some(active) = slot.as_ref() {
            if !active.is_ended() {
                return Err(AmqpError::AlreadySubscribed(active.tag().to_owned()));
            }
        }

        if self.inner.pulls_in_flight.load(Ordering::Acquire) > 0 {
            return Err(AmqpError::ModeError(
                "subscribe while a get is in flight".to_owned(),
            ));
        }

        let no_ack = self.inner.ack_mode == AckMode::Auto;
        let stream = channel
            .observe(channel.raw().consume(&self.inner.queue, no_ack).await)
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                match err {
                    AmqpError::ChannelClosed => err,
                    other => AmqpError::ConsumerError(other.to_string()),
                }
            })?;

        let handle = spawn_subscription(self.clone(), stream, handler);
        *slot = Some(handle.clone());

        Ok(handle)
    }

    /// Cancels the active subscription, if any.
    ///
    /// Returns once the broker acknowledged the cancel. The handler then
    /// observes exactly one `End`; no `Message` follows it.
    ///
    /// If the cancel fails the subscription stays `Active` and the call can be
    /// retried.
    pub async fn unsubscribe(&self) -> Result<(), AmqpError> {
        let Some(handle) = self.inner.subscription.lock().await.clone() else {
            return Ok(());
        };

        if !handle.begin_cancel() {
            return Ok(());
        }

        let channel = &self.inner.channel;
        let cancelled = match channel.ensure_open() {
            Ok(()) => {
                channel
                    .round_trip(
                        "basic.cancel",
                        channel.config().tx_timeout(),
                        channel.raw().cancel(handle.tag()),
                    )
                    .await
            }
            Err(err) => Err(err),
        };

        match cancelled {
            Ok(()) => {
                handle.cancel_acknowledged();
                debug!(tag = handle.tag(), "subscription cancelled");
                Ok(())
            }
            // the delivery loop ends on its own when the channel goes away
            Err(AmqpError::ChannelClosed) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "failure to cancel the consumer");
                if !handle.abort_cancel() {
                    debug!(tag = handle.tag(), "subscription already ending on its own");
                }
                Err(err)
            }
        }
    }

    /// The current (possibly ended) subscription.
    pub async fn subscription(&self) -> Option<SubscriptionHandle> {
        self.inner.subscription.lock().await.clone()
    }

    /// Acknowledges one delivery. Manual-ack consumers only.
    pub async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.settle(delivery_tag, "ack")?;

        let channel = &self.inner.channel;
        channel
            .observe(channel.raw().ack(delivery_tag, false).await)
            .map_err(|err| {
                error!(delivery_tag, error = err.to_string(), "error whiling ack msg");
                match err {
                    AmqpError::ChannelClosed => err,
                    _ => AmqpError::AckMessageError,
                }
            })
    }

    /// Rejects one delivery, optionally putting it back on the queue.
    pub async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.settle(delivery_tag, "nack")?;

        let channel = &self.inner.channel;
        channel
            .observe(channel.raw().nack(delivery_tag, false, requeue).await)
            .map_err(|err| {
                error!(delivery_tag, error = err.to_string(), "error whiling nack msg");
                match err {
                    AmqpError::ChannelClosed => err,
                    _ => AmqpError::NackMessageError,
                }
            })
    }

    /// Whether `delivery_tag` was handed out and not yet settled.
    pub fn is_outstanding(&self, delivery_tag: u64) -> bool {
        self.outstanding().contains(&delivery_tag)
    }

    pub(crate) fn track(&self, delivery_tag: u64) {
        if self.inner.ack_mode == AckMode::Manual {
            self.outstanding().insert(delivery_tag);
        }
    }

    /// Claims `delivery_tag` so no second ack/nack can be sent for it.
    fn settle(&self, delivery_tag: u64, operation: &str) -> Result<(), AmqpError> {
        if self.inner.ack_mode == AckMode::Auto {
            return Err(AmqpError::ModeError(format!(
                "{} on an auto-ack consumer",
                operation
            )));
        }

        self.inner.channel.ensure_open()?;

        if !self.outstanding().remove(&delivery_tag) {
            warn!(delivery_tag, operation, "unknown delivery tag");
            return Err(AmqpError::UnknownTag(delivery_tag));
        }

        Ok(())
    }

    fn outstanding(&self) -> std::sync::MutexGuard<'_, HashSet<u64>> {
        self.inner
            .outstanding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Puts back a message whose get-ok arrived after the caller gave up on it.
async fn release_late_get(
    raw: Arc<dyn ProtocolChannel>,
    pending: JoinHandle<Result<Option<Delivery>, AmqpError>>,
) {
    let Ok(Ok(Some(late))) = pending.await else {
        return;
    };

    warn!(
        delivery_tag = late.delivery_tag,
        "releasing delivery received after get timeout"
    );
    if let Err(err) = raw.nack(late.delivery_tag, false, true).await {
        error!(
            delivery_tag = late.delivery_tag,
            error = err.to_string(),
            "failure to release late delivery"
        );
    }
}
