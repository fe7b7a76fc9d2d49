// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Handles
//!
//! A [`ChannelHandle`] wraps one multiplexed protocol channel owned by a
//! [`Connection`](crate::connection::Connection). It tracks the channel mode
//! (normal, confirm or transactional), refuses work once the channel or its
//! connection is gone, and serializes publishes so confirm sequence numbers
//! line up with the broker's.

use crate::{
    config::AmqpConfig,
    confirm::ConfirmTracker,
    connection::ConnectionShared,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    protocol::{MessageProperties, ProtocolChannel},
    publisher::PublishResult,
    queue::{QueueBinding, QueueDefinition},
};
use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock, Weak,
    },
    time::Duration,
};
use tracing::{debug, error, warn};

/// Publishing mode of a channel. Leaving `Normal` is a one-way transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Normal,
    Confirm,
    Transactional,
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelMode::Normal => write!(f, "normal"),
            ChannelMode::Confirm => write!(f, "confirm"),
            ChannelMode::Transactional => write!(f, "transactional"),
        }
    }
}

/// One channel on a broker connection.
///
/// The handle is shared through `Arc` by producers and consumers but owned by
/// its connection: closing the connection invalidates every handle, and
/// every operation on an invalidated handle fails with `ChannelClosed`.
pub struct ChannelHandle {
    raw: Arc<dyn ProtocolChannel>,
    connection: Weak<ConnectionShared>,
    config: Arc<AmqpConfig>,
    mode: Mutex<ChannelMode>,
    confirms: OnceLock<Arc<ConfirmTracker>>,
    transition: tokio::sync::Mutex<()>,
    publish_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id())
            .field("mode", &self.mode())
            .field("open", &self.is_open())
            .finish()
    }
}

impl ChannelHandle {
    pub(crate) fn new(
        raw: Arc<dyn ProtocolChannel>,
        connection: Weak<ConnectionShared>,
        config: Arc<AmqpConfig>,
    ) -> ChannelHandle {
        ChannelHandle {
            raw,
            connection,
            config,
            mode: Mutex::new(ChannelMode::Normal),
            confirms: OnceLock::new(),
            transition: tokio::sync::Mutex::new(()),
            publish_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// The protocol channel identifier.
    pub fn id(&self) -> u16 {
        self.raw.id()
    }

    pub fn mode(&self) -> ChannelMode {
        *self.mode.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether the channel and its connection are both still usable.
    pub fn is_open(&self) -> bool {
        self.ensure_open().is_ok()
    }

    pub(crate) fn config(&self) -> &AmqpConfig {
        &self.config
    }

    pub(crate) fn raw(&self) -> &Arc<dyn ProtocolChannel> {
        &self.raw
    }

    pub(crate) fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AmqpError::ChannelClosed);
        }

        let connection_alive = self
            .connection
            .upgrade()
            .is_some_and(|conn| conn.is_open());

        if !connection_alive || !self.raw.is_open() {
            self.invalidate();
            return Err(AmqpError::ChannelClosed);
        }

        Ok(())
    }

    /// Marks the handle unusable when a protocol failure killed the channel.
    pub(crate) fn observe<T>(&self, result: Result<T, AmqpError>) -> Result<T, AmqpError> {
        if let Err(err) = &result {
            if !self.raw.is_open() {
                warn!(
                    channel = self.id(),
                    error = err.to_string(),
                    "channel invalidated by protocol failure"
                );
                self.invalidate();
            }
        }
        result
    }

    /// Runs a broker round-trip bounded by `timeout`.
    pub(crate) async fn round_trip<T, F>(
        &self,
        operation: &str,
        timeout: Duration,
        fut: F,
    ) -> Result<T, AmqpError>
    where
        F: Future<Output = Result<T, AmqpError>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => self.observe(result),
            Err(_) => {
                error!(channel = self.id(), operation, "broker round-trip timed out");
                Err(AmqpError::Timeout(operation.to_owned()))
            }
        }
    }

    pub(crate) fn invalidate(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(channel = self.id(), "channel invalidated");
            if let Some(tracker) = self.confirms.get() {
                tracker.close();
            }
        }
    }

    /// Switches the channel into confirm mode.
    ///
    /// Enabling it again returns the same tracker; a transactional channel
    /// refuses with `ModeError`.
    pub(crate) async fn enable_confirm(&self) -> Result<Arc<ConfirmTracker>, AmqpError> {
        self.ensure_open()?;
        let _transition = self.transition.lock().await;

        match self.mode() {
            ChannelMode::Confirm => {
                return self.confirms.get().cloned().ok_or(AmqpError::InternalError)
            }
            ChannelMode::Transactional => {
                return Err(AmqpError::ModeError(
                    "confirm mode requested on a transactional channel".to_owned(),
                ))
            }
            ChannelMode::Normal => {}
        }

        let events = self.observe(self.raw.confirm_select().await)?;

        let tracker = ConfirmTracker::new(self.config.confirm_timeout());
        tracker.spawn(events);
        let tracker = self.confirms.get_or_init(|| tracker).clone();
        self.set_mode(ChannelMode::Confirm);

        debug!(channel = self.id(), "confirm mode enabled");
        Ok(tracker)
    }

    /// Switches the channel into transactional mode.
    pub(crate) async fn enable_transactions(&self) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let _transition = self.transition.lock().await;

        match self.mode() {
            ChannelMode::Transactional => return Ok(()),
            ChannelMode::Confirm => {
                return Err(AmqpError::ModeError(
                    "transactional mode requested on a confirm channel".to_owned(),
                ))
            }
            ChannelMode::Normal => {}
        }

        self.round_trip("tx.select", self.config.tx_timeout(), self.raw.tx_select())
            .await?;
        self.set_mode(ChannelMode::Transactional);

        debug!(channel = self.id(), "transactional mode enabled");
        Ok(())
    }

    pub(crate) async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
        mandatory: bool,
        immediate: bool,
    ) -> Result<PublishResult, AmqpError> {
        self.ensure_open()?;
        let _serialized = self.publish_lock.lock().await;

        match self.mode() {
            ChannelMode::Confirm => {
                let tracker = self.confirms.get().ok_or(AmqpError::InternalError)?;
                let future = tracker.register()?;

                let sent = self
                    .raw
                    .publish(exchange, routing_key, body, properties, mandatory, immediate)
                    .await;

                if let Err(err) = self.observe(sent) {
                    tracker.forget(future.sequence());
                    return Err(err);
                }

                Ok(PublishResult::Confirm(future))
            }
            mode => {
                self.observe(
                    self.raw
                        .publish(exchange, routing_key, body, properties, mandatory, immediate)
                        .await,
                )?;

                if mode == ChannelMode::Transactional {
                    Ok(PublishResult::Buffered)
                } else {
                    Ok(PublishResult::Sent)
                }
            }
        }
    }

    pub(crate) async fn commit(&self) -> Result<(), AmqpError> {
        self.ensure_transactional("commit")?;
        let _serialized = self.publish_lock.lock().await;
        self.round_trip("tx.commit", self.config.tx_timeout(), self.raw.tx_commit())
            .await
    }

    pub(crate) async fn rollback(&self) -> Result<(), AmqpError> {
        self.ensure_transactional("rollback")?;
        let _serialized = self.publish_lock.lock().await;
        self.round_trip("tx.rollback", self.config.tx_timeout(), self.raw.tx_rollback())
            .await
    }

    /// Declares an exchange, forwarding the definition as-is.
    pub async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.observe(self.raw.declare_exchange(def).await)
    }

    /// Declares a queue and returns its (possibly broker-generated) name.
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        self.ensure_open()?;
        self.observe(self.raw.declare_queue(def).await)
    }

    pub async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.observe(self.raw.bind_queue(binding).await)
    }

    /// Closes the channel. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.invalidate();

        if self.raw.is_open() {
            self.raw.close().await?;
        }

        debug!(channel = self.id(), "channel closed");
        Ok(())
    }

    fn ensure_transactional(&self, operation: &str) -> Result<(), AmqpError> {
        self.ensure_open()?;
        match self.mode() {
            ChannelMode::Transactional => Ok(()),
            mode => Err(AmqpError::ModeError(format!(
                "{} requires a transactional channel, channel is in {} mode",
                operation, mode
            ))),
        }
    }

    fn set_mode(&self, mode: ChannelMode) {
        *self.mode.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = mode;
    }
}
