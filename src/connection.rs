// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! This module handles the creation of broker connections and the channels
//! derived from them. A [`Connection`] owns every [`ChannelHandle`] it opens:
//! closing the connection closes the channels first, and a handle outliving
//! its connection refuses all work.

use crate::{
    amqp::LapinConnector,
    channel::ChannelHandle,
    config::AmqpConfig,
    errors::AmqpError,
    protocol::{ProtocolConnection, ProtocolConnector},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// State shared between a connection and the channels it owns.
pub(crate) struct ConnectionShared {
    raw: Arc<dyn ProtocolConnection>,
    closed: AtomicBool,
}

impl ConnectionShared {
    pub(crate) fn new(raw: Arc<dyn ProtocolConnection>) -> ConnectionShared {
        ConnectionShared {
            raw,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.raw.is_open()
    }
}

/// An open broker connection and the channels it owns.
pub struct Connection {
    shared: Arc<ConnectionShared>,
    config: Arc<AmqpConfig>,
    channels: RwLock<Vec<Arc<ChannelHandle>>>,
    default_channel: Option<Arc<ChannelHandle>>,
}

impl Connection {
    /// Connects to the broker described by `cfg` using lapin.
    ///
    /// # Example
    /// ```no_run
    /// # async fn run() -> Result<(), amqp_runtime::errors::AmqpError> {
    /// use amqp_runtime::{config::AmqpConfig, connection::Connection};
    ///
    /// let conn = Connection::open(AmqpConfig::from_env()).await?;
    /// let channel = conn.open_channel().await?;
    /// # let _ = channel;
    /// conn.close().await
    /// # }
    /// ```
    pub async fn open(cfg: AmqpConfig) -> Result<Connection, AmqpError> {
        Self::open_with(&LapinConnector, cfg).await
    }

    /// Connects through an explicit protocol implementation.
    pub async fn open_with(
        connector: &dyn ProtocolConnector,
        cfg: AmqpConfig,
    ) -> Result<Connection, AmqpError> {
        debug!(host = cfg.host.as_str(), port = cfg.port, "creating amqp connection...");

        let raw = connector.connect(&cfg).await.map_err(|err| {
            error!(error = err.to_string(), "failure to connect");
            match err {
                AmqpError::ConnectionError(_) => err,
                other => AmqpError::ConnectionError(other.to_string()),
            }
        })?;
        debug!("amqp connected");

        let mut conn = Connection {
            shared: Arc::new(ConnectionShared::new(raw)),
            config: Arc::new(cfg),
            channels: RwLock::new(vec![]),
            default_channel: None,
        };

        if conn.config.eager_channel {
            match conn.open_channel().await {
                Ok(channel) => conn.default_channel = Some(channel),
                Err(err) => {
                    if let Err(close_err) = conn.close().await {
                        warn!(error = close_err.to_string(), "failure to close connection");
                    }
                    return Err(err);
                }
            }
        }

        Ok(conn)
    }

    pub fn config(&self) -> &AmqpConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// The channel opened by `open` when `eager_channel` is set.
    pub fn default_channel(&self) -> Option<Arc<ChannelHandle>> {
        self.default_channel.clone()
    }

    /// Opens a new channel owned by this connection.
    ///
    /// Fails with `ChannelClosed` once the connection is closed and with
    /// `ChannelError` when the broker refuses (e.g. channel-max reached).
    pub async fn open_channel(&self) -> Result<Arc<ChannelHandle>, AmqpError> {
        let mut channels = self.channels.write().await;

        if !self.shared.is_open() {
            return Err(AmqpError::ChannelClosed);
        }

        debug!("creating amqp channel...");
        let raw = self.shared.raw.open_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            err
        })?;

        let handle = Arc::new(ChannelHandle::new(
            raw,
            Arc::downgrade(&self.shared),
            self.config.clone(),
        ));

        if self.config.prefetch_count > 0 {
            let qos = handle.observe(handle.raw().qos(self.config.prefetch_count).await);
            if let Err(err) = qos {
                error!(error = err.to_string(), "failure to configure qos");
                if let Err(close_err) = handle.close().await {
                    warn!(error = close_err.to_string(), "failure to close channel");
                }
                return Err(err);
            }
        }

        channels.retain(|c| c.is_open());
        channels.push(handle.clone());

        debug!(channel = handle.id(), "channel created");
        Ok(handle)
    }

    /// Snapshot of the channels currently owned by the connection.
    pub async fn channels(&self) -> Vec<Arc<ChannelHandle>> {
        self.channels.read().await.clone()
    }

    /// Closes every owned channel, then the transport.
    ///
    /// Channel close failures are logged and skipped. Closing an already
    /// closed connection is a no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let mut channels = self.channels.write().await;

        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for channel in channels.drain(..) {
            if let Err(err) = channel.close().await {
                warn!(
                    channel = channel.id(),
                    error = err.to_string(),
                    "failure to close channel"
                );
            }
        }

        if self.shared.raw.is_open() {
            self.shared.raw.close().await.map_err(|err| {
                error!(error = err.to_string(), "failure to close connection");
                AmqpError::ConnectionError(err.to_string())
            })?;
        }

        debug!("amqp connection closed");
        Ok(())
    }
}
