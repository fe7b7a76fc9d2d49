// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Installation
//!
//! Declares a set of exchanges, queues (with their dead letter queues) and
//! bindings through a channel, in dependency order. Definitions are passed
//! through to the broker untouched.

use crate::{
    channel::ChannelHandle,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::{debug, error};

/// Exchanges, queues and bindings to declare together.
#[derive(Debug, Clone, Default)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Declares exchanges, then queues, then bindings.
    pub async fn install(&self, channel: &ChannelHandle) -> Result<(), AmqpError> {
        self.install_exchanges(channel).await?;
        self.install_queues(channel).await?;
        self.binding_queues(channel).await
    }

    async fn install_exchanges(&self, channel: &ChannelHandle) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name());

            channel.declare_exchange(exch).await.map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = exch.name(),
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(exch.name().to_owned())
            })?;

            debug!("exchange: {} was created", exch.name());
        }

        Ok(())
    }

    async fn install_queues(&self, channel: &ChannelHandle) -> Result<(), AmqpError> {
        for def in &self.queues {
            if let Some(dlq) = def.dlq() {
                self.declare_queue(channel, &dlq).await?;
            }
            self.declare_queue(channel, def).await?;
        }

        Ok(())
    }

    async fn declare_queue(
        &self,
        channel: &ChannelHandle,
        def: &QueueDefinition,
    ) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name());

        let name = channel.declare_queue(def).await.map_err(|err| {
            error!(error = err.to_string(), name = def.name(), "failure to declare queue");
            AmqpError::DeclareQueueError(def.name().to_owned())
        })?;

        debug!("queue: {} was created", name);
        Ok(())
    }

    async fn binding_queues(&self, channel: &ChannelHandle) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name(),
                binding.exchange_name(),
                binding.key()
            );

            channel.bind_queue(binding).await.map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name().to_owned(),
                    binding.queue_name().to_owned(),
                )
            })?;
        }

        Ok(())
    }
}
