// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Protocol Backend
//!
//! Implements the [`protocol`](crate::protocol) traits on top of lapin. Lapin
//! tracks publisher confirms per publish future; this backend numbers those
//! publishes and turns each settled future into a [`ConfirmEvent`], and turns
//! each lapin consumer into a [`ConsumeStream`].

use crate::{
    config::AmqpConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    protocol::{
        ConfirmEvent, Confirmation, ConsumeEvent, ConsumeStream, Delivery, HeaderValue,
        MessageProperties, ProtocolChannel, ProtocolConnection, ProtocolConnector,
    },
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation as LapinConfirmation,
    types::{AMQPValue, ByteArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Connects with lapin.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinConnector;

#[async_trait]
impl ProtocolConnector for LapinConnector {
    async fn connect(&self, cfg: &AmqpConfig) -> Result<Arc<dyn ProtocolConnection>, AmqpError> {
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.connection_name.clone()));

        let conn = Connection::connect(&cfg.uri(), options)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to connect");
                AmqpError::ConnectionError(err.to_string())
            })?;

        Ok(Arc::new(LapinConnection { conn }))
    }
}

struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl ProtocolConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    async fn open_channel(&self) -> Result<Arc<dyn ProtocolChannel>, AmqpError> {
        let channel = self.conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError(err.to_string())
        })?;

        Ok(Arc::new(LapinChannel {
            channel,
            confirms: Mutex::new(None),
            next_sequence: AtomicU64::new(1),
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

struct LapinChannel {
    channel: Channel,
    confirms: Mutex<Option<mpsc::UnboundedSender<ConfirmEvent>>>,
    next_sequence: AtomicU64,
}

impl LapinChannel {
    fn map_err(&self, operation: &str, err: lapin::Error) -> AmqpError {
        error!(
            channel = self.channel.id(),
            operation,
            error = err.to_string(),
            "amqp operation failed"
        );
        match err {
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
                AmqpError::ChannelClosed
            }
            other => AmqpError::ChannelError(other.to_string()),
        }
    }

    fn confirm_sender(&self) -> Option<mpsc::UnboundedSender<ConfirmEvent>> {
        self.confirms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl ProtocolChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| self.map_err("basic.qos", err))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
        mandatory: bool,
        immediate: bool,
    ) -> Result<(), AmqpError> {
        let confirms = self
            .confirm_sender()
            .map(|sender| (sender, self.next_sequence.fetch_add(1, Ordering::AcqRel)));

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate,
                },
                body,
                to_basic_properties(properties),
            )
            .await
            .map_err(|err| self.map_err("basic.publish", err))?;

        if let Some((sender, sequence)) = confirms {
            tokio::spawn(async move {
                let confirmation = match confirm.await {
                    Ok(LapinConfirmation::Nack(_)) => {
                        Confirmation::Nack("nacked by the broker".to_owned())
                    }
                    Ok(_) => Confirmation::Ack,
                    Err(err) => Confirmation::Nack(err.to_string()),
                };

                // the tracker is gone once the channel closed
                let _ = sender.send(ConfirmEvent {
                    sequence,
                    multiple: false,
                    confirmation,
                });
            });
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, no_ack: bool) -> Result<ConsumeStream, AmqpError> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| self.map_err("basic.consume", err))?;

        let tag = consumer.tag().as_str().to_owned();
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = self.channel.clone();

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        if tx.send(ConsumeEvent::Delivery(from_lapin(delivery))).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        error!(error = err.to_string(), "errors consume msg");
                        return;
                    }
                }
            }

            if channel.status().connected() {
                let _ = tx.send(ConsumeEvent::Cancelled);
            }
        });

        Ok(ConsumeStream { tag, events: rx })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, Default::default())
            .await
            .map_err(|err| self.map_err("basic.cancel", err))
    }

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<Delivery>, AmqpError> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack })
            .await
            .map_err(|err| self.map_err("basic.get", err))?;

        Ok(message.map(|msg| from_lapin(msg.delivery)))
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| self.map_err("basic.ack", err))
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| self.map_err("basic.nack", err))
    }

    async fn tx_select(&self) -> Result<(), AmqpError> {
        self.channel
            .tx_select()
            .await
            .map_err(|err| self.map_err("tx.select", err))
    }

    async fn tx_commit(&self) -> Result<(), AmqpError> {
        self.channel
            .tx_commit()
            .await
            .map_err(|err| self.map_err("tx.commit", err))
    }

    async fn tx_rollback(&self) -> Result<(), AmqpError> {
        self.channel
            .tx_rollback()
            .await
            .map_err(|err| self.map_err("tx.rollback", err))
    }

    async fn confirm_select(&self) -> Result<mpsc::UnboundedReceiver<ConfirmEvent>, AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| self.map_err("confirm.select", err))?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.next_sequence.store(1, Ordering::Release);
        *self
            .confirms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tx);

        Ok(rx)
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                to_field_table(&def.params),
            )
            .await
            .map_err(|err| self.map_err("exchange.declare", err))
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let queue = self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                to_field_table(&def.arguments()),
            )
            .await
            .map_err(|err| self.map_err("queue.declare", err))?;

        Ok(queue.name().as_str().to_owned())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| self.map_err("queue.bind", err))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.confirms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        debug!(channel = self.channel.id(), "closing lapin channel");
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| self.map_err("channel.close", err))
    }
}

fn from_lapin(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        properties: from_basic_properties(&delivery.properties),
        body: delivery.data,
    }
}

fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();

    if let Some(content_type) = &props.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(kind) = &props.message_type {
        basic = basic.with_type(ShortString::from(kind.clone()));
    }
    if let Some(id) = &props.message_id {
        basic = basic.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(id) = &props.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(id.clone()));
    }
    if props.persistent {
        basic = basic.with_delivery_mode(2);
    }

    let headers = props
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<BTreeMap<_, _>>();

    basic.with_headers(to_field_table(&headers))
}

fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    let short = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_owned());

    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(k, v)| from_amqp_value(v).map(|v| (k.as_str().to_owned(), v)))
                .collect::<HashMap<_, _>>()
        })
        .unwrap_or_default();

    MessageProperties {
        content_type: short(props.content_type()),
        message_type: short(props.kind()),
        message_id: short(props.message_id()),
        correlation_id: short(props.correlation_id()),
        persistent: *props.delivery_mode() == Some(2),
        headers,
    }
}

fn to_field_table(values: &BTreeMap<String, HeaderValue>) -> FieldTable {
    let table = values
        .iter()
        .map(|(k, v)| (ShortString::from(k.clone()), to_amqp_value(v)))
        .collect::<BTreeMap<_, _>>();

    FieldTable::from(table)
}

fn to_amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        HeaderValue::Int(v) => match i32::try_from(*v) {
            Ok(v) => AMQPValue::LongInt(v),
            Err(_) => AMQPValue::LongLongInt(*v),
        },
        HeaderValue::UInt(v) => match u32::try_from(*v) {
            Ok(v) => AMQPValue::LongUInt(v),
            Err(_) => AMQPValue::LongLongInt(*v as i64),
        },
        HeaderValue::Float(v) => AMQPValue::Double(*v),
        HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        HeaderValue::Bytes(v) => AMQPValue::ByteArray(ByteArray::from(v.clone())),
    }
}

fn from_amqp_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::Boolean(v) => Some(HeaderValue::Bool(*v)),
        AMQPValue::ShortShortInt(v) => Some(HeaderValue::Int((*v).into())),
        AMQPValue::ShortInt(v) => Some(HeaderValue::Int((*v).into())),
        AMQPValue::LongInt(v) => Some(HeaderValue::Int((*v).into())),
        AMQPValue::LongLongInt(v) => Some(HeaderValue::Int(*v)),
        AMQPValue::ShortShortUInt(v) => Some(HeaderValue::UInt((*v).into())),
        AMQPValue::ShortUInt(v) => Some(HeaderValue::UInt((*v).into())),
        AMQPValue::LongUInt(v) => Some(HeaderValue::UInt((*v).into())),
        AMQPValue::Timestamp(v) => Some(HeaderValue::UInt(*v)),
        AMQPValue::Float(v) => Some(HeaderValue::Float((*v).into())),
        AMQPValue::Double(v) => Some(HeaderValue::Float(*v)),
        AMQPValue::ShortString(v) => Some(HeaderValue::String(v.as_str().to_owned())),
        AMQPValue::LongString(v) => Some(HeaderValue::String(
            String::from_utf8_lossy(v.as_bytes()).into_owned(),
        )),
        AMQPValue::ByteArray(v) => Some(HeaderValue::Bytes(v.as_slice().to_vec())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_survive_conversion() {
        let props = MessageProperties::default()
            .with_content_type("application/json")
            .with_message_type("order.created")
            .with_correlation_id("c-1")
            .persistent()
            .with_header("x-tenant", "acme")
            .with_header("x-attempt", 2i64)
            .with_header("x-replay", true);

        let back = from_basic_properties(&to_basic_properties(&props));

        assert_eq!(back, props);
    }

    #[test]
    fn wide_integers_keep_their_value() {
        assert_eq!(
            to_amqp_value(&HeaderValue::Int(i64::from(i32::MAX) + 1)),
            AMQPValue::LongLongInt(i64::from(i32::MAX) + 1)
        );
        assert_eq!(
            from_amqp_value(&AMQPValue::LongUInt(7)),
            Some(HeaderValue::UInt(7))
        );
        assert_eq!(from_amqp_value(&AMQPValue::Void), None);
    }

    #[test]
    fn queue_arguments_become_field_table() {
        let table = to_field_table(&QueueDefinition::new("jobs").with_dlq().arguments());
        let inner = table.inner();

        assert_eq!(
            inner.get("x-dead-letter-routing-key"),
            Some(&AMQPValue::LongString(LongString::from("jobs-dlq")))
        );
    }
}
