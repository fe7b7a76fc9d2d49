// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use amqp_runtime::{
    config::{AmqpConfig, GetTimeoutPolicy},
    connection::Connection,
    consumer::{AckMode, Consumer, GetOptions, Source},
    dispatcher::{EndReason, SubscriptionEvent, SubscriptionHandler, SubscriptionState},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    memory::MemoryBroker,
    publisher::{Destination, Producer, PublishOptions},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Notify},
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(1);

struct Fixture {
    broker: MemoryBroker,
    conn: Connection,
    producer: Producer,
}

impl Fixture {
    async fn new(cfg: AmqpConfig) -> Fixture {
        let broker = MemoryBroker::new();
        let conn = Connection::open_with(&broker, cfg).await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        channel
            .declare_queue(&QueueDefinition::new("jobs"))
            .await
            .unwrap();

        Fixture {
            broker,
            producer: Producer::new(channel, Destination::queue("jobs")),
            conn,
        }
    }

    async fn consumer(&self, ack_mode: AckMode) -> Consumer {
        let channel = self.conn.open_channel().await.unwrap();
        Consumer::new(channel, Source::queue("jobs"), ack_mode)
            .await
            .unwrap()
    }

    async fn publish(&self, body: &str) {
        self.producer
            .publish(body.as_bytes(), &PublishOptions::default())
            .await
            .unwrap();
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<SubscriptionEvent>) -> SubscriptionEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("subscription event")
        .expect("handler channel open")
}

#[tokio::test]
async fn get_returns_messages_in_publish_order() {
    let fx = Fixture::new(AmqpConfig::default()).await;
    let consumer = fx.consumer(AckMode::Auto).await;

    for body in ["1", "2", "3"] {
        fx.publish(body).await;
    }

    let mut bodies = vec![];
    while let Some(delivery) = consumer.get(&GetOptions::default()).await.unwrap() {
        bodies.push(String::from_utf8(delivery.body).unwrap());
    }

    assert_eq!(bodies, ["1", "2", "3"]);
}

#[tokio::test]
async fn delivery_tag_is_settled_at_most_once() {
    let fx = Fixture::new(AmqpConfig::default()).await;
    let consumer = fx.consumer(AckMode::Manual).await;
    fx.publish("work").await;

    let delivery = consumer
        .get(&GetOptions::default())
        .await
        .unwrap()
        .unwrap();
    let tag = delivery.delivery_tag;
    assert!(consumer.is_outstanding(tag));

    consumer.ack(tag).await.unwrap();

    assert_eq!(consumer.ack(tag).await, Err(AmqpError::UnknownTag(tag)));
    assert_eq!(
        consumer.nack(tag, true).await,
        Err(AmqpError::UnknownTag(tag))
    );
    assert_eq!(
        consumer.ack(tag + 100).await,
        Err(AmqpError::UnknownTag(tag + 100))
    );
    // misuse never reaches the broker, so the channel survives
    assert!(consumer.channel().is_open());
}

#[tokio::test]
async fn nack_with_requeue_redelivers() {
    let fx = Fixture::new(AmqpConfig::default()).await;
    let consumer = fx.consumer(AckMode::Manual).await;
    fx.publish("retry me").await;

    let first = consumer
        .get(&GetOptions::default())
        .await
        .unwrap()
        .unwrap();
    consumer.nack(first.delivery_tag, true).await.unwrap();

    let again = consumer
        .get(&GetOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert!(again.redelivered);
    assert_eq!(again.body, b"retry me");
    assert_ne!(again.delivery_tag, first.delivery_tag);
}

#[tokio::test]
async fn auto_ack_consumer_refuses_ack() {
    let fx = Fixture::new(AmqpConfig::default()).await;
    let consumer = fx.consumer(AckMode::Auto).await;
    fx.publish("x").await;

    let delivery = consumer
        .get(&GetOptions::default())
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(
        consumer.ack(delivery.delivery_tag).await,
        Err(AmqpError::ModeError(_))
    ));
    assert_eq!(fx.broker.queue_len("jobs"), Some(0));
}

#[tokio::test]
async fn get_timeout_follows_the_configured_policy() {
    let fx = Fixture::new(AmqpConfig {
        get_timeout_ms: 20,
        ..AmqpConfig::default()
    })
    .await;
    fx.publish("late").await;
    fx.broker.delay_gets(Duration::from_millis(300));

    let lenient = fx.consumer(AckMode::Auto).await;
    assert_eq!(lenient.get(&GetOptions::default()).await, Ok(None));

    let strict_conn = Connection::open_with(
        &fx.broker,
        AmqpConfig {
            get_timeout_ms: 20,
            get_timeout_policy: GetTimeoutPolicy::Error,
            ..AmqpConfig::default()
        },
    )
    .await
    .unwrap();
    let strict = Consumer::new(
        strict_conn.open_channel().await.unwrap(),
        Source::queue("jobs"),
        AckMode::Auto,
    )
    .await
    .unwrap();
    assert_eq!(
        strict.get(&GetOptions::default()).await,
        Err(AmqpError::Timeout("basic.get".to_owned()))
    );

    // a per-call timeout overrides the configured one
    let patient = GetOptions {
        timeout: Some(Duration::from_secs(2)),
    };
    let delivery = strict.get(&patient).await.unwrap().unwrap();
    assert_eq!(delivery.body, b"late");
}

#[tokio::test]
async fn subscription_events_are_ordered() {
    let fx = Fixture::new(AmqpConfig::default()).await;
    let consumer = fx.consumer(AckMode::Manual).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let subscription = consumer.subscribe(tx).await.unwrap();
    for body in ["a", "b", "c"] {
        fx.publish(body).await;
    }

    let SubscriptionEvent::Begin { tag } = next_event(&mut rx).await else {
        panic!("first event must be Begin");
    };
    assert_eq!(tag, subscription.tag());

    for expected in ["a", "b", "c"] {
        match next_event(&mut rx).await {
            SubscriptionEvent::Message { tag, delivery } => {
                assert_eq!(tag, subscription.tag());
                assert_eq!(delivery.body, expected.as_bytes());
                consumer.ack(delivery.delivery_tag).await.unwrap();
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    consumer.unsubscribe().await.unwrap();

    assert!(matches!(
        next_event(&mut rx).await,
        SubscriptionEvent::End {
            reason: EndReason::Unsubscribed,
            ..
        }
    ));
    timeout(WAIT, subscription.wait_ended()).await.unwrap();
    assert_eq!(subscription.state(), SubscriptionState::Ended);
    assert!(rx.try_recv().is_err());

    // unsubscribing again is a no-op
    consumer.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn second_subscription_is_refused_while_active() {
    let fx = Fixture::new(AmqpConfig::default()).await;
    let consumer = fx.consumer(AckMode::Auto).await;
    let (tx, _rx) = mpsc::unbounded_channel();

    let subscription = consumer.subscribe(tx.clone()).await.unwrap();

    assert_eq!(
        consumer.subscribe(tx.clone()).await.unwrap_err(),
        AmqpError::AlreadySubscribed(subscription.tag().to_owned())
    );
    assert!(matches!(
        consumer.get(&GetOptions::default()).await,
        Err(AmqpError::ModeError(_))
    ));

    consumer.unsubscribe().await.unwrap();
    timeout(WAIT, subscription.wait_ended()).await.unwrap();

    let resubscribed = consumer.subscribe(tx).await.unwrap();
    assert_ne!(resubscribed.tag(), subscription.tag());
}

#[tokio::test]
async fn deleted_queue_ends_subscription() {
    let fx = Fixture::new(AmqpConfig::default()).await;
    let consumer = fx.consumer(AckMode::Auto).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    consumer.subscribe(tx).await.unwrap();

    assert!(matches!(
        next_event(&mut rx).await,
        SubscriptionEvent::Begin { .. }
    ));
    fx.broker.delete_queue("jobs");

    assert!(matches!(
        next_event(&mut rx).await,
        SubscriptionEvent::End {
            reason: EndReason::BrokerCancelled,
            ..
        }
    ));
}

#[tokio::test]
async fn closing_the_connection_ends_subscription() {
    let fx = Fixture::new(AmqpConfig::default()).await;
    let consumer = fx.consumer(AckMode::Manual).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = consumer.subscribe(tx).await.unwrap();

    fx.publish("unacked").await;
    assert!(matches!(
        next_event(&mut rx).await,
        SubscriptionEvent::Begin { .. }
    ));
    assert!(matches!(
        next_event(&mut rx).await,
        SubscriptionEvent::Message { .. }
    ));

    fx.conn.close().await.unwrap();

    assert!(matches!(
        next_event(&mut rx).await,
        SubscriptionEvent::End {
            reason: EndReason::ChannelClosed,
            ..
        }
    ));
    timeout(WAIT, subscription.wait_ended()).await.unwrap();
    assert_eq!(
        consumer.get(&GetOptions::default()).await,
        Err(AmqpError::ChannelClosed)
    );
}

#[tokio::test]
async fn exchange_source_declares_and_binds_a_queue() {
    let fx = Fixture::new(AmqpConfig::default()).await;
    let channel = fx.conn.open_channel().await.unwrap();
    channel
        .declare_exchange(&ExchangeDefinition::new("events").fanout())
        .await
        .unwrap();

    let consumer = Consumer::new(
        channel.clone(),
        Source::exchange("events", "", ""),
        AckMode::Auto,
    )
    .await
    .unwrap();
    assert!(consumer.queue().starts_with("amq.gen-"));
    assert_eq!(consumer.exchange(), Some("events"));

    Producer::new(channel, Destination::exchange("events", None))
        .publish(b"broadcast", &PublishOptions::default())
        .await
        .unwrap();

    let delivery = consumer
        .get(&GetOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.exchange, "events");
    assert_eq!(delivery.body, b"broadcast");
}

/// Holds every delivery until released, then acks it.
struct Gate {
    consumer: Consumer,
    release: Arc<Notify>,
    seen: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl SubscriptionHandler for Gate {
    async fn handle(&self, event: SubscriptionEvent) {
        if let SubscriptionEvent::Message { delivery, .. } = event {
            self.seen.send(delivery.body.clone()).unwrap();
            self.release.notified().await;
            self.consumer.ack(delivery.delivery_tag).await.unwrap();
        }
    }
}

#[tokio::test]
async fn unsubscribe_returns_buffered_deliveries_in_queue_order() {
    let fx = Fixture::new(AmqpConfig::default()).await;
    let consumer = fx.consumer(AckMode::Manual).await;
    let release = Arc::new(Notify::new());
    let (seen_tx, mut seen) = mpsc::unbounded_channel();

    let subscription = consumer
        .subscribe(Gate {
            consumer: consumer.clone(),
            release: release.clone(),
            seen: seen_tx,
        })
        .await
        .unwrap();
    for body in ["a", "b", "c"] {
        fx.publish(body).await;
    }

    let first = timeout(WAIT, seen.recv()).await.unwrap();
    assert_eq!(first.as_deref(), Some(&b"a"[..]));

    consumer.unsubscribe().await.unwrap();
    release.notify_one();
    timeout(WAIT, subscription.wait_ended()).await.unwrap();

    assert!(seen.try_recv().is_err());
    assert_eq!(
        fx.broker.queued_bodies("jobs"),
        vec![b"b".to_vec(), b"c".to_vec()]
    );
}

#[tokio::test]
async fn late_get_reply_is_put_back_in_manual_mode() {
    let fx = Fixture::new(AmqpConfig {
        get_timeout_ms: 20,
        ..AmqpConfig::default()
    })
    .await;
    let consumer = fx.consumer(AckMode::Manual).await;
    fx.publish("slow").await;
    fx.broker.delay_gets(Duration::from_millis(100));

    assert_eq!(consumer.get(&GetOptions::default()).await, Ok(None));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fx.broker.queue_len("jobs"), Some(1));

    fx.broker.delay_gets(Duration::ZERO);
    let again = consumer
        .get(&GetOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert!(again.redelivered);
    assert_eq!(again.body, b"slow");
    assert!(consumer.is_outstanding(again.delivery_tag));
}
