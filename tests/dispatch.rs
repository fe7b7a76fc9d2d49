// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use amqp_runtime::{
    config::AmqpConfig,
    connection::Connection,
    consumer::{AckMode, Consumer, GetOptions, Source},
    decoder::JsonDecoder,
    memory::MemoryBroker,
    pattern::Pattern,
    protocol::Delivery,
    publisher::{Destination, Producer, PublishOptions},
    queue::QueueDefinition,
    router::{
        handler_fn, DispatchOutcome, DispatchReporter, HandlerError, PatternDispatcher, Route,
    },
    topology::AmqpTopology,
    value::Value,
};
use serde::Deserialize;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::mpsc, time::timeout};

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<DispatchOutcome>>>);

impl Recorder {
    fn outcomes(&self) -> Vec<DispatchOutcome> {
        self.0.lock().unwrap().clone()
    }
}

impl DispatchReporter for Recorder {
    fn report(&self, _delivery_tag: u64, outcome: &DispatchOutcome) {
        self.0.lock().unwrap().push(outcome.clone());
    }
}

struct Fixture {
    broker: MemoryBroker,
    _conn: Connection,
    producer: Producer,
    consumer: Consumer,
}

impl Fixture {
    async fn new() -> Fixture {
        let broker = MemoryBroker::new();
        let conn = Connection::open_with(&broker, AmqpConfig::default())
            .await
            .unwrap();
        let channel = conn.open_channel().await.unwrap();
        AmqpTopology::new()
            .queue(QueueDefinition::new("commands").with_dlq())
            .install(&channel)
            .await
            .unwrap();

        let consumer = Consumer::new(
            conn.open_channel().await.unwrap(),
            Source::queue("commands"),
            AckMode::Manual,
        )
        .await
        .unwrap();

        Fixture {
            broker,
            producer: Producer::new(channel, Destination::queue("commands")),
            consumer,
            _conn: conn,
        }
    }

    async fn publish(&self, body: &[u8]) {
        self.producer
            .publish(body, &PublishOptions::default())
            .await
            .unwrap();
    }

    async fn next(&self) -> Delivery {
        self.consumer
            .get(&GetOptions::default())
            .await
            .unwrap()
            .expect("a ready message")
    }
}

fn ok() -> Result<(), HandlerError> {
    Ok(())
}

#[tokio::test]
async fn first_matching_clause_wins_and_acks() {
    let fx = Fixture::new().await;
    let recorder = Recorder::default();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let pongs = tx.clone();
    let dispatcher = PatternDispatcher::builder(fx.consumer.clone())
        .decoder(JsonDecoder)
        .on(
            Pattern::map([("cmd", Pattern::eq("ping"))]),
            handler_fn(move |_msg| {
                let pongs = pongs.clone();
                async move {
                    pongs.send("pong").unwrap();
                    ok()
                }
            }),
        )
        .on(
            Pattern::Any,
            handler_fn(move |_msg| {
                let tx = tx.clone();
                async move {
                    tx.send("any").unwrap();
                    ok()
                }
            }),
        )
        .reporter(recorder.clone())
        .build();

    fx.publish(br#"{"cmd":"ping","id":1}"#).await;
    let delivery = fx.next().await;
    let tag = delivery.delivery_tag;

    let outcome = dispatcher.dispatch(delivery).await;

    assert_eq!(outcome, DispatchOutcome::Handled(Route::Clause(0)));
    assert_eq!(rx.try_recv(), Ok("pong"));
    assert!(rx.try_recv().is_err());
    assert!(!fx.consumer.is_outstanding(tag));
    assert_eq!(recorder.outcomes(), vec![outcome]);
}

#[tokio::test]
async fn bindings_reach_the_handler() {
    #[derive(Deserialize)]
    struct Resize {
        width: u32,
    }

    let fx = Fixture::new().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let dispatcher = PatternDispatcher::builder(fx.consumer.clone())
        .decoder(JsonDecoder)
        .on(
            Pattern::map([
                ("cmd", Pattern::eq("resize")),
                ("width", Pattern::bind("w", Pattern::number())),
            ]),
            handler_fn(move |msg| {
                let tx = tx.clone();
                async move {
                    let typed: Resize = msg.json()?;
                    tx.send((msg.binding("w").cloned(), typed.width)).unwrap();
                    ok()
                }
            }),
        )
        .build();

    fx.publish(br#"{"cmd":"resize","width":640}"#).await;
    dispatcher.dispatch(fx.next().await).await;

    assert_eq!(rx.try_recv(), Ok((Some(Value::Int(640)), 640)));
}

#[tokio::test]
async fn unmatched_message_goes_to_catch_all() {
    let fx = Fixture::new().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let dispatcher = PatternDispatcher::builder(fx.consumer.clone())
        .decoder(JsonDecoder)
        .on(
            Pattern::map([("cmd", Pattern::eq("ping"))]),
            handler_fn(|_msg| async { ok() }),
        )
        .otherwise(handler_fn(move |msg| {
            let tx = tx.clone();
            async move {
                tx.send(msg.value().clone()).unwrap();
                ok()
            }
        }))
        .build();

    fx.publish(br#"{"cmd":"reboot"}"#).await;
    let outcome = dispatcher.dispatch(fx.next().await).await;

    assert_eq!(outcome, DispatchOutcome::Handled(Route::CatchAll));
    assert_eq!(
        rx.try_recv().unwrap().get("cmd"),
        Some(&Value::String("reboot".to_owned()))
    );
}

#[tokio::test]
async fn unmatched_without_catch_all_is_dead_lettered() {
    let fx = Fixture::new().await;
    let recorder = Recorder::default();

    let dispatcher = PatternDispatcher::builder(fx.consumer.clone())
        .decoder(JsonDecoder)
        .on(Pattern::eq("ping"), handler_fn(|_msg| async { ok() }))
        .reporter(recorder.clone())
        .build();

    fx.publish(br#""pong""#).await;
    let outcome = dispatcher.dispatch(fx.next().await).await;

    assert_eq!(outcome, DispatchOutcome::Unmatched);
    assert_eq!(fx.broker.queue_len("commands"), Some(0));
    assert_eq!(
        fx.broker.queued_bodies("commands-dlq"),
        vec![br#""pong""#.to_vec()]
    );
}

#[tokio::test]
async fn undecodable_body_is_reported_and_left_unacked() {
    let fx = Fixture::new().await;
    let recorder = Recorder::default();

    let dispatcher = PatternDispatcher::builder(fx.consumer.clone())
        .decoder(JsonDecoder)
        .otherwise(handler_fn(|_msg| async { ok() }))
        .reporter(recorder.clone())
        .build();

    fx.publish(&[0xde, 0xad, 0xbe, 0xef]).await;
    let delivery = fx.next().await;
    let tag = delivery.delivery_tag;

    let outcome = dispatcher.dispatch(delivery).await;

    assert!(matches!(outcome, DispatchOutcome::DecodeFailed(_)));
    assert!(fx.consumer.is_outstanding(tag));
    assert_eq!(recorder.outcomes().len(), 1);
}

#[tokio::test]
async fn raw_body_clause_receives_undecodable_bodies() {
    let fx = Fixture::new().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let dispatcher = PatternDispatcher::builder(fx.consumer.clone())
        .decoder(JsonDecoder)
        .on_raw_body(handler_fn(move |msg| {
            let tx = tx.clone();
            async move {
                tx.send(msg.body().to_vec()).unwrap();
                ok()
            }
        }))
        .build();

    fx.publish(b"\x89PNG").await;
    let outcome = dispatcher.dispatch(fx.next().await).await;

    assert_eq!(outcome, DispatchOutcome::Handled(Route::RawBody));
    assert_eq!(rx.try_recv(), Ok(b"\x89PNG".to_vec()));
}

#[tokio::test]
async fn failing_handler_nacks_with_configured_requeue() {
    let fx = Fixture::new().await;

    let dispatcher = PatternDispatcher::builder(fx.consumer.clone())
        .on(
            Pattern::bytes(),
            handler_fn(|_msg| async { Err::<(), HandlerError>("downstream unavailable".into()) }),
        )
        .requeue_on_error(true)
        .build();

    fx.publish(b"job").await;
    let outcome = dispatcher.dispatch(fx.next().await).await;

    assert_eq!(
        outcome,
        DispatchOutcome::HandlerFailed {
            route: Route::Clause(0),
            reason: "downstream unavailable".to_owned(),
        }
    );
    let again = fx.next().await;
    assert!(again.redelivered);
}

#[tokio::test]
async fn panicking_handler_does_not_stop_dispatch() {
    let fx = Fixture::new().await;

    let dispatcher = PatternDispatcher::builder(fx.consumer.clone())
        .on(
            Pattern::bytes(),
            handler_fn(|msg| async move {
                if msg.body() == b"boom" {
                    panic!("handler exploded");
                }
                ok()
            }),
        )
        .build();

    fx.publish(b"boom").await;
    fx.publish(b"fine").await;

    let first = dispatcher.dispatch(fx.next().await).await;
    let second = dispatcher.dispatch(fx.next().await).await;

    assert!(matches!(first, DispatchOutcome::HandlerFailed { .. }));
    assert_eq!(second, DispatchOutcome::Handled(Route::Clause(0)));
    assert_eq!(fx.broker.queued_bodies("commands-dlq"), vec![b"boom".to_vec()]);
}

#[tokio::test]
async fn handler_may_settle_the_message_itself() {
    let fx = Fixture::new().await;

    let dispatcher = PatternDispatcher::builder(fx.consumer.clone())
        .on(
            Pattern::bytes(),
            handler_fn(|msg| async move {
                msg.nack(true).await?;
                ok()
            }),
        )
        .build();

    fx.publish(b"later").await;
    let outcome = dispatcher.dispatch(fx.next().await).await;

    assert_eq!(outcome, DispatchOutcome::Handled(Route::Clause(0)));
    assert_eq!(fx.broker.queue_len("commands"), Some(1));
}

#[tokio::test]
async fn subscribed_dispatcher_handles_pushed_messages() {
    let fx = Fixture::new().await;
    let recorder = Recorder::default();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let dispatcher = PatternDispatcher::builder(fx.consumer.clone())
        .decoder(JsonDecoder)
        .on(
            Pattern::map([("cmd", Pattern::bind("cmd", Pattern::string()))]),
            handler_fn(move |msg| {
                let tx = tx.clone();
                async move {
                    let cmd = msg.binding("cmd").and_then(Value::as_str).unwrap_or_default();
                    tx.send(cmd.to_owned()).unwrap();
                    ok()
                }
            }),
        )
        .reporter(recorder.clone())
        .build();

    let subscription = dispatcher.subscribe().await.unwrap();
    for cmd in ["start", "stop"] {
        fx.publish(format!(r#"{{"cmd":"{}"}}"#, cmd).as_bytes()).await;
    }

    for expected in ["start", "stop"] {
        let cmd = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(cmd.as_deref(), Some(expected));
    }

    fx.consumer.unsubscribe().await.unwrap();
    timeout(Duration::from_secs(1), subscription.wait_ended())
        .await
        .unwrap();

    assert_eq!(recorder.outcomes().len(), 2);
    assert_eq!(fx.broker.queue_len("commands"), Some(0));

    let again = dispatcher.subscribe().await.unwrap();
    assert_ne!(again.tag(), subscription.tag());
}
