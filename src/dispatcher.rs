// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Dispatcher
//!
//! The delivery loop behind [`Consumer::subscribe`](crate::consumer::Consumer::subscribe).
//! One task per subscription reads the broker consumer stream and hands the
//! handler a strictly ordered sequence of lifecycle events: one `Begin`,
//! the deliveries in arrival order, then one `End`.
//!
//! Cancellation is cooperative. `unsubscribe` moves the subscription to
//! `Ending` and waits for the broker's cancel-ok; from then on the loop stops
//! handing out messages, releases whatever it still had buffered and emits
//! `End`. A handler call already in progress is allowed to finish.

use crate::{
    consumer::{AckMode, Consumer},
    errors::AmqpError,
    protocol::{ConsumeEvent, ConsumeStream, Delivery},
};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

/// Why a subscription ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The caller unsubscribed.
    Unsubscribed,
    /// The broker cancelled the consumer (queue deleted, node failover...).
    BrokerCancelled,
    /// The channel or its connection went away.
    ChannelClosed,
}

/// Lifecycle events observed by a [`SubscriptionHandler`].
#[derive(Debug)]
pub enum SubscriptionEvent {
    Begin { tag: String },
    Message { tag: String, delivery: Delivery },
    End { tag: String, reason: EndReason },
}

impl SubscriptionEvent {
    pub fn tag(&self) -> &str {
        match self {
            SubscriptionEvent::Begin { tag }
            | SubscriptionEvent::Message { tag, .. }
            | SubscriptionEvent::End { tag, .. } => tag,
        }
    }
}

/// State of one subscription. `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    Ending,
    Ended,
}

/// Receives the lifecycle events of a subscription, one at a time.
///
/// With a manual-ack consumer the handler is responsible for acking each
/// delivery through the consumer.
#[async_trait]
pub trait SubscriptionHandler: Send + Sync + 'static {
    async fn handle(&self, event: SubscriptionEvent);
}

/// Forwards every event into an mpsc channel.
#[async_trait]
impl SubscriptionHandler for mpsc::UnboundedSender<SubscriptionEvent> {
    async fn handle(&self, event: SubscriptionEvent) {
        if self.send(event).is_err() {
            debug!("subscription event receiver dropped");
        }
    }
}

struct Control {
    state: watch::Sender<SubscriptionState>,
    cancel_acked: watch::Sender<bool>,
    /// Set once the delivery loop stopped reading; `End` is on its way.
    draining: AtomicBool,
}

impl Control {
    /// Applies a state transition; there is no way out of `Ended`.
    ///
    /// `Ending` may fall back to `Active` when a cancel failed, as long as the
    /// delivery loop is still running.
    fn transition(&self, next: SubscriptionState) -> bool {
        self.state.send_if_modified(|current| {
            let allowed = match (*current, next) {
                (SubscriptionState::Active, SubscriptionState::Ending)
                | (SubscriptionState::Ending, SubscriptionState::Ended) => true,
                (SubscriptionState::Ending, SubscriptionState::Active) => {
                    !self.draining.load(Ordering::Acquire)
                }
                _ => false,
            };
            if allowed {
                *current = next;
            }
            allowed
        })
    }

    /// Marks the loop as draining and moves to `Ending`, in one state update.
    fn drain(&self) {
        self.state.send_if_modified(|current| {
            self.draining.store(true, Ordering::Release);
            if *current == SubscriptionState::Active {
                *current = SubscriptionState::Ending;
                true
            } else {
                false
            }
        });
    }

    fn current(&self) -> SubscriptionState {
        *self.state.borrow()
    }
}

/// Handle to one subscription, returned by `Consumer::subscribe`.
#[derive(Clone)]
pub struct SubscriptionHandle {
    tag: String,
    state: watch::Receiver<SubscriptionState>,
    control: Arc<Control>,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("tag", &self.tag)
            .field("state", &self.state())
            .finish()
    }
}

impl SubscriptionHandle {
    /// The broker-assigned consumer tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn is_ended(&self) -> bool {
        self.state() == SubscriptionState::Ended
    }

    /// Waits until the `End` event has been handed to the handler.
    pub async fn wait_ended(&self) {
        let mut state = self.state.clone();
        // the sender lives as long as `control`, which we hold
        let _ = state
            .wait_for(|s| *s == SubscriptionState::Ended)
            .await;
    }

    /// Moves `Active` to `Ending`. Returns false if the subscription was
    /// already ending or ended.
    pub(crate) fn begin_cancel(&self) -> bool {
        self.control.transition(SubscriptionState::Ending)
    }

    /// Moves `Ending` back to `Active` after a failed cancel, so the next
    /// `unsubscribe` sends it again. Returns false once the loop is draining.
    pub(crate) fn abort_cancel(&self) -> bool {
        self.control.transition(SubscriptionState::Active)
    }

    /// Tells the delivery loop that the broker acknowledged the cancel.
    pub(crate) fn cancel_acknowledged(&self) {
        self.control.cancel_acked.send_replace(true);
    }
}

/// Spawns the delivery loop for a freshly started broker consumer.
pub(crate) fn spawn_subscription<H>(
    consumer: Consumer,
    stream: ConsumeStream,
    handler: H,
) -> SubscriptionHandle
where
    H: SubscriptionHandler,
{
    let (state_tx, state_rx) = watch::channel(SubscriptionState::Active);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let control = Arc::new(Control {
        state: state_tx,
        cancel_acked: cancel_tx,
        draining: AtomicBool::new(false),
    });

    let handle = SubscriptionHandle {
        tag: stream.tag.clone(),
        state: state_rx,
        control: control.clone(),
    };

    tokio::spawn(run(consumer, stream, handler, control, cancel_rx));

    handle
}

async fn run<H>(
    consumer: Consumer,
    stream: ConsumeStream,
    handler: H,
    control: Arc<Control>,
    mut cancel_acked: watch::Receiver<bool>,
) where
    H: SubscriptionHandler,
{
    let ConsumeStream { tag, mut events } = stream;
    debug!(tag = tag.as_str(), queue = consumer.queue(), "subscription started");

    invoke(&handler, SubscriptionEvent::Begin { tag: tag.clone() }).await;

    let mut watching_cancel = true;
    let reason = loop {
        tokio::select! {
            biased;

            changed = cancel_acked.changed(), if watching_cancel => {
                if changed.is_err() {
                    watching_cancel = false;
                    continue;
                }
                let acked = *cancel_acked.borrow_and_update();
                if acked {
                    release_buffered(&consumer, &mut events).await;
                    break EndReason::Unsubscribed;
                }
            }

            event = events.recv() => match event {
                Some(ConsumeEvent::Delivery(delivery)) => {
                    consumer.track(delivery.delivery_tag);
                    invoke(&handler, SubscriptionEvent::Message { tag: tag.clone(), delivery }).await;
                }
                Some(ConsumeEvent::Cancelled) => {
                    break ending_reason(&control, EndReason::BrokerCancelled);
                }
                None => {
                    break ending_reason(&control, EndReason::ChannelClosed);
                }
            },
        }
    };

    control.drain();
    invoke(
        &handler,
        SubscriptionEvent::End {
            tag: tag.clone(),
            reason,
        },
    )
    .await;
    control.transition(SubscriptionState::Ended);

    debug!(tag = tag.as_str(), ?reason, "subscription ended");
}

/// A stream that ends while we are cancelling ended because we asked it to.
fn ending_reason(control: &Control, otherwise: EndReason) -> EndReason {
    if control.current() == SubscriptionState::Ending {
        EndReason::Unsubscribed
    } else {
        otherwise
    }
}

/// Hands buffered deliveries back to the broker after the cancel-ok.
async fn release_buffered(
    consumer: &Consumer,
    events: &mut mpsc::UnboundedReceiver<ConsumeEvent>,
) {
    while let Ok(event) = events.try_recv() {
        let ConsumeEvent::Delivery(delivery) = event else {
            continue;
        };

        if consumer.ack_mode() == AckMode::Auto {
            warn!(
                delivery_tag = delivery.delivery_tag,
                "dropping auto-acked delivery received after cancel"
            );
            continue;
        }

        consumer.track(delivery.delivery_tag);
        if let Err(err) = consumer.nack(delivery.delivery_tag, true).await {
            release_failed(delivery.delivery_tag, &err);
        }
    }
}

fn release_failed(delivery_tag: u64, err: &AmqpError) {
    error!(
        delivery_tag,
        error = err.to_string(),
        "failure to release delivery after cancel"
    );
}

async fn invoke<H>(handler: &H, event: SubscriptionEvent)
where
    H: SubscriptionHandler,
{
    if AssertUnwindSafe(handler.handle(event))
        .catch_unwind()
        .await
        .is_err()
    {
        error!("subscription handler panicked");
    }
}
