// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publisher Confirms
//!
//! Correlates broker confirms with the publishes that caused them. The
//! publishing path registers a slot per sequence number, the resolver task
//! fed by the channel's confirm stream fills it, and the caller waits on the
//! matching [`ConfirmFuture`].

use crate::{
    errors::AmqpError,
    protocol::{ConfirmEvent, Confirmation},
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

/// Resolves to the broker's verdict for one confirmed publish.
///
/// Waiting consumes the future, so a confirm is observed at most once.
#[derive(Debug)]
pub struct ConfirmFuture {
    sequence: u64,
    timeout: Duration,
    rx: oneshot::Receiver<Confirmation>,
}

impl ConfirmFuture {
    /// The channel-scoped publish sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Waits with the connection's `confirm_timeout`.
    pub async fn wait(self) -> Result<Confirmation, AmqpError> {
        let timeout = self.timeout;
        self.wait_timeout(timeout).await
    }

    /// Waits at most `timeout`.
    ///
    /// `ConfirmTimeout` does not mean the message was lost, only that the
    /// broker did not answer in time.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<Confirmation, AmqpError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Err(_) => Err(AmqpError::ConfirmTimeout(self.sequence)),
            Ok(Err(_)) => Err(AmqpError::ChannelClosed),
            Ok(Ok(confirmation)) => Ok(confirmation),
        }
    }
}

#[derive(Default)]
struct Slots {
    next_sequence: u64,
    pending: BTreeMap<u64, oneshot::Sender<Confirmation>>,
    closed: bool,
}

/// Sequence number to pending-result table for one channel.
pub(crate) struct ConfirmTracker {
    slots: Mutex<Slots>,
    settled: Notify,
    timeout: Duration,
}

impl ConfirmTracker {
    pub(crate) fn new(timeout: Duration) -> Arc<ConfirmTracker> {
        Arc::new(ConfirmTracker {
            slots: Mutex::new(Slots {
                next_sequence: 1,
                ..Slots::default()
            }),
            settled: Notify::new(),
            timeout,
        })
    }

    /// Starts resolving slots from the channel's confirm stream.
    pub(crate) fn spawn(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<ConfirmEvent>) {
        let tracker = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                tracker.resolve(event);
            }
            debug!("confirm stream ended");
            tracker.close();
        });
    }

    /// Allocates the next sequence number. Must be called in publish order.
    pub(crate) fn register(&self) -> Result<ConfirmFuture, AmqpError> {
        let mut slots = self.lock();
        if slots.closed {
            return Err(AmqpError::ChannelClosed);
        }

        let sequence = slots.next_sequence;
        slots.next_sequence += 1;

        let (tx, rx) = oneshot::channel();
        slots.pending.insert(sequence, tx);

        Ok(ConfirmFuture {
            sequence,
            timeout: self.timeout,
            rx,
        })
    }

    /// Drops the slot of a publish that never reached the broker.
    pub(crate) fn forget(&self, sequence: u64) {
        self.lock().pending.remove(&sequence);
        self.settled.notify_waiters();
    }

    pub(crate) fn resolve(&self, event: ConfirmEvent) {
        let resolved = {
            let mut slots = self.lock();
            if event.multiple {
                let rest = slots.pending.split_off(&(event.sequence + 1));
                std::mem::replace(&mut slots.pending, rest)
                    .into_values()
                    .collect::<Vec<_>>()
            } else {
                slots.pending.remove(&event.sequence).into_iter().collect()
            }
        };

        if resolved.is_empty() {
            warn!(sequence = event.sequence, "confirm for unknown sequence number");
        }

        for slot in resolved {
            // the caller may have dropped its future
            let _ = slot.send(event.confirmation.clone());
        }

        self.settled.notify_waiters();
    }

    /// Fails every pending slot; waiters observe `ChannelClosed`.
    pub(crate) fn close(&self) {
        let mut slots = self.lock();
        slots.closed = true;
        slots.pending.clear();
        drop(slots);
        self.settled.notify_waiters();
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.lock().pending.len()
    }

    /// Waits until every registered publish has been confirmed.
    pub(crate) async fn wait_for_confirms(&self, timeout: Duration) -> Result<(), AmqpError> {
        let wait = async {
            loop {
                let notified = self.settled.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let (drained, closed) = {
                    let slots = self.lock();
                    (slots.pending.is_empty(), slots.closed)
                };
                if drained {
                    return Ok(());
                }
                if closed {
                    return Err(AmqpError::ChannelClosed);
                }

                notified.await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(AmqpError::Timeout("wait_for_confirms".to_owned())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(sequence: u64, multiple: bool) -> ConfirmEvent {
        ConfirmEvent {
            sequence,
            multiple,
            confirmation: Confirmation::Ack,
        }
    }

    #[tokio::test]
    async fn sequence_numbers_start_at_one() {
        let tracker = ConfirmTracker::new(Duration::from_secs(1));
        let first = tracker.register().unwrap();
        let second = tracker.register().unwrap();

        assert_eq!(first.sequence(), 1);
        assert_eq!(second.sequence(), 2);
        assert_eq!(tracker.outstanding(), 2);
    }

    #[tokio::test]
    async fn individual_confirm_resolves_one_slot() {
        let tracker = ConfirmTracker::new(Duration::from_secs(1));
        let first = tracker.register().unwrap();
        let second = tracker.register().unwrap();

        tracker.resolve(ConfirmEvent {
            sequence: 2,
            multiple: false,
            confirmation: Confirmation::Nack("queue full".to_owned()),
        });

        assert_eq!(
            second.wait().await,
            Ok(Confirmation::Nack("queue full".to_owned()))
        );
        assert_eq!(tracker.outstanding(), 1);
        assert_eq!(
            first.wait_timeout(Duration::from_millis(20)).await,
            Err(AmqpError::ConfirmTimeout(1))
        );
    }

    #[tokio::test]
    async fn cumulative_confirm_resolves_up_to_sequence() {
        let tracker = ConfirmTracker::new(Duration::from_secs(1));
        let futures: Vec<_> = (0..4).map(|_| tracker.register().unwrap()).collect();

        tracker.resolve(ack(3, true));

        assert_eq!(tracker.outstanding(), 1);
        let mut futures = futures.into_iter();
        for _ in 0..3 {
            assert_eq!(futures.next().unwrap().wait().await, Ok(Confirmation::Ack));
        }
    }

    #[tokio::test]
    async fn duplicate_confirm_is_ignored() {
        let tracker = ConfirmTracker::new(Duration::from_secs(1));
        let future = tracker.register().unwrap();

        tracker.resolve(ack(1, false));
        tracker.resolve(ack(1, false));

        assert_eq!(future.wait().await, Ok(Confirmation::Ack));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn closing_the_stream_fails_pending_slots() {
        let tracker = ConfirmTracker::new(Duration::from_secs(1));
        let (tx, rx) = mpsc::unbounded_channel();
        tracker.spawn(rx);

        let future = tracker.register().unwrap();
        drop(tx);

        assert_eq!(future.wait().await, Err(AmqpError::ChannelClosed));
        assert_eq!(tracker.register().unwrap_err(), AmqpError::ChannelClosed);
    }

    #[tokio::test]
    async fn wait_for_confirms_returns_once_drained() {
        let tracker = ConfirmTracker::new(Duration::from_secs(1));
        let (tx, rx) = mpsc::unbounded_channel();
        tracker.spawn(rx);

        let _first = tracker.register().unwrap();
        let _second = tracker.register().unwrap();

        assert_eq!(
            tracker.wait_for_confirms(Duration::from_millis(20)).await,
            Err(AmqpError::Timeout("wait_for_confirms".to_owned()))
        );

        tx.send(ack(2, true)).unwrap();
        assert_eq!(tracker.wait_for_confirms(Duration::from_secs(1)).await, Ok(()));
    }
}
