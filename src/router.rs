// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pattern-Match Dispatch
//!
//! A declarative layer over [`Consumer`]. Each delivery is decoded (when a
//! decoder is configured) and routed to the first clause whose pattern
//! matches, falling back to a catch-all clause:
//!
//! 1. A body the decoder rejects goes to the raw-body clause, or is reported
//!    as a decode failure and left unacked.
//! 2. Clauses are tried in declaration order; the first match runs with its
//!    bindings.
//! 3. Nothing matched: the catch-all clause runs, or the message is reported
//!    as unmatched.
//! 4. With a manual-ack consumer, a handler that did not settle the message
//!    itself gets it acked on success and nacked (no requeue unless
//!    configured) on failure or panic.
//!
//! ```no_run
//! # async fn run(consumer: amqp_runtime::consumer::Consumer) -> Result<(), amqp_runtime::errors::AmqpError> {
//! use amqp_runtime::{decoder::JsonDecoder, pattern::Pattern, router::{handler_fn, PatternDispatcher}};
//!
//! let dispatcher = PatternDispatcher::builder(consumer)
//!     .decoder(JsonDecoder)
//!     .on(
//!         Pattern::map([("cmd", Pattern::eq("ping"))]),
//!         handler_fn(|_msg| async { Ok(()) }),
//!     )
//!     .otherwise(handler_fn(|msg| async move {
//!         tracing::warn!(body = ?msg.body(), "unknown command");
//!         Ok(())
//!     }))
//!     .build();
//!
//! let subscription = dispatcher.subscribe().await?;
//! # let _ = subscription;
//! # Ok(())
//! # }
//! ```

use crate::{
    consumer::{AckMode, Consumer},
    decoder::PayloadDecoder,
    dispatcher::{SubscriptionEvent, SubscriptionHandle, SubscriptionHandler},
    errors::AmqpError,
    otel,
    pattern::{Bindings, Pattern},
    protocol::Delivery,
    value::Value,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, future::Future, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, warn};

/// Error type returned by clause handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Which clause a message was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// A pattern clause, by declaration index.
    Clause(usize),
    /// The raw-body clause, after the decoder rejected the body.
    RawBody,
    /// The catch-all clause.
    CatchAll,
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled(Route),
    HandlerFailed { route: Route, reason: String },
    /// The body could not be decoded and no raw-body clause exists.
    /// The message is left unacked.
    DecodeFailed(String),
    /// No clause matched and no catch-all exists.
    Unmatched,
}

/// Receives every dispatch outcome.
pub trait DispatchReporter: Send + Sync {
    fn report(&self, delivery_tag: u64, outcome: &DispatchOutcome);
}

/// Reports outcomes through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl DispatchReporter for TracingReporter {
    fn report(&self, delivery_tag: u64, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Handled(route) => {
                debug!(delivery_tag, ?route, "message successfully processed")
            }
            DispatchOutcome::HandlerFailed { route, reason } => {
                error!(delivery_tag, ?route, reason = reason.as_str(), "handler failure")
            }
            DispatchOutcome::DecodeFailed(reason) => {
                error!(delivery_tag, reason = reason.as_str(), "failure to decode payload")
            }
            DispatchOutcome::Unmatched => warn!(delivery_tag, "no clause matched message"),
        }
    }
}

/// A delivery routed to a clause, with its decoded value and bindings.
pub struct Message {
    delivery: Delivery,
    value: Value,
    bindings: Bindings,
    consumer: Consumer,
    ctx: Context,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("delivery_tag", &self.delivery.delivery_tag)
            .field("value", &self.value)
            .field("bindings", &self.bindings)
            .finish()
    }
}

impl Message {
    pub fn body(&self) -> &[u8] {
        &self.delivery.body
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// The decoded body; `Value::Bytes` when nothing was decoded.
    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    pub fn binding(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    /// Trace context extracted from the message headers.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Deserializes the body as JSON into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.delivery.body)
            .map_err(|err| AmqpError::DecodeError(err.to_string()))
    }

    /// Acks the message now instead of leaving it to the dispatcher.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.consumer.ack(self.delivery.delivery_tag).await
    }

    /// Nacks the message now instead of leaving it to the dispatcher.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.consumer.nack(self.delivery.delivery_tag, requeue).await
    }
}

/// Handles the messages routed to one clause.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, msg: Arc<Message>) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, msg: Arc<Message>) -> Result<(), HandlerError> {
        (self.0)(msg).await
    }
}

type Extractor = Box<dyn Fn(&Value) -> Bindings + Send + Sync>;
type Test = Box<dyn Fn(&Value) -> bool + Send + Sync>;

struct Clause {
    predicate: Test,
    extractor: Extractor,
    handler: Arc<dyn MessageHandler>,
}

/// Collects clauses for a [`PatternDispatcher`].
pub struct PatternDispatcherBuilder {
    consumer: Consumer,
    decoder: Option<Arc<dyn PayloadDecoder>>,
    clauses: Vec<Clause>,
    raw_body: Option<Arc<dyn MessageHandler>>,
    catch_all: Option<Arc<dyn MessageHandler>>,
    reporter: Arc<dyn DispatchReporter>,
    requeue_on_error: bool,
}

impl PatternDispatcherBuilder {
    /// Decodes bodies before matching. Without one, patterns see `Value::Bytes`.
    pub fn decoder<D>(mut self, decoder: D) -> Self
    where
        D: PayloadDecoder + 'static,
    {
        self.decoder = Some(Arc::new(decoder));
        self
    }

    /// Adds a clause tried after the ones already declared.
    pub fn on<H>(self, pattern: Pattern, handler: H) -> Self
    where
        H: MessageHandler,
    {
        let extract = pattern.clone();
        self.on_match(
            move |v| pattern.matches(v),
            move |v| extract.bindings(v),
            handler,
        )
    }

    /// Adds a clause from an explicit predicate and binding projection.
    pub fn on_match<P, E, H>(mut self, predicate: P, extractor: E, handler: H) -> Self
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
        E: Fn(&Value) -> Bindings + Send + Sync + 'static,
        H: MessageHandler,
    {
        self.clauses.push(Clause {
            predicate: Box::new(predicate),
            extractor: Box::new(extractor),
            handler: Arc::new(handler),
        });
        self
    }

    /// Receives bodies the decoder rejected.
    pub fn on_raw_body<H>(mut self, handler: H) -> Self
    where
        H: MessageHandler,
    {
        self.raw_body = Some(Arc::new(handler));
        self
    }

    /// Receives decoded messages no clause matched.
    pub fn otherwise<H>(mut self, handler: H) -> Self
    where
        H: MessageHandler,
    {
        self.catch_all = Some(Arc::new(handler));
        self
    }

    pub fn reporter<R>(mut self, reporter: R) -> Self
    where
        R: DispatchReporter + 'static,
    {
        self.reporter = Arc::new(reporter);
        self
    }

    /// Requeue instead of dropping messages whose handler failed.
    pub fn requeue_on_error(mut self, requeue: bool) -> Self {
        self.requeue_on_error = requeue;
        self
    }

    pub fn build(self) -> PatternDispatcher {
        PatternDispatcher {
            consumer: self.consumer,
            compiled: Arc::new(Compiled {
                decoder: self.decoder,
                clauses: self.clauses,
                raw_body: self.raw_body,
                catch_all: self.catch_all,
                reporter: self.reporter,
                requeue_on_error: self.requeue_on_error,
            }),
        }
    }
}

struct Compiled {
    decoder: Option<Arc<dyn PayloadDecoder>>,
    clauses: Vec<Clause>,
    raw_body: Option<Arc<dyn MessageHandler>>,
    catch_all: Option<Arc<dyn MessageHandler>>,
    reporter: Arc<dyn DispatchReporter>,
    requeue_on_error: bool,
}

/// Clauses compiled and bound to a consumer.
#[derive(Clone)]
pub struct PatternDispatcher {
    consumer: Consumer,
    compiled: Arc<Compiled>,
}

impl PatternDispatcher {
    pub fn builder(consumer: Consumer) -> PatternDispatcherBuilder {
        PatternDispatcherBuilder {
            consumer,
            decoder: None,
            clauses: vec![],
            raw_body: None,
            catch_all: None,
            reporter: Arc::new(TracingReporter),
            requeue_on_error: false,
        }
    }

    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    /// Subscribes the consumer and dispatches every delivery.
    pub async fn subscribe(&self) -> Result<SubscriptionHandle, AmqpError> {
        self.consumer.subscribe(self.clone()).await
    }

    /// Dispatches one delivery, e.g. one obtained with `Consumer::get`.
    pub async fn dispatch(&self, delivery: Delivery) -> DispatchOutcome {
        let compiled = &self.compiled;
        let delivery_tag = delivery.delivery_tag;

        let tracer = global::tracer("amqp consumer");
        let span_name = delivery
            .properties
            .message_type
            .clone()
            .unwrap_or_else(|| self.consumer.queue().to_owned());
        let (ctx, mut span) = otel::new_span(&delivery.properties, &tracer, &span_name);

        let decoded = match &compiled.decoder {
            Some(decoder) => decoder.decode(&delivery.body).map(Some),
            None => Ok(None),
        };

        let (route, value, bindings, handler) = match decoded {
            Err(err) => match &compiled.raw_body {
                Some(handler) => {
                    let value = Value::Bytes(delivery.body.clone());
                    (Route::RawBody, value, Bindings::new(), handler.clone())
                }
                None => {
                    let outcome = DispatchOutcome::DecodeFailed(err.to_string());
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("failure to decode payload"),
                    });
                    compiled.reporter.report(delivery_tag, &outcome);
                    return outcome;
                }
            },
            Ok(decoded) => {
                let value = decoded.unwrap_or_else(|| Value::Bytes(delivery.body.clone()));
                match self.select(&value) {
                    Some((route, bindings, handler)) => (route, value, bindings, handler),
                    None => {
                        let outcome = DispatchOutcome::Unmatched;
                        span.set_status(Status::Error {
                            description: Cow::from("no clause matched"),
                        });
                        self.settle_unhandled(delivery_tag, false).await;
                        compiled.reporter.report(delivery_tag, &outcome);
                        return outcome;
                    }
                }
            }
        };

        let msg = Arc::new(Message {
            delivery,
            value,
            bindings,
            consumer: self.consumer.clone(),
            ctx,
        });

        let result = AssertUnwindSafe(handler.handle(msg))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err("handler panicked".into()));

        let outcome = match result {
            Ok(()) => {
                self.settle_handled(delivery_tag).await;
                span.set_status(Status::Ok);
                DispatchOutcome::Handled(route)
            }
            Err(err) => {
                span.record_error(err.as_ref());
                span.set_status(Status::Error {
                    description: Cow::from("handler failure"),
                });
                self.settle_unhandled(delivery_tag, compiled.requeue_on_error)
                    .await;
                DispatchOutcome::HandlerFailed {
                    route,
                    reason: err.to_string(),
                }
            }
        };

        compiled.reporter.report(delivery_tag, &outcome);
        outcome
    }

    fn select(&self, value: &Value) -> Option<(Route, Bindings, Arc<dyn MessageHandler>)> {
        let compiled = &self.compiled;

        compiled
            .clauses
            .iter()
            .enumerate()
            .find(|(_, clause)| (clause.predicate)(value))
            .map(|(index, clause)| {
                (
                    Route::Clause(index),
                    (clause.extractor)(value),
                    clause.handler.clone(),
                )
            })
            .or_else(|| {
                compiled
                    .catch_all
                    .clone()
                    .map(|handler| (Route::CatchAll, Bindings::new(), handler))
            })
    }

    /// Acks a message the handler left unsettled.
    async fn settle_handled(&self, delivery_tag: u64) {
        if !self.needs_settling(delivery_tag) {
            return;
        }
        if let Err(err) = self.consumer.ack(delivery_tag).await {
            error!(delivery_tag, error = err.to_string(), "error whiling ack msg");
        }
    }

    /// Nacks a message the handler failed on (or no clause wanted).
    async fn settle_unhandled(&self, delivery_tag: u64, requeue: bool) {
        if !self.needs_settling(delivery_tag) {
            return;
        }
        if let Err(err) = self.consumer.nack(delivery_tag, requeue).await {
            error!(delivery_tag, error = err.to_string(), "error whiling nack msg");
        }
    }

    fn needs_settling(&self, delivery_tag: u64) -> bool {
        self.consumer.ack_mode() == AckMode::Manual && self.consumer.is_outstanding(delivery_tag)
    }
}

#[async_trait]
impl SubscriptionHandler for PatternDispatcher {
    async fn handle(&self, event: SubscriptionEvent) {
        match event {
            SubscriptionEvent::Begin { tag } => {
                debug!(tag = tag.as_str(), "pattern dispatcher subscribed")
            }
            SubscriptionEvent::Message { delivery, .. } => {
                self.dispatch(delivery).await;
            }
            SubscriptionEvent::End { tag, reason } => {
                debug!(tag = tag.as_str(), ?reason, "pattern dispatcher unsubscribed")
            }
        }
    }
}
