// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Client-side AMQP 0-9-1 runtime: connections and channels, producers with
//! confirm and transactional publishing, consumers with pull and push
//! delivery, and a pattern-matching message dispatcher.

mod amqp;
mod otel;

pub mod channel;
pub mod config;
pub mod confirm;
pub mod connection;
pub mod consumer;
pub mod decoder;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod memory;
pub mod pattern;
pub mod protocol;
pub mod publisher;
pub mod queue;
pub mod router;
pub mod topology;
pub mod value;

pub use amqp::LapinConnector;
