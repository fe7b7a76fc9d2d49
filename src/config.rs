// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Configuration
//!
//! Options recognized by [`Connection::open`](crate::connection::Connection::open).
//! The struct deserializes from any serde format with every field optional,
//! and can also be loaded from `RABBITMQ_*` environment variables.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use std::{env, str::FromStr, time::Duration};

/// RFC 3986 unreserved characters stay as they are.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// What `Consumer::get` returns when the broker does not answer in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GetTimeoutPolicy {
    /// Treat the timeout as an empty queue.
    #[default]
    Empty,
    /// Surface the timeout as `AmqpError::Timeout`.
    Error,
}

impl FromStr for GetTimeoutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "empty" => Ok(GetTimeoutPolicy::Empty),
            "error" => Ok(GetTimeoutPolicy::Error),
            other => Err(format!("unknown get timeout policy `{}`", other)),
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub tls: bool,
    pub connection_name: String,
    /// Open a default channel as part of `Connection::open`.
    pub eager_channel: bool,
    /// Zero leaves the broker default (unlimited).
    pub prefetch_count: u16,
    pub confirm_timeout_ms: u64,
    pub get_timeout_ms: u64,
    pub tx_timeout_ms: u64,
    pub get_timeout_policy: GetTimeoutPolicy,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        AmqpConfig {
            host: "localhost".to_owned(),
            port: 5672,
            username: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            tls: false,
            connection_name: "amqp-runtime".to_owned(),
            eager_channel: false,
            prefetch_count: 0,
            confirm_timeout_ms: 5_000,
            get_timeout_ms: 2_000,
            tx_timeout_ms: 5_000,
            get_timeout_policy: GetTimeoutPolicy::Empty,
        }
    }
}

impl AmqpConfig {
    /// Loads the configuration from `RABBITMQ_*` environment variables.
    ///
    /// Unset or unparsable variables keep their default value.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = AmqpConfig::default();

        if let Some(v) = lookup("RABBITMQ_HOST") {
            cfg.host = v;
        }
        if let Some(v) = lookup("RABBITMQ_PORT").and_then(|v| v.parse().ok()) {
            cfg.port = v;
        }
        if let Some(v) = lookup("RABBITMQ_USER") {
            cfg.username = v;
        }
        if let Some(v) = lookup("RABBITMQ_PASSWORD") {
            cfg.password = v;
        }
        if let Some(v) = lookup("RABBITMQ_VHOST") {
            cfg.vhost = v;
        }
        if let Some(v) = lookup("RABBITMQ_TLS").and_then(|v| v.parse().ok()) {
            cfg.tls = v;
        }
        if let Some(v) = lookup("RABBITMQ_CONNECTION_NAME") {
            cfg.connection_name = v;
        }
        if let Some(v) = lookup("RABBITMQ_EAGER_CHANNEL").and_then(|v| v.parse().ok()) {
            cfg.eager_channel = v;
        }
        if let Some(v) = lookup("RABBITMQ_PREFETCH_COUNT").and_then(|v| v.parse().ok()) {
            cfg.prefetch_count = v;
        }
        if let Some(v) = lookup("RABBITMQ_CONFIRM_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            cfg.confirm_timeout_ms = v;
        }
        if let Some(v) = lookup("RABBITMQ_GET_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            cfg.get_timeout_ms = v;
        }
        if let Some(v) = lookup("RABBITMQ_TX_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            cfg.tx_timeout_ms = v;
        }
        if let Some(v) = lookup("RABBITMQ_GET_TIMEOUT_POLICY").and_then(|v| v.parse().ok()) {
            cfg.get_timeout_policy = v;
        }

        cfg
    }

    /// Builds the broker URI, percent-encoding credentials and vhost.
    pub fn uri(&self) -> String {
        let scheme = if self.tls { "amqps" } else { "amqp" };
        format!(
            "{}://{}:{}@{}:{}/{}",
            scheme,
            utf8_percent_encode(&self.username, URI_COMPONENT),
            utf8_percent_encode(&self.password, URI_COMPONENT),
            self.host,
            self.port,
            utf8_percent_encode(&self.vhost, URI_COMPONENT)
        )
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.get_timeout_ms)
    }

    pub fn tx_timeout(&self) -> Duration {
        Duration::from_millis(self.tx_timeout_ms)
    }
}
