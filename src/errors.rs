// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Runtime
//!
//! This module provides the error taxonomy shared by the connection manager,
//! producers, consumers and the pattern dispatcher. Errors are grouped by who
//! is expected to react to them: transport failures are fatal to the
//! connection, mode and tag errors are caller mistakes, and timeouts leave
//! the broker state unknown so the caller decides whether to retry.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Transport, authentication or protocol handshake failure.
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The broker refused to open a channel or a channel-level exception occurred.
    #[error("channel failure: {0}")]
    ChannelError(String),

    /// The channel (or its connection) is gone; the caller must open a new one.
    #[error("channel is closed")]
    ChannelClosed,

    /// The operation is not valid for the current channel or consumer mode.
    #[error("invalid operation for the current mode: {0}")]
    ModeError(String),

    /// The delivery tag is unknown or was already acked/nacked.
    #[error("unknown delivery tag `{0}`")]
    UnknownTag(u64),

    /// The consumer already has an active subscription.
    #[error("consumer already subscribed with tag `{0}`")]
    AlreadySubscribed(String),

    /// No confirm arrived in time. The message may or may not have been accepted.
    #[error("publisher confirm for sequence `{0}` timed out")]
    ConfirmTimeout(u64),

    /// A synchronous broker round-trip did not complete in time.
    #[error("`{0}` timed out")]
    Timeout(String),

    /// The payload decoder rejected a message body.
    #[error("failure to decode payload: {0}")]
    DecodeError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker negatively acknowledged a confirmed publish.
    #[error("publish `{0}` was nacked by the broker")]
    PublishNacked(u64),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error starting or cancelling a broker consumer
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    /// Whether the outcome of the failed operation is unknown to the client.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, AmqpError::ConfirmTimeout(_) | AmqpError::Timeout(_))
    }

    /// Whether the failure invalidated the channel it happened on.
    pub fn invalidates_channel(&self) -> bool {
        matches!(
            self,
            AmqpError::ChannelClosed | AmqpError::ChannelError(_) | AmqpError::ConnectionError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_ambiguous() {
        assert!(AmqpError::ConfirmTimeout(3).is_ambiguous());
        assert!(AmqpError::Timeout("tx.commit".to_owned()).is_ambiguous());
        assert!(!AmqpError::UnknownTag(1).is_ambiguous());
    }

    #[test]
    fn misuse_does_not_invalidate_channel() {
        assert!(!AmqpError::ModeError("commit".to_owned()).invalidates_channel());
        assert!(!AmqpError::AlreadySubscribed("ctag".to_owned()).invalidates_channel());
        assert!(AmqpError::ChannelClosed.invalidates_channel());
    }

    #[test]
    fn messages_name_the_subject() {
        assert_eq!(
            AmqpError::UnknownTag(42).to_string(),
            "unknown delivery tag `42`"
        );
        assert_eq!(
            AmqpError::BindingExchangeToQueueError("ex".to_owned(), "q".to_owned()).to_string(),
            "failure to binding exchange `ex` to queue `q`"
        );
    }
}
