// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Decoders
//!
//! Turn raw message bodies into [`Value`]s for pattern matching.

use crate::{errors::AmqpError, value::Value};
use tracing::debug;

/// Decodes a message body.
pub trait PayloadDecoder: Send + Sync {
    fn decode(&self, body: &[u8]) -> Result<Value, AmqpError>;
}

impl<F> PayloadDecoder for F
where
    F: Fn(&[u8]) -> Result<Value, AmqpError> + Send + Sync,
{
    fn decode(&self, body: &[u8]) -> Result<Value, AmqpError> {
        self(body)
    }
}

/// Decodes JSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl PayloadDecoder for JsonDecoder {
    fn decode(&self, body: &[u8]) -> Result<Value, AmqpError> {
        serde_json::from_slice::<serde_json::Value>(body)
            .map(Value::from)
            .map_err(|err| {
                debug!(error = err.to_string(), "body is not json");
                AmqpError::DecodeError(err.to_string())
            })
    }
}

/// Decodes UTF-8 text into [`Value::String`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TextDecoder;

impl PayloadDecoder for TextDecoder {
    fn decode(&self, body: &[u8]) -> Result<Value, AmqpError> {
        std::str::from_utf8(body)
            .map(|text| Value::String(text.to_owned()))
            .map_err(|err| AmqpError::DecodeError(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_decoder_rejects_binary() {
        assert!(matches!(
            JsonDecoder.decode(&[0xff, 0x00, 0x13]),
            Err(AmqpError::DecodeError(_))
        ));
        assert_eq!(JsonDecoder.decode(b"null"), Ok(Value::Null));
    }

    #[test]
    fn closures_are_decoders() {
        let upper = |body: &[u8]| -> Result<Value, AmqpError> {
            Ok(Value::String(String::from_utf8_lossy(body).to_uppercase()))
        };
        assert_eq!(upper.decode(b"hi"), Ok(Value::from("HI")));
    }

    #[test]
    fn text_decoder_requires_utf8() {
        assert_eq!(TextDecoder.decode(b"ping"), Ok(Value::from("ping")));
        assert!(TextDecoder.decode(&[0xc3, 0x28]).is_err());
    }
}
