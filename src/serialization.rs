// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Serialization
//!
//! Serializers turn the ordered payload items of a channel message into a wire body and
//! back. Implementations must be safe to share between workers.

use crate::{errors::SerializationError, message::LogicalMessage};

/// Converts payload items to and from their wire body.
pub trait Serializer: Send + Sync {
    /// MIME-type suffix describing the body format (json, bson, ...).
    fn content_format(&self) -> &str;

    /// Encoding applied to the body, empty when none.
    fn content_encoding(&self) -> &str;

    fn serialize(&self, messages: &[LogicalMessage]) -> Result<Vec<u8>, SerializationError>;

    /// Rebuilds the payload items from a body, given the format and encoding advertised
    /// by the wire message.
    fn deserialize(
        &self,
        body: &[u8],
        format: &str,
        encoding: &str,
    ) -> Result<Vec<LogicalMessage>, SerializationError>;
}

/// JSON serializer backed by `serde_json`.
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_format(&self) -> &str {
        "json"
    }

    fn content_encoding(&self) -> &str {
        ""
    }

    fn serialize(&self, messages: &[LogicalMessage]) -> Result<Vec<u8>, SerializationError> {
        Ok(serde_json::to_vec(messages)?)
    }

    fn deserialize(
        &self,
        body: &[u8],
        format: &str,
        encoding: &str,
    ) -> Result<Vec<LogicalMessage>, SerializationError> {
        if !format.is_empty() && format != self.content_format() {
            return Err(SerializationError::new(format!(
                "unsupported content format `{format}`"
            )));
        }

        if !encoding.is_empty() {
            return Err(SerializationError::new(format!(
                "unsupported content encoding `{encoding}`"
            )));
        }

        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_payload_items_in_order() {
        let serializer = JsonSerializer;
        let messages = vec![
            LogicalMessage::from_value("first", json!(1)),
            LogicalMessage::from_value("second", json!({"a": "b"})),
        ];

        let body = serializer.serialize(&messages).unwrap();
        let restored = serializer.deserialize(&body, "json", "").unwrap();

        assert_eq!(restored, messages);
    }

    #[test]
    fn rejects_foreign_formats() {
        let result = JsonSerializer.deserialize(b"[]", "bson", "");

        assert!(result.is_err());
    }

    #[test]
    fn rejects_garbage_bodies() {
        let result = JsonSerializer.deserialize(b"not json", "json", "");

        assert!(result.is_err());
    }
}
