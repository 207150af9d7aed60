// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Wire Messages
//!
//! A `WireMessage` is the framed form of a message as it travels on the broker: AMQP
//! properties, routing key and body. Each instance carries a process-local identity used
//! to cache its translation into a `ChannelMessage`; clones share that identity.

use lapin::{
    message::Delivery,
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties,
};
use uuid::Uuid;

/// Header holding the number of failed delivery attempts so far.
pub const ATTEMPT_COUNT_HEADER: &str = "x-attempt-count";

/// Framed message as sent to or received from the broker.
#[derive(Debug, Clone)]
pub struct WireMessage {
    id: Uuid,
    delivery_tag: u64,
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    body: Vec<u8>,
}

impl WireMessage {
    /// Creates an outgoing wire message.
    pub fn new(routing_key: &str, properties: BasicProperties, body: Vec<u8>) -> Self {
        WireMessage {
            id: Uuid::new_v4(),
            delivery_tag: 0,
            exchange: String::new(),
            routing_key: routing_key.to_owned(),
            properties,
            body,
        }
    }

    /// Captures a lapin delivery.
    pub fn from_delivery(delivery: &Delivery) -> Self {
        WireMessage {
            id: Uuid::new_v4(),
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            properties: delivery.properties.clone(),
            body: delivery.data.clone(),
        }
    }

    /// Process-local identity of this wire message.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Broker delivery tag; zero for outgoing messages.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Exchange the delivery came through.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Routing key of the message.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// AMQP properties.
    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    /// Raw payload.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Message identifier as advertised in the AMQP properties, empty when absent.
    pub fn message_id(&self) -> String {
        self.properties
            .message_id()
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_default()
    }

    /// Raw header value.
    pub fn header(&self, key: &str) -> Option<&AMQPValue> {
        self.properties
            .headers()
            .as_ref()
            .and_then(|headers| headers.inner().get(key))
    }

    /// Sets a raw header value.
    pub fn set_header(&mut self, key: &str, value: AMQPValue) {
        let mut headers = self.properties.headers().clone().unwrap_or_default();
        headers.insert(ShortString::from(key), value);

        let properties = std::mem::take(&mut self.properties);
        self.properties = properties.with_headers(headers);
    }

    /// Sets a string header.
    pub fn set_string_header(&mut self, key: &str, value: &str) {
        self.set_header(key, AMQPValue::LongString(LongString::from(value)));
    }

    /// Number of failed delivery attempts recorded on the message, zero when absent.
    pub fn attempt_count(&self) -> u32 {
        self.header(ATTEMPT_COUNT_HEADER)
            .and_then(header_to_string)
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or_default()
    }

    /// Stores the number of failed attempts.
    pub fn set_attempt_count(&mut self, count: u32) {
        self.set_header(
            ATTEMPT_COUNT_HEADER,
            AMQPValue::LongLongInt(LongLongInt::from(count)),
        );
    }

    pub(crate) fn headers_mut(&mut self) -> HeadersGuard<'_> {
        let headers = self.properties.headers().clone().unwrap_or_default();
        HeadersGuard {
            message: self,
            headers,
        }
    }
}

/// Scoped mutable access to the headers of a wire message; changes are written back on drop.
pub(crate) struct HeadersGuard<'a> {
    message: &'a mut WireMessage,
    headers: FieldTable,
}

impl HeadersGuard<'_> {
    pub(crate) fn table(&mut self) -> &mut FieldTable {
        &mut self.headers
    }
}

impl Drop for HeadersGuard<'_> {
    fn drop(&mut self) {
        let properties = std::mem::take(&mut self.message.properties);
        self.message.properties = properties.with_headers(std::mem::take(&mut self.headers));
    }
}

/// Renders a header value as a string, when it has a scalar representation.
pub fn header_to_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
        AMQPValue::Boolean(v) => Some(v.to_string()),
        AMQPValue::ShortShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortShortUInt(v) => Some(v.to_string()),
        AMQPValue::ShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortUInt(v) => Some(v.to_string()),
        AMQPValue::LongInt(v) => Some(v.to_string()),
        AMQPValue::LongUInt(v) => Some(v.to_string()),
        AMQPValue::LongLongInt(v) => Some(v.to_string()),
        AMQPValue::Float(v) => Some(v.to_string()),
        AMQPValue::Double(v) => Some(v.to_string()),
        AMQPValue::Timestamp(v) => Some(v.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire() -> WireMessage {
        WireMessage::new(
            "orders",
            BasicProperties::default().with_message_id(ShortString::from("abc")),
            b"[]".to_vec(),
        )
    }

    #[test]
    fn attempt_count_defaults_to_zero() {
        assert_eq!(wire().attempt_count(), 0);
    }

    #[test]
    fn attempt_count_is_stored_in_headers() {
        let mut message = wire();
        message.set_attempt_count(2);

        assert_eq!(message.attempt_count(), 2);
        assert_eq!(
            message.header(ATTEMPT_COUNT_HEADER),
            Some(&AMQPValue::LongLongInt(2))
        );
    }

    #[test]
    fn setting_headers_keeps_other_properties() {
        let mut message = wire();
        message.set_string_header("x-reason", "late");

        assert_eq!(message.message_id(), "abc");
        assert_eq!(
            message.header("x-reason").and_then(header_to_string),
            Some("late".to_owned())
        );
    }

    #[test]
    fn clones_share_identity() {
        let message = wire();

        assert_eq!(message.clone().id(), message.id());
        assert_ne!(wire().id(), message.id());
    }

    #[test]
    fn headers_guard_writes_back_on_drop() {
        let mut message = wire();
        {
            let mut guard = message.headers_mut();
            guard
                .table()
                .insert(ShortString::from("x-a"), AMQPValue::LongInt(1));
            guard
                .table()
                .insert(ShortString::from("x-b"), AMQPValue::LongInt(2));
        }

        assert_eq!(message.header("x-a"), Some(&AMQPValue::LongInt(1)));
        assert_eq!(message.header("x-b"), Some(&AMQPValue::LongInt(2)));
    }
}
