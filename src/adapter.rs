// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Adapter
//!
//! Translates between wire messages and channel messages. Translation of a received wire
//! message is cached by the wire message's identity so that translating the same delivery
//! twice yields the very same `ChannelMessage`. The cache lock only guards lookups and
//! inserts; deserialization itself runs outside of it so that workers sharing an adapter
//! never wait on each other's payloads.

use crate::{
    address::{normalize_name, PublicationAddress},
    errors::SerializationError,
    message::ChannelMessage,
    otel,
    serialization::Serializer,
    wire::{header_to_string, WireMessage},
};
use chrono::{DateTime, Duration, Utc};
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use parking_lot::Mutex;
use std::{collections::HashMap, error::Error as StdError, sync::Arc};
use tracing::trace;
use uuid::Uuid;

const TRANSIENT: u8 = 1;
const PERSISTENT: u8 = 2;
const CONTENT_TYPE: &str = "application/vnd.amqp-channel.msg";
const RETRY_ADDRESS_HEADER: &str = "x-retry-address";

/// Translates wire messages to channel messages and back.
pub struct MessageAdapter {
    serializer: Arc<dyn Serializer>,
    application_id: String,
    cache: Mutex<HashMap<Uuid, Arc<ChannelMessage>>>,
}

impl MessageAdapter {
    /// Creates an adapter stamping `application_id` on outgoing messages.
    pub fn new(serializer: Arc<dyn Serializer>, application_id: &str) -> Self {
        MessageAdapter {
            serializer,
            application_id: application_id.to_owned(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Translates a received wire message, returning the cached translation when the same
    /// wire message has been translated before.
    pub fn build(&self, message: &WireMessage) -> Result<Arc<ChannelMessage>, SerializationError> {
        if let Some(cached) = self.cache.lock().get(&message.id()) {
            return Ok(cached.clone());
        }

        let translated = Arc::new(self.translate(message)?);

        // a concurrent translation may have won the race; both results are equivalent
        let mut cache = self.cache.lock();
        Ok(cache.entry(message.id()).or_insert(translated).clone())
    }

    /// Drops the cached translation of a wire message once its delivery is complete.
    pub fn purge_from_cache(&self, message: &WireMessage) -> bool {
        self.cache.lock().remove(&message.id()).is_some()
    }

    fn translate(&self, message: &WireMessage) -> Result<ChannelMessage, SerializationError> {
        let properties = message.properties();
        let format = content_format(properties);
        let encoding = properties
            .content_encoding()
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();

        trace!(
            message_id = message.message_id(),
            format,
            "deserializing wire message"
        );
        let messages = self
            .serializer
            .deserialize(message.body(), &format, &encoding)?;

        if messages.is_empty() {
            return Err(SerializationError::new("wire message carries no payload"));
        }

        let mut translated = ChannelMessage::new(
            parse_uuid(properties.message_id()),
            parse_uuid(properties.correlation_id()),
            properties
                .reply_to()
                .as_ref()
                .and_then(|reply| reply.as_str().parse::<PublicationAddress>().ok()),
            HashMap::new(),
            messages,
        )
        .with_persistence(properties.delivery_mode() == &Some(PERSISTENT));

        if let Some(expiration) = expiration(properties) {
            translated = translated.with_expiration(expiration);
        }

        append_headers(translated.headers_mut(), properties);
        Ok(translated)
    }

    /// Builds the wire form of a channel message.
    pub fn build_wire(&self, message: &ChannelMessage) -> Result<WireMessage, SerializationError> {
        let Some(message_type) = message.message_type() else {
            return Err(SerializationError::new("channel message carries no payload"));
        };

        let body = self.serializer.serialize(message.messages())?;

        let mut headers = FieldTable::default();
        for (key, value) in message.headers() {
            headers.insert(
                ShortString::from(key.as_str()),
                AMQPValue::LongString(LongString::from(value.as_str())),
            );
        }
        otel::inject_current_context(&mut headers);

        let format = self.serializer.content_format();
        let content_type = if format.is_empty() {
            CONTENT_TYPE.to_owned()
        } else {
            format!("{CONTENT_TYPE}+{format}")
        };

        let now = Utc::now().timestamp();
        let mut properties = BasicProperties::default()
            .with_message_id(ShortString::from(message.message_id().to_string()))
            .with_correlation_id(ShortString::from(message.correlation_id().to_string()))
            .with_app_id(ShortString::from(self.application_id.as_str()))
            .with_content_type(ShortString::from(content_type))
            .with_delivery_mode(if message.persistent() {
                PERSISTENT
            } else {
                TRANSIENT
            })
            .with_type(ShortString::from(message_type))
            .with_timestamp(now as u64)
            .with_headers(headers);

        let encoding = self.serializer.content_encoding();
        if !encoding.is_empty() {
            properties = properties.with_content_encoding(ShortString::from(encoding));
        }

        if let Some(reply) = message.return_address() {
            properties = properties.with_reply_to(ShortString::from(reply.to_string()));
        }

        if let Some(expiration) = message.expiration() {
            // relative to the whole-second timestamp so the absolute instant survives
            let sent = DateTime::from_timestamp(now, 0).unwrap_or_else(Utc::now);
            let ttl = (expiration - sent).num_milliseconds().max(0);
            properties = properties.with_expiration(ShortString::from(ttl.to_string()));
        }

        Ok(WireMessage::new(
            &normalize_name(message_type),
            properties,
            body,
        ))
    }

    /// Records the address a poison message should be re-fed to.
    pub fn append_retry_address(&self, message: &mut WireMessage, address: &PublicationAddress) {
        message.set_string_header(RETRY_ADDRESS_HEADER, &address.to_string());
    }

    /// Appends the causal chain of a failure as indexed headers, one set per nesting depth.
    pub fn append_exception(&self, message: &mut WireMessage, error: &(dyn StdError + 'static)) {
        let mut guard = message.headers_mut();
        let headers = guard.table();

        let mut depth = 0;
        let mut current = Some(error);
        while let Some(err) = current {
            let mut set = |field: &str, value: String| {
                headers.insert(
                    ShortString::from(format!("x-exception{depth}-{field}")),
                    AMQPValue::LongString(LongString::from(value)),
                );
            };
            set("type", error_type_name(err));
            set("message", err.to_string());
            set("trace", format!("{err:?}"));

            current = err.source();
            depth += 1;
        }
    }
}

fn content_format(properties: &BasicProperties) -> String {
    properties
        .content_type()
        .as_ref()
        .and_then(|content_type| {
            content_type
                .as_str()
                .split_once('+')
                .map(|(_, format)| format.to_owned())
        })
        .unwrap_or_default()
}

fn parse_uuid(value: &Option<ShortString>) -> Uuid {
    value
        .as_ref()
        .and_then(|v| Uuid::parse_str(v.as_str()).ok())
        .unwrap_or_else(Uuid::nil)
}

fn expiration(properties: &BasicProperties) -> Option<DateTime<Utc>> {
    let ttl = properties
        .expiration()
        .as_ref()
        .and_then(|e| e.as_str().parse::<i64>().ok())?;
    let sent = DateTime::from_timestamp(i64::try_from((*properties.timestamp())?).ok()?, 0)?;

    Some(sent + Duration::milliseconds(ttl))
}

fn append_headers(headers: &mut HashMap<String, String>, properties: &BasicProperties) {
    let mut put = |key: &str, value: Option<String>| {
        if let Some(value) = value {
            headers.insert(format!("x-amqp-{key}"), value);
        }
    };
    put("appId", properties.app_id().as_ref().map(|v| v.to_string()));
    put("clusterId", properties.cluster_id().as_ref().map(|v| v.to_string()));
    put("userId", properties.user_id().as_ref().map(|v| v.to_string()));
    put("type", properties.kind().as_ref().map(|v| v.to_string()));
    put("priority", properties.priority().map(|v| v.to_string()));

    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            if let Some(value) = header_to_string(value) {
                headers.insert(key.to_string(), value);
            }
        }
    }
}

/// Best-effort name of an error's concrete type, taken from its `Debug` rendering.
fn error_type_name(err: &dyn StdError) -> String {
    let debug = format!("{err:?}");
    debug
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .find(|token| !token.is_empty())
        .unwrap_or("Error")
        .to_owned()
}
