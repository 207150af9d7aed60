// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Messages
//!
//! The transport-independent message model: a `ChannelMessage` carries one or more typed
//! logical payloads together with identifiers, headers, expiration and persistence, and a
//! `ChannelEnvelope` pairs a message with the set of recipients it must reach.

use crate::{
    address::{ChannelAddress, PublicationAddress},
    errors::{ChannelError, SerializationError},
};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use uuid::Uuid;

/// A single typed payload item.
///
/// The message type names the payload for routing purposes; the body is kept as a JSON
/// value so that handlers decode it into their own types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalMessage {
    #[serde(rename = "type")]
    message_type: String,
    body: serde_json::Value,
}

impl LogicalMessage {
    /// Serializes `payload` into a message of `message_type`.
    pub fn new<T: Serialize>(message_type: &str, payload: &T) -> Result<Self, SerializationError> {
        Ok(LogicalMessage {
            message_type: message_type.to_owned(),
            body: serde_json::to_value(payload)?,
        })
    }

    /// Wraps an already-decoded JSON body.
    pub fn from_value(message_type: &str, body: serde_json::Value) -> Self {
        LogicalMessage {
            message_type: message_type.to_owned(),
            body,
        }
    }

    /// Type name used for routing.
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Decoded JSON body.
    pub fn body(&self) -> &serde_json::Value {
        &self.body
    }

    /// Decodes the body into the handler's own representation.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, SerializationError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Immutable message flowing through a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    message_id: Uuid,
    correlation_id: Uuid,
    return_address: Option<PublicationAddress>,
    headers: HashMap<String, String>,
    messages: Vec<LogicalMessage>,
    expiration: Option<DateTime<Utc>>,
    persistent: bool,
}

impl ChannelMessage {
    /// Creates a transient message that never expires.
    pub fn new(
        message_id: Uuid,
        correlation_id: Uuid,
        return_address: Option<PublicationAddress>,
        headers: HashMap<String, String>,
        messages: Vec<LogicalMessage>,
    ) -> Self {
        ChannelMessage {
            message_id,
            correlation_id,
            return_address,
            headers,
            messages,
            expiration: None,
            persistent: false,
        }
    }

    /// Sets the instant after which the message must no longer be processed.
    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Marks the message as surviving broker restarts.
    pub fn with_persistence(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Unique identifier of the message.
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Identifier shared by related messages.
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Where replies should be sent, if anywhere.
    pub fn return_address(&self) -> Option<&PublicationAddress> {
        self.return_address.as_ref()
    }

    /// Application headers.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Logical messages carried, in order.
    pub fn messages(&self) -> &[LogicalMessage] {
        &self.messages
    }

    /// Instant after which the message is dead-lettered unread.
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration
    }

    /// Whether the broker persists the message.
    pub fn persistent(&self) -> bool {
        self.persistent
    }

    /// Type of the first payload item, used for routing.
    pub fn message_type(&self) -> Option<&str> {
        self.messages.first().map(LogicalMessage::message_type)
    }

    /// Whether the expiration has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|expiration| expiration <= now)
    }

    pub(crate) fn headers_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.headers
    }
}

/// A message paired with the unique set of recipients it must reach.
#[derive(Debug, Clone)]
pub struct ChannelEnvelope {
    message: Arc<ChannelMessage>,
    recipients: Vec<ChannelAddress>,
}

impl ChannelEnvelope {
    /// Builds an envelope, dropping duplicate recipients while keeping their order.
    ///
    /// Fails with `ChannelError::Argument` when no recipient is provided.
    pub fn new(
        message: Arc<ChannelMessage>,
        recipients: impl IntoIterator<Item = ChannelAddress>,
    ) -> Result<Self, ChannelError> {
        let mut unique: Vec<ChannelAddress> = vec![];
        for recipient in recipients {
            if !unique.contains(&recipient) {
                unique.push(recipient);
            }
        }

        if unique.is_empty() {
            return Err(ChannelError::Argument(
                "no recipients were provided".to_owned(),
            ));
        }

        Ok(ChannelEnvelope {
            message,
            recipients: unique,
        })
    }

    /// Message to send.
    pub fn message(&self) -> &Arc<ChannelMessage> {
        &self.message
    }

    /// Distinct recipients, in insertion order.
    pub fn recipients(&self) -> &[ChannelAddress] {
        &self.recipients
    }
}
