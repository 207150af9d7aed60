// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dispatch Context
//!
//! Single-use fluent builder assembling an outbound message from inside a delivery.
//! Exactly one of `send`, `publish` or `reply` ends the builder; each consumes it, so a
//! dispatched context cannot be reused.
//!
//! ```ignore
//! context
//!     .prepare_dispatch()
//!     .with_message(LogicalMessage::new("invoice-paid", &paid)?)
//!     .with_header("tenant", Some("acme"))
//!     .publish()?;
//! ```

use crate::{
    address::ChannelAddress,
    context::DeliveryContext,
    errors::ChannelError,
    message::{ChannelEnvelope, LogicalMessage},
};
use std::{collections::HashMap, sync::Arc};
use uuid::Uuid;

pub struct DispatchContext<'a> {
    context: &'a mut dyn DeliveryContext,
    messages: Vec<LogicalMessage>,
    correlation_id: Option<Uuid>,
    headers: HashMap<String, String>,
    recipients: Vec<ChannelAddress>,
}

impl<'a> DispatchContext<'a> {
    /// Starts an empty dispatch over `context`.
    pub fn new(context: &'a mut dyn DeliveryContext) -> Self {
        DispatchContext {
            context,
            messages: vec![],
            correlation_id: None,
            headers: HashMap::new(),
            recipients: vec![],
        }
    }

    /// Appends one logical message.
    pub fn with_message(mut self, message: LogicalMessage) -> Self {
        self.messages.push(message);
        self
    }

    /// Appends several logical messages.
    pub fn with_messages(mut self, messages: impl IntoIterator<Item = LogicalMessage>) -> Self {
        self.messages.extend(messages);
        self
    }

    /// Correlates the outgoing message with `correlation_id`.
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Sets a header; `None` removes it.
    pub fn with_header(mut self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => {
                self.headers.insert(key.to_owned(), value.to_owned());
            }
            None => {
                self.headers.remove(key);
            }
        }
        self
    }

    /// Sets several headers at once.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Adds a recipient for `send`.
    pub fn with_recipient(mut self, recipient: ChannelAddress) -> Self {
        self.recipients.push(recipient);
        self
    }

    /// Sends the message to the explicitly added recipients.
    pub fn send(self) -> Result<(), ChannelError> {
        if self.messages.is_empty() {
            return Err(ChannelError::InvalidOperation(
                "no message to dispatch".to_owned(),
            ));
        }

        if self.recipients.is_empty() {
            return Err(ChannelError::InvalidOperation(
                "no recipient to dispatch to".to_owned(),
            ));
        }

        let DispatchContext {
            context,
            messages,
            correlation_id,
            headers,
            recipients,
        } = self;

        let config = context.current_configuration();
        let message = config.message_builder().build(
            correlation_id,
            config.return_address(),
            headers,
            messages,
        );

        let envelope = ChannelEnvelope::new(Arc::new(message), recipients)?;
        context.send(envelope)
    }

    /// Sends the message to the recipients the dispatch table lists for its payload types,
    /// on top of any explicit recipient.
    pub fn publish(mut self) -> Result<(), ChannelError> {
        let table = self.context.current_configuration().dispatch_table().clone();
        for message in &self.messages {
            for recipient in table.recipients(message.message_type()) {
                self.recipients.push(recipient);
            }
        }

        self.send()
    }

    /// Answers the message being delivered, at its return address and correlated to it.
    pub fn reply(mut self) -> Result<(), ChannelError> {
        let Some(incoming) = self.context.current_message() else {
            return Err(ChannelError::InvalidOperation(
                "no message is being delivered".to_owned(),
            ));
        };

        let Some(return_address) = incoming.return_address().cloned() else {
            return Err(ChannelError::InvalidOperation(
                "the incoming message has no return address".to_owned(),
            ));
        };

        let correlation_id = incoming.correlation_id();
        self.correlation_id = Some(correlation_id);
        self.recipients = vec![return_address.into()];
        self.send()
    }
}
