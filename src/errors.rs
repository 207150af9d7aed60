// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Channel
//!
//! This module provides the error taxonomy used across channels, transactions and
//! worker groups. `ChannelError` is returned by every public operation, `TransportError`
//! is the opaque failure raised by a transport session, and `HandlerError` is what
//! caller-supplied delivery handlers return so the channel can decide the fate of a
//! failed delivery.

use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error used to carry the cause of a handler or serialization failure.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Represents errors that can occur while operating a channel, a channel group or a
/// worker group.
///
/// The first group of variants covers lifecycle and argument validation and is always
/// returned synchronously to the caller of the violating operation. `Connection` signals
/// that the underlying transport is unusable and that the owning channel must be
/// discarded. The remaining variants describe topology failures during group setup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Invalid input to a public operation
    #[error("invalid argument `{0}`")]
    Argument(String),

    /// Operation attempted out of the allowed lifecycle sequence
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Operation attempted after disposal
    #[error("`{0}` has been disposed")]
    ObjectDisposed(&'static str),

    /// The channel is shutting down and no longer accepts work
    #[error("the channel is shutting down")]
    Shutdown,

    /// The transport is unusable; the channel must be discarded
    #[error("channel connection failure: {0}")]
    Connection(String),

    /// A payload could not be translated from or to its wire form
    #[error("failure to translate message: {0}")]
    Serialization(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error purging a queue
    #[error("failure to purge queue `{0}`")]
    PurgeQueueError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),
}

impl ChannelError {
    /// Returns true when the error means the transport can no longer be used.
    pub fn is_connection(&self) -> bool {
        matches!(self, ChannelError::Connection(_))
    }
}

/// Opaque failure raised by a transport session or subscription.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        TransportError(err.to_string())
    }
}

impl From<TransportError> for ChannelError {
    fn from(err: TransportError) -> Self {
        ChannelError::Connection(err.0)
    }
}

/// Failure to translate a payload between its logical and wire representation.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct SerializationError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl SerializationError {
    /// Creates an error without an underlying cause.
    pub fn new(message: impl Into<String>) -> Self {
        SerializationError {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an error wrapping `source`.
    pub fn with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        SerializationError {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

impl From<serde_json::Error> for SerializationError {
    fn from(err: serde_json::Error) -> Self {
        SerializationError::with_source("malformed json payload", err)
    }
}

impl From<SerializationError> for ChannelError {
    fn from(err: SerializationError) -> Self {
        ChannelError::Serialization(err.to_string())
    }
}

/// Error returned by a delivery handler.
///
/// The variant decides what happens to the delivery: connection failures abort the
/// receive pump, serialization failures go straight to the poison exchange, dead-letter
/// conditions are forwarded to the dead-letter exchange and every other failure is retried.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// A channel operation failed inside the handler
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The payload could not be understood by the handler
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// The message has expired or has no handler; forward, don't process
    #[error("dead letter: {0}")]
    DeadLetter(String),

    /// Any other failure raised by handler logic
    #[error("handler failure: {0}")]
    Failed(#[source] BoxError),
}

impl HandlerError {
    /// Wraps any error as a retryable handler failure.
    pub fn failed(err: impl Into<BoxError>) -> Self {
        HandlerError::Failed(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn transport_errors_normalize_to_connection_failures() {
        let err: ChannelError = TransportError("socket closed".to_owned()).into();

        assert_eq!(err, ChannelError::Connection("socket closed".to_owned()));
        assert!(err.is_connection());
    }

    #[test]
    fn serialization_error_keeps_its_source() {
        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = SerializationError::from(json);

        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "malformed json payload");
    }

    #[test]
    fn handler_error_wraps_channel_errors() {
        let err: HandlerError = ChannelError::Shutdown.into();

        assert!(matches!(err, HandlerError::Channel(ChannelError::Shutdown)));
    }
}
