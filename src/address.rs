// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Addresses
//!
//! A `PublicationAddress` is a concrete broker destination (exchange kind, exchange name
//! and routing key) written as `kind://exchange/routing-key`, where the `default` host
//! names the broker's default exchange. A `ChannelAddress` is what callers put on an
//! envelope: either a publication address or one of the logical loopback/dead-letter
//! addresses that a channel group resolves against its own configuration.

use crate::{errors::ChannelError, exchange::ExchangeKind};
use std::{fmt, str::FromStr};

const DEFAULT_EXCHANGE_HOST: &str = "default";
const LOOPBACK_ADDRESS: &str = "default://loopback/";
const DEAD_LETTER_ADDRESS: &str = "default://dead-letter-queue/";

/// A concrete broker destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicationAddress {
    kind: ExchangeKind,
    exchange: String,
    routing_key: String,
}

impl PublicationAddress {
    /// Creates an address publishing to `exchange` with `routing_key`.
    pub fn new(kind: ExchangeKind, exchange: &str, routing_key: &str) -> Self {
        PublicationAddress {
            kind,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }

    /// Address of a fanout exchange, ignoring routing keys.
    pub fn fanout(exchange: &str) -> Self {
        PublicationAddress::new(ExchangeKind::Fanout, exchange, "")
    }

    /// Address of a queue reached through the default exchange.
    pub fn queue(name: &str) -> Self {
        PublicationAddress::new(ExchangeKind::Direct, "", name)
    }

    /// Kind of the target exchange.
    pub fn kind(&self) -> &ExchangeKind {
        &self.kind
    }

    /// Exchange name; empty for the default exchange.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Routing key; empty means the message's own key.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }
}

impl fmt::Display for PublicationAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.exchange.is_empty() {
            DEFAULT_EXCHANGE_HOST
        } else {
            &self.exchange
        };
        write!(f, "{}://{}/{}", self.kind, host, self.routing_key)
    }
}

impl FromStr for PublicationAddress {
    type Err = ChannelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some((scheme, rest)) = value.split_once("://") else {
            return Err(ChannelError::Argument(format!("malformed address {value}")));
        };

        let kind = scheme.parse::<ExchangeKind>()?;
        let (host, routing_key) = rest.split_once('/').unwrap_or((rest, ""));
        if host.is_empty() {
            return Err(ChannelError::Argument(format!("missing exchange in {value}")));
        }

        let exchange = if host == DEFAULT_EXCHANGE_HOST { "" } else { host };
        Ok(PublicationAddress::new(kind, exchange, routing_key))
    }
}

/// Recipient of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelAddress {
    /// The channel group's own input queue
    Loopback,
    /// The configured dead-letter exchange, if any
    DeadLetter,
    /// A concrete broker destination
    Publication(PublicationAddress),
}

impl From<PublicationAddress> for ChannelAddress {
    fn from(address: PublicationAddress) -> Self {
        ChannelAddress::Publication(address)
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelAddress::Loopback => f.write_str(LOOPBACK_ADDRESS),
            ChannelAddress::DeadLetter => f.write_str(DEAD_LETTER_ADDRESS),
            ChannelAddress::Publication(address) => address.fmt(f),
        }
    }
}

impl FromStr for ChannelAddress {
    type Err = ChannelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            LOOPBACK_ADDRESS => Ok(ChannelAddress::Loopback),
            DEAD_LETTER_ADDRESS => Ok(ChannelAddress::DeadLetter),
            other => Ok(ChannelAddress::Publication(other.parse()?)),
        }
    }
}

/// Normalizes a type or queue name into a broker-friendly identifier: lower case, with
/// anything other than alphanumerics, `.`, `-` and `_` replaced by `-`.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() => c.to_ascii_lowercase(),
            '.' | '-' | '_' => c,
            _ => '-',
        })
        .collect()
}
