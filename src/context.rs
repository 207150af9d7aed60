// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Context
//!
//! The capability set a handler sees while one delivery is in flight.

use crate::{
    configuration::{ChannelGroupConfiguration, DependencyResolver},
    dispatch::DispatchContext,
    errors::{ChannelError, HandlerError},
    message::{ChannelEnvelope, ChannelMessage},
    transaction::Transaction,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Handles the deliveries of a receiving channel.
///
/// The returned error decides what happens to the delivery, see `HandlerError`.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, context: &mut dyn DeliveryContext) -> Result<(), HandlerError>;
}

/// Channel surface exposed to a handler during a delivery.
pub trait DeliveryContext: Send {
    /// Message being delivered; `None` outside of a delivery.
    fn current_message(&self) -> Option<&Arc<ChannelMessage>>;

    /// Open transaction of the delivery, created if the previous one has finished.
    fn current_transaction(&mut self) -> &mut Transaction;

    fn current_configuration(&self) -> &ChannelGroupConfiguration;

    fn current_resolver(&self) -> Option<&Arc<dyn DependencyResolver>>;

    fn group_name(&self) -> &str;

    /// Registers the envelope's publications on the current transaction.
    fn send(&mut self, envelope: ChannelEnvelope) -> Result<(), ChannelError>;
}

impl<'c> dyn DeliveryContext + 'c {
    /// Starts building an outbound message.
    pub fn prepare_dispatch(&mut self) -> DispatchContext<'_> {
        DispatchContext::new(self)
    }
}
