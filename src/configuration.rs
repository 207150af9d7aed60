// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Group Configuration
//!
//! A channel group is a named family of channels sharing routing, queue and transaction
//! policy. Its configuration is assembled through `ChannelGroupConfigurationBuilder`,
//! whose fluent methods validate their input at call time, and is immutable once built.

use crate::{
    adapter::MessageAdapter,
    address::{normalize_name, ChannelAddress, PublicationAddress},
    errors::ChannelError,
    message::{ChannelMessage, LogicalMessage},
    serialization::{JsonSerializer, Serializer},
};
use std::{any::Any, collections::HashMap, sync::Arc, time::Duration};
use uuid::Uuid;

const DEFAULT_GROUP_NAME: &str = "all";
const DEFAULT_APP_ID: &str = "amqp-channel";
const DEFAULT_WORKER_COUNT: usize = 1;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_CHANNEL_BUFFER: u16 = 1024;
const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(1500);
const DEFAULT_POISON_MESSAGE_EXCHANGE: &str = "poison-messages";
const DEFAULT_DEAD_LETTER_EXCHANGE: &str = "dead-letters";

/// How a channel brackets the work done for a delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionMode {
    /// Deliveries are never acknowledged and no broker transaction exists
    None,
    /// Deliveries are acknowledged when the work is committed
    Acknowledge,
    /// Acknowledgments and publications run inside a broker transaction
    #[default]
    Full,
}

/// Resolves the recipients of a published message from its type.
pub trait DispatchTable: Send + Sync {
    fn recipients(&self, message_type: &str) -> Vec<ChannelAddress>;
}

/// Publishes each message type to a fanout exchange named after the type.
#[derive(Debug, Clone, Default)]
pub struct ExchangeDispatchTable;

impl DispatchTable for ExchangeDispatchTable {
    fn recipients(&self, message_type: &str) -> Vec<ChannelAddress> {
        vec![PublicationAddress::fanout(&normalize_name(message_type)).into()]
    }
}

/// Builds outbound channel messages.
pub trait ChannelMessageBuilder: Send + Sync {
    fn build(
        &self,
        correlation_id: Option<Uuid>,
        return_address: Option<&PublicationAddress>,
        headers: HashMap<String, String>,
        messages: Vec<LogicalMessage>,
    ) -> ChannelMessage;
}

/// Assigns fresh identifiers and marks messages as persistent.
#[derive(Debug, Clone, Default)]
pub struct DefaultChannelMessageBuilder;

impl ChannelMessageBuilder for DefaultChannelMessageBuilder {
    fn build(
        &self,
        correlation_id: Option<Uuid>,
        return_address: Option<&PublicationAddress>,
        headers: HashMap<String, String>,
        messages: Vec<LogicalMessage>,
    ) -> ChannelMessage {
        ChannelMessage::new(
            Uuid::new_v4(),
            correlation_id.unwrap_or_else(Uuid::new_v4),
            return_address.cloned(),
            headers,
            messages,
        )
        .with_persistence(true)
    }
}

/// Resolves application services for handlers running inside a delivery.
pub trait DependencyResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Immutable configuration of a channel group.
#[derive(Clone)]
pub struct ChannelGroupConfiguration {
    pub(crate) group_name: String,
    pub(crate) input_queue: Option<String>,
    pub(crate) return_address: Option<PublicationAddress>,
    pub(crate) return_address_specified: bool,
    pub(crate) dispatch_only: bool,
    pub(crate) min_workers: usize,
    pub(crate) max_workers: usize,
    pub(crate) receive_timeout: Duration,
    pub(crate) transaction_mode: TransactionMode,
    pub(crate) channel_buffer: u16,
    pub(crate) poison_message_exchange: PublicationAddress,
    pub(crate) dead_letter_exchange: Option<PublicationAddress>,
    pub(crate) max_attempts: u32,
    pub(crate) application_id: String,
    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) message_types: Vec<String>,
    pub(crate) resolver: Option<Arc<dyn DependencyResolver>>,
    pub(crate) dispatch_table: Arc<dyn DispatchTable>,
    pub(crate) message_builder: Arc<dyn ChannelMessageBuilder>,
    pub(crate) adapter: Arc<MessageAdapter>,
    pub(crate) durable_queue: bool,
    pub(crate) exclusive_queue: bool,
    pub(crate) auto_delete: bool,
    pub(crate) purge_on_start: bool,
}

impl ChannelGroupConfiguration {
    /// Starts a builder holding the defaults.
    pub fn builder() -> ChannelGroupConfigurationBuilder {
        ChannelGroupConfigurationBuilder::default()
    }

    /// Name shared by every channel of the group.
    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// Name of the queue the group receives from; `None` for dispatch-only groups and an
    /// empty string until a server-generated name has been resolved.
    pub fn input_queue(&self) -> Option<&str> {
        self.input_queue.as_deref()
    }

    /// Address replies are sent to; defaults to the input queue.
    pub fn return_address(&self) -> Option<&PublicationAddress> {
        self.return_address.as_ref()
    }

    /// Whether the group only sends and never receives.
    pub fn dispatch_only(&self) -> bool {
        self.dispatch_only
    }

    /// Number of concurrent channels the group runs.
    pub fn min_workers(&self) -> usize {
        self.min_workers
    }

    /// Reserved ceiling for the number of channels.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// How long one receive waits before checking for shutdown.
    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    /// How deliveries are acknowledged and committed at the broker.
    pub fn transaction_mode(&self) -> TransactionMode {
        self.transaction_mode
    }

    /// Prefetch count; zero leaves the broker default.
    pub fn channel_buffer(&self) -> u16 {
        self.channel_buffer
    }

    /// Destination of deliveries that can never be processed.
    pub fn poison_message_exchange(&self) -> &PublicationAddress {
        &self.poison_message_exchange
    }

    /// Destination of expired or rejected deliveries; `None` drops them.
    pub fn dead_letter_exchange(&self) -> Option<&PublicationAddress> {
        self.dead_letter_exchange.as_ref()
    }

    /// Failed attempts after which a delivery is poisoned.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Identifier stamped on outgoing messages.
    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    /// Message types the input queue is bound to.
    pub fn message_types(&self) -> &[String] {
        &self.message_types
    }

    /// Resolver handed to delivery handlers, if any.
    pub fn dependency_resolver(&self) -> Option<&Arc<dyn DependencyResolver>> {
        self.resolver.as_ref()
    }

    /// Table mapping message types to publish recipients.
    pub fn dispatch_table(&self) -> &Arc<dyn DispatchTable> {
        &self.dispatch_table
    }

    /// Builder of outgoing channel messages.
    pub fn message_builder(&self) -> &Arc<dyn ChannelMessageBuilder> {
        &self.message_builder
    }

    /// Adapter translating between wire and channel messages.
    pub fn message_adapter(&self) -> &Arc<MessageAdapter> {
        &self.adapter
    }

    /// Address of the group's own input queue.
    pub fn input_address(&self) -> Option<PublicationAddress> {
        self.input_queue
            .as_deref()
            .filter(|name| !name.is_empty())
            .map(PublicationAddress::queue)
    }

    /// Resolves an envelope recipient into a broker destination; `None` means drop.
    pub fn resolve(&self, address: &ChannelAddress) -> Option<PublicationAddress> {
        match address {
            ChannelAddress::Loopback => self.input_address(),
            ChannelAddress::DeadLetter => self.dead_letter_exchange.clone(),
            ChannelAddress::Publication(address) => Some(address.clone()),
        }
    }

    /// Returns a copy bound to the queue name the broker actually declared.
    pub(crate) fn with_resolved_input_queue(&self, name: &str) -> ChannelGroupConfiguration {
        let mut resolved = self.clone();
        resolved.input_queue = Some(name.to_owned());
        if !resolved.return_address_specified {
            resolved.return_address = Some(PublicationAddress::queue(name));
        }
        resolved
    }
}

/// Fluent builder for `ChannelGroupConfiguration`.
pub struct ChannelGroupConfigurationBuilder {
    config: ChannelGroupConfiguration,
}

impl Default for ChannelGroupConfigurationBuilder {
    fn default() -> Self {
        let serializer: Arc<dyn Serializer> = Arc::new(JsonSerializer);
        ChannelGroupConfigurationBuilder {
            config: ChannelGroupConfiguration {
                group_name: DEFAULT_GROUP_NAME.to_owned(),
                input_queue: None,
                return_address: None,
                return_address_specified: false,
                dispatch_only: true,
                min_workers: DEFAULT_WORKER_COUNT,
                max_workers: DEFAULT_WORKER_COUNT,
                receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
                transaction_mode: TransactionMode::Full,
                channel_buffer: DEFAULT_CHANNEL_BUFFER,
                poison_message_exchange: PublicationAddress::fanout(
                    DEFAULT_POISON_MESSAGE_EXCHANGE,
                ),
                dead_letter_exchange: Some(PublicationAddress::fanout(
                    DEFAULT_DEAD_LETTER_EXCHANGE,
                )),
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                application_id: DEFAULT_APP_ID.to_owned(),
                adapter: Arc::new(MessageAdapter::new(serializer.clone(), DEFAULT_APP_ID)),
                serializer,
                message_types: vec![],
                resolver: None,
                dispatch_table: Arc::new(ExchangeDispatchTable),
                message_builder: Arc::new(DefaultChannelMessageBuilder),
                durable_queue: true,
                exclusive_queue: false,
                auto_delete: false,
                purge_on_start: false,
            },
        }
    }
}

impl ChannelGroupConfigurationBuilder {
    /// Names the group; fails with `Argument` on an empty name.
    pub fn with_group_name(mut self, name: &str) -> Result<Self, ChannelError> {
        if name.trim().is_empty() {
            return Err(ChannelError::Argument("group name".to_owned()));
        }

        self.config.group_name = name.trim().to_owned();
        Ok(self)
    }

    /// How long a receive waits on the transport before re-checking for shutdown.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.config.receive_timeout = timeout;
        self
    }

    /// Sets the worker counts; fails with `Argument` unless `0 < min <= max`.
    pub fn with_workers(mut self, min: usize, max: usize) -> Result<Self, ChannelError> {
        if min == 0 {
            return Err(ChannelError::Argument(
                "at least one worker must be specified".to_owned(),
            ));
        }

        if min > max {
            return Err(ChannelError::Argument(
                "the maximum workers must be at least the minimum".to_owned(),
            ));
        }

        self.config.min_workers = min;
        self.config.max_workers = max;
        Ok(self)
    }

    /// Receives from the named queue; an empty name lets the broker generate one, in
    /// which case the queue is auto-deleted.
    pub fn with_input_queue(mut self, name: &str) -> Self {
        let name = normalize_name(name);

        if !self.config.return_address_specified {
            self.config.return_address =
                Some(PublicationAddress::queue(&name)).filter(|_| !name.is_empty());
        }

        self.config.auto_delete = name.is_empty();
        self.config.input_queue = Some(name);
        self.config.dispatch_only = false;
        self
    }

    /// Receives from a server-named, auto-deleted queue.
    pub fn with_random_input_queue(self) -> Self {
        self.with_input_queue("")
    }

    /// Declares the input queue exclusive to this connection.
    pub fn with_exclusive_receive(mut self) -> Self {
        self.config.exclusive_queue = true;
        self
    }

    /// Deletes the input queue once its last consumer leaves.
    pub fn with_auto_delete_queue(mut self) -> Self {
        self.config.auto_delete = true;
        self
    }

    /// Declares a non-durable input queue.
    pub fn with_transient_queue(mut self) -> Self {
        self.config.durable_queue = false;
        self
    }

    /// Purges the input queue when the group starts.
    pub fn with_clean_queue(mut self) -> Self {
        self.config.purge_on_start = true;
        self
    }

    /// Channels of this group only send and never receive.
    pub fn with_dispatch_only(mut self) -> Self {
        self.config.dispatch_only = true;
        self.config.input_queue = None;
        self
    }

    /// Selects how deliveries are acknowledged and committed.
    pub fn with_transaction(mut self, mode: TransactionMode) -> Self {
        self.config.transaction_mode = mode;
        self
    }

    /// Prefetch bound of receiving channels, clamped to what the transport supports.
    pub fn with_channel_buffer(mut self, size: usize) -> Self {
        self.config.channel_buffer = u16::try_from(size).unwrap_or(u16::MAX);
        self
    }

    /// Overrides the address replies are sent to.
    pub fn with_return_address(mut self, address: PublicationAddress) -> Self {
        self.config.return_address_specified = true;
        self.config.return_address = Some(address);
        self
    }

    /// Sets the poison exchange; fails with `Argument` on an empty name.
    pub fn with_poison_message_exchange(mut self, exchange: &str) -> Result<Self, ChannelError> {
        if exchange.trim().is_empty() {
            return Err(ChannelError::Argument("poison message exchange".to_owned()));
        }

        self.config.poison_message_exchange = PublicationAddress::fanout(exchange.trim());
        Ok(self)
    }

    /// Sets the dead-letter exchange; fails with `Argument` on an empty name.
    pub fn with_dead_letter_exchange(mut self, exchange: &str) -> Result<Self, ChannelError> {
        if exchange.trim().is_empty() {
            return Err(ChannelError::Argument("dead letter exchange".to_owned()));
        }

        self.config.dead_letter_exchange = Some(PublicationAddress::fanout(exchange.trim()));
        Ok(self)
    }

    /// Dead-lettered messages are dropped instead of forwarded.
    pub fn without_dead_letter_exchange(mut self) -> Self {
        self.config.dead_letter_exchange = None;
        self
    }

    /// Sets the failed attempts before poisoning; fails with `Argument` on zero.
    pub fn with_max_attempts(mut self, attempts: u32) -> Result<Self, ChannelError> {
        if attempts == 0 {
            return Err(ChannelError::Argument(
                "the maximum number of attempts must be positive".to_owned(),
            ));
        }

        self.config.max_attempts = attempts;
        Ok(self)
    }

    /// Identifier stamped on outgoing messages.
    pub fn with_application_id(mut self, identifier: &str) -> Self {
        self.config.application_id = identifier.trim().to_owned();
        self
    }

    /// Replaces the JSON serializer.
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.config.serializer = serializer;
        self
    }

    /// Message types the group's input queue is bound to.
    pub fn with_message_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for message_type in types {
            let message_type = message_type.as_ref().to_owned();
            if !self.config.message_types.contains(&message_type) {
                self.config.message_types.push(message_type);
            }
        }
        self
    }

    /// Resolver exposed to delivery handlers.
    pub fn with_dependency_resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.config.resolver = Some(resolver);
        self
    }

    /// Replaces the table deciding publish recipients.
    pub fn with_dispatch_table(mut self, table: Arc<dyn DispatchTable>) -> Self {
        self.config.dispatch_table = table;
        self
    }

    /// Replaces the builder of outgoing channel messages.
    pub fn with_message_builder(mut self, builder: Arc<dyn ChannelMessageBuilder>) -> Self {
        self.config.message_builder = builder;
        self
    }

    /// Freezes the configuration.
    pub fn build(mut self) -> ChannelGroupConfiguration {
        self.config.adapter = Arc::new(MessageAdapter::new(
            self.config.serializer.clone(),
            &self.config.application_id,
        ));
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_a_dispatch_only_full_transaction_group() {
        let config = ChannelGroupConfiguration::builder().build();

        assert_eq!(config.group_name(), "all");
        assert!(config.dispatch_only());
        assert_eq!(config.transaction_mode(), TransactionMode::Full);
        assert_eq!(config.max_attempts(), 3);
        assert_eq!(config.receive_timeout(), Duration::from_millis(1500));
        assert_eq!(config.channel_buffer(), 1024);
        assert_eq!(config.poison_message_exchange().exchange(), "poison-messages");
        assert_eq!(
            config.dead_letter_exchange().map(|a| a.exchange()),
            Some("dead-letters")
        );
    }

    #[test]
    fn rejects_invalid_worker_counts() {
        assert!(ChannelGroupConfiguration::builder().with_workers(0, 1).is_err());
        assert!(ChannelGroupConfiguration::builder().with_workers(3, 2).is_err());
        assert!(ChannelGroupConfiguration::builder().with_workers(2, 2).is_ok());
    }

    #[test]
    fn rejects_non_positive_attempts() {
        let result = ChannelGroupConfiguration::builder().with_max_attempts(0);

        assert!(matches!(result, Err(ChannelError::Argument(_))));
    }

    #[test]
    fn input_queue_enables_receiving_and_sets_return_address() {
        let config = ChannelGroupConfiguration::builder()
            .with_input_queue("Orders")
            .build();

        assert!(!config.dispatch_only());
        assert_eq!(config.input_queue(), Some("orders"));
        assert_eq!(
            config.return_address(),
            Some(&PublicationAddress::queue("orders"))
        );
    }

    #[test]
    fn explicit_return_address_wins_over_input_queue() {
        let reply = PublicationAddress::fanout("replies");
        let config = ChannelGroupConfiguration::builder()
            .with_return_address(reply.clone())
            .with_input_queue("orders")
            .build();

        assert_eq!(config.return_address(), Some(&reply));
    }

    #[test]
    fn random_input_queue_is_auto_deleted_and_resolved_later() {
        let config = ChannelGroupConfiguration::builder()
            .with_random_input_queue()
            .build();

        assert!(config.auto_delete);
        assert_eq!(config.input_address(), None);

        let resolved = config.with_resolved_input_queue("amq.gen-123");
        assert_eq!(
            resolved.input_address(),
            Some(PublicationAddress::queue("amq.gen-123"))
        );
        assert_eq!(
            resolved.return_address(),
            Some(&PublicationAddress::queue("amq.gen-123"))
        );
    }

    #[test]
    fn channel_buffer_is_clamped() {
        let config = ChannelGroupConfiguration::builder()
            .with_channel_buffer(1_000_000)
            .build();

        assert_eq!(config.channel_buffer(), u16::MAX);
    }

    #[test]
    fn resolves_logical_addresses() {
        let config = ChannelGroupConfiguration::builder()
            .with_input_queue("orders")
            .without_dead_letter_exchange()
            .build();

        assert_eq!(
            config.resolve(&ChannelAddress::Loopback),
            Some(PublicationAddress::queue("orders"))
        );
        assert_eq!(config.resolve(&ChannelAddress::DeadLetter), None);
    }

    #[test]
    fn message_types_are_unique() {
        let config = ChannelGroupConfiguration::builder()
            .with_message_types(["order-placed", "order-placed", "order-shipped"])
            .build();

        assert_eq!(config.message_types(), &["order-placed", "order-shipped"]);
    }

    #[test]
    fn dispatch_table_publishes_to_type_exchange() {
        let recipients = ExchangeDispatchTable.recipients("Billing.InvoicePaid");

        assert_eq!(
            recipients,
            vec![ChannelAddress::from(PublicationAddress::fanout(
                "billing.invoicepaid"
            ))]
        );
    }
}
