// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module derives the broker topology of a channel group from its configuration and
//! declares it. A receiving group gets:
//! - the poison and dead-letter system exchanges, each a durable fanout exchange with a
//!   same-named durable queue bound to it
//! - one durable fanout exchange per bound message type
//! - its input queue, bound to every message-type exchange
//!
//! Dispatch-only groups only declare the message-type exchanges they publish to.

use crate::{
    address::normalize_name,
    configuration::ChannelGroupConfiguration,
    errors::ChannelError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueuePurgeOptions},
    types::FieldTable,
    Channel,
};
use tracing::{debug, error};

/// Exchanges, queues and bindings of a channel group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) input_queue: Option<QueueDefinition>,
    /// Exchanges the input queue is bound to once its name is known
    pub(crate) input_exchanges: Vec<String>,
}

impl AmqpTopology {
    /// Creates an empty topology.
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    /// Builds the topology a channel group needs.
    pub fn from_configuration(config: &ChannelGroupConfiguration) -> AmqpTopology {
        let mut topology = AmqpTopology::new();

        if !config.dispatch_only() {
            let system = std::iter::once(config.poison_message_exchange())
                .chain(config.dead_letter_exchange());
            for address in system {
                let name = address.exchange();
                topology = topology
                    .exchange(ExchangeDefinition::new(name).fanout().durable())
                    .queue(QueueDefinition::new(name).durable())
                    .queue_binding(QueueBinding::new(name).exchange(name));
            }
        }

        let type_exchanges: Vec<String> = config
            .message_types()
            .iter()
            .map(|message_type| normalize_name(message_type))
            .collect();
        for name in &type_exchanges {
            topology = topology.exchange(ExchangeDefinition::new(name).fanout().durable());
        }

        if !config.dispatch_only() {
            let mut queue = QueueDefinition::new(config.input_queue().unwrap_or_default());
            if config.durable_queue {
                queue = queue.durable();
            }
            if config.exclusive_queue {
                queue = queue.exclusive();
            }
            if config.auto_delete {
                queue = queue.delete();
            }
            if config.purge_on_start {
                queue = queue.purge();
            }
            topology.input_queue = Some(queue);
            topology.input_exchanges = type_exchanges;
        }

        topology
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Declares the topology, returning the name of the input queue as reported by the
    /// broker, which generates one when the configured name is empty.
    pub async fn install(&self, channel: &Channel) -> Result<Option<String>, ChannelError> {
        self.install_exchange(channel).await?;
        for def in &self.queues {
            self.declare_queue(channel, def).await?;
        }
        self.binding_queues(channel, &self.queues_binding).await?;

        let Some(input) = &self.input_queue else {
            return Ok(None);
        };

        let name = self.declare_queue(channel, input).await?;
        let bindings: Vec<QueueBinding> = self
            .input_exchanges
            .iter()
            .map(|exchange| QueueBinding::new(&name).exchange(exchange))
            .collect();
        self.binding_queues(channel, &bindings).await?;

        Ok(Some(name))
    }

    /// Creates all exchanges defined in the topology.
    async fn install_exchange(&self, channel: &Channel) -> Result<(), ChannelError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            match channel
                .exchange_declare(
                    &exch.name,
                    (&exch.kind).into(),
                    ExchangeDeclareOptions {
                        passive: false,
                        durable: exch.durable,
                        auto_delete: exch.delete,
                        internal: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = exch.name,
                        "error to declare the exchange"
                    );
                    Err(ChannelError::DeclareExchangeError(exch.name.clone()))
                }
                _ => Ok(()),
            }?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    /// Declares a queue and purges it when requested, returning its actual name.
    async fn declare_queue(
        &self,
        channel: &Channel,
        def: &QueueDefinition,
    ) -> Result<String, ChannelError> {
        debug!("creating queue: {}", def.name);

        let queue = match channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "failure to declare queue");
                Err(ChannelError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => Ok(queue),
        }?;

        let name = queue.name().to_string();
        debug!("queue: {} was created", name);

        if def.purge {
            if let Err(err) = channel
                .queue_purge(&name, QueuePurgeOptions { nowait: false })
                .await
            {
                error!(error = err.to_string(), name, "failure to purge queue");
                return Err(ChannelError::PurgeQueueError(name));
            }
            debug!("queue: {} was purged", name);
        }

        Ok(name)
    }

    /// Sets up queue-to-exchange bindings.
    async fn binding_queues(
        &self,
        channel: &Channel,
        bindings: &[QueueBinding],
    ) -> Result<(), ChannelError> {
        for binding in bindings {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            match channel
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "error to bind queue to exchange");

                    Err(ChannelError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    ))
                }
                _ => Ok(()),
            }?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receiving_group_declares_system_exchanges_and_binds_its_queue() {
        let config = ChannelGroupConfiguration::builder()
            .with_input_queue("billing")
            .with_clean_queue()
            .with_message_types(["Invoice.Paid", "Order Placed"])
            .build();

        let topology = AmqpTopology::from_configuration(&config);

        let exchanges: Vec<&str> = topology.exchanges.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            exchanges,
            vec!["poison-messages", "dead-letters", "invoice.paid", "order-placed"]
        );
        assert!(topology.exchanges.iter().all(|e| e.durable));
        assert_eq!(
            topology.queues,
            vec![
                QueueDefinition::new("poison-messages").durable(),
                QueueDefinition::new("dead-letters").durable(),
            ]
        );
        assert_eq!(
            topology.queues_binding[0],
            QueueBinding::new("poison-messages").exchange("poison-messages")
        );

        let input = topology.input_queue.unwrap();
        assert_eq!(input.name, "billing");
        assert!(input.durable && input.purge);
        assert_eq!(topology.input_exchanges, vec!["invoice.paid", "order-placed"]);
    }

    #[test]
    fn dispatch_only_group_declares_type_exchanges_only() {
        let config = ChannelGroupConfiguration::builder()
            .with_message_types(["Invoice.Paid"])
            .build();

        let topology = AmqpTopology::from_configuration(&config);

        assert_eq!(topology.exchanges.len(), 1);
        assert!(topology.queues.is_empty());
        assert!(topology.input_queue.is_none());
    }

    #[test]
    fn missing_dead_letter_exchange_is_not_declared() {
        let config = ChannelGroupConfiguration::builder()
            .with_input_queue("billing")
            .without_dead_letter_exchange()
            .build();

        let topology = AmqpTopology::from_configuration(&config);

        assert_eq!(topology.exchanges.len(), 1);
        assert_eq!(topology.exchanges[0].name, "poison-messages");
    }

    #[test]
    fn random_queue_is_left_for_the_broker_to_name() {
        let config = ChannelGroupConfiguration::builder()
            .with_random_input_queue()
            .build();

        let input = AmqpTopology::from_configuration(&config).input_queue.unwrap();

        assert_eq!(input.name, "");
        assert!(input.delete);
    }
}
