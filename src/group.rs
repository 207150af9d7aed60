// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Groups
//!
//! A `ChannelGroup` is a named configuration bound to a connector. Initializing it declares
//! the broker topology once; afterwards it produces `MessagingChannel`s on demand and runs
//! them on a `WorkerGroup`, either receiving (activity mode) or dispatching queued envelopes
//! (queue mode, dispatch-only groups).

use crate::{
    channel::MessagingChannel,
    configuration::ChannelGroupConfiguration,
    context::DeliveryHandler,
    errors::ChannelError,
    message::ChannelEnvelope,
    transport::TransportSession,
    worker::WorkerGroup,
};
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Source of transport sessions for a channel group.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Declares the topology the configuration needs and returns the configuration with
    /// any broker-assigned names resolved.
    async fn initialize(
        &self,
        config: &ChannelGroupConfiguration,
    ) -> Result<ChannelGroupConfiguration, ChannelError>;

    /// Opens a session dedicated to one channel.
    async fn open_session(&self) -> Result<Arc<dyn TransportSession>, ChannelError>;
}

/// Named family of channels sharing one configuration and one connector.
pub struct ChannelGroup {
    connector: Arc<dyn ChannelConnector>,
    config: ChannelGroupConfiguration,
    resolved: OnceLock<Arc<ChannelGroupConfiguration>>,
    workers: WorkerGroup<MessagingChannel>,
}

impl ChannelGroup {
    /// Creates a group; fails with `Argument` when the configured worker counts are invalid.
    pub fn new(
        connector: Arc<dyn ChannelConnector>,
        config: ChannelGroupConfiguration,
    ) -> Result<Self, ChannelError> {
        let workers = WorkerGroup::new(config.min_workers(), config.max_workers())?;

        Ok(ChannelGroup {
            connector,
            config,
            resolved: OnceLock::new(),
            workers,
        })
    }

    /// Name of the group as configured.
    pub fn name(&self) -> &str {
        self.config.group_name()
    }

    /// Whether the group only sends and never receives.
    pub fn dispatch_only(&self) -> bool {
        self.config.dispatch_only()
    }

    /// The configuration as resolved against the broker, once initialized.
    pub fn configuration(&self) -> Option<&Arc<ChannelGroupConfiguration>> {
        self.resolved.get()
    }

    /// Declares the topology and prepares the workers. Dispatch-only groups start
    /// draining their dispatch queue right away.
    pub async fn initialize(&self) -> Result<(), ChannelError> {
        if self.resolved.get().is_some() {
            return Err(ChannelError::InvalidOperation(format!(
                "the channel group `{}` is already initialized",
                self.name()
            )));
        }

        debug!(group = self.name(), "initializing channel group");
        let resolved = Arc::new(self.connector.initialize(&self.config).await?);
        if self.resolved.set(resolved.clone()).is_err() {
            return Err(ChannelError::InvalidOperation(format!(
                "the channel group `{}` is already initialized",
                self.name()
            )));
        }

        let connector = self.connector.clone();
        self.workers.initialize(
            move |token: CancellationToken| {
                let connector = connector.clone();
                let config = resolved.clone();
                async move {
                    let session = connector.open_session().await?;
                    MessagingChannel::open(session, config, &token).await
                }
            },
            || true,
        )?;

        if self.dispatch_only() {
            self.workers.start_queue()?;
        }

        debug!(group = self.name(), "channel group initialized");
        Ok(())
    }

    /// Opens a standalone channel the caller owns and must dispose.
    pub async fn open_channel(&self) -> Result<MessagingChannel, ChannelError> {
        let config = self.ensure_initialized()?;
        let session = self.connector.open_session().await?;
        MessagingChannel::open(session, config, &CancellationToken::new()).await
    }

    /// Starts every worker receiving deliveries into `handler`.
    pub fn begin_receive(&self, handler: Arc<dyn DeliveryHandler>) -> Result<(), ChannelError> {
        if self.dispatch_only() {
            return Err(ChannelError::InvalidOperation(
                "dispatch-only channel groups cannot receive".to_owned(),
            ));
        }
        self.ensure_initialized()?;

        debug!(group = self.name(), "channel group receiving");
        self.workers.start_activity(move |channel: &mut MessagingChannel| {
            let handler = handler.clone();
            Box::pin(async move {
                if let Err(err) = channel.receive(handler).await {
                    error!(error = err.to_string(), "channel stopped receiving");
                }
            })
        })
    }

    /// Queues an envelope for one of the workers to send.
    pub fn begin_dispatch(&self, envelope: ChannelEnvelope) -> Result<(), ChannelError> {
        if !self.dispatch_only() {
            return Err(ChannelError::InvalidOperation(
                "only dispatch-only channel groups can dispatch asynchronously".to_owned(),
            ));
        }
        self.ensure_initialized()?;

        self.workers.enqueue(move |channel: &mut MessagingChannel| {
            Box::pin(async move {
                if let Err(err) = channel.dispatch(envelope).await {
                    error!(error = err.to_string(), "failure to dispatch message");
                }
            })
        })
    }

    /// Tears down the workers and opens fresh channels for them.
    pub async fn restart(&self) -> Result<(), ChannelError> {
        self.workers.restart().await
    }

    /// Stops every worker and waits until each channel is disposed.
    pub async fn dispose(&self) {
        debug!(group = self.name(), "disposing channel group");
        self.workers.dispose().await;
    }

    fn ensure_initialized(&self) -> Result<Arc<ChannelGroupConfiguration>, ChannelError> {
        self.resolved.get().cloned().ok_or_else(|| {
            ChannelError::InvalidOperation(format!(
                "the channel group `{}` has not been initialized",
                self.name()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::ChannelAddress,
        context::DeliveryContext,
        errors::HandlerError,
        message::{ChannelMessage, LogicalMessage},
        transport::fake::FakeSession,
    };
    use serde_json::json;
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use uuid::Uuid;

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DeliveryHandler for CountingHandler {
        async fn handle(&self, _context: &mut dyn DeliveryContext) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn connector(session: &FakeSession) -> MockChannelConnector {
        let mut connector = MockChannelConnector::new();
        connector.expect_initialize().returning(|config| {
            Ok(match config.dispatch_only() {
                true => config.clone(),
                false => config.with_resolved_input_queue("amq.gen-1"),
            })
        });
        let session = session.clone();
        connector
            .expect_open_session()
            .returning(move || Ok(Arc::new(session.clone()) as Arc<dyn TransportSession>));
        connector
    }

    fn envelope() -> ChannelEnvelope {
        let message = ChannelMessage::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            HashMap::new(),
            vec![LogicalMessage::from_value("invoice", json!({"id": 1}))],
        );
        ChannelEnvelope::new(Arc::new(message), [ChannelAddress::DeadLetter]).unwrap()
    }

    async fn eventually(condition: impl Fn() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn initialize_resolves_the_configuration_once() {
        let session = FakeSession::default();
        let group = ChannelGroup::new(
            Arc::new(connector(&session)),
            ChannelGroupConfiguration::builder()
                .with_random_input_queue()
                .build(),
        )
        .unwrap();

        assert!(group.configuration().is_none());
        group.initialize().await.unwrap();

        let resolved = group.configuration().unwrap();
        assert_eq!(resolved.input_queue(), Some("amq.gen-1"));
        assert!(matches!(
            group.initialize().await,
            Err(ChannelError::InvalidOperation(_))
        ));

        group.dispose().await;
    }

    #[tokio::test]
    async fn operations_require_initialization() {
        let session = FakeSession::default();
        let group = ChannelGroup::new(
            Arc::new(connector(&session)),
            ChannelGroupConfiguration::builder()
                .with_input_queue("billing")
                .build(),
        )
        .unwrap();

        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        assert!(matches!(
            group.begin_receive(handler),
            Err(ChannelError::InvalidOperation(_))
        ));
        assert!(matches!(
            group.open_channel().await,
            Err(ChannelError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn failing_topology_leaves_the_group_uninitialized() {
        let mut connector = MockChannelConnector::new();
        connector
            .expect_initialize()
            .returning(|_| Err(ChannelError::DeclareQueueError("billing".to_owned())));
        let group = ChannelGroup::new(
            Arc::new(connector),
            ChannelGroupConfiguration::builder()
                .with_input_queue("billing")
                .build(),
        )
        .unwrap();

        assert_eq!(
            group.initialize().await,
            Err(ChannelError::DeclareQueueError("billing".to_owned()))
        );
        assert!(group.configuration().is_none());
    }

    #[tokio::test]
    async fn receiving_group_pumps_deliveries_into_the_handler() {
        let config = ChannelGroupConfiguration::builder()
            .with_input_queue("billing")
            .build();
        let wire = config
            .message_adapter()
            .build_wire(&ChannelMessage::new(
                Uuid::new_v4(),
                Uuid::new_v4(),
                None,
                HashMap::new(),
                vec![LogicalMessage::from_value("invoice", json!({"id": 1}))],
            ))
            .unwrap();
        let session = FakeSession::with_deliveries(vec![wire]);
        let group = ChannelGroup::new(Arc::new(connector(&session)), config).unwrap();
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });

        group.initialize().await.unwrap();
        assert!(matches!(
            group.begin_dispatch(envelope()),
            Err(ChannelError::InvalidOperation(_))
        ));
        group.begin_receive(handler.clone()).unwrap();

        eventually(|| handler.calls.load(Ordering::SeqCst) == 1).await;
        group.dispose().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(session.count("subscribe:amq.gen-1") >= 1);
        assert!(session.count("abort") >= 1);
    }

    #[tokio::test]
    async fn failed_commit_does_not_stall_the_receiving_workers() {
        struct FailingLedger {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl DeliveryHandler for FailingLedger {
            async fn handle(&self, context: &mut dyn DeliveryContext) -> Result<(), HandlerError> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    context.current_transaction().register(|| async {
                        Err(ChannelError::Argument("ledger entry".to_owned()))
                    })?;
                }
                Ok(())
            }
        }

        let config = ChannelGroupConfiguration::builder()
            .with_input_queue("billing")
            .build();
        let deliveries = (0..2)
            .map(|_| {
                let message = ChannelMessage::new(
                    Uuid::new_v4(),
                    Uuid::new_v4(),
                    None,
                    HashMap::new(),
                    vec![LogicalMessage::from_value("invoice", json!({"id": 1}))],
                );
                config.message_adapter().build_wire(&message).unwrap()
            })
            .collect();
        let session = FakeSession::with_deliveries(deliveries);
        let group = ChannelGroup::new(Arc::new(connector(&session)), config).unwrap();
        let handler = Arc::new(FailingLedger {
            calls: AtomicUsize::new(0),
        });

        group.initialize().await.unwrap();
        group.begin_receive(handler.clone()).unwrap();

        eventually(|| handler.calls.load(Ordering::SeqCst) == 2).await;
        group.dispose().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(session.count("subscribe:amq.gen-1"), 1);
        assert_eq!(session.published().len(), 1);
        assert_eq!(session.count("ack"), 2);
    }

    #[tokio::test]
    async fn dispatch_only_group_sends_queued_envelopes() {
        let session = FakeSession::default();
        let group = ChannelGroup::new(
            Arc::new(connector(&session)),
            ChannelGroupConfiguration::builder().build(),
        )
        .unwrap();

        group.initialize().await.unwrap();
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        assert!(matches!(
            group.begin_receive(handler),
            Err(ChannelError::InvalidOperation(_))
        ));

        group.begin_dispatch(envelope()).unwrap();
        eventually(|| session.published().len() == 1).await;
        group.dispose().await;

        let published = session.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0.exchange(), "dead-letters");
        assert_eq!(session.count("abort"), 1);
    }

    #[tokio::test]
    async fn open_channel_uses_a_fresh_session() {
        let session = FakeSession::default();
        let group = ChannelGroup::new(
            Arc::new(connector(&session)),
            ChannelGroupConfiguration::builder().build(),
        )
        .unwrap();
        group.initialize().await.unwrap();

        let mut channel = group.open_channel().await.unwrap();
        channel.dispatch(envelope()).await.unwrap();
        channel.dispose().await;
        group.dispose().await;

        assert_eq!(session.published().len(), 1);
        assert!(channel.is_disposed());
    }
}
