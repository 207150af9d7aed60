// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Channel
//!
//! A `MessagingChannel` owns one transport session. It receives deliveries one at a time,
//! hands each to a `DeliveryHandler` inside a transaction, and settles the delivery
//! according to the handler's result: commit on success, forward to the retry, poison or
//! dead-letter destination on failure, abort when the transport is gone.
//!
//! A channel is never shared between workers. Any transport failure is reported as
//! `ChannelError::Connection`, after which the channel reports itself faulted and its owner
//! must discard it.

use crate::{
    adapter::MessageAdapter,
    address::PublicationAddress,
    configuration::{ChannelGroupConfiguration, DependencyResolver, TransactionMode},
    context::{DeliveryContext, DeliveryHandler},
    errors::{ChannelError, HandlerError},
    message::{ChannelEnvelope, ChannelMessage},
    otel,
    policy::{self, DeliveryOutcome, Disposition},
    transaction::{Transaction, TransactionBoundary},
    transport::{Subscription, TransportSession},
    wire::WireMessage,
    worker::WorkerState,
};
use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    sync::{Arc, OnceLock},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Acknowledges and commits at the broker around a channel's transactions.
struct ChannelBoundary {
    session: Arc<dyn TransportSession>,
    subscription: Arc<OnceLock<Arc<dyn Subscription>>>,
    mode: TransactionMode,
}

#[async_trait]
impl TransactionBoundary for ChannelBoundary {
    async fn complete(&self) -> Result<(), ChannelError> {
        if self.mode != TransactionMode::None {
            if let Some(subscription) = self.subscription.get() {
                subscription.acknowledge().await?;
            }
        }

        if self.mode == TransactionMode::Full {
            self.session.commit().await?;
        }

        Ok(())
    }

    async fn abort(&self) -> Result<(), ChannelError> {
        if self.mode == TransactionMode::Full {
            self.session.rollback().await?;
        }

        Ok(())
    }
}

/// Single-consumer channel over one transport session; owned by exactly one worker.
pub struct MessagingChannel {
    session: Arc<dyn TransportSession>,
    config: Arc<ChannelGroupConfiguration>,
    adapter: Arc<MessageAdapter>,
    subscription: Arc<OnceLock<Arc<dyn Subscription>>>,
    transaction: Transaction,
    current_message: Option<Arc<ChannelMessage>>,
    delivery: Option<WireMessage>,
    shutdown: CancellationToken,
    tracer: BoxedTracer,
    disposed: bool,
    faulted: bool,
}

impl MessagingChannel {
    /// Opens a channel over the given session.
    ///
    /// The channel shuts down when `shutdown` is cancelled, or when `begin_shutdown` is
    /// called on it.
    pub async fn open(
        session: Arc<dyn TransportSession>,
        config: Arc<ChannelGroupConfiguration>,
        shutdown: &CancellationToken,
    ) -> Result<Self, ChannelError> {
        let mode = config.transaction_mode();
        if mode == TransactionMode::Full {
            session.select_transactions().await?;
        }

        if config.channel_buffer() > 0 && !config.dispatch_only() {
            session.set_prefetch(config.channel_buffer()).await?;
        }

        debug!(group = config.group_name(), ?mode, "channel opened");

        let subscription = Arc::new(OnceLock::new());
        let boundary = Arc::new(ChannelBoundary {
            session: session.clone(),
            subscription: subscription.clone(),
            mode,
        });

        Ok(MessagingChannel {
            adapter: config.message_adapter().clone(),
            transaction: Transaction::with_boundary(boundary),
            session,
            config,
            subscription,
            current_message: None,
            delivery: None,
            shutdown: shutdown.child_token(),
            tracer: global::tracer(otel::TRACER_NAME),
            disposed: false,
            faulted: false,
        })
    }

    /// Pumps deliveries to `handler` until shutdown or a transport failure.
    ///
    /// # Parameters
    /// * `handler` - invoked once per delivery, inside the delivery's transaction
    ///
    /// # Returns
    /// `Ok(())` once shutdown was requested. Any error leaves the channel faulted, so its
    /// owner must discard it rather than receive on it again.
    pub async fn receive(&mut self, handler: Arc<dyn DeliveryHandler>) -> Result<(), ChannelError> {
        let result = self.pump(handler).await;
        if result.is_err() {
            self.faulted = true;
        }
        result
    }

    async fn pump(&mut self, handler: Arc<dyn DeliveryHandler>) -> Result<(), ChannelError> {
        self.ensure_not_disposed()?;

        if self.config.dispatch_only() {
            return Err(ChannelError::InvalidOperation(
                "dispatch-only channels cannot receive".to_owned(),
            ));
        }

        if self.subscription.get().is_some() {
            return Err(ChannelError::InvalidOperation(
                "the channel is already receiving".to_owned(),
            ));
        }

        if self.shutdown.is_cancelled() {
            return Err(ChannelError::InvalidOperation(
                "the channel is shutting down".to_owned(),
            ));
        }

        let queue = self.config.input_queue().unwrap_or_default().to_owned();
        let no_ack = self.config.transaction_mode() == TransactionMode::None;
        let subscription: Arc<dyn Subscription> =
            match self.session.subscribe(&queue, no_ack).await {
                Ok(subscription) => Arc::from(subscription),
                Err(err) => return Err(self.fault(err.into())),
            };
        let _ = self.subscription.set(subscription.clone());

        debug!(group = self.config.group_name(), queue, "receiving");
        let timeout = self.config.receive_timeout();

        loop {
            let delivery = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                delivery = subscription.receive(timeout) => delivery,
            };

            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(err) => {
                    error!(error = err.to_string(), "failure receiving from the transport");
                    return Err(self.fault(err.into()));
                }
            };

            match self.handle_delivery(delivery, handler.as_ref()).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(err) => return Err(self.fault(err)),
            }
        }

        debug!(group = self.config.group_name(), "receive stopped");
        Ok(())
    }

    /// Handles one delivery; `Ok(false)` stops the pump.
    pub(crate) async fn handle_delivery(
        &mut self,
        delivery: Option<WireMessage>,
        handler: &dyn DeliveryHandler,
    ) -> Result<bool, ChannelError> {
        if self.shutdown.is_cancelled() {
            return Ok(false);
        }

        let Some(delivery) = delivery else {
            trace!("receive timed out");
            return Ok(true);
        };

        trace!(
            delivery_tag = delivery.delivery_tag(),
            exchange = delivery.exchange(),
            "delivery received"
        );

        self.ensure_transaction();

        let outcome = match self.adapter.build(&delivery) {
            Err(err) => {
                warn!(
                    message_id = delivery.message_id(),
                    error = err.to_string(),
                    "failure to translate delivery"
                );
                DeliveryOutcome::Poison(HandlerError::Serialization(err))
            }
            Ok(message) if message.is_expired(Utc::now()) => {
                debug!(message_id = delivery.message_id(), "delivery expired");
                DeliveryOutcome::DeadLetter
            }
            Ok(message) => {
                self.current_message = Some(message.clone());
                self.delivery = Some(delivery.clone());
                let result = self.invoke(&message, &delivery, handler).await;
                self.current_message = None;
                self.delivery = None;
                policy::classify(result)
            }
        };

        let settled = match policy::settle(outcome, &delivery, &self.config, &self.adapter) {
            Disposition::Commit => match self.commit_delivery().await {
                Err(err) if !err.is_connection() => self.retry_failed_commit(err, &delivery).await,
                committed => committed,
            },
            disposition => self.settle(disposition).await,
        };
        self.adapter.purge_from_cache(&delivery);
        settled?;

        Ok(!self.shutdown.is_cancelled())
    }

    async fn invoke(
        &mut self,
        message: &ChannelMessage,
        delivery: &WireMessage,
        handler: &dyn DeliveryHandler,
    ) -> Result<(), HandlerError> {
        let name = message.message_type().unwrap_or_default().to_owned();
        let mut span = otel::new_span(delivery.properties(), &self.tracer, &name);

        let result = handler.handle(self).await;

        if let Err(err) = &result {
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
        span.end();

        result
    }

    async fn settle(&mut self, disposition: Disposition) -> Result<(), ChannelError> {
        match disposition {
            Disposition::Commit => self.commit_delivery().await,
            Disposition::Abort(err) => {
                if let Err(rollback) = self.transaction.dispose().await {
                    debug!(error = rollback.to_string(), "ignoring rollback failure");
                }
                Err(err)
            }
            Disposition::Forward {
                destination,
                message,
            } => {
                // the handler's pending work is discarded with the failed attempt
                self.transaction.rollback().await?;
                self.forward(destination, message).await
            }
        }
    }

    async fn commit_delivery(&mut self) -> Result<(), ChannelError> {
        if self.transaction.is_active() {
            self.transaction.commit().await?;
        }
        Ok(())
    }

    /// A deferred action failed at commit: whatever already reached the broker is rolled
    /// back and the delivery is handled as a failed attempt.
    async fn retry_failed_commit(
        &mut self,
        err: ChannelError,
        delivery: &WireMessage,
    ) -> Result<(), ChannelError> {
        warn!(
            message_id = delivery.message_id(),
            error = err.to_string(),
            "failure to commit the delivery"
        );

        if self.config.transaction_mode() == TransactionMode::Full {
            self.session.rollback().await?;
        }

        let outcome = policy::classify(Err(HandlerError::Channel(err)));
        let disposition = policy::settle(outcome, delivery, &self.config, &self.adapter);
        self.settle(disposition).await
    }

    /// Publishes a copy of the delivery in its own transaction.
    async fn forward(
        &mut self,
        destination: Option<PublicationAddress>,
        message: WireMessage,
    ) -> Result<(), ChannelError> {
        self.ensure_transaction();

        match destination {
            Some(address) => self.register_publish(address, message)?,
            None => debug!(
                message_id = message.message_id(),
                "no destination configured, dropping delivery"
            ),
        }

        self.transaction.commit().await
    }

    /// Sends the envelope and commits right away.
    pub async fn dispatch(&mut self, envelope: ChannelEnvelope) -> Result<(), ChannelError> {
        self.send(envelope)?;
        self.ensure_transaction();

        match self.transaction.commit().await {
            Err(err) => Err(self.fault(err)),
            ok => ok,
        }
    }

    /// Acknowledges every delivery received so far.
    ///
    /// # Returns
    /// `ObjectDisposed` once the channel is disposed; a no-op in `TransactionMode::None`
    /// or before the channel subscribed.
    pub async fn acknowledge_message(&mut self) -> Result<(), ChannelError> {
        self.ensure_not_disposed()?;

        if self.config.transaction_mode() == TransactionMode::None {
            return Ok(());
        }

        let Some(subscription) = self.subscription.get().cloned() else {
            return Ok(());
        };

        match subscription.acknowledge().await {
            Err(err) => Err(self.fault(err.into())),
            Ok(()) => Ok(()),
        }
    }

    /// Commits the broker transaction in `TransactionMode::Full` and starts a new
    /// channel transaction.
    pub async fn commit_transaction(&mut self) -> Result<(), ChannelError> {
        self.ensure_not_disposed()?;

        if self.config.transaction_mode() == TransactionMode::Full {
            let result = self.session.commit().await;
            if let Err(err) = result {
                return Err(self.fault(err.into()));
            }
        }

        self.ensure_transaction();
        Ok(())
    }

    /// Rolls the broker transaction back in `TransactionMode::Full` and starts a new
    /// channel transaction.
    pub async fn rollback_transaction(&mut self) -> Result<(), ChannelError> {
        self.ensure_not_disposed()?;

        if self.config.transaction_mode() == TransactionMode::Full {
            let result = self.session.rollback().await;
            if let Err(err) = result {
                return Err(self.fault(err.into()));
            }
        }

        self.ensure_transaction();
        Ok(())
    }

    /// Asks the receive pump to stop after the delivery in flight.
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether `dispose` has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Rolls back the open transaction, cancels the subscription and closes the session.
    /// Later calls do nothing.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }

        if let Err(err) = self.transaction.dispose().await {
            debug!(error = err.to_string(), "ignoring failure to dispose the transaction");
        }

        self.disposed = true;

        if let Some(subscription) = self.subscription.get() {
            subscription.dispose().await;
        }

        self.session.abort().await;
        debug!(group = self.config.group_name(), "channel disposed");
    }

    fn ensure_not_disposed(&self) -> Result<(), ChannelError> {
        if self.disposed {
            return Err(ChannelError::ObjectDisposed("MessagingChannel"));
        }
        Ok(())
    }

    fn ensure_transaction(&mut self) {
        if !self.transaction.is_active() {
            self.transaction = Transaction::with_boundary(Arc::new(ChannelBoundary {
                session: self.session.clone(),
                subscription: self.subscription.clone(),
                mode: self.config.transaction_mode(),
            }));
        }
    }

    fn register_publish(
        &mut self,
        address: PublicationAddress,
        message: WireMessage,
    ) -> Result<(), ChannelError> {
        let session = self.session.clone();
        self.transaction.register(move || async move {
            session
                .publish(&address, &message)
                .await
                .map_err(ChannelError::from)
        })
    }

    fn fault(&mut self, err: ChannelError) -> ChannelError {
        if err.is_connection() {
            self.faulted = true;
        }
        err
    }
}

impl DeliveryContext for MessagingChannel {
    fn current_message(&self) -> Option<&Arc<ChannelMessage>> {
        self.current_message.as_ref()
    }

    fn current_transaction(&mut self) -> &mut Transaction {
        self.ensure_transaction();
        &mut self.transaction
    }

    fn current_configuration(&self) -> &ChannelGroupConfiguration {
        &self.config
    }

    fn current_resolver(&self) -> Option<&Arc<dyn DependencyResolver>> {
        self.config.dependency_resolver()
    }

    fn group_name(&self) -> &str {
        self.config.group_name()
    }

    fn send(&mut self, envelope: ChannelEnvelope) -> Result<(), ChannelError> {
        self.ensure_not_disposed()?;

        if self.subscription.get().is_none() && self.shutdown.is_cancelled() {
            return Err(ChannelError::Shutdown);
        }

        let wire = match (&self.current_message, &self.delivery) {
            (Some(current), Some(delivery)) if Arc::ptr_eq(current, envelope.message()) => {
                delivery.clone()
            }
            _ => self.adapter.build_wire(envelope.message())?,
        };

        self.ensure_transaction();
        for recipient in envelope.recipients() {
            match self.config.resolve(recipient) {
                Some(address) => self.register_publish(address, wire.clone())?,
                None => debug!(%recipient, "recipient has no destination, skipping"),
            }
        }

        Ok(())
    }
}

#[async_trait]
impl WorkerState for MessagingChannel {
    async fn dispose(&mut self) {
        MessagingChannel::dispose(self).await
    }

    fn is_faulted(&self) -> bool {
        self.faulted
    }
}
