// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport
//!
//! `TransportSession` and `Subscription` over a lapin channel.

use crate::{
    address::PublicationAddress,
    errors::TransportError,
    transport::{Subscription, TransportSession},
    wire::WireMessage,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions,
    },
    types::FieldTable,
    Channel, Consumer,
};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Session backed by a single lapin channel.
pub struct AmqpSession {
    channel: Channel,
}

impl AmqpSession {
    /// Wraps an open lapin channel.
    pub fn new(channel: Channel) -> Self {
        AmqpSession { channel }
    }
}

#[async_trait]
impl TransportSession for AmqpSession {
    async fn select_transactions(&self) -> Result<(), TransportError> {
        Ok(self.channel.tx_select().await?)
    }

    async fn commit(&self) -> Result<(), TransportError> {
        Ok(self.channel.tx_commit().await?)
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        Ok(self.channel.tx_rollback().await?)
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        match self
            .channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to configure qos");
                Err(err.into())
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        address: &PublicationAddress,
        message: &WireMessage,
    ) -> Result<(), TransportError> {
        let routing_key = if address.routing_key().is_empty() {
            message.routing_key()
        } else {
            address.routing_key()
        };

        let confirm = match self
            .channel
            .basic_publish(
                address.exchange(),
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                message.body(),
                message.properties().clone(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), %address, "error publishing message");
                Err(TransportError::from(err))
            }
            Ok(confirm) => Ok(confirm),
        }?;

        confirm.await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        no_ack: bool,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(TransportError::from(err))
            }
            Ok(consumer) => Ok(consumer),
        }?;

        debug!(queue, tag = consumer.tag().to_string(), "consumer created");
        Ok(Box::new(AmqpSubscription::new(self.channel.clone(), consumer)))
    }

    async fn abort(&self) {
        if let Err(err) = self.channel.close(200, "channel disposed").await {
            debug!(error = err.to_string(), "ignoring failure to close the channel");
        }
    }
}

/// Consumer on a lapin channel.
pub struct AmqpSubscription {
    channel: Channel,
    tag: String,
    consumer: Mutex<Consumer>,
    last_delivery: AtomicU64,
}

impl AmqpSubscription {
    fn new(channel: Channel, consumer: Consumer) -> Self {
        AmqpSubscription {
            channel,
            tag: consumer.tag().to_string(),
            consumer: Mutex::new(consumer),
            last_delivery: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn receive(&self, timeout: Duration) -> Result<Option<WireMessage>, TransportError> {
        let mut consumer = self.consumer.lock().await;

        match tokio::time::timeout(timeout, consumer.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(TransportError("the consumer was cancelled".to_owned())),
            Ok(Some(Err(err))) => {
                error!(error = err.to_string(), "errors consume msg");
                Err(err.into())
            }
            Ok(Some(Ok(delivery))) => {
                self.last_delivery
                    .store(delivery.delivery_tag, Ordering::Release);
                Ok(Some(WireMessage::from_delivery(&delivery)))
            }
        }
    }

    async fn acknowledge(&self) -> Result<(), TransportError> {
        let tag = self.last_delivery.load(Ordering::Acquire);
        if tag == 0 {
            return Ok(());
        }

        Ok(self
            .channel
            .basic_ack(tag, BasicAckOptions { multiple: true })
            .await?)
    }

    async fn dispose(&self) {
        if let Err(err) = self
            .channel
            .basic_cancel(&self.tag, BasicCancelOptions { nowait: false })
            .await
        {
            debug!(error = err.to_string(), "ignoring failure to cancel the consumer");
        }
    }
}
