// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Seam
//!
//! The broker operations a channel depends on, expressed as traits so that channels can
//! run against the lapin implementation in `session` or against test doubles. Every
//! failure is a `TransportError`, which channels normalize into
//! `ChannelError::Connection`.

use crate::{address::PublicationAddress, errors::TransportError, wire::WireMessage};
use async_trait::async_trait;
use std::time::Duration;

/// A single session against the broker, owned by exactly one channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Puts the session in transactional mode.
    async fn select_transactions(&self) -> Result<(), TransportError>;

    async fn commit(&self) -> Result<(), TransportError>;

    async fn rollback(&self) -> Result<(), TransportError>;

    /// Bounds the number of unacknowledged deliveries pushed to this session.
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    async fn publish(
        &self,
        address: &PublicationAddress,
        message: &WireMessage,
    ) -> Result<(), TransportError>;

    /// Starts consuming the given queue. With `no_ack` the broker considers every delivery
    /// acknowledged as soon as it is sent.
    async fn subscribe(
        &self,
        queue: &str,
        no_ack: bool,
    ) -> Result<Box<dyn Subscription>, TransportError>;

    /// Tears the session down, swallowing any failure.
    async fn abort(&self);
}

/// Stream of deliveries from a subscribed queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Waits up to `timeout` for the next delivery; `None` signals the timeout elapsed.
    async fn receive(&self, timeout: Duration) -> Result<Option<WireMessage>, TransportError>;

    /// Acknowledges every delivery received so far.
    async fn acknowledge(&self) -> Result<(), TransportError>;

    async fn dispose(&self);
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted in-memory transport recording every call made against it.

    use super::*;
    use parking_lot::Mutex;
    use std::{collections::VecDeque, sync::Arc};
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Shared {
        calls: Mutex<Vec<String>>,
        published: Mutex<Vec<(PublicationAddress, WireMessage)>>,
        deliveries: Mutex<VecDeque<WireMessage>>,
        fail_publish: Mutex<bool>,
        drained: CancellationToken,
    }

    /// Session double: deliveries are served in order, then `drained` is cancelled.
    #[derive(Clone, Default)]
    pub(crate) struct FakeSession {
        shared: Arc<Shared>,
    }

    impl FakeSession {
        pub(crate) fn with_deliveries(deliveries: Vec<WireMessage>) -> Self {
            let session = FakeSession::default();
            session.shared.deliveries.lock().extend(deliveries);
            session
        }

        pub(crate) fn fail_publishing(&self) {
            *self.shared.fail_publish.lock() = true;
        }

        /// Cancelled once every scripted delivery has been handed out.
        pub(crate) fn drained(&self) -> CancellationToken {
            self.shared.drained.clone()
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.shared.calls.lock().clone()
        }

        pub(crate) fn count(&self, call: &str) -> usize {
            self.shared
                .calls
                .lock()
                .iter()
                .filter(|c| c.as_str() == call)
                .count()
        }

        pub(crate) fn published(&self) -> Vec<(PublicationAddress, WireMessage)> {
            self.shared.published.lock().clone()
        }

        fn record(&self, call: &str) {
            self.shared.calls.lock().push(call.to_owned());
        }
    }

    #[async_trait]
    impl TransportSession for FakeSession {
        async fn select_transactions(&self) -> Result<(), TransportError> {
            self.record("select");
            Ok(())
        }

        async fn commit(&self) -> Result<(), TransportError> {
            self.record("commit");
            Ok(())
        }

        async fn rollback(&self) -> Result<(), TransportError> {
            self.record("rollback");
            Ok(())
        }

        async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
            self.record(&format!("prefetch:{count}"));
            Ok(())
        }

        async fn publish(
            &self,
            address: &PublicationAddress,
            message: &WireMessage,
        ) -> Result<(), TransportError> {
            if *self.shared.fail_publish.lock() {
                return Err(TransportError("connection reset".to_owned()));
            }

            self.record("publish");
            self.shared
                .published
                .lock()
                .push((address.clone(), message.clone()));
            Ok(())
        }

        async fn subscribe(
            &self,
            queue: &str,
            _no_ack: bool,
        ) -> Result<Box<dyn Subscription>, TransportError> {
            self.record(&format!("subscribe:{queue}"));
            Ok(Box::new(FakeSubscription {
                session: self.clone(),
            }))
        }

        async fn abort(&self) {
            self.record("abort");
        }
    }

    struct FakeSubscription {
        session: FakeSession,
    }

    #[async_trait]
    impl Subscription for FakeSubscription {
        async fn receive(&self, _timeout: Duration) -> Result<Option<WireMessage>, TransportError> {
            let next = self.session.shared.deliveries.lock().pop_front();
            if next.is_none() {
                self.session.shared.drained.cancel();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(next)
        }

        async fn acknowledge(&self) -> Result<(), TransportError> {
            self.session.record("ack");
            Ok(())
        }

        async fn dispose(&self) {
            self.session.record("cancel");
        }
    }
}
