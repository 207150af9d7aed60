// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transactions
//!
//! A `Transaction` is the unit of work of one delivery. It buffers deferred actions, most
//! notably publications, and runs them in registration order on commit. A finished
//! transaction is never reused; channels replace it with a fresh one when needed.
//!
//! What brackets a commit or rollback at the broker level (acknowledging deliveries,
//! committing the broker transaction) is supplied by the owner through a
//! `TransactionBoundary`.

use crate::errors::ChannelError;
use async_trait::async_trait;
use futures_util::{future::BoxFuture, FutureExt};
use std::{future::Future, sync::Arc};
use tracing::trace;

/// Action run when a transaction commits.
pub type DeferredAction =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<(), ChannelError>> + Send + Sync>;

/// Work done around the commit or rollback of a transaction.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionBoundary: Send + Sync {
    /// Runs after every deferred action succeeded.
    async fn complete(&self) -> Result<(), ChannelError>;

    /// Runs when the transaction is rolled back.
    async fn abort(&self) -> Result<(), ChannelError>;
}

enum TransactionState {
    Active(Vec<DeferredAction>),
    Finished,
}

/// Unit of work against a channel.
pub struct Transaction {
    state: TransactionState,
    boundary: Option<Arc<dyn TransactionBoundary>>,
}

impl Default for Transaction {
    fn default() -> Self {
        Transaction::new()
    }
}

impl Transaction {
    /// Creates an active transaction with nothing around its commit.
    pub fn new() -> Self {
        Transaction {
            state: TransactionState::Active(vec![]),
            boundary: None,
        }
    }

    /// Creates an active transaction completed or aborted through `boundary`.
    pub fn with_boundary(boundary: Arc<dyn TransactionBoundary>) -> Self {
        Transaction {
            state: TransactionState::Active(vec![]),
            boundary: Some(boundary),
        }
    }

    /// Whether the transaction still accepts actions.
    pub fn is_active(&self) -> bool {
        matches!(self.state, TransactionState::Active(_))
    }

    /// Number of actions waiting for the commit.
    pub fn pending(&self) -> usize {
        match &self.state {
            TransactionState::Active(actions) => actions.len(),
            TransactionState::Finished => 0,
        }
    }

    /// Appends an action to run at commit time.
    pub fn register<F, Fut>(&mut self, action: F) -> Result<(), ChannelError>
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ChannelError>> + Send + 'static,
    {
        match &mut self.state {
            TransactionState::Active(actions) => {
                actions.push(Box::new(move || action().boxed()));
                Ok(())
            }
            TransactionState::Finished => Err(ChannelError::InvalidOperation(
                "the transaction has already finished".to_owned(),
            )),
        }
    }

    /// Runs every registered action in order, then completes the boundary.
    ///
    /// The transaction is finished even when an action fails; the failure is returned and
    /// the remaining actions are skipped.
    pub async fn commit(&mut self) -> Result<(), ChannelError> {
        let actions = match std::mem::replace(&mut self.state, TransactionState::Finished) {
            TransactionState::Active(actions) => actions,
            TransactionState::Finished => {
                return Err(ChannelError::InvalidOperation(
                    "the transaction has already finished".to_owned(),
                ))
            }
        };

        trace!(actions = actions.len(), "committing transaction");
        for action in actions {
            action().await?;
        }

        match &self.boundary {
            Some(boundary) => boundary.complete().await,
            None => Ok(()),
        }
    }

    /// Finishes the transaction without running its actions. No-op once finished.
    pub async fn rollback(&mut self) -> Result<(), ChannelError> {
        if !self.is_active() {
            return Ok(());
        }

        self.state = TransactionState::Finished;
        trace!("rolling back transaction");

        match &self.boundary {
            Some(boundary) => boundary.abort().await,
            None => Ok(()),
        }
    }

    /// Rolls back a transaction that is still active.
    pub async fn dispose(&mut self) -> Result<(), ChannelError> {
        self.rollback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder() -> Arc<Mutex<Vec<u32>>> {
        Arc::new(Mutex::new(vec![]))
    }

    fn push(
        log: &Arc<Mutex<Vec<u32>>>,
        value: u32,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<(), ChannelError>> + Send + Sync + 'static {
        let log = log.clone();
        move || {
            async move {
                log.lock().push(value);
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn commit_runs_actions_in_registration_order() {
        let log = recorder();
        let mut tx = Transaction::new();
        tx.register(push(&log, 1)).unwrap();
        tx.register(push(&log, 2)).unwrap();
        tx.register(push(&log, 3)).unwrap();

        tx.commit().await.unwrap();

        assert_eq!(*log.lock(), vec![1, 2, 3]);
        assert!(!tx.is_active());
    }

    #[tokio::test]
    async fn rollback_discards_actions() {
        let log = recorder();
        let mut tx = Transaction::new();
        tx.register(push(&log, 1)).unwrap();

        tx.rollback().await.unwrap();

        assert!(log.lock().is_empty());
        assert!(!tx.is_active());
    }

    #[tokio::test]
    async fn finished_transaction_rejects_new_actions() {
        let mut tx = Transaction::new();
        tx.commit().await.unwrap();

        let result = tx.register(|| async { Ok(()) });

        assert!(matches!(result, Err(ChannelError::InvalidOperation(_))));
        assert!(tx.commit().await.is_err());
    }

    #[tokio::test]
    async fn failed_action_finishes_the_transaction_and_propagates() {
        let log = recorder();
        let mut tx = Transaction::new();
        tx.register(push(&log, 1)).unwrap();
        tx.register(|| async { Err(ChannelError::Connection("reset".to_owned())) })
            .unwrap();
        tx.register(push(&log, 3)).unwrap();

        let result = tx.commit().await;

        assert_eq!(result, Err(ChannelError::Connection("reset".to_owned())));
        assert_eq!(*log.lock(), vec![1]);
        assert!(!tx.is_active());
    }

    #[tokio::test]
    async fn boundary_completes_after_actions() {
        let mut boundary = MockTransactionBoundary::new();
        boundary.expect_complete().times(1).returning(|| Ok(()));
        boundary.expect_abort().never();

        let mut tx = Transaction::with_boundary(Arc::new(boundary));
        tx.register(|| async { Ok(()) }).unwrap();

        assert_eq!(tx.pending(), 1);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn boundary_is_not_completed_when_an_action_fails() {
        let mut boundary = MockTransactionBoundary::new();
        boundary.expect_complete().never();

        let mut tx = Transaction::with_boundary(Arc::new(boundary));
        tx.register(|| async { Err(ChannelError::Connection("reset".to_owned())) })
            .unwrap();

        assert!(tx.commit().await.is_err());
    }

    #[tokio::test]
    async fn dispose_aborts_once() {
        let mut boundary = MockTransactionBoundary::new();
        boundary.expect_abort().times(1).returning(|| Ok(()));

        let mut tx = Transaction::with_boundary(Arc::new(boundary));
        tx.dispose().await.unwrap();
        tx.dispose().await.unwrap();
        tx.rollback().await.unwrap();
    }
}
