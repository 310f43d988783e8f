//! The interfaces to the chain a node calls into.
//!
//! The node never talks to a chain backend directly; it only submits
//! transactions through a [`TransactionService`] and manages its own
//! batches through a [`PostageContract`]. When the chain is disabled both
//! are replaced by implementations failing every call with
//! [`PostageError::ChainDisabled`].

use futures_util::future::BoxFuture;
use hive_base::BatchId;
use serde::{Deserialize, Serialize};

use crate::error::{ChainDisabledSnafu, PostageError};

/// Hash of a submitted transaction.
pub type TxHash = [u8; 32];

/// A transaction to submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRequest {
    /// Target contract address.
    pub to: [u8; 20],
    /// Call data.
    pub data: Vec<u8>,
    /// Value transferred along.
    pub value: u128,
    /// Free form description, for logging.
    pub description: String,
}

/// Submits transactions.
pub trait TransactionService: Send + Sync + std::fmt::Debug + 'static {
    /// Sends `request`, returning its hash.
    fn send(&self, request: TxRequest) -> BoxFuture<'_, Result<TxHash, PostageError>>;

    /// Waits until `tx` is mined. Fails with
    /// [`PostageError::TransactionReverted`] if it reverted.
    fn wait_for_receipt(&self, tx: TxHash) -> BoxFuture<'_, Result<(), PostageError>>;
}

/// Manages the batches of this node.
pub trait PostageContract: Send + Sync + std::fmt::Debug + 'static {
    /// Buys a new batch.
    fn create_batch(
        &self,
        initial_balance: u128,
        depth: u8,
        immutable: bool,
        label: String,
    ) -> BoxFuture<'_, Result<BatchId, PostageError>>;

    /// Adds `amount` per chunk to a batch.
    fn top_up_batch(&self, id: BatchId, amount: u128) -> BoxFuture<'_, Result<(), PostageError>>;

    /// Increases the depth of a batch.
    fn dilute_batch(&self, id: BatchId, depth: u8) -> BoxFuture<'_, Result<(), PostageError>>;
}

/// Transaction service of a node running without a chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledTransactionService;

impl TransactionService for DisabledTransactionService {
    fn send(&self, _request: TxRequest) -> BoxFuture<'_, Result<TxHash, PostageError>> {
        Box::pin(async { ChainDisabledSnafu.fail() })
    }

    fn wait_for_receipt(&self, _tx: TxHash) -> BoxFuture<'_, Result<(), PostageError>> {
        Box::pin(async { ChainDisabledSnafu.fail() })
    }
}

/// Postage contract of a node running without a chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledPostageContract;

impl PostageContract for DisabledPostageContract {
    fn create_batch(
        &self,
        _initial_balance: u128,
        _depth: u8,
        _immutable: bool,
        _label: String,
    ) -> BoxFuture<'_, Result<BatchId, PostageError>> {
        Box::pin(async { ChainDisabledSnafu.fail() })
    }

    fn top_up_batch(&self, _id: BatchId, _amount: u128) -> BoxFuture<'_, Result<(), PostageError>> {
        Box::pin(async { ChainDisabledSnafu.fail() })
    }

    fn dilute_batch(&self, _id: BatchId, _depth: u8) -> BoxFuture<'_, Result<(), PostageError>> {
        Box::pin(async { ChainDisabledSnafu.fail() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled() {
        let tx = DisabledTransactionService;
        let err = tx
            .send(TxRequest {
                to: [0; 20],
                data: vec![],
                value: 0,
                description: "test".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PostageError::ChainDisabled { .. }));

        let contract: Box<dyn PostageContract> = Box::new(DisabledPostageContract);
        let err = contract
            .create_batch(10, 20, false, "label".into())
            .await
            .unwrap_err();
        assert!(matches!(err, PostageError::ChainDisabled { .. }));
        assert!(contract.top_up_batch(BatchId::default(), 1).await.is_err());
        assert!(contract.dilute_batch(BatchId::default(), 21).await.is_err());
    }
}
