use hive_base::{BatchId, crypto::CryptoError, stamp::StampError, state::StateStoreError, storage::StorageError};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};

/// Errors from the postage layer.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum PostageError {
    #[snafu(display("bucket full"))]
    BucketFull {},
    #[snafu(display("batch {id} not found"))]
    NotFound { id: BatchId },
    #[snafu(display("batch {id} not usable yet"))]
    NotUsable { id: BatchId },
    #[snafu(display("batch {id} already exists"))]
    BatchExists { id: BatchId },
    #[snafu(display("insufficient funds"))]
    InsufficientFunds {},
    #[snafu(display("invalid depth {depth}"))]
    InvalidDepth { depth: u8 },
    #[snafu(display("chain disabled"))]
    ChainDisabled {},
    #[snafu(display("transaction reverted"))]
    TransactionReverted {},
    #[snafu(display("signing stamp"))]
    Sign { source: CryptoError },
    #[snafu(transparent)]
    InvalidStamp { source: StampError },
    #[snafu(transparent)]
    State { source: StateStoreError },
    #[snafu(display("evicting chunks of batch {id}"))]
    Evict { id: BatchId, source: StorageError },
}
