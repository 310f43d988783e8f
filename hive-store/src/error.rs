use hive_base::{stamp::StampError, storage::StorageError};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};

use crate::sharky::SharkyError;

/// Errors inside the local store.
///
/// At the public API these are turned into [`StorageError`]s, keeping
/// [`StorageError::NotFound`] and friends intact.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum LocalStoreError {
    #[snafu(transparent)]
    Storage { source: StorageError },
    #[snafu(transparent)]
    Sharky { source: SharkyError },
    #[snafu(transparent)]
    Io { source: std::io::Error },
    #[snafu(transparent)]
    Database { source: redb::DatabaseError },
    #[snafu(transparent)]
    Transaction { source: redb::TransactionError },
    #[snafu(transparent)]
    Table { source: redb::TableError },
    #[snafu(transparent)]
    Redb { source: redb::StorageError },
    #[snafu(transparent)]
    Commit { source: redb::CommitError },
    #[snafu(transparent)]
    Encoding { source: postcard::Error },
    #[snafu(transparent)]
    Stamp { source: StampError },
    #[snafu(display("unknown schema {name}"))]
    UnknownSchema { name: String },
    #[snafu(display("store was created with a different base key"))]
    BaseKeyMismatch {},
    #[snafu(display("close timed out after {timeout:?}"))]
    CloseTimeout { timeout: std::time::Duration },
}

impl From<LocalStoreError> for StorageError {
    fn from(value: LocalStoreError) -> Self {
        match value {
            LocalStoreError::Storage { source, .. } => source,
            other => StorageError::from_err(other),
        }
    }
}
