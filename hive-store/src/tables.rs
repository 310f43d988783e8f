#![allow(missing_docs)]
// Table Definitions

use redb::{Table, TableDefinition, WriteTransaction};

/// Table: Retrieval data
/// Key:   `[u8; 32]` # Address
/// Value: `&[u8]`    # postcard encoded [`crate::store::Item`]
pub const RETRIEVAL_DATA_TABLE: TableDefinition<&[u8; 32], &[u8]> =
    TableDefinition::new("retrieval-data-1");

/// Table: Retrieval access
/// Key:   `[u8; 32]` # Address
/// Value: `u64`      # last access timestamp, nanoseconds
pub const RETRIEVAL_ACCESS_TABLE: TableDefinition<&[u8; 32], u64> =
    TableDefinition::new("retrieval-access-1");

/// Table: Pull index
/// Key:   `(u8, u64)` # (bin, bin id)
/// Value: `[u8; 32]`  # Address
pub const PULL_TABLE: TableDefinition<PullKey, &[u8; 32]> = TableDefinition::new("pull-1");
pub type PullKey = (u8, u64);

/// Table: Push index
/// Key:   `(u64, [u8; 32])` # (store timestamp, Address)
/// Value: `u32`             # upload tag, 0 for none
pub const PUSH_TABLE: TableDefinition<PushKey, u32> = TableDefinition::new("push-1");
pub type PushKey<'a> = (u64, &'a [u8; 32]);

/// Table: Garbage collection index
/// Key:   `(u64, u64, [u8; 32])` # (access timestamp, bin id, Address)
/// Value: `()`
pub const GC_TABLE: TableDefinition<GcKey, ()> = TableDefinition::new("gc-1");
pub type GcKey<'a> = (u64, u64, &'a [u8; 32]);

/// Table: Pins
/// Key:   `[u8; 32]` # Address
/// Value: `u64`      # pin counter
pub const PIN_TABLE: TableDefinition<&[u8; 32], u64> = TableDefinition::new("pin-1");

/// Table: Chunks per batch
/// Key:   `([u8; 32], u8, u64, [u8; 32])` # (BatchId, proximity order, bin id, Address)
/// Value: `()`
pub const VOUCHER_CHUNKS_TABLE: TableDefinition<VoucherChunksKey, ()> =
    TableDefinition::new("voucher-chunks-1");
pub type VoucherChunksKey<'a> = (&'a [u8; 32], u8, u64, &'a [u8; 32]);

/// Table: Stamp slots per batch
/// Key:   `([u8; 32], [u8; 8])` # (BatchId, bucket || counter)
/// Value: `([u8; 32], u64)`     # (Address, stamp timestamp)
pub const VOUCHER_INDEX_TABLE: TableDefinition<VoucherIndexKey, VoucherIndexValue> =
    TableDefinition::new("voucher-index-1");
pub type VoucherIndexKey<'a> = (&'a [u8; 32], &'a [u8; 8]);
pub type VoucherIndexValue<'a> = (&'a [u8; 32], u64);

/// Table: Reserve radius per batch
/// Key:   `[u8; 32]` # BatchId
/// Value: `u8`       # radius
pub const POSTAGE_RADIUS_TABLE: TableDefinition<&[u8; 32], u8> =
    TableDefinition::new("postage-radius-1");

/// Table: Last bin id per bin
/// Key:   `u8`  # bin
/// Value: `u64` # last bin id handed out
pub const BIN_IDS_TABLE: TableDefinition<u8, u64> = TableDefinition::new("bin-ids-1");

/// Table: Counters
/// Key:   `&str` # name, see [`GC_SIZE`] and [`RESERVE_SIZE`]
/// Value: `u64`
pub const COUNTERS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("counters-1");
pub const GC_SIZE: &str = "gcSize";
pub const RESERVE_SIZE: &str = "reserveSize";

/// Table: Singletons
/// Key:   `&str`  # name, see [`SCHEMA_NAME`] and [`BASE_KEY`]
/// Value: `&[u8]`
pub const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta-1");
pub const SCHEMA_NAME: &str = "schemaName";
pub const BASE_KEY: &str = "baseKey";

#[derive(derive_more::Debug)]
pub struct Tables<'tx> {
    #[debug("retrieval_data")]
    pub retrieval_data: Table<'tx, &'static [u8; 32], &'static [u8]>,
    #[debug("retrieval_access")]
    pub retrieval_access: Table<'tx, &'static [u8; 32], u64>,
    #[debug("pull")]
    pub pull: Table<'tx, PullKey, &'static [u8; 32]>,
    #[debug("push")]
    pub push: Table<'tx, PushKey<'static>, u32>,
    #[debug("gc")]
    pub gc: Table<'tx, GcKey<'static>, ()>,
    #[debug("pin")]
    pub pin: Table<'tx, &'static [u8; 32], u64>,
    #[debug("voucher_chunks")]
    pub voucher_chunks: Table<'tx, VoucherChunksKey<'static>, ()>,
    #[debug("voucher_index")]
    pub voucher_index: Table<'tx, VoucherIndexKey<'static>, VoucherIndexValue<'static>>,
    #[debug("postage_radius")]
    pub postage_radius: Table<'tx, &'static [u8; 32], u8>,
    #[debug("bin_ids")]
    pub bin_ids: Table<'tx, u8, u64>,
    #[debug("counters")]
    pub counters: Table<'tx, &'static str, u64>,
}

impl<'tx> Tables<'tx> {
    pub fn new(tx: &'tx WriteTransaction) -> Result<Self, redb::TableError> {
        Ok(Self {
            retrieval_data: tx.open_table(RETRIEVAL_DATA_TABLE)?,
            retrieval_access: tx.open_table(RETRIEVAL_ACCESS_TABLE)?,
            pull: tx.open_table(PULL_TABLE)?,
            push: tx.open_table(PUSH_TABLE)?,
            gc: tx.open_table(GC_TABLE)?,
            pin: tx.open_table(PIN_TABLE)?,
            voucher_chunks: tx.open_table(VOUCHER_CHUNKS_TABLE)?,
            voucher_index: tx.open_table(VOUCHER_INDEX_TABLE)?,
            postage_radius: tx.open_table(POSTAGE_RADIUS_TABLE)?,
            bin_ids: tx.open_table(BIN_IDS_TABLE)?,
            counters: tx.open_table(COUNTERS_TABLE)?,
        })
    }
}

/// Creates every table, so that read transactions can open them.
pub fn create_tables(tx: &WriteTransaction) -> Result<(), redb::TableError> {
    Tables::new(tx)?;
    tx.open_table(META_TABLE)?;
    Ok(())
}
