//! Postage for hive: stamp issuers and the stamper that uses them, the
//! postage service tracking the batches this node owns, the batch store
//! tracking every batch on chain, and the service applying chain events.
#![cfg_attr(hive_docsrs, feature(doc_auto_cfg))]

pub mod batch;
pub mod batchstore;
pub mod chain;
mod error;
pub mod events;
pub mod issuer;
pub mod service;
pub mod stamper;
pub mod validate;

pub use self::{
    batch::{Batch, ChainState, ReserveState},
    batchstore::BatchStore,
    error::PostageError,
    issuer::StampIssuer,
    service::PostageService,
    stamper::Stamper,
    validate::ValidStamp,
};

/// Number of blocks a batch needs to age before stamps are issued from it.
pub const BLOCK_THRESHOLD: u64 = 10;
