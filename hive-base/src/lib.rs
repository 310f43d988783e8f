//! Base types and utilities for hive: addresses, chunks, the BMT hasher,
//! single owner chunks, postage stamps and the storage traits shared by all
//! the other crates.
#![cfg_attr(hive_docsrs, feature(doc_auto_cfg))]

pub mod address;
pub mod bmt;
pub mod cac;
pub mod chunk;
pub mod crypto;
pub mod hash;
pub mod soc;
pub mod stamp;
pub mod state;
pub mod storage;

pub use self::{
    address::{Address, MAX_PO},
    chunk::Chunk,
    crypto::{EthAddress, Signature, Signer},
    stamp::{BatchId, Stamp},
    state::StateStore,
};
