//! The local chunk store of a hive node.
//!
//! [`LocalStore`] keeps chunk payloads in [`sharky`] and indexes them in
//! redb. It garbage collects cached chunks, protects the reserve, tracks
//! pins and feeds the pull and push sync protocols through subscriptions.
#![cfg_attr(hive_docsrs, feature(doc_auto_cfg))]

pub mod config;
mod error;
pub mod metrics;
mod migrations;
pub mod sharky;
mod store;
mod tables;
pub mod tags;

pub use self::{
    config::LocalStoreConfig,
    error::LocalStoreError,
    store::{Builder, LocalStore, PushSubscription, SYNC_RATE_WINDOW},
    tags::{Tag, Tags},
};
