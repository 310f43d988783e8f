//! A content addressed chunk storage node.
//!
//! Content is split into chunks by a [`file::Pipeline`], stamped with
//! postage and stored in the local store, from where the [`pusher`] hands
//! every chunk to [`pushsync`] so it ends up in the neighbourhood of its
//! address. [`retrieval`] fetches chunks from the closest peers, and the
//! [`netstore`] puts the two together: local first, network on a miss.
//!
//! [`node::Node`] wires all of it over an injected transport.
#![cfg_attr(hive_docsrs, feature(doc_auto_cfg))]

pub mod accounting;
pub mod blocklist;
pub mod config;
pub mod depthmonitor;
pub mod file;
pub mod metrics;
pub mod netstore;
pub mod node;
pub mod p2p;
pub mod pss;
pub mod pusher;
pub mod pushsync;
pub mod retrieval;
mod singleflight;
pub mod test_utils;
pub mod topology;
pub mod traversal;
pub mod warden;

pub use self::{
    config::NodeConfig,
    file::Reference,
    netstore::NetStore,
    node::{Node, NodeError},
    pushsync::PushSync,
    retrieval::Retrieval,
};
