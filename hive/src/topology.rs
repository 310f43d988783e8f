//! Which peers are closest to an address, and how deep our neighbourhood is.

use std::{
    collections::BTreeSet,
    fmt::Debug,
    sync::{
        RwLock,
        atomic::{AtomicU8, Ordering},
    },
};

use hive_base::Address;
use snafu::Snafu;

/// Errors from peer selection.
#[allow(missing_docs)]
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum TopologyError {
    #[snafu(display("no suitable peer"))]
    NotFound,
    #[snafu(display("this node is the closest"))]
    WantSelf,
}

/// Picks the peer closest to an address.
pub trait ClosestPeerer: Send + Sync + Debug + 'static {
    /// Returns the connected peer closest to `address`, ignoring `skip`.
    ///
    /// With `include_self`, fails with [`TopologyError::WantSelf`] if this
    /// node is closer than every candidate.
    fn closest_peer(
        &self,
        address: &Address,
        include_self: bool,
        skip: &[Address],
    ) -> Result<Address, TopologyError>;
}

/// Reports the neighbourhood depth: peers at or above it in proximity to
/// this node form its neighbourhood.
pub trait NeighborhoodDepther: Send + Sync + Debug + 'static {
    /// The current depth.
    fn neighborhood_depth(&self) -> u8;
}

/// Both views of the topology, as needed by push sync.
pub trait Topology: ClosestPeerer + NeighborhoodDepther {}

impl<T: ClosestPeerer + NeighborhoodDepther> Topology for T {}

/// A fixed set of connected peers, managed by hand.
#[derive(Debug)]
pub struct StaticTopology {
    base: Address,
    peers: RwLock<BTreeSet<Address>>,
    depth: AtomicU8,
}

impl StaticTopology {
    /// A topology around `base` with no peers and depth 0.
    pub fn new(base: Address) -> Self {
        Self {
            base,
            peers: Default::default(),
            depth: AtomicU8::new(0),
        }
    }

    /// Connects `peer`.
    pub fn add_peer(&self, peer: Address) {
        if peer != self.base {
            self.peers.write().expect("poisoned").insert(peer);
        }
    }

    /// Disconnects `peer`.
    pub fn remove_peer(&self, peer: &Address) {
        self.peers.write().expect("poisoned").remove(peer);
    }

    /// Connected peers.
    pub fn peers(&self) -> Vec<Address> {
        self.peers.read().expect("poisoned").iter().copied().collect()
    }

    /// Connected peers whose proximity to this node is at least `depth`.
    pub fn peers_within(&self, depth: u8) -> usize {
        self.peers
            .read()
            .expect("poisoned")
            .iter()
            .filter(|p| self.base.proximity(p) >= depth)
            .count()
    }

    /// Overrides the neighbourhood depth.
    pub fn set_depth(&self, depth: u8) {
        self.depth.store(depth, Ordering::Relaxed);
    }

    /// The node's own address.
    pub fn base(&self) -> &Address {
        &self.base
    }
}

impl ClosestPeerer for StaticTopology {
    fn closest_peer(
        &self,
        address: &Address,
        include_self: bool,
        skip: &[Address],
    ) -> Result<Address, TopologyError> {
        let peers = self.peers.read().expect("poisoned");
        let closest = peers
            .iter()
            .filter(|p| !skip.contains(p))
            .min_by(|x, y| address.distance_cmp(x, y))
            .copied();
        match closest {
            Some(peer) if include_self && address.is_closer(&self.base, &peer) => {
                WantSelfSnafu.fail()
            }
            Some(peer) => Ok(peer),
            None if include_self => WantSelfSnafu.fail(),
            None => NotFoundSnafu.fail(),
        }
    }
}

impl NeighborhoodDepther for StaticTopology {
    fn neighborhood_depth(&self) -> u8 {
        self.depth.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(first: u8) -> Address {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        Address::new(bytes)
    }

    #[test]
    fn picks_closest() {
        let topology = StaticTopology::new(addr(0b1000_0000));
        assert_eq!(
            topology.closest_peer(&addr(0), false, &[]),
            Err(TopologyError::NotFound)
        );
        topology.add_peer(addr(0b0100_0000));
        topology.add_peer(addr(0b0000_0001));
        topology.add_peer(addr(0b1000_0000));
        assert_eq!(topology.peers().len(), 2);

        let target = addr(0b0000_0011);
        assert_eq!(topology.closest_peer(&target, false, &[]), Ok(addr(1)));
        assert_eq!(
            topology.closest_peer(&target, false, &[addr(1)]),
            Ok(addr(0b0100_0000))
        );

        // we are closer than every remaining candidate
        let target = addr(0b1000_0001);
        assert_eq!(
            topology.closest_peer(&target, true, &[]),
            Err(TopologyError::WantSelf)
        );
        assert_eq!(topology.closest_peer(&target, false, &[]), Ok(addr(1)));
        assert_eq!(topology.peers_within(1), 0);
    }
}
