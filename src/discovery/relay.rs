//! Relay fan-out rule for the station mesh
//!
//! Traffic from the rover goes to every peer; traffic from a peer goes to the
//! rover and every other peer; nothing is ever reflected to its sender.

use std::net::SocketAddr;

/// Where a relayed message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Rover,
    Peer(SocketAddr),
    /// Originated by this station
    Local,
}

/// Where a relayed message goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Rover,
    Peer(SocketAddr),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub messages_relayed: u64,
    pub bytes_relayed: u64,
}

/// Peer set and the routing rule over it
#[derive(Debug, Default)]
pub struct RelayRouter {
    peers: Vec<SocketAddr>,
    stats: RelayStats,
}

impl RelayRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the peer is already registered
    pub fn register(&mut self, peer: SocketAddr) -> bool {
        if self.peers.contains(&peer) {
            return false;
        }
        self.peers.push(peer);
        true
    }

    pub fn unregister(&mut self, peer: &SocketAddr) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p != peer);
        self.peers.len() != before
    }

    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.peers.contains(peer)
    }

    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Destinations for a message from `origin`
    pub fn route(&self, origin: Origin) -> Vec<Target> {
        let mut targets = Vec::with_capacity(self.peers.len() + 1);
        if origin != Origin::Rover {
            targets.push(Target::Rover);
        }
        targets.extend(
            self.peers
                .iter()
                .filter(|peer| origin != Origin::Peer(**peer))
                .map(|peer| Target::Peer(*peer)),
        );
        targets
    }

    /// Count a message that reached `delivered` destinations
    pub fn record(&mut self, bytes: usize, delivered: usize) {
        self.stats.messages_relayed += delivered as u64;
        self.stats.bytes_relayed += (bytes * delivered) as u64;
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }
}
