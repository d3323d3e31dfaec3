use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::debug;

use super::id::ID_LEN;
use crate::constants::{
    MAX_PEERS_PER_INFO_HASH, MAX_PEERS_RETURNED, SWEEP_EVERY_PUTS, VALIDITY_PERIOD,
};

struct StoredPeer {
    addr: SocketAddr,
    announced_at: Instant,
}

/// Storage for announced peers, keyed by info-hash.
///
/// Each peer appears at most once per info-hash (a re-announce replaces
/// the old record) and expires [`VALIDITY_PERIOD`] after its last
/// announce. Expiry is enforced lazily on reads of a key and by a full
/// sweep every [`SWEEP_EVERY_PUTS`] puts, so the store never needs its
/// own timer.
pub struct PeerStore {
    peers: HashMap<[u8; ID_LEN], Vec<StoredPeer>>,
    puts_since_sweep: usize,
}

impl PeerStore {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            puts_since_sweep: 0,
        }
    }

    /// Records an announce. The list for a key is kept in announce order,
    /// oldest first, so re-announcing moves a peer to the fresh end.
    pub fn put(&mut self, info_hash: [u8; ID_LEN], addr: SocketAddr, now: Instant) {
        self.puts_since_sweep += 1;
        if self.puts_since_sweep >= SWEEP_EVERY_PUTS {
            self.puts_since_sweep = 0;
            self.sweep(now);
        }

        let list = self.peers.entry(info_hash).or_default();
        list.retain(|p| p.addr != addr);

        if list.len() < MAX_PEERS_PER_INFO_HASH {
            list.push(StoredPeer {
                addr,
                announced_at: now,
            });
        }
    }

    /// Returns up to [`MAX_PEERS_RETURNED`] most recently announced live
    /// peers for the key, cleaning out expired records on the way. A key
    /// left empty is removed entirely.
    pub fn get(&mut self, info_hash: &[u8; ID_LEN], now: Instant) -> Vec<SocketAddr> {
        let Some(list) = self.peers.get_mut(info_hash) else {
            return Vec::new();
        };

        list.retain(|p| now.duration_since(p.announced_at) < VALIDITY_PERIOD);
        if list.is_empty() {
            self.peers.remove(info_hash);
            return Vec::new();
        }

        list.iter()
            .rev()
            .take(MAX_PEERS_RETURNED)
            .map(|p| p.addr)
            .collect()
    }

    /// Drops expired records under every key.
    fn sweep(&mut self, now: Instant) {
        let before: usize = self.peers.values().map(Vec::len).sum();

        self.peers.retain(|_, list| {
            list.retain(|p| now.duration_since(p.announced_at) < VALIDITY_PERIOD);
            !list.is_empty()
        });

        let after: usize = self.peers.values().map(Vec::len).sum();
        if after < before {
            debug!(
                expired = before - after,
                remaining = after,
                info_hashes = self.peers.len(),
                "peer store sweep"
            );
        }
    }

    /// Number of info-hashes currently tracked.
    pub fn info_hash_count(&self) -> usize {
        self.peers.len()
    }
}

impl Default for PeerStore {
    fn default() -> Self {
        Self::new()
    }
}
