use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::id::{NodeId, ID_LEN};
use crate::constants::{FRESHNESS_PERIOD, MAX_FAILURES};

/// Wire length of one compact node contact: 20-byte id, IPv4, BE port.
pub const COMPACT_NODE_LEN: usize = ID_LEN + 6;

/// Wire length of one compact peer address: IPv4 plus BE port.
pub const COMPACT_PEER_LEN: usize = 6;

/// A remote contact as learned from the wire.
///
/// The id is always present: contacts only come out of compact node
/// encodings and out of responses, both of which carry one. A plain
/// address with no id (a bootstrap entry point, say) stays a
/// `SocketAddr` until its owner answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    /// Client version token (`v` key) if the node ever sent one.
    pub version: Option<Bytes>,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            version: None,
        }
    }

    pub fn with_version(mut self, version: Option<Bytes>) -> Self {
        self.version = version;
        self
    }

    /// Parses one 26-byte compact contact. Returns `None` on any length or
    /// content problem; callers iterate wire data with `chunks_exact` and
    /// skip the bad ones.
    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != COMPACT_NODE_LEN {
            return None;
        }

        let id = NodeId::from_bytes(&data[..ID_LEN]).ok()?;
        let addr = peer_from_compact(&data[ID_LEN..])?;
        Some(Self::new(id, addr))
    }

    /// Encodes to the 26-byte compact form; `None` for IPv6 contacts,
    /// which the compact `nodes` encoding cannot carry.
    pub fn to_compact(&self) -> Option<[u8; COMPACT_NODE_LEN]> {
        let mut compact = [0u8; COMPACT_NODE_LEN];
        compact[..ID_LEN].copy_from_slice(&self.id.0);
        compact[ID_LEN..].copy_from_slice(&compact_peer(&self.addr)?);
        Some(compact)
    }
}

/// Parses a 6-byte compact peer address.
pub fn peer_from_compact(data: &[u8]) -> Option<SocketAddr> {
    if data.len() != COMPACT_PEER_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Encodes a peer address to the 6-byte compact form; `None` for IPv6.
pub fn compact_peer(addr: &SocketAddr) -> Option<[u8; COMPACT_PEER_LEN]> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut data = [0u8; COMPACT_PEER_LEN];
            data[..4].copy_from_slice(&v4.ip().octets());
            data[4..].copy_from_slice(&v4.port().to_be_bytes());
            Some(data)
        }
        SocketAddr::V6(_) => None,
    }
}

/// Health of a routing-table node, derived from its bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Answered within the freshness window and has no pending failures.
    Good,
    /// Not heard from recently; a liveness-ping candidate.
    Questionable,
    /// Failed too many queries in a row; due for eviction.
    Bad,
}

/// A routing-table resident: a contact plus the liveness bookkeeping the
/// table maintenance runs on.
#[derive(Debug, Clone)]
pub struct RNode {
    pub node: Node,
    pub last_seen: Instant,
    pub created_at: Instant,
    pub failures: u8,
    /// Whether this node has ever answered one of our queries. Restored
    /// and promoted contacts start unverified and stay questionable until
    /// a liveness ping confirms them.
    pub verified: bool,
    /// Smoothed round-trip time, fed by every answered query.
    pub rtt: Option<Duration>,
    /// When the maintenance loop last pinged this node, to avoid
    /// re-probing the same questionable node every tick.
    pub last_pinged: Option<Instant>,
}

impl RNode {
    /// A node that just answered us.
    pub fn new(node: Node, now: Instant) -> Self {
        Self {
            node,
            last_seen: now,
            created_at: now,
            failures: 0,
            verified: true,
            rtt: None,
            last_pinged: None,
        }
    }

    /// A restored or promoted contact we have not verified recently; it is
    /// never preferred over verified nodes until a ping confirms it.
    pub fn new_unverified(node: Node, now: Instant) -> Self {
        Self {
            node,
            last_seen: now,
            created_at: now,
            failures: 0,
            verified: false,
            rtt: None,
            last_pinged: None,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.node.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.node.addr
    }

    /// Records an answered query: clears failures, refreshes the
    /// last-seen stamp, and folds the sample into the smoothed RTT
    /// (EWMA, 7/8 history).
    pub fn touch(&mut self, rtt: Option<Duration>, now: Instant) {
        self.last_seen = now;
        self.failures = 0;
        self.verified = true;
        if let Some(sample) = rtt {
            self.rtt = Some(match self.rtt {
                Some(prev) => (prev * 7 + sample) / 8,
                None => sample,
            });
        }
    }

    /// Records an unanswered query.
    pub fn fail(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn status(&self, now: Instant) -> NodeStatus {
        if self.failures >= MAX_FAILURES {
            NodeStatus::Bad
        } else if self.verified
            && self.failures == 0
            && now.duration_since(self.last_seen) < FRESHNESS_PERIOD
        {
            NodeStatus::Good
        } else {
            NodeStatus::Questionable
        }
    }
}
