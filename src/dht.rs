//! Distributed Hash Table ([BEP-5]).
//!
//! This module implements a Kademlia-based Mainline DHT node: it locates
//! peers for an info-hash through iterative lookups and answers the
//! symmetric queries (`ping`, `find_node`, `get_peers`, `announce_peer`)
//! issued by the rest of the swarm.
//!
//! The moving parts, bottom up:
//!
//! - `id` — 160-bit identifiers and the XOR metric
//! - `message` — KRPC framing over bencode
//! - `flood` — per-source ingress rate guard
//! - `token` — rotating write tokens gating announce_peer
//! - `store` — announced peers with TTL eviction
//! - `routing` — k-buckets with replacement caches
//! - `querier` — in-flight transaction bookkeeping
//! - `lookup` — the iterative lookup state machine
//! - `state` — routing-table snapshots for restarts
//! - `server` — the event loop tying it all together
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

mod error;
mod flood;
mod id;
mod lookup;
mod message;
mod node;
mod querier;
mod routing;
mod server;
mod state;
mod store;
mod token;

pub use error::DhtError;
pub use id::{NodeId, ID_LEN};
pub use lookup::{LookupEvent, LookupOutcome, LookupTermination};
pub use message::{DhtMessage, DhtQuery, DhtResponse, TransactionId};
pub use node::{Node, NodeStatus, RNode};
pub use server::{DhtConfig, DhtServer};
pub use state::parse_state as load_state;

#[cfg(test)]
mod tests;
