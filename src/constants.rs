//! Protocol constants and tuning parameters.
//!
//! All the knobs used by the DHT node live here: Kademlia table geometry,
//! query and lookup timeouts, token and announce-store lifetimes, and the
//! ingress flood limits. Values follow BEP-5 and the defaults used by
//! mainline clients, with adjustments noted per constant.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Version token included as the `v` key in outgoing KRPC messages
/// (two-letter client id plus a two-byte version, like mainline clients).
pub const CLIENT_VERSION: &[u8; 4] = b"RD\x00\x01";

/// Default DHT listen port.
pub const DEFAULT_PORT: u16 = 6881;

// ============================================================================
// Table geometry
// ============================================================================

/// Bucket capacity (the Kademlia `k`). BEP-5 uses 8.
pub const K: usize = 8;

/// Number of buckets: one per log-distance level of a 160-bit id space.
pub const NUM_BUCKETS: usize = 160;

/// Concurrent in-flight queries per lookup (the Kademlia `alpha`).
pub const ALPHA: usize = 3;

/// Unanswered queries before a routing-table node is considered bad
/// and evicted.
pub const MAX_FAILURES: u8 = 3;

/// A node that answered within this window is good; beyond it the node
/// turns questionable and becomes a liveness-ping candidate (BEP-5: 15 min).
pub const FRESHNESS_PERIOD: Duration = Duration::from_secs(15 * 60);

// ============================================================================
// Queries
// ============================================================================

/// Time to wait for a single RPC response before giving up on the attempt.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Send attempts per RPC (first try plus retries), each with a fresh
/// transaction id.
pub const MAX_QUERY_ATTEMPTS: usize = 2;

/// Cap on concurrently outstanding transactions; further sends are refused.
pub const MAX_PENDING_QUERIES: usize = 1024;

// ============================================================================
// Lookups
// ============================================================================

/// Ceiling on a whole iterative lookup, even if every probed node stalls.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(20);

/// Peer batches are delivered to lookup subscribers through a channel of
/// this depth.
pub const LOOKUP_CHANNEL_CAPACITY: usize = 16;

// ============================================================================
// Maintenance
// ============================================================================

/// A bucket untouched for this long is refreshed with a lookup on a random
/// id inside its distance band (BEP-5: 15 min).
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// How often the oldest questionable node of each bucket is liveness-pinged.
pub const LIVENESS_PING_INTERVAL: Duration = Duration::from_secs(90);

/// Refresh lookups launched per maintenance tick, to bound background load.
pub const MAX_REFRESHES_PER_TICK: usize = 4;

/// Well-known entry points used when no bootstrap contacts are configured.
pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

// ============================================================================
// Tokens
// ============================================================================

/// Secret rotation period. A token stays valid for the current and the
/// previous secret, so its total lifetime is at most twice this.
pub const TOKEN_ROTATION: Duration = Duration::from_secs(5 * 60);

/// Length in bytes of an issued announce token.
pub const TOKEN_LEN: usize = 8;

// ============================================================================
// Announce store
// ============================================================================

/// How long an announced peer stays retrievable without re-announcing.
pub const VALIDITY_PERIOD: Duration = Duration::from_secs(30 * 60);

/// A full expiry sweep across all info-hashes runs every this many puts.
pub const SWEEP_EVERY_PUTS: usize = 100;

/// Most-recent peers returned for one get_peers query.
pub const MAX_PEERS_RETURNED: usize = 50;

/// Stored peers per info-hash; announces beyond this are dropped.
pub const MAX_PEERS_PER_INFO_HASH: usize = 1000;

// ============================================================================
// Flood barrier
// ============================================================================

/// Sliding window over which per-source packet counts are taken.
pub const CHECK_PERIOD: Duration = Duration::from_secs(1);

/// Packets admitted per source within one `CHECK_PERIOD`. Covers queries
/// and responses alike, so it must absorb the burst of answers a single
/// busy counterpart can legitimately send during a lookup.
pub const MAX_PACKETS_PER_PERIOD: usize = 20;

/// How long an offending source stays blocked; any packet from a blocked
/// source restarts this.
pub const BLOCK_PERIOD: Duration = Duration::from_secs(10);

/// Sources tracked by the barrier; least-recently-seen entries are evicted
/// beyond this, so an address-spraying sender cannot grow memory.
pub const MAX_TRACKED_IPS: usize = 4096;
