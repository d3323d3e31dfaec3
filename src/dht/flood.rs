use std::collections::VecDeque;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::debug;

use crate::constants::{BLOCK_PERIOD, CHECK_PERIOD, MAX_PACKETS_PER_PERIOD, MAX_TRACKED_IPS};

#[derive(Default)]
struct FloodEntry {
    /// Arrival times of recently admitted packets, oldest first.
    hits: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

/// Per-source-IP rate guard sitting in front of the message codec.
///
/// A source gets [`MAX_PACKETS_PER_PERIOD`] packets per sliding
/// [`CHECK_PERIOD`]; one more blocks it for [`BLOCK_PERIOD`], and every
/// packet sent while blocked restarts the block. Rejected packets are
/// dropped before any parsing happens.
///
/// The table of sources is itself bounded: least-recently-seen entries
/// fall out past [`MAX_TRACKED_IPS`], which also forgets their block
/// state, an accepted trade for bounded memory.
pub struct FloodBarrier {
    period: Duration,
    max_packets: usize,
    block_period: Duration,
    entries: LruCache<IpAddr, FloodEntry>,
}

impl FloodBarrier {
    pub fn new() -> Self {
        Self::with_limits(CHECK_PERIOD, MAX_PACKETS_PER_PERIOD, BLOCK_PERIOD)
    }

    pub fn with_limits(period: Duration, max_packets: usize, block_period: Duration) -> Self {
        let capacity = NonZeroUsize::new(MAX_TRACKED_IPS).expect("MAX_TRACKED_IPS is non-zero");
        Self {
            period,
            max_packets,
            block_period,
            entries: LruCache::new(capacity),
        }
    }

    /// Decides whether a packet from `ip` may proceed to the codec.
    pub fn admit(&mut self, ip: IpAddr, now: Instant) -> bool {
        let entry = self.entries.get_or_insert_mut(ip, FloodEntry::default);

        if let Some(until) = entry.blocked_until {
            if now < until {
                entry.blocked_until = Some(now + self.block_period);
                return false;
            }
            entry.blocked_until = None;
            entry.hits.clear();
        }

        while let Some(&front) = entry.hits.front() {
            if now.duration_since(front) >= self.period {
                entry.hits.pop_front();
            } else {
                break;
            }
        }

        if entry.hits.len() >= self.max_packets {
            entry.blocked_until = Some(now + self.block_period);
            debug!(%ip, "flood barrier blocked source");
            return false;
        }

        entry.hits.push_back(now);
        true
    }
}

impl Default for FloodBarrier {
    fn default() -> Self {
        Self::new()
    }
}
