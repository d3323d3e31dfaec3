use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use super::error::DhtError;
use super::message::DhtMessage;
use crate::constants::MAX_PENDING_QUERIES;

struct PendingQuery {
    addr: SocketAddr,
    tx: mpsc::Sender<DhtMessage>,
}

/// Bookkeeping for in-flight outgoing queries.
///
/// Transaction ids come from a wrapping 16-bit counter seeded at random,
/// so an id cannot recur while an earlier use of it is still pending.
/// Responses are correlated by transaction id *and* source address; a
/// packet from anywhere else echoing a live id neither completes nor
/// disturbs the slot. Each slot delivers at most one response, so
/// retransmitted duplicates arriving after completion fall through as
/// unknown transactions and are dropped.
pub struct Querier {
    pending: HashMap<Bytes, PendingQuery>,
    next_tid: u16,
}

impl Querier {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            next_tid: rand::random(),
        }
    }

    /// Allocates a transaction id and a reply channel for a query to
    /// `addr`. Refuses beyond [`MAX_PENDING_QUERIES`] outstanding slots.
    pub fn register(
        &mut self,
        addr: SocketAddr,
    ) -> Result<(Bytes, mpsc::Receiver<DhtMessage>), DhtError> {
        if self.pending.len() >= MAX_PENDING_QUERIES {
            return Err(DhtError::RateLimited);
        }

        let tid = loop {
            let tid = Bytes::copy_from_slice(&self.next_tid.to_be_bytes());
            self.next_tid = self.next_tid.wrapping_add(1);
            if !self.pending.contains_key(&tid) {
                break tid;
            }
        };

        let (tx, rx) = mpsc::channel(1);
        self.pending.insert(tid.clone(), PendingQuery { addr, tx });
        Ok((tid, rx))
    }

    /// Takes the reply channel for an inbound response, if its transaction
    /// id is live and the packet came from the queried address.
    pub fn complete(&mut self, tid: &Bytes, from: SocketAddr) -> Option<mpsc::Sender<DhtMessage>> {
        match self.pending.get(tid) {
            Some(slot) if slot.addr == from => self.pending.remove(tid).map(|slot| slot.tx),
            Some(slot) => {
                debug!(
                    expected = %slot.addr,
                    got = %from,
                    "response for live transaction from wrong address"
                );
                None
            }
            None => {
                debug!(%from, "response for unknown transaction");
                None
            }
        }
    }

    /// Releases a slot whose query timed out or was abandoned.
    pub fn forget(&mut self, tid: &Bytes) {
        self.pending.remove(tid);
    }

    /// Drops every slot; waiting callers see their channel close.
    pub fn abort_all(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for Querier {
    fn default() -> Self {
        Self::new()
    }
}
