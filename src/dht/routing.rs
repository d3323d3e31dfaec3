use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, trace};

use super::id::NodeId;
use super::node::{Node, NodeStatus, RNode};
use crate::constants::{K, LIVENESS_PING_INTERVAL, NUM_BUCKETS, REFRESH_INTERVAL};

/// What became of a contact offered to the table after it answered us.
#[derive(Debug)]
pub enum InsertOutcome {
    /// Appended to a bucket that had room.
    Inserted,
    /// Already present; refreshed and moved to the fresh end.
    Refreshed,
    /// The bucket is full. The caller should ping `oldest` and report the
    /// result through [`RoutingTable::resolve_full`]; until then the
    /// contact waits in the replacement cache.
    Full { oldest: Node },
    /// Not storable (our own id).
    Ignored,
}

struct Bucket {
    /// Active nodes, oldest-seen at the front, capacity [`K`].
    nodes: VecDeque<RNode>,
    /// Recently sighted candidates waiting for a slot, freshest at the back.
    cache: VecDeque<Node>,
    /// Last insert, refresh, or sighting; drives bucket refresh lookups.
    last_changed: Instant,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            nodes: VecDeque::with_capacity(K),
            cache: VecDeque::with_capacity(K),
            last_changed: now,
        }
    }

    fn get_mut(&mut self, id: &NodeId) -> Option<&mut RNode> {
        self.nodes.iter_mut().find(|n| n.id() == id)
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id() == id)
    }

    /// Moves an existing node to the fresh end and updates it.
    fn refresh(&mut self, id: &NodeId, rtt: Option<std::time::Duration>, now: Instant) -> bool {
        let Some(pos) = self.position(id) else {
            return false;
        };
        let mut rnode = self.nodes.remove(pos).expect("position came from the list");
        rnode.touch(rtt, now);
        self.nodes.push_back(rnode);
        self.last_changed = now;
        true
    }

    fn remove(&mut self, id: &NodeId) -> Option<RNode> {
        let pos = self.position(id)?;
        self.nodes.remove(pos)
    }

    /// Remembers a candidate, deduplicating and keeping only the freshest
    /// [`K`] of them.
    fn cache_push(&mut self, node: Node) {
        self.cache.retain(|n| n.id != node.id);
        if self.cache.len() == K {
            self.cache.pop_front();
        }
        self.cache.push_back(node);
    }

    /// Takes the freshest cached candidate.
    fn cache_pop(&mut self) -> Option<Node> {
        self.cache.pop_back()
    }
}

/// The Kademlia routing table: one bucket per log-distance level from the
/// local id.
///
/// Single-writer by design; every mutation comes from the server's event
/// loop or from callbacks it drives. Invariants: a bucket at level `d`
/// only holds nodes whose log-distance to our id is exactly `d`, no
/// bucket exceeds [`K`] nodes, ids are unique, and our own id is never
/// stored.
pub struct RoutingTable {
    our_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(our_id: NodeId, now: Instant) -> Self {
        let buckets = (0..NUM_BUCKETS).map(|_| Bucket::new(now)).collect();
        Self { our_id, buckets }
    }

    pub fn our_id(&self) -> &NodeId {
        &self.our_id
    }

    fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        match self.our_id.log_distance(id) {
            -1 => None,
            d => Some(d as usize),
        }
    }

    /// Feeds in a node that just answered one of our queries.
    pub fn note_response(
        &mut self,
        node: &Node,
        rtt: Option<std::time::Duration>,
        now: Instant,
    ) -> InsertOutcome {
        let Some(idx) = self.bucket_index(&node.id) else {
            return InsertOutcome::Ignored;
        };
        let bucket = &mut self.buckets[idx];

        if bucket.refresh(&node.id, rtt, now) {
            if let Some(rnode) = bucket.get_mut(&node.id) {
                if node.version.is_some() {
                    rnode.node.version = node.version.clone();
                }
            }
            return InsertOutcome::Refreshed;
        }

        if bucket.nodes.len() < K {
            let mut rnode = RNode::new(node.clone(), now);
            rnode.touch(rtt, now);
            bucket.nodes.push_back(rnode);
            bucket.last_changed = now;
            trace!(id = %node.id, bucket = idx, "node inserted");
            return InsertOutcome::Inserted;
        }

        bucket.cache_push(node.clone());
        let oldest = bucket
            .nodes
            .front()
            .expect("full bucket has a front")
            .node
            .clone();
        InsertOutcome::Full { oldest }
    }

    /// Feeds in a node sighted through a query it sent us. Weaker than a
    /// response: it refreshes the last-seen stamp of a known node without
    /// clearing its failure count, and unknown senders only become
    /// replacement candidates until they answer a query of ours.
    pub fn note_query(&mut self, node: &Node, now: Instant) {
        let Some(idx) = self.bucket_index(&node.id) else {
            return;
        };
        let bucket = &mut self.buckets[idx];

        if let Some(rnode) = bucket.get_mut(&node.id) {
            rnode.last_seen = now;
            bucket.last_changed = now;
        } else {
            bucket.cache_push(node.clone());
        }
    }

    /// Outcome of the liveness ping started by [`InsertOutcome::Full`].
    /// A responsive head keeps its seat (and moves to the fresh end); a
    /// dead one is evicted in favor of the waiting candidate.
    pub fn resolve_full(&mut self, oldest: &NodeId, alive: bool, candidate: Node, now: Instant) {
        let Some(idx) = self.bucket_index(&candidate.id) else {
            return;
        };
        let bucket = &mut self.buckets[idx];

        if alive {
            bucket.refresh(oldest, None, now);
            return;
        }

        if bucket.remove(oldest).is_some() {
            debug!(id = %oldest, bucket = idx, "evicted unresponsive bucket head");
        }

        if bucket.position(&candidate.id).is_none() && bucket.nodes.len() < K {
            bucket.cache.retain(|n| n.id != candidate.id);
            bucket.nodes.push_back(RNode::new(candidate, now));
            bucket.last_changed = now;
        }
    }

    /// Records an unanswered query or an error response. A node that
    /// crosses the failure threshold is evicted and the freshest
    /// replacement-cache candidate takes its slot, unverified.
    pub fn note_failure(&mut self, id: &NodeId, now: Instant) {
        let Some(idx) = self.bucket_index(id) else {
            return;
        };
        let bucket = &mut self.buckets[idx];

        let Some(rnode) = bucket.get_mut(id) else {
            return;
        };
        rnode.fail();
        if rnode.status(now) != NodeStatus::Bad {
            return;
        }

        bucket.remove(id);
        debug!(%id, bucket = idx, "node failed out of the table");
        if bucket.nodes.len() < K {
            if let Some(candidate) = bucket.cache_pop() {
                bucket.nodes.push_back(RNode::new_unverified(candidate, now));
            }
        }
    }

    /// Seeds a contact restored from a state snapshot: inserted unverified
    /// if its bucket has room, otherwise remembered as a candidate.
    pub fn restore(&mut self, node: Node, now: Instant) {
        let Some(idx) = self.bucket_index(&node.id) else {
            return;
        };
        let bucket = &mut self.buckets[idx];
        if bucket.position(&node.id).is_some() {
            return;
        }
        if bucket.nodes.len() < K {
            bucket.nodes.push_back(RNode::new_unverified(node, now));
        } else {
            bucket.cache_push(node);
        }
    }

    /// The `n` usable nodes closest to `target` by XOR distance; Good
    /// nodes are preferred over Questionable ones, Bad nodes and our own
    /// id never appear. Ties break on freshness, then address, so the
    /// ordering is deterministic.
    pub fn closest(&self, target: &NodeId, n: usize, now: Instant) -> Vec<Node> {
        let mut good = Vec::new();
        let mut questionable = Vec::new();

        for bucket in &self.buckets {
            for rnode in &bucket.nodes {
                match rnode.status(now) {
                    NodeStatus::Good => good.push(rnode),
                    NodeStatus::Questionable => questionable.push(rnode),
                    NodeStatus::Bad => {}
                }
            }
        }

        let by_distance = |a: &&RNode, b: &&RNode| {
            a.id()
                .distance(target)
                .cmp(&b.id().distance(target))
                .then(b.last_seen.cmp(&a.last_seen))
                .then(a.addr().cmp(&b.addr()))
        };
        good.sort_by(by_distance);
        questionable.sort_by(by_distance);

        let mut picked: Vec<&RNode> = good.into_iter().take(n).collect();
        if picked.len() < n {
            let missing = n - picked.len();
            picked.extend(questionable.into_iter().take(missing));
            picked.sort_by(by_distance);
        }

        picked.into_iter().map(|rn| rn.node.clone()).collect()
    }

    /// Buckets with nodes but no activity within [`REFRESH_INTERVAL`];
    /// each is due a lookup on a random id inside its band.
    pub fn stale_buckets(&self, now: Instant) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                !b.nodes.is_empty()
                    && now.duration_since(b.last_changed) > REFRESH_INTERVAL
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn mark_refreshed(&mut self, idx: usize, now: Instant) {
        if let Some(bucket) = self.buckets.get_mut(idx) {
            bucket.last_changed = now;
        }
    }

    /// Picks the oldest questionable node of each bucket for a liveness
    /// ping, skipping nodes probed within the last ping interval, and
    /// stamps the chosen ones so the next tick moves on.
    pub fn ping_candidates(&mut self, now: Instant) -> Vec<Node> {
        let mut due = Vec::new();

        for bucket in &mut self.buckets {
            let candidate = bucket
                .nodes
                .iter_mut()
                .filter(|rn| rn.status(now) == NodeStatus::Questionable)
                .filter(|rn| match rn.last_pinged {
                    Some(at) => now.duration_since(at) >= LIVENESS_PING_INTERVAL,
                    None => true,
                })
                .min_by_key(|rn| rn.last_seen);

            if let Some(rnode) = candidate {
                rnode.last_pinged = Some(now);
                due.push(rnode.node.clone());
            }
        }

        due
    }

    /// Snapshot of the main lists with their bucket levels, for state
    /// dumps; Bad nodes are skipped.
    pub fn entries(&self, now: Instant) -> Vec<(usize, RNode)> {
        let mut out = Vec::new();
        for (idx, bucket) in self.buckets.iter().enumerate() {
            for rnode in &bucket.nodes {
                if rnode.status(now) != NodeStatus::Bad {
                    out.push((idx, rnode.clone()));
                }
            }
        }
        out
    }

    pub fn get(&self, id: &NodeId) -> Option<&RNode> {
        let idx = self.bucket_index(id)?;
        self.buckets[idx].nodes.iter().find(|n| n.id() == id)
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.node_count() == 0
    }

    #[cfg(test)]
    pub(crate) fn cached_count(&self, id: &NodeId) -> usize {
        match self.bucket_index(id) {
            Some(idx) => self.buckets[idx].cache.len(),
            None => 0,
        }
    }
}
