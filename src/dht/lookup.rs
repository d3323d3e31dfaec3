//! The iterative lookup state machine.
//!
//! A lookup converges on the [`K`](crate::constants::K) nodes closest to a
//! target id, collecting peers and announce tokens along the way. The
//! state machine here is purely event-driven: the server feeds it
//! responses and failures and asks it which nodes to query next, so the
//! whole convergence logic is testable without touching a socket.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use bytes::Bytes;

use super::id::NodeId;
use super::node::Node;
use crate::constants::K;

/// Why a lookup ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupTermination {
    /// The closest `K` shortlist nodes have all answered.
    Converged,
    /// Candidates ran out before `K` responders accumulated.
    Exhausted,
    /// Nothing answered at all.
    NoNodes,
    /// The overall lookup deadline passed.
    Timeout,
    /// The node shut down mid-lookup.
    Cancelled,
}

/// Final result of one lookup.
#[derive(Debug, Clone)]
pub struct LookupOutcome {
    /// Every distinct peer collected, in arrival order. Empty for
    /// find_node lookups and for targets without announcers.
    pub peers: Vec<SocketAddr>,
    /// The closest responding nodes, at most `K`, closest first.
    pub closest: Vec<Node>,
    pub termination: LookupTermination,
}

/// Streamed progress of a lookup, delivered over a channel.
#[derive(Debug, Clone)]
pub enum LookupEvent {
    /// A batch of newly discovered peers, in arrival order.
    Peers(Vec<SocketAddr>),
    /// The lookup finished; no further events follow.
    Done(LookupOutcome),
}

struct Candidate {
    node: Node,
    dist: [u8; 20],
}

/// Live state of one iterative lookup.
pub(crate) struct LookupState {
    target: NodeId,
    our_id: NodeId,
    /// Candidates ordered ascending by XOR distance to the target.
    shortlist: Vec<Candidate>,
    /// Ids ever admitted to the shortlist, for dedup.
    known: HashSet<NodeId>,
    /// Addresses ever queried, including id-less bootstrap visits.
    visited: HashSet<SocketAddr>,
    queried: HashSet<NodeId>,
    responded: HashSet<NodeId>,
    tokens: HashMap<NodeId, Bytes>,
    peers: Vec<SocketAddr>,
    peer_set: HashSet<SocketAddr>,
    in_flight: usize,
}

impl LookupState {
    pub fn new(target: NodeId, our_id: NodeId, seeds: Vec<Node>) -> Self {
        let mut state = Self {
            target,
            our_id,
            shortlist: Vec::new(),
            known: HashSet::new(),
            visited: HashSet::new(),
            queried: HashSet::new(),
            responded: HashSet::new(),
            tokens: HashMap::new(),
            peers: Vec::new(),
            peer_set: HashSet::new(),
            in_flight: 0,
        };
        state.add_candidates(seeds);
        state
    }

    /// Admits newly learned contacts, deduplicating by id and dropping
    /// ourselves.
    pub fn add_candidates(&mut self, nodes: Vec<Node>) {
        for node in nodes {
            if node.id == self.our_id || !self.known.insert(node.id) {
                continue;
            }
            let dist = node.id.distance(&self.target);
            let pos = self
                .shortlist
                .partition_point(|c| (c.dist, c.node.addr) < (dist, node.addr));
            self.shortlist.insert(pos, Candidate { node, dist });
        }
    }

    /// Hands out the next nodes to query, keeping at most `alpha` queries
    /// in flight. A candidate is only worth querying while fewer than
    /// [`K`] nodes have responded or it is closer than the K-th closest
    /// responder.
    pub fn start_queries(&mut self, alpha: usize) -> Vec<Node> {
        let mut started = Vec::new();

        while self.in_flight < alpha {
            let horizon = self.kth_responded_distance();
            let next = self.shortlist.iter().find(|c| {
                !self.queried.contains(&c.node.id)
                    && !self.visited.contains(&c.node.addr)
                    && match horizon {
                        Some(kth) => c.dist < kth,
                        None => true,
                    }
            });

            let Some(candidate) = next else { break };
            let node = candidate.node.clone();
            self.queried.insert(node.id);
            self.visited.insert(node.addr);
            self.in_flight += 1;
            started.push(node);
        }

        started
    }

    /// Registers a direct visit to an address whose node id is still
    /// unknown (a bootstrap contact). Returns false if the address was
    /// already queried.
    pub fn visit(&mut self, addr: SocketAddr) -> bool {
        if !self.visited.insert(addr) {
            return false;
        }
        self.in_flight += 1;
        true
    }

    /// Feeds in a response. Returns the peers this response contributed
    /// that were not known before, in arrival order, for incremental
    /// delivery.
    pub fn on_response(
        &mut self,
        from: &Node,
        token: Option<Bytes>,
        nodes: Vec<Node>,
        values: Vec<SocketAddr>,
    ) -> Vec<SocketAddr> {
        self.in_flight = self.in_flight.saturating_sub(1);

        // A bootstrap visit reveals its node id only here.
        self.add_candidates(vec![from.clone()]);
        self.queried.insert(from.id);
        self.responded.insert(from.id);

        if let Some(token) = token {
            self.tokens.insert(from.id, token);
        }

        self.add_candidates(nodes);

        let mut fresh = Vec::new();
        for peer in values {
            if self.peer_set.insert(peer) {
                self.peers.push(peer);
                fresh.push(peer);
            }
        }
        fresh
    }

    /// Feeds in a timeout or error; the non-responder keeps its `queried`
    /// mark but never counts as responded.
    pub fn on_failure(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// True once nothing is in flight and no candidate is worth querying.
    pub fn is_finished(&self) -> bool {
        if self.in_flight > 0 {
            return false;
        }
        let horizon = self.kth_responded_distance();
        !self.shortlist.iter().any(|c| {
            !self.queried.contains(&c.node.id)
                && !self.visited.contains(&c.node.addr)
                && match horizon {
                    Some(kth) => c.dist < kth,
                    None => true,
                }
        })
    }

    /// How a naturally finished lookup classifies.
    pub fn termination(&self) -> LookupTermination {
        if self.responded.is_empty() {
            LookupTermination::NoNodes
        } else if self.kth_responded_distance().is_some() {
            LookupTermination::Converged
        } else {
            LookupTermination::Exhausted
        }
    }

    /// Distance of the K-th closest responder, once `K` have responded.
    fn kth_responded_distance(&self) -> Option<[u8; 20]> {
        let mut seen = 0;
        for candidate in &self.shortlist {
            if self.responded.contains(&candidate.node.id) {
                seen += 1;
                if seen == K {
                    return Some(candidate.dist);
                }
            }
        }
        None
    }

    /// The closest responders, at most `K`, closest first.
    pub fn closest_responders(&self) -> Vec<Node> {
        self.shortlist
            .iter()
            .filter(|c| self.responded.contains(&c.node.id))
            .take(K)
            .map(|c| c.node.clone())
            .collect()
    }

    /// The closest responders that issued us a write token, paired with
    /// that token; these are the announce targets.
    pub fn announce_targets(&self) -> Vec<(Node, Bytes)> {
        self.closest_responders()
            .into_iter()
            .filter_map(|node| {
                let token = self.tokens.get(&node.id)?.clone();
                Some((node, token))
            })
            .collect()
    }

    /// Every distinct peer collected so far, in arrival order.
    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }

    pub fn into_outcome(self, termination: LookupTermination) -> LookupOutcome {
        LookupOutcome {
            closest: self.closest_responders(),
            peers: self.peers,
            termination,
        }
    }
}
