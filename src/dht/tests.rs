use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::flood::FloodBarrier;
use super::id::NodeId;
use super::lookup::{LookupEvent, LookupState, LookupTermination};
use super::message::{DhtMessage, DhtQuery, DhtResponse};
use super::node::{Node, NodeStatus, RNode};
use super::querier::Querier;
use super::routing::{InsertOutcome, RoutingTable};
use super::server::{DhtConfig, DhtServer};
use super::state::{encode_state, parse_state};
use super::store::PeerStore;
use super::token::TokenManager;
use crate::constants::{
    FRESHNESS_PERIOD, K, MAX_FAILURES, MAX_PEERS_RETURNED, SWEEP_EVERY_PUTS, TOKEN_ROTATION,
    VALIDITY_PERIOD,
};

fn addr(last_octet: u8, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), port)
}

// ============================================================================
// Identifier
// ============================================================================

#[test]
fn id_log_distance_of_self_is_minus_one() {
    let id = NodeId::generate();
    assert_eq!(id.log_distance(&id), -1);
}

#[test]
fn id_log_distance_is_symmetric() {
    let a = NodeId::generate();
    let b = NodeId::generate();
    assert_eq!(a.log_distance(&b), b.log_distance(&a));
}

#[test]
fn id_log_distance_known_values() {
    let zero = NodeId([0u8; 20]);

    let mut top = [0u8; 20];
    top[0] = 0x80;
    assert_eq!(zero.log_distance(&NodeId(top)), 159);

    let mut bottom = [0u8; 20];
    bottom[19] = 0x01;
    assert_eq!(zero.log_distance(&NodeId(bottom)), 0);

    let mut mid = [0u8; 20];
    mid[10] = 0x10; // top set bit 83 from the MSB end, log distance 76
    assert_eq!(zero.log_distance(&NodeId(mid)), 76);
}

#[test]
fn id_at_log_distance_is_exact() {
    let id = NodeId::generate();
    for ld in [0, 1, 7, 8, 63, 100, 158, 159] {
        let close = id.at_log_distance(ld).unwrap();
        assert_eq!(id.log_distance(&close), ld, "log distance {}", ld);
    }
}

#[test]
fn id_at_log_distance_rejects_out_of_range() {
    let id = NodeId::generate();
    assert!(id.at_log_distance(-1).is_err());
    assert!(id.at_log_distance(160).is_err());
}

#[test]
fn id_hex_round_trip() {
    let id = NodeId::generate();
    let parsed = NodeId::from_hex(&id.to_string()).unwrap();
    assert_eq!(parsed, id);

    assert!(NodeId::from_hex("60d5d8").is_err());
    assert!(NodeId::from_hex(&"zz".repeat(20)).is_err());
}

#[test]
fn id_from_bytes_checks_length() {
    assert!(NodeId::from_bytes(&[1u8; 20]).is_ok());
    assert!(NodeId::from_bytes(&[1u8; 19]).is_err());
    assert!(NodeId::from_bytes(&[1u8; 21]).is_err());
}

// ============================================================================
// Contacts
// ============================================================================

#[test]
fn node_compact_round_trip() {
    let node = Node::new(NodeId([7u8; 20]), addr(1, 6881));
    let compact = node.to_compact().unwrap();
    assert_eq!(compact.len(), 26);

    let parsed = Node::from_compact(&compact).unwrap();
    assert_eq!(parsed.id, node.id);
    assert_eq!(parsed.addr, node.addr);
}

#[test]
fn node_compact_rejects_bad_lengths() {
    assert!(Node::from_compact(&[0u8; 25]).is_none());
    assert!(Node::from_compact(&[0u8; 27]).is_none());
}

#[test]
fn rnode_status_transitions() {
    let now = Instant::now();
    let mut rnode = RNode::new(Node::new(NodeId::generate(), addr(1, 1)), now);

    assert_eq!(rnode.status(now), NodeStatus::Good);
    assert_eq!(
        rnode.status(now + FRESHNESS_PERIOD),
        NodeStatus::Questionable
    );

    rnode.touch(Some(Duration::from_millis(40)), now + FRESHNESS_PERIOD);
    assert_eq!(
        rnode.status(now + FRESHNESS_PERIOD + Duration::from_secs(1)),
        NodeStatus::Good
    );

    for _ in 0..MAX_FAILURES {
        rnode.fail();
    }
    assert_eq!(rnode.status(now), NodeStatus::Bad);
}

#[test]
fn rnode_unverified_is_questionable_until_touched() {
    let now = Instant::now();
    let mut rnode = RNode::new_unverified(Node::new(NodeId::generate(), addr(1, 1)), now);
    assert_eq!(rnode.status(now), NodeStatus::Questionable);

    rnode.touch(None, now);
    assert_eq!(rnode.status(now), NodeStatus::Good);
}

#[test]
fn rnode_rtt_is_smoothed() {
    let now = Instant::now();
    let mut rnode = RNode::new(Node::new(NodeId::generate(), addr(1, 1)), now);

    rnode.touch(Some(Duration::from_millis(80)), now);
    assert_eq!(rnode.rtt, Some(Duration::from_millis(80)));

    rnode.touch(Some(Duration::from_millis(160)), now);
    let rtt = rnode.rtt.unwrap();
    assert!(rtt > Duration::from_millis(80) && rtt < Duration::from_millis(160));
}

// ============================================================================
// Messages
// ============================================================================

#[test]
fn message_ping_has_stable_encoding() {
    let msg = DhtMessage::ping(Bytes::from_static(b"aa"), &NodeId([b'A'; 20]));
    let expected: &[u8] =
        b"d1:ad2:id20:AAAAAAAAAAAAAAAAAAAAe1:q4:ping1:t2:aa1:v4:RD\x00\x011:y1:qe";
    assert_eq!(msg.to_bytes(), expected);
    // deterministic: same logical message, same bytes
    assert_eq!(msg.to_bytes(), expected);
}

#[test]
fn message_query_round_trips() {
    let our_id = NodeId::generate();
    let target = NodeId::generate();
    let info_hash = [0xAB; 20];
    let tid = Bytes::from_static(b"xy");

    let samples = vec![
        DhtMessage::ping(tid.clone(), &our_id),
        DhtMessage::find_node(tid.clone(), &our_id, target),
        DhtMessage::get_peers(tid.clone(), &our_id, info_hash),
        DhtMessage::announce_peer(
            tid.clone(),
            &our_id,
            info_hash,
            6881,
            Bytes::from_static(b"tok"),
        ),
    ];

    for msg in samples {
        let parsed = DhtMessage::parse(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.transaction_id, tid);
        assert_eq!(parsed.sender_id, Some(our_id));
        assert_eq!(parsed.version.as_deref(), Some(b"RD\x00\x01".as_slice()));
        assert!(parsed.query.is_some());
        assert_eq!(parsed.to_bytes(), msg.to_bytes());
    }
}

#[test]
fn message_parse_find_node_target() {
    let our_id = NodeId::generate();
    let target = NodeId::generate();
    let msg = DhtMessage::find_node(Bytes::from_static(b"ab"), &our_id, target);

    let parsed = DhtMessage::parse(&msg.to_bytes()).unwrap();
    match parsed.query {
        Some(DhtQuery::FindNode { target: t }) => assert_eq!(t, target),
        other => panic!("unexpected query: {:?}", other),
    }
}

#[test]
fn message_announce_carries_implied_port() {
    let data = b"d1:ad2:id20:AAAAAAAAAAAAAAAAAAAA9:info_hash20:BBBBBBBBBBBBBBBBBBBB12:implied_porti1e4:porti7777e5:token3:abce1:q13:announce_peer1:t1:z1:y1:qe";
    let parsed = DhtMessage::parse(data).unwrap();

    match parsed.query {
        Some(DhtQuery::AnnouncePeer {
            port, implied_port, ..
        }) => {
            assert_eq!(port, 7777);
            assert!(implied_port);
        }
        other => panic!("unexpected query: {:?}", other),
    }
}

#[test]
fn message_get_peers_response_round_trips() {
    let our_id = NodeId::generate();
    let peers = vec![addr(4, 6881), addr(5, 6882)];
    let nodes = vec![
        Node::new(NodeId::generate(), addr(6, 7001)),
        Node::new(NodeId::generate(), addr(7, 7002)),
    ];

    let with_values = DhtMessage::found_peers(
        Bytes::from_static(b"aa"),
        &our_id,
        Bytes::from_static(b"tok12345"),
        Some(peers.clone()),
        None,
    );
    let parsed = DhtMessage::parse(&with_values.to_bytes()).unwrap();
    match parsed.response {
        Some(DhtResponse::GetPeers {
            token,
            peers: Some(got),
            nodes: None,
            ..
        }) => {
            assert_eq!(token.as_ref(), b"tok12345");
            assert_eq!(got, peers);
        }
        other => panic!("unexpected response: {:?}", other),
    }

    let with_nodes = DhtMessage::found_peers(
        Bytes::from_static(b"ab"),
        &our_id,
        Bytes::from_static(b"tok12345"),
        None,
        Some(nodes.clone()),
    );
    let parsed = DhtMessage::parse(&with_nodes.to_bytes()).unwrap();
    match parsed.response {
        Some(DhtResponse::GetPeers {
            peers: None,
            nodes: Some(got),
            ..
        }) => {
            assert_eq!(got.len(), 2);
            assert_eq!(got[0].id, nodes[0].id);
            assert_eq!(got[1].addr, nodes[1].addr);
        }
        other => panic!("unexpected response: {:?}", other),
    }
}

#[test]
fn message_find_node_response_round_trips() {
    let our_id = NodeId::generate();
    let nodes: Vec<Node> = (0..8)
        .map(|i| Node::new(NodeId::generate(), addr(i + 1, 7000 + i as u16)))
        .collect();

    let msg = DhtMessage::found_nodes(Bytes::from_static(b"fn"), &our_id, nodes.clone());
    let parsed = DhtMessage::parse(&msg.to_bytes()).unwrap();

    match parsed.response {
        Some(DhtResponse::FindNode { id, nodes: got }) => {
            assert_eq!(id, our_id);
            assert_eq!(got.len(), nodes.len());
            for (a, b) in got.iter().zip(&nodes) {
                assert_eq!(a.id, b.id);
                assert_eq!(a.addr, b.addr);
            }
        }
        other => panic!("unexpected response: {:?}", other),
    }
}

#[test]
fn message_accepts_nodes2_as_fallback() {
    let node = Node::new(NodeId([9u8; 20]), addr(9, 9009));
    let compact = node.to_compact().unwrap();

    let mut data = Vec::new();
    data.extend_from_slice(b"d1:rd2:id20:AAAAAAAAAAAAAAAAAAAA6:nodes226:");
    data.extend_from_slice(&compact);
    data.extend_from_slice(b"e1:t2:aa1:y1:re");

    let parsed = DhtMessage::parse(&data).unwrap();
    match parsed.response {
        Some(DhtResponse::FindNode { nodes, .. }) => {
            assert_eq!(nodes.len(), 1);
            assert_eq!(nodes[0].id, node.id);
        }
        other => panic!("unexpected response: {:?}", other),
    }
}

#[test]
fn message_error_round_trips() {
    let msg = DhtMessage::error(Bytes::from_static(b"er"), 203, "Protocol Error");
    let parsed = DhtMessage::parse(&msg.to_bytes()).unwrap();
    match parsed.response {
        Some(DhtResponse::Error { code, message }) => {
            assert_eq!(code, 203);
            assert_eq!(message, "Protocol Error");
        }
        other => panic!("unexpected response: {:?}", other),
    }
}

#[test]
fn message_unknown_method_is_reported_not_rejected() {
    let data = b"d1:ad2:id20:AAAAAAAAAAAAAAAAAAAAe1:q4:vote1:t2:aa1:y1:qe";
    let parsed = DhtMessage::parse(data).unwrap();
    match parsed.query {
        Some(DhtQuery::Unknown { method }) => assert_eq!(method, "vote"),
        other => panic!("unexpected query: {:?}", other),
    }
}

#[test]
fn message_rejects_malformed() {
    // not bencode at all
    assert!(DhtMessage::parse(b"hello").is_err());
    // not a dict
    assert!(DhtMessage::parse(b"i42e").is_err());
    // missing transaction id
    assert!(DhtMessage::parse(b"d1:y1:qe").is_err());
    // transaction id too long
    assert!(DhtMessage::parse(b"d1:t5:abcde1:y1:qe").is_err());
    // unknown message type
    assert!(DhtMessage::parse(b"d1:t2:aa1:y1:xe").is_err());
    // query without args
    assert!(DhtMessage::parse(b"d1:q4:ping1:t2:aa1:y1:qe").is_err());
    // response without id
    assert!(DhtMessage::parse(b"d1:rde1:t2:aa1:y1:re").is_err());
    // announce without token
    assert!(DhtMessage::parse(
        b"d1:ad2:id20:AAAAAAAAAAAAAAAAAAAA9:info_hash20:BBBBBBBBBBBBBBBBBBBB4:porti1ee1:q13:announce_peer1:t1:a1:y1:qe"
    )
    .is_err());
}

#[test]
fn message_ignores_unknown_optional_keys() {
    let data = b"d1:ad2:id20:AAAAAAAAAAAAAAAAAAAA5:dummyi1ee1:q4:ping1:t2:aa1:y1:q3:exti1ee";
    let parsed = DhtMessage::parse(data).unwrap();
    assert!(matches!(parsed.query, Some(DhtQuery::Ping)));
}

// ============================================================================
// Token manager
// ============================================================================

#[test]
fn token_validates_for_issuing_ip_only() {
    let t0 = Instant::now();
    let mut tokens = TokenManager::new(t0);

    let token = tokens.generate(&addr(1, 6881), t0);
    assert!(tokens.validate(&addr(1, 6881), &token, t0));
    // same ip, different port: still valid
    assert!(tokens.validate(&addr(1, 9999), &token, t0));
    // different ip: rejected
    assert!(!tokens.validate(&addr(2, 6881), &token, t0));
    // garbage: rejected
    assert!(!tokens.validate(&addr(1, 6881), b"bogus", t0));
}

#[test]
fn token_survives_one_rotation_not_two() {
    let t0 = Instant::now();
    let mut tokens = TokenManager::new(t0);
    let source = addr(1, 6881);

    let token = tokens.generate(&source, t0);

    let t1 = t0 + TOKEN_ROTATION + Duration::from_secs(1);
    assert!(tokens.validate(&source, &token, t1));

    let t2 = t1 + TOKEN_ROTATION + Duration::from_secs(1);
    assert!(!tokens.validate(&source, &token, t2));
}

#[test]
fn token_expires_after_long_silence() {
    let t0 = Instant::now();
    let mut tokens = TokenManager::new(t0);
    let source = addr(1, 6881);

    let token = tokens.generate(&source, t0);
    let much_later = t0 + TOKEN_ROTATION * 5;
    assert!(!tokens.validate(&source, &token, much_later));
}

// ============================================================================
// Peer store
// ============================================================================

#[test]
fn store_keeps_one_record_per_peer() {
    let t0 = Instant::now();
    let mut store = PeerStore::new();
    let info_hash = [1u8; 20];
    let peer = addr(4, 6881);

    store.put(info_hash, peer, t0);
    store.put(info_hash, peer, t0 + Duration::from_secs(1));

    let peers = store.get(&info_hash, t0 + Duration::from_secs(2));
    assert_eq!(peers, vec![peer]);
}

#[test]
fn store_returns_most_recent_first_and_caps() {
    let t0 = Instant::now();
    let mut store = PeerStore::new();
    let info_hash = [2u8; 20];

    for i in 0..(MAX_PEERS_RETURNED + 10) {
        let peer = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, (i / 250) as u8, (i % 250) as u8)),
            6881,
        );
        store.put(info_hash, peer, t0 + Duration::from_secs(i as u64));
    }

    let peers = store.get(&info_hash, t0 + Duration::from_secs(120));
    assert_eq!(peers.len(), MAX_PEERS_RETURNED);
    // the freshest announce comes first
    let freshest = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(
            10,
            0,
            ((MAX_PEERS_RETURNED + 9) / 250) as u8,
            ((MAX_PEERS_RETURNED + 9) % 250) as u8,
        )),
        6881,
    );
    assert_eq!(peers[0], freshest);
}

#[test]
fn store_expires_on_read_and_removes_empty_keys() {
    let t0 = Instant::now();
    let mut store = PeerStore::new();
    let info_hash = [3u8; 20];
    let peer = addr(4, 6881);

    store.put(info_hash, peer, t0);

    // one second before the validity edge the record is still there
    let just_before = t0 + VALIDITY_PERIOD - Duration::from_secs(1);
    assert_eq!(store.get(&info_hash, just_before), vec![peer]);

    // one second past it the record and the key are gone
    let just_after = t0 + VALIDITY_PERIOD + Duration::from_secs(1);
    assert!(store.get(&info_hash, just_after).is_empty());
    assert_eq!(store.info_hash_count(), 0);
}

#[test]
fn store_periodic_sweep_reaps_untouched_keys() {
    let t0 = Instant::now();
    let mut store = PeerStore::new();
    let stale_hash = [4u8; 20];
    let busy_hash = [5u8; 20];

    store.put(stale_hash, addr(4, 6881), t0);

    // enough puts on another key trigger the sweep, long after expiry
    let late = t0 + VALIDITY_PERIOD + Duration::from_secs(60);
    for i in 0..SWEEP_EVERY_PUTS {
        store.put(busy_hash, addr((i % 200) as u8 + 1, 6881), late);
    }

    // the stale key fell out without ever being read
    assert_eq!(store.info_hash_count(), 1);
}

// ============================================================================
// Flood barrier
// ============================================================================

#[test]
fn flood_admits_up_to_limit_then_blocks() {
    let t0 = Instant::now();
    let mut barrier =
        FloodBarrier::with_limits(Duration::from_millis(400), 4, Duration::from_secs(1));
    let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 0));

    for _ in 0..4 {
        assert!(barrier.admit(ip, t0));
    }
    assert!(!barrier.admit(ip, t0));
}

#[test]
fn flood_sources_are_independent() {
    let t0 = Instant::now();
    let mut barrier =
        FloodBarrier::with_limits(Duration::from_millis(400), 4, Duration::from_secs(1));

    for octet in 0..8u8 {
        let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, octet));
        for _ in 0..4 {
            assert!(barrier.admit(ip, t0));
        }
    }

    // each source is now at its own limit
    assert!(!barrier.admit(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 0)), t0));
    assert!(!barrier.admit(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 7)), t0 + Duration::from_millis(100)));
}

#[test]
fn flood_window_slides() {
    let t0 = Instant::now();
    let mut barrier =
        FloodBarrier::with_limits(Duration::from_millis(400), 4, Duration::from_secs(1));
    let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 1));

    for _ in 0..4 {
        assert!(barrier.admit(ip, t0));
    }
    // the old hits have left the window; a fresh burst is fine
    let t1 = t0 + Duration::from_millis(450);
    for _ in 0..4 {
        assert!(barrier.admit(ip, t1));
    }
}

#[test]
fn flood_block_refreshes_on_contact_and_expires_in_silence() {
    let t0 = Instant::now();
    let mut barrier =
        FloodBarrier::with_limits(Duration::from_millis(400), 4, Duration::from_secs(1));
    let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 0));

    for _ in 0..4 {
        assert!(barrier.admit(ip, t0));
    }
    assert!(!barrier.admit(ip, t0)); // blocked until t0 + 1s

    // probing while blocked stays rejected and restarts the block
    let t1 = t0 + Duration::from_millis(700);
    assert!(!barrier.admit(ip, t1)); // blocked until t1 + 1s

    // one second of silence from the last contact clears it
    let t2 = t1 + Duration::from_millis(1100);
    assert!(barrier.admit(ip, t2));
    for _ in 0..3 {
        assert!(barrier.admit(ip, t2));
    }
    assert!(!barrier.admit(ip, t2));
}

// ============================================================================
// Routing table
// ============================================================================

fn distinct_nodes_at(our_id: &NodeId, log_distance: i32, count: usize) -> Vec<Node> {
    let mut seen = HashSet::new();
    let mut nodes = Vec::new();
    while nodes.len() < count {
        let id = our_id.at_log_distance(log_distance).unwrap();
        if seen.insert(id) {
            let port = 7000 + nodes.len() as u16;
            nodes.push(Node::new(id, addr((nodes.len() % 200) as u8 + 1, port)));
        }
    }
    nodes
}

#[test]
fn routing_ignores_our_own_id() {
    let now = Instant::now();
    let our_id = NodeId::generate();
    let mut table = RoutingTable::new(our_id, now);

    let outcome = table.note_response(&Node::new(our_id, addr(1, 1)), None, now);
    assert!(matches!(outcome, InsertOutcome::Ignored));
    assert_eq!(table.node_count(), 0);
}

#[test]
fn routing_bucket_holds_k_and_reports_overflow() {
    let now = Instant::now();
    let our_id = NodeId::generate();
    let mut table = RoutingTable::new(our_id, now);
    let nodes = distinct_nodes_at(&our_id, 100, K + 1);

    for node in &nodes[..K] {
        assert!(matches!(
            table.note_response(node, None, now),
            InsertOutcome::Inserted
        ));
    }
    assert_eq!(table.node_count(), K);

    match table.note_response(&nodes[K], None, now) {
        InsertOutcome::Full { oldest } => assert_eq!(oldest.id, nodes[0].id),
        other => panic!("unexpected outcome: {:?}", other),
    }
    // the newcomer waits in the replacement cache, the main list is intact
    assert_eq!(table.node_count(), K);
    assert_eq!(table.cached_count(&nodes[K].id), 1);
}

#[test]
fn routing_full_bucket_keeps_responsive_head() {
    let now = Instant::now();
    let our_id = NodeId::generate();
    let mut table = RoutingTable::new(our_id, now);
    let nodes = distinct_nodes_at(&our_id, 101, K + 1);

    for node in &nodes[..K] {
        table.note_response(node, None, now);
    }
    let InsertOutcome::Full { oldest } = table.note_response(&nodes[K], None, now) else {
        panic!("bucket should be full");
    };

    table.resolve_full(&oldest.id, true, nodes[K].clone(), now);

    assert!(table.get(&oldest.id).is_some());
    assert!(table.get(&nodes[K].id).is_none());
    assert_eq!(table.node_count(), K);
}

#[test]
fn routing_full_bucket_evicts_dead_head() {
    let now = Instant::now();
    let our_id = NodeId::generate();
    let mut table = RoutingTable::new(our_id, now);
    let nodes = distinct_nodes_at(&our_id, 102, K + 1);

    for node in &nodes[..K] {
        table.note_response(node, None, now);
    }
    let InsertOutcome::Full { oldest } = table.note_response(&nodes[K], None, now) else {
        panic!("bucket should be full");
    };

    table.resolve_full(&oldest.id, false, nodes[K].clone(), now);

    assert!(table.get(&oldest.id).is_none());
    assert!(table.get(&nodes[K].id).is_some());
    assert_eq!(table.node_count(), K);
}

#[test]
fn routing_failures_evict_and_promote_replacement() {
    let now = Instant::now();
    let our_id = NodeId::generate();
    let mut table = RoutingTable::new(our_id, now);
    let nodes = distinct_nodes_at(&our_id, 103, K + 1);

    for node in &nodes[..K] {
        table.note_response(node, None, now);
    }
    // the extra node lands in the replacement cache
    table.note_response(&nodes[K], None, now);

    for _ in 0..MAX_FAILURES {
        table.note_failure(&nodes[3].id, now);
    }

    assert!(table.get(&nodes[3].id).is_none());
    // the cached candidate took the freed slot
    assert!(table.get(&nodes[K].id).is_some());
    assert_eq!(table.node_count(), K);
}

#[test]
fn routing_closest_is_sorted_and_bounded() {
    let now = Instant::now();
    let our_id = NodeId([0u8; 20]);
    let mut table = RoutingTable::new(our_id, now);

    for ld in 140..156 {
        for node in distinct_nodes_at(&our_id, ld, 2) {
            table.note_response(&node, None, now);
        }
    }

    let target = NodeId::generate();
    let closest = table.closest(&target, K, now);
    assert_eq!(closest.len(), K);

    let distances: Vec<_> = closest.iter().map(|n| n.id.distance(&target)).collect();
    let mut sorted = distances.clone();
    sorted.sort();
    assert_eq!(distances, sorted);
}

#[test]
fn routing_closest_skips_bad_nodes() {
    let now = Instant::now();
    let our_id = NodeId::generate();
    let mut table = RoutingTable::new(our_id, now);
    let nodes = distinct_nodes_at(&our_id, 110, 4);

    for node in &nodes {
        table.note_response(node, None, now);
    }
    for _ in 0..MAX_FAILURES {
        table.note_failure(&nodes[0].id, now);
    }

    let closest = table.closest(&our_id.at_log_distance(110).unwrap(), K, now);
    assert!(closest.iter().all(|n| n.id != nodes[0].id));
}

#[test]
fn routing_bucket_index_matches_log_distance() {
    let now = Instant::now();
    let our_id = NodeId::generate();
    let mut table = RoutingTable::new(our_id, now);

    for _ in 0..64 {
        let node = Node::new(NodeId::generate(), addr(1, 6881));
        table.note_response(&node, None, now);
    }

    for (bucket, rnode) in table.entries(now) {
        assert_eq!(our_id.log_distance(rnode.id()) as usize, bucket);
    }
}

#[test]
fn routing_queries_refresh_known_nodes_without_absolving_them() {
    let now = Instant::now();
    let our_id = NodeId::generate();
    let mut table = RoutingTable::new(our_id, now);
    let node = distinct_nodes_at(&our_id, 120, 1).remove(0);

    table.note_response(&node, None, now);
    table.note_failure(&node.id, now);

    // a query sighting freshens last_seen but keeps the failure count
    table.note_query(&node, now + Duration::from_secs(10));
    let rnode = table.get(&node.id).unwrap();
    assert_eq!(rnode.failures, 1);
    assert_eq!(rnode.last_seen, now + Duration::from_secs(10));
}

#[test]
fn routing_stale_buckets_surface_for_refresh() {
    let now = Instant::now();
    let our_id = NodeId::generate();
    let mut table = RoutingTable::new(our_id, now);
    let node = distinct_nodes_at(&our_id, 130, 1).remove(0);
    table.note_response(&node, None, now);

    assert!(table.stale_buckets(now + Duration::from_secs(1)).is_empty());

    let later = now + crate::constants::REFRESH_INTERVAL + Duration::from_secs(1);
    assert_eq!(table.stale_buckets(later), vec![130]);

    table.mark_refreshed(130, later);
    assert!(table.stale_buckets(later).is_empty());
}

#[test]
fn routing_ping_candidates_picks_oldest_questionable() {
    let now = Instant::now();
    let our_id = NodeId::generate();
    let mut table = RoutingTable::new(our_id, now);
    let nodes = distinct_nodes_at(&our_id, 135, 3);

    table.note_response(&nodes[0], None, now);
    table.note_response(&nodes[1], None, now + Duration::from_secs(60));
    table.note_response(&nodes[2], None, now + Duration::from_secs(120));

    let later = now + FRESHNESS_PERIOD + Duration::from_secs(130);
    let due = table.ping_candidates(later);
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, nodes[0].id);

    // the stamped node is skipped, so the next tick moves on to the
    // second-oldest
    let due = table.ping_candidates(later + Duration::from_secs(1));
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, nodes[1].id);
}

// ============================================================================
// Querier
// ============================================================================

#[test]
fn querier_correlates_by_tid_and_address() {
    let mut querier = Querier::new();
    let destination = addr(1, 6881);

    let (tid, _rx) = querier.register(destination).unwrap();
    assert_eq!(querier.len(), 1);

    // same tid from a different source does not complete the slot
    assert!(querier.complete(&tid, addr(2, 6881)).is_none());
    assert_eq!(querier.len(), 1);

    assert!(querier.complete(&tid, destination).is_some());
    assert_eq!(querier.len(), 0);

    // a duplicate response finds nothing
    assert!(querier.complete(&tid, destination).is_none());
}

#[test]
fn querier_allocates_distinct_tids() {
    let mut querier = Querier::new();
    let mut seen = HashSet::new();
    for _ in 0..256 {
        let (tid, _rx) = querier.register(addr(1, 6881)).unwrap();
        assert!(seen.insert(tid));
    }
}

#[test]
fn querier_enforces_capacity() {
    let mut querier = Querier::new();
    let mut receivers = Vec::new();
    for _ in 0..crate::constants::MAX_PENDING_QUERIES {
        receivers.push(querier.register(addr(1, 6881)).unwrap());
    }
    assert!(querier.register(addr(1, 6881)).is_err());

    let tid = receivers[0].0.clone();
    querier.forget(&tid);
    assert!(querier.register(addr(1, 6881)).is_ok());
}

// ============================================================================
// Lookup state machine
// ============================================================================

fn lookup_fixture(target: NodeId, seed_count: usize) -> (LookupState, Vec<Node>) {
    let our_id = NodeId::generate();
    let seeds: Vec<Node> = (0..seed_count)
        .map(|i| Node::new(NodeId::generate(), addr((i % 200) as u8 + 1, 8000 + i as u16)))
        .collect();
    (LookupState::new(target, our_id, seeds.clone()), seeds)
}

#[test]
fn lookup_respects_alpha() {
    let (mut state, _) = lookup_fixture(NodeId::generate(), 10);

    let first = state.start_queries(3);
    assert_eq!(first.len(), 3);
    // nothing came back yet, so no extra slots open up
    assert!(state.start_queries(3).is_empty());

    state.on_failure();
    assert_eq!(state.start_queries(3).len(), 1);
}

#[test]
fn lookup_queries_closest_first() {
    let target = NodeId::generate();
    let (mut state, seeds) = lookup_fixture(target, 8);

    let mut by_distance = seeds.clone();
    by_distance.sort_by(|a, b| a.id.distance(&target).cmp(&b.id.distance(&target)));

    let started = state.start_queries(3);
    let expected: Vec<_> = by_distance.iter().take(3).map(|n| n.id).collect();
    let got: Vec<_> = started.iter().map(|n| n.id).collect();
    assert_eq!(got, expected);
}

#[test]
fn lookup_converges_when_closest_k_responded() {
    let target = NodeId::generate();
    let (mut state, seeds) = lookup_fixture(target, 1);

    // the seed answers with K contacts close to the target
    let contacts: Vec<Node> = (0..K)
        .map(|i| {
            let id = target.at_log_distance(20 + i as i32).unwrap();
            Node::new(id, addr((i + 50) as u8, 9000 + i as u16))
        })
        .collect();

    let started = state.start_queries(3);
    assert_eq!(started.len(), 1);
    state.on_response(&seeds[0], None, contacts.clone(), Vec::new());

    // every contact answers empty-handed
    loop {
        let batch = state.start_queries(3);
        if batch.is_empty() {
            break;
        }
        for node in batch {
            state.on_response(&node, None, Vec::new(), Vec::new());
        }
    }

    assert!(state.is_finished());
    assert_eq!(state.termination(), LookupTermination::Converged);

    let closest = state.closest_responders();
    assert_eq!(closest.len(), K);
    let expected: HashSet<_> = contacts.iter().map(|n| n.id).collect();
    let got: HashSet<_> = closest.iter().map(|n| n.id).collect();
    assert_eq!(got, expected);
}

#[test]
fn lookup_exhausts_when_candidates_run_dry() {
    let target = NodeId::generate();
    let (mut state, seeds) = lookup_fixture(target, 2);

    for node in state.start_queries(3) {
        if node.id == seeds[0].id {
            state.on_response(&node, None, Vec::new(), Vec::new());
        } else {
            state.on_failure();
        }
    }

    assert!(state.is_finished());
    assert_eq!(state.termination(), LookupTermination::Exhausted);
    assert_eq!(state.closest_responders().len(), 1);
}

#[test]
fn lookup_reports_no_nodes_when_nothing_answers() {
    let (mut state, _) = lookup_fixture(NodeId::generate(), 3);

    for _ in state.start_queries(3) {
        state.on_failure();
    }

    assert!(state.is_finished());
    assert_eq!(state.termination(), LookupTermination::NoNodes);
}

#[test]
fn lookup_collects_peers_incrementally_without_duplicates() {
    let target = NodeId::generate();
    let (mut state, seeds) = lookup_fixture(target, 2);
    let peer_a = addr(41, 6881);
    let peer_b = addr(42, 6881);

    let started = state.start_queries(2);

    let fresh = state.on_response(&started[0], None, Vec::new(), vec![peer_a, peer_b]);
    assert_eq!(fresh, vec![peer_a, peer_b]);

    // a second responder repeating peer_a contributes only the new one
    let peer_c = addr(43, 6881);
    let fresh = state.on_response(&started[1], None, Vec::new(), vec![peer_a, peer_c]);
    assert_eq!(fresh, vec![peer_c]);

    assert_eq!(state.peers(), &[peer_a, peer_b, peer_c]);
    let _ = seeds;
}

#[test]
fn lookup_captures_tokens_for_announce() {
    let target = NodeId::generate();
    let (mut state, _) = lookup_fixture(target, 2);

    let started = state.start_queries(2);
    state.on_response(
        &started[0],
        Some(Bytes::from_static(b"tok-a")),
        Vec::new(),
        Vec::new(),
    );
    state.on_response(&started[1], None, Vec::new(), Vec::new());

    let targets = state.announce_targets();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].0.id, started[0].id);
    assert_eq!(targets[0].1.as_ref(), b"tok-a");
}

#[test]
fn lookup_dedups_candidates_and_skips_self() {
    let our_id = NodeId::generate();
    let target = NodeId::generate();
    let seed = Node::new(NodeId::generate(), addr(1, 8000));
    let mut state = LookupState::new(target, our_id, vec![seed.clone()]);

    state.add_candidates(vec![
        seed.clone(),
        Node::new(our_id, addr(2, 8001)),
        seed.clone(),
    ]);

    // only the original seed remains queryable
    let started = state.start_queries(8);
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].id, seed.id);
}

#[test]
fn lookup_visit_tracks_idless_bootstrap_contacts() {
    let our_id = NodeId::generate();
    let target = NodeId::generate();
    let mut state = LookupState::new(target, our_id, Vec::new());
    let bootstrap = addr(9, 6881);

    assert!(state.visit(bootstrap));
    assert!(!state.visit(bootstrap));
    assert!(!state.is_finished());

    // the response reveals the node behind the address
    let revealed = Node::new(NodeId::generate(), bootstrap);
    state.on_response(&revealed, None, Vec::new(), Vec::new());

    assert!(state.is_finished());
    assert_eq!(state.termination(), LookupTermination::Exhausted);
    assert_eq!(state.closest_responders()[0].id, revealed.id);
}

// ============================================================================
// State snapshots
// ============================================================================

#[test]
fn state_round_trips() {
    let now = Instant::now();
    let our_id = NodeId::generate();

    let mut rnode_a = RNode::new(
        Node::new(NodeId::generate(), addr(10, 6881))
            .with_version(Some(Bytes::from_static(b"RD\x00\x01"))),
        now,
    );
    rnode_a.touch(Some(Duration::from_millis(83)), now);
    let rnode_b = RNode::new(Node::new(NodeId::generate(), addr(11, 6882)), now);

    let entries = vec![(17usize, rnode_a.clone()), (130usize, rnode_b.clone())];
    let blob = encode_state(&our_id, &entries, now + Duration::from_secs(60));

    let (id, contacts) = parse_state(&blob);
    assert_eq!(id, Some(our_id));
    assert_eq!(contacts.len(), 2);
    assert_eq!(contacts[0].id, rnode_a.node.id);
    assert_eq!(contacts[0].addr, rnode_a.node.addr);
    assert_eq!(contacts[0].version, rnode_a.node.version);
    assert_eq!(contacts[1].id, rnode_b.node.id);
    assert_eq!(contacts[1].version, None);
}

#[test]
fn state_tolerates_garbage() {
    assert_eq!(parse_state(b""), (None, vec![]));
    assert_eq!(parse_state(b"not a snapshot"), (None, vec![]));
    assert_eq!(parse_state(&[0xff, 0xfe, 0x00]), (None, vec![]));
}

#[test]
fn state_skips_bad_records_and_ignores_trailing_fields() {
    let our_id = NodeId::generate();
    let good_id = NodeId::generate();

    let blob = format!(
        "rdht {}\n\
         42 {} - 10.0.0.5 6881 17 300 future-field another\n\
         not a record at all\n\
         17 deadbeef - 10.0.0.6 6881 1 1\n",
        our_id, good_id
    );

    let (id, contacts) = parse_state(blob.as_bytes());
    assert_eq!(id, Some(our_id));
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].id, good_id);
    assert_eq!(contacts[0].addr, addr(5, 6881));
}

// ============================================================================
// End to end over loopback
// ============================================================================

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

async fn spawn_server(bootstrap: Vec<String>) -> Arc<DhtServer> {
    let config = DhtConfig {
        port: 0,
        bootstrap,
        honor_implied_port: true,
        state: None,
    };
    let server = DhtServer::bind(config).await.unwrap();
    tokio::spawn(server.clone().run());
    server
}

/// What a scripted fake node should answer to get_peers.
#[derive(Clone, Default)]
struct FakeScript {
    nodes: Vec<Node>,
    values: Vec<SocketAddr>,
}

#[derive(Default)]
struct FakeLog {
    announces: Vec<(Bytes, u16, [u8; 20])>,
    get_peers: usize,
}

/// A minimal scripted DHT node: answers ping, find_node, and get_peers
/// from its script, accepts any announce, and records what it saw.
async fn spawn_fake(id: NodeId, script: FakeScript) -> (SocketAddr, Arc<Mutex<FakeLog>>) {
    let socket = tokio::net::UdpSocket::bind(localhost(0)).await.unwrap();
    let fake_addr = localhost(socket.local_addr().unwrap().port());
    let log = Arc::new(Mutex::new(FakeLog::default()));

    let task_log = log.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let Ok(message) = DhtMessage::parse(&buf[..len]) else {
                continue;
            };
            let tid = message.transaction_id.clone();

            let reply = match message.query {
                Some(DhtQuery::Ping) => DhtMessage::pong(tid, &id),
                Some(DhtQuery::FindNode { .. }) => {
                    DhtMessage::found_nodes(tid, &id, script.nodes.clone())
                }
                Some(DhtQuery::GetPeers { .. }) => {
                    task_log.lock().unwrap().get_peers += 1;
                    let values = if script.values.is_empty() {
                        None
                    } else {
                        Some(script.values.clone())
                    };
                    let nodes = if script.nodes.is_empty() {
                        None
                    } else {
                        Some(script.nodes.clone())
                    };
                    DhtMessage::found_peers(tid, &id, Bytes::from_static(b"faketok1"), values, nodes)
                }
                Some(DhtQuery::AnnouncePeer {
                    info_hash,
                    port,
                    token,
                    ..
                }) => {
                    task_log
                        .lock()
                        .unwrap()
                        .announces
                        .push((token, port, info_hash));
                    DhtMessage::announce_ack(tid, &id)
                }
                _ => continue,
            };

            let _ = socket.send_to(&reply.to_bytes(), from).await;
        }
    });

    (fake_addr, log)
}

#[tokio::test]
async fn e2e_ping_between_two_servers() {
    let a = spawn_server(vec![]).await;
    let b = spawn_server(vec![]).await;

    let (node, rtt) = b.ping(localhost(a.port())).await.unwrap();
    assert_eq!(&node.id, a.our_id());
    assert!(rtt < Duration::from_secs(1));

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn e2e_bootstrap_then_dump_and_restore() {
    let a = spawn_server(vec![]).await;
    let b = spawn_server(vec![format!("127.0.0.1:{}", a.port())]).await;

    b.bootstrap().await.unwrap();
    assert!(b.node_count() >= 1);

    let blob = b.dump_state();
    let (id, contacts) = parse_state(&blob);
    assert_eq!(id, Some(*b.our_id()));
    assert!(contacts.iter().any(|n| &n.id == a.our_id()));

    // a restarted node picks up the same identity and seed contacts
    let restored = DhtServer::bind(DhtConfig {
        port: 0,
        bootstrap: vec![],
        honor_implied_port: true,
        state: Some(blob),
    })
    .await
    .unwrap();
    assert_eq!(restored.our_id(), b.our_id());
    assert!(restored.node_count() >= 1);

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn e2e_announce_and_get_peers() {
    let storer = spawn_server(vec![]).await;
    let announcer = spawn_server(vec![format!("127.0.0.1:{}", storer.port())]).await;

    announcer.bootstrap().await.unwrap();

    let info_hash = [0x42u8; 20];
    let accepted = announcer.announce(info_hash, 7777).await.unwrap();
    assert_eq!(accepted, 1);

    // the same lookup path now returns the stored peer
    let peers = announcer.get_peers(info_hash).await.unwrap();
    assert_eq!(peers, vec![localhost(7777)]);

    storer.shutdown();
    announcer.shutdown();
}

#[tokio::test]
async fn e2e_lookup_on_cold_table_returns_scripted_neighborhood() {
    // eight scripted nodes close to the target, all answering get_peers
    // with a token and nothing else
    let info_hash = [0x60u8; 20];
    let target = NodeId(info_hash);

    let mut neighborhood = Vec::new();
    let mut logs = Vec::new();
    for i in 0..8 {
        let id = target.at_log_distance(30 + i).unwrap();
        let (fake_addr, log) = spawn_fake(id, FakeScript::default()).await;
        neighborhood.push(Node::new(id, fake_addr));
        logs.push(log);
    }

    // one reachable entry point, far from the target, that hands out the
    // neighborhood
    let entry_id = target.at_log_distance(159).unwrap();
    let (entry_addr, entry_log) = spawn_fake(
        entry_id,
        FakeScript {
            nodes: neighborhood.clone(),
            values: vec![],
        },
    )
    .await;

    let server = spawn_server(vec![entry_addr.to_string()]).await;
    let mut events = server.get_peers_streaming(info_hash, None);

    let mut done = None;
    while let Some(event) = events.recv().await {
        match event {
            LookupEvent::Peers(_) => panic!("no peers should be found"),
            LookupEvent::Done(outcome) => {
                done = Some(outcome);
                break;
            }
        }
    }

    let outcome = done.expect("lookup finishes");
    assert!(outcome.peers.is_empty());
    assert_eq!(outcome.termination, LookupTermination::Converged);

    // the closest-K set is exactly the scripted neighborhood; the entry
    // point sits farther out and drops off the end
    let got: HashSet<_> = outcome.closest.iter().map(|n| n.id).collect();
    let expected: HashSet<_> = neighborhood.iter().map(|n| n.id).collect();
    assert_eq!(got, expected);

    // every scripted node was asked for peers; without a bt_port nothing
    // gets announced
    for log in logs.iter().chain([&entry_log]) {
        let log = log.lock().unwrap();
        assert!(log.get_peers >= 1);
        assert!(log.announces.is_empty());
    }

    server.shutdown();
}

#[tokio::test]
async fn e2e_get_peers_with_values_announces_with_captured_token() {
    let info_hash = [0x61u8; 20];
    let scripted_peers = vec![
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 6881),
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 5)), 6881),
    ];

    let (fake_addr, log) = spawn_fake(
        NodeId::generate(),
        FakeScript {
            nodes: vec![],
            values: scripted_peers.clone(),
        },
    )
    .await;

    let server = spawn_server(vec![fake_addr.to_string()]).await;
    let mut events = server.get_peers_streaming(info_hash, Some(7777));

    let mut streamed = Vec::new();
    let mut outcome = None;
    while let Some(event) = events.recv().await {
        match event {
            LookupEvent::Peers(batch) => streamed.extend(batch),
            LookupEvent::Done(done) => {
                outcome = Some(done);
                break;
            }
        }
    }

    assert_eq!(streamed, scripted_peers);
    let outcome = outcome.unwrap();
    assert_eq!(outcome.peers, scripted_peers);

    // the captured token came back in an announce carrying our bt_port
    let log = log.lock().unwrap();
    assert_eq!(log.announces.len(), 1);
    let (token, port, hash) = &log.announces[0];
    assert_eq!(token.as_ref(), b"faketok1");
    assert_eq!(*port, 7777);
    assert_eq!(*hash, info_hash);

    server.shutdown();
}

#[tokio::test]
async fn e2e_announce_with_bad_token_is_rejected() {
    let storer = spawn_server(vec![]).await;
    let socket = tokio::net::UdpSocket::bind(localhost(0)).await.unwrap();

    let our_id = NodeId::generate();
    let msg = DhtMessage::announce_peer(
        Bytes::from_static(b"zz"),
        &our_id,
        [0x11; 20],
        6881,
        Bytes::from_static(b"forgery!"),
    );
    socket
        .send_to(&msg.to_bytes(), localhost(storer.port()))
        .await
        .unwrap();

    let mut buf = vec![0u8; 1024];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let reply = DhtMessage::parse(&buf[..len]).unwrap();
    match reply.response {
        Some(DhtResponse::Error { code, .. }) => assert_eq!(code, 203),
        other => panic!("unexpected reply: {:?}", other),
    }

    storer.shutdown();
}

#[tokio::test]
async fn e2e_implied_port_follows_config() {
    for honor in [true, false] {
        let config = DhtConfig {
            port: 0,
            bootstrap: vec![],
            honor_implied_port: honor,
            state: None,
        };
        let storer = DhtServer::bind(config).await.unwrap();
        tokio::spawn(storer.clone().run());

        let socket = tokio::net::UdpSocket::bind(localhost(0)).await.unwrap();
        let source_port = socket.local_addr().unwrap().port();
        let our_id = NodeId::generate();
        let info_hash = [0x22; 20];
        let mut buf = vec![0u8; 65535];

        // fetch a real token first
        let get = DhtMessage::get_peers(Bytes::from_static(b"gp"), &our_id, info_hash);
        socket
            .send_to(&get.to_bytes(), localhost(storer.port()))
            .await
            .unwrap();
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let token = match DhtMessage::parse(&buf[..len]).unwrap().response {
            Some(DhtResponse::GetPeers { token, .. }) => token,
            other => panic!("unexpected reply: {:?}", other),
        };

        // announce under port 1000 with implied_port set
        let mut announce =
            DhtMessage::announce_peer(Bytes::from_static(b"an"), &our_id, info_hash, 1000, token);
        if let Some(DhtQuery::AnnouncePeer { implied_port, .. }) = announce.query.as_mut() {
            *implied_port = true;
        }
        socket
            .send_to(&announce.to_bytes(), localhost(storer.port()))
            .await
            .unwrap();
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            DhtMessage::parse(&buf[..len]).unwrap().response,
            Some(DhtResponse::AnnouncePeer { .. })
        ));

        // read the stored peer back
        let get = DhtMessage::get_peers(Bytes::from_static(b"g2"), &our_id, info_hash);
        socket
            .send_to(&get.to_bytes(), localhost(storer.port()))
            .await
            .unwrap();
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let peers = match DhtMessage::parse(&buf[..len]).unwrap().response {
            Some(DhtResponse::GetPeers {
                peers: Some(peers), ..
            }) => peers,
            other => panic!("unexpected reply: {:?}", other),
        };

        let expected_port = if honor { source_port } else { 1000 };
        assert_eq!(peers, vec![localhost(expected_port)]);

        storer.shutdown();
    }
}

#[tokio::test]
async fn e2e_responder_answers_find_node_with_known_contacts() {
    let a = spawn_server(vec![]).await;
    let b = spawn_server(vec![format!("127.0.0.1:{}", a.port())]).await;
    b.bootstrap().await.unwrap();

    // b knows a; asking b for anything returns a among the closest
    let socket = tokio::net::UdpSocket::bind(localhost(0)).await.unwrap();
    let our_id = NodeId::generate();
    let msg = DhtMessage::find_node(Bytes::from_static(b"fn"), &our_id, NodeId::generate());
    socket
        .send_to(&msg.to_bytes(), localhost(b.port()))
        .await
        .unwrap();

    let mut buf = vec![0u8; 65535];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let reply = DhtMessage::parse(&buf[..len]).unwrap();
    match reply.response {
        Some(DhtResponse::FindNode { nodes, .. }) => {
            assert!(nodes.iter().any(|n| &n.id == a.our_id()));
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn e2e_shutdown_cancels_api_calls() {
    let server = spawn_server(vec![]).await;
    server.shutdown();

    assert!(matches!(
        server.get_peers([0u8; 20]).await,
        Err(super::error::DhtError::Cancelled)
    ));
    assert!(matches!(
        server.announce([0u8; 20], 6881).await,
        Err(super::error::DhtError::Cancelled)
    ));
}
