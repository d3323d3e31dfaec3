//! Routing-table snapshots.
//!
//! A dump is a small line-oriented text blob: a header naming the local
//! id, then one record per main-list node. It exists so a restarting
//! client can seed its table from the previous run instead of leaning on
//! the bootstrap entry points. The format is stable but forgiving: a
//! parser skips records it cannot read and ignores fields beyond the ones
//! it knows, so newer dumps load on older code.
//!
//! ```text
//! rdht 60d5d82328b4547511fdeac9bf4a0496deb9f637
//! 159 a5f2...c913 52440001 93.184.216.34 6881 112 540
//! ```
//!
//! Record fields: bucket level (log-distance to the local id), node id in
//! hex, client version in hex (`-` when unknown), IPv4 address, port,
//! smoothed RTT in milliseconds (`-` when never measured), and seconds
//! since the node entered the table.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;

use super::id::NodeId;
use super::node::{Node, RNode};

const STATE_HEADER: &str = "rdht";

/// Serializes the local id and the given main-list entries.
pub fn encode_state(our_id: &NodeId, entries: &[(usize, RNode)], now: Instant) -> Vec<u8> {
    let mut out = String::new();
    let _ = writeln!(out, "{} {}", STATE_HEADER, our_id);

    for (bucket, rnode) in entries {
        let version = match &rnode.node.version {
            Some(v) if !v.is_empty() => hex_string(v),
            _ => "-".to_string(),
        };
        let rtt = match rnode.rtt {
            Some(rtt) => rtt.as_millis().to_string(),
            None => "-".to_string(),
        };
        let age = now.duration_since(rnode.created_at).as_secs();

        let _ = writeln!(
            out,
            "{} {} {} {} {} {} {}",
            bucket,
            rnode.node.id,
            version,
            rnode.node.addr.ip(),
            rnode.node.addr.port(),
            rtt,
            age,
        );
    }

    out.into_bytes()
}

/// Parses a snapshot back into the local id and its contacts.
///
/// Tolerant by contract: a blob without a readable header yields
/// `(None, vec![])`, unreadable records are skipped, and fields past the
/// known seven are ignored.
pub fn parse_state(data: &[u8]) -> (Option<NodeId>, Vec<Node>) {
    let Ok(text) = std::str::from_utf8(data) else {
        return (None, Vec::new());
    };
    let mut lines = text.lines();

    let our_id = lines.next().and_then(|header| {
        let mut fields = header.split_whitespace();
        if fields.next() != Some(STATE_HEADER) {
            return None;
        }
        fields.next().and_then(|hex| NodeId::from_hex(hex).ok())
    });
    if our_id.is_none() {
        return (None, Vec::new());
    }

    let mut contacts = Vec::new();
    for line in lines {
        if let Some(node) = parse_record(line) {
            contacts.push(node);
        }
    }

    (our_id, contacts)
}

fn parse_record(line: &str) -> Option<Node> {
    let mut fields = line.split_whitespace();

    let _bucket: usize = fields.next()?.parse().ok()?;
    let id = NodeId::from_hex(fields.next()?).ok()?;
    let version = match fields.next()? {
        "-" => None,
        hex => Some(Bytes::from(hex_bytes(hex)?)),
    };
    let ip: std::net::Ipv4Addr = fields.next()?.parse().ok()?;
    let port: u16 = fields.next()?.parse().ok()?;
    let addr = SocketAddr::new(ip.into(), port);
    // rtt and age are informational; tolerate their absence too

    Some(Node::new(id, addr).with_version(version))
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

fn hex_bytes(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
