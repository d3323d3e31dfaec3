//! KRPC message framing ([BEP-5]) on top of the bencode layer.
//!
//! Every datagram is a bencoded dictionary with a transaction id `t`
//! (1 to 4 opaque bytes, echoed verbatim in the answer), a type `y`
//! (`q`uery, `r`esponse, or `e`rror), and either query arguments under
//! `a` or return values under `r`. An optional `v` carries the sender's
//! client version.
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::Bytes;

use super::error::DhtError;
use super::id::{NodeId, ID_LEN};
use super::node::{compact_peer, peer_from_compact, Node, COMPACT_NODE_LEN, COMPACT_PEER_LEN};
use crate::bencode::{decode, encode, Value};
use crate::constants::CLIENT_VERSION;

/// An opaque transaction id, 1 to 4 bytes on the wire.
pub type TransactionId = Bytes;

/// KRPC error code: protocol error (malformed packet, bad token).
pub const ERR_PROTOCOL: i64 = 203;
/// KRPC error code: method unknown.
pub const ERR_METHOD_UNKNOWN: i64 = 204;

/// A query as sent by a remote node (or by us).
#[derive(Debug, Clone)]
pub enum DhtQuery {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: [u8; ID_LEN],
    },
    AnnouncePeer {
        info_hash: [u8; ID_LEN],
        port: u16,
        token: Bytes,
        implied_port: bool,
    },
    /// A well-formed query whose method we do not implement; answered
    /// with KRPC error 204.
    Unknown {
        method: String,
    },
}

/// A response or error as sent by a remote node (or by us).
///
/// KRPC responses carry no method name, so the variant is inferred from
/// the keys present: `values` or `token` mean get_peers, bare `nodes`
/// means find_node, a lone `id` answers ping or announce_peer.
#[derive(Debug, Clone)]
pub enum DhtResponse {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        nodes: Vec<Node>,
    },
    GetPeers {
        id: NodeId,
        token: Bytes,
        peers: Option<Vec<SocketAddr>>,
        nodes: Option<Vec<Node>>,
    },
    AnnouncePeer {
        id: NodeId,
    },
    Error {
        code: i64,
        message: String,
    },
}

impl DhtResponse {
    /// The responder's id, if this is not an error.
    pub fn sender_id(&self) -> Option<NodeId> {
        match self {
            DhtResponse::Ping { id }
            | DhtResponse::FindNode { id, .. }
            | DhtResponse::GetPeers { id, .. }
            | DhtResponse::AnnouncePeer { id } => Some(*id),
            DhtResponse::Error { .. } => None,
        }
    }

    /// Contacts carried by this response, regardless of variant.
    pub fn nodes(&self) -> &[Node] {
        match self {
            DhtResponse::FindNode { nodes, .. } => nodes,
            DhtResponse::GetPeers {
                nodes: Some(nodes), ..
            } => nodes,
            _ => &[],
        }
    }
}

/// One parsed or to-be-encoded KRPC datagram.
#[derive(Debug, Clone)]
pub struct DhtMessage {
    pub transaction_id: TransactionId,
    pub sender_id: Option<NodeId>,
    pub version: Option<Bytes>,
    pub query: Option<DhtQuery>,
    pub response: Option<DhtResponse>,
}

impl DhtMessage {
    fn query(transaction_id: TransactionId, our_id: &NodeId, query: DhtQuery) -> Self {
        Self {
            transaction_id,
            sender_id: Some(*our_id),
            version: Some(Bytes::from_static(CLIENT_VERSION)),
            query: Some(query),
            response: None,
        }
    }

    fn response(transaction_id: TransactionId, response: DhtResponse) -> Self {
        Self {
            transaction_id,
            sender_id: None,
            version: Some(Bytes::from_static(CLIENT_VERSION)),
            query: None,
            response: Some(response),
        }
    }

    // === Query constructors ===

    pub fn ping(tid: TransactionId, our_id: &NodeId) -> Self {
        Self::query(tid, our_id, DhtQuery::Ping)
    }

    pub fn find_node(tid: TransactionId, our_id: &NodeId, target: NodeId) -> Self {
        Self::query(tid, our_id, DhtQuery::FindNode { target })
    }

    pub fn get_peers(tid: TransactionId, our_id: &NodeId, info_hash: [u8; ID_LEN]) -> Self {
        Self::query(tid, our_id, DhtQuery::GetPeers { info_hash })
    }

    pub fn announce_peer(
        tid: TransactionId,
        our_id: &NodeId,
        info_hash: [u8; ID_LEN],
        port: u16,
        token: Bytes,
    ) -> Self {
        Self::query(
            tid,
            our_id,
            DhtQuery::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port: false,
            },
        )
    }

    // === Response constructors ===

    pub fn pong(tid: TransactionId, our_id: &NodeId) -> Self {
        Self::response(tid, DhtResponse::Ping { id: *our_id })
    }

    pub fn found_nodes(tid: TransactionId, our_id: &NodeId, nodes: Vec<Node>) -> Self {
        Self::response(tid, DhtResponse::FindNode { id: *our_id, nodes })
    }

    pub fn found_peers(
        tid: TransactionId,
        our_id: &NodeId,
        token: Bytes,
        peers: Option<Vec<SocketAddr>>,
        nodes: Option<Vec<Node>>,
    ) -> Self {
        Self::response(
            tid,
            DhtResponse::GetPeers {
                id: *our_id,
                token,
                peers,
                nodes,
            },
        )
    }

    pub fn announce_ack(tid: TransactionId, our_id: &NodeId) -> Self {
        Self::response(tid, DhtResponse::AnnouncePeer { id: *our_id })
    }

    pub fn error(tid: TransactionId, code: i64, message: &str) -> Self {
        Self::response(
            tid,
            DhtResponse::Error {
                code,
                message: message.to_string(),
            },
        )
    }

    // === Decoding ===

    /// Parses one datagram. Fails on anything that is not a well-formed
    /// KRPC dictionary; unknown *optional* keys are ignored, but a missing
    /// or over-long transaction id, an unknown `y`, or missing required
    /// arguments are fatal for the packet.
    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let value = decode(data)?;

        let dict = value
            .into_dict()
            .ok_or_else(|| DhtError::Malformed("top-level value is not a dict".into()))?;

        let transaction_id = dict
            .get(b"t".as_slice())
            .and_then(|v| v.as_bytes())
            .cloned()
            .ok_or_else(|| DhtError::Malformed("missing transaction id".into()))?;
        if transaction_id.is_empty() || transaction_id.len() > 4 {
            return Err(DhtError::Malformed("transaction id not 1-4 bytes".into()));
        }

        let version = dict.get(b"v".as_slice()).and_then(|v| v.as_bytes()).cloned();

        let kind = dict
            .get(b"y".as_slice())
            .and_then(|v| v.as_str())
            .ok_or_else(|| DhtError::Malformed("missing message type".into()))?;

        let mut message = match kind {
            "q" => Self::parse_query(transaction_id, &dict)?,
            "r" => Self::parse_response(transaction_id, &dict)?,
            "e" => Self::parse_error(transaction_id, &dict)?,
            other => {
                return Err(DhtError::Malformed(format!(
                    "unknown message type {:?}",
                    other
                )))
            }
        };
        message.version = version;
        Ok(message)
    }

    fn parse_query(
        transaction_id: TransactionId,
        dict: &BTreeMap<Bytes, Value>,
    ) -> Result<Self, DhtError> {
        let method = dict
            .get(b"q".as_slice())
            .and_then(|v| v.as_str())
            .ok_or_else(|| DhtError::Malformed("missing query method".into()))?;

        let args = dict
            .get(b"a".as_slice())
            .and_then(|v| v.as_dict())
            .ok_or_else(|| DhtError::Malformed("missing query args".into()))?;

        let sender_id = args
            .get(b"id".as_slice())
            .and_then(|v| v.as_bytes())
            .and_then(|b| NodeId::from_bytes(b).ok())
            .ok_or_else(|| DhtError::Malformed("missing or bad sender id".into()))?;

        let query = match method {
            "ping" => DhtQuery::Ping,
            "find_node" => {
                let target = args
                    .get(b"target".as_slice())
                    .and_then(|v| v.as_bytes())
                    .and_then(|b| NodeId::from_bytes(b).ok())
                    .ok_or_else(|| DhtError::Malformed("missing or bad target".into()))?;
                DhtQuery::FindNode { target }
            }
            "get_peers" => DhtQuery::GetPeers {
                info_hash: required_info_hash(args)?,
            },
            "announce_peer" => {
                let port = args
                    .get(b"port".as_slice())
                    .and_then(|v| v.as_integer())
                    .filter(|p| (0..=u16::MAX as i64).contains(p))
                    .ok_or_else(|| DhtError::Malformed("missing or bad port".into()))?;

                let token = args
                    .get(b"token".as_slice())
                    .and_then(|v| v.as_bytes())
                    .cloned()
                    .ok_or_else(|| DhtError::Malformed("missing token".into()))?;

                let implied_port = args
                    .get(b"implied_port".as_slice())
                    .and_then(|v| v.as_integer())
                    .map(|v| v != 0)
                    .unwrap_or(false);

                DhtQuery::AnnouncePeer {
                    info_hash: required_info_hash(args)?,
                    port: port as u16,
                    token,
                    implied_port,
                }
            }
            other => DhtQuery::Unknown {
                method: other.to_string(),
            },
        };

        Ok(Self {
            transaction_id,
            sender_id: Some(sender_id),
            version: None,
            query: Some(query),
            response: None,
        })
    }

    fn parse_response(
        transaction_id: TransactionId,
        dict: &BTreeMap<Bytes, Value>,
    ) -> Result<Self, DhtError> {
        let ret = dict
            .get(b"r".as_slice())
            .and_then(|v| v.as_dict())
            .ok_or_else(|| DhtError::Malformed("missing return dict".into()))?;

        let sender_id = ret
            .get(b"id".as_slice())
            .and_then(|v| v.as_bytes())
            .and_then(|b| NodeId::from_bytes(b).ok())
            .ok_or_else(|| DhtError::Malformed("missing or bad responder id".into()))?;

        // `nodes` is the normal IPv4 contact list; some older nodes answer
        // with `nodes2` instead, which we accept for its IPv4 entries.
        let nodes = ret
            .get(b"nodes".as_slice())
            .or_else(|| ret.get(b"nodes2".as_slice()))
            .and_then(|v| v.as_bytes())
            .map(|data| {
                data.chunks_exact(COMPACT_NODE_LEN)
                    .filter_map(Node::from_compact)
                    .collect::<Vec<_>>()
            });

        let peers = ret
            .get(b"values".as_slice())
            .and_then(|v| v.as_list())
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_bytes())
                    .filter(|b| b.len() == COMPACT_PEER_LEN)
                    .filter_map(|b| peer_from_compact(b))
                    .collect::<Vec<_>>()
            });

        let token = ret
            .get(b"token".as_slice())
            .and_then(|v| v.as_bytes())
            .cloned();

        let response = if peers.is_some() || token.is_some() {
            DhtResponse::GetPeers {
                id: sender_id,
                token: token.unwrap_or_default(),
                peers,
                nodes,
            }
        } else if let Some(nodes) = nodes {
            DhtResponse::FindNode {
                id: sender_id,
                nodes,
            }
        } else {
            DhtResponse::Ping { id: sender_id }
        };

        Ok(Self {
            transaction_id,
            sender_id: Some(sender_id),
            version: None,
            query: None,
            response: Some(response),
        })
    }

    fn parse_error(
        transaction_id: TransactionId,
        dict: &BTreeMap<Bytes, Value>,
    ) -> Result<Self, DhtError> {
        let detail = dict
            .get(b"e".as_slice())
            .and_then(|v| v.as_list())
            .ok_or_else(|| DhtError::Malformed("missing error list".into()))?;

        let code = detail.first().and_then(|v| v.as_integer()).unwrap_or(0);
        let message = detail
            .get(1)
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
            .to_string();

        Ok(Self {
            transaction_id,
            sender_id: None,
            version: None,
            query: None,
            response: Some(DhtResponse::Error { code, message }),
        })
    }

    // === Encoding ===

    /// Encodes to canonical bencode bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();

        dict.insert(
            Bytes::from_static(b"t"),
            Value::Bytes(self.transaction_id.clone()),
        );
        if let Some(version) = &self.version {
            dict.insert(Bytes::from_static(b"v"), Value::Bytes(version.clone()));
        }

        if let Some(query) = &self.query {
            dict.insert(Bytes::from_static(b"y"), Value::string("q"));
            let mut args = BTreeMap::new();
            if let Some(id) = &self.sender_id {
                args.insert(Bytes::from_static(b"id"), Value::bytes(id.as_bytes()));
            }

            let method = match query {
                DhtQuery::Ping => "ping",
                DhtQuery::FindNode { target } => {
                    args.insert(Bytes::from_static(b"target"), Value::bytes(target.as_bytes()));
                    "find_node"
                }
                DhtQuery::GetPeers { info_hash } => {
                    args.insert(Bytes::from_static(b"info_hash"), Value::bytes(info_hash));
                    "get_peers"
                }
                DhtQuery::AnnouncePeer {
                    info_hash,
                    port,
                    token,
                    implied_port,
                } => {
                    args.insert(Bytes::from_static(b"info_hash"), Value::bytes(info_hash));
                    args.insert(Bytes::from_static(b"port"), Value::Integer(*port as i64));
                    args.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
                    if *implied_port {
                        args.insert(Bytes::from_static(b"implied_port"), Value::Integer(1));
                    }
                    "announce_peer"
                }
                DhtQuery::Unknown { method } => method.as_str(),
            };

            dict.insert(Bytes::from_static(b"q"), Value::string(method));
            dict.insert(Bytes::from_static(b"a"), Value::Dict(args));
        } else if let Some(DhtResponse::Error { code, message }) = &self.response {
            dict.insert(Bytes::from_static(b"y"), Value::string("e"));
            dict.insert(
                Bytes::from_static(b"e"),
                Value::List(vec![Value::Integer(*code), Value::string(message)]),
            );
        } else if let Some(response) = &self.response {
            dict.insert(Bytes::from_static(b"y"), Value::string("r"));
            let mut ret = BTreeMap::new();

            match response {
                DhtResponse::Ping { id } | DhtResponse::AnnouncePeer { id } => {
                    ret.insert(Bytes::from_static(b"id"), Value::bytes(id.as_bytes()));
                }
                DhtResponse::FindNode { id, nodes } => {
                    ret.insert(Bytes::from_static(b"id"), Value::bytes(id.as_bytes()));
                    ret.insert(
                        Bytes::from_static(b"nodes"),
                        Value::Bytes(compact_nodes(nodes)),
                    );
                }
                DhtResponse::GetPeers {
                    id,
                    token,
                    peers,
                    nodes,
                } => {
                    ret.insert(Bytes::from_static(b"id"), Value::bytes(id.as_bytes()));
                    ret.insert(Bytes::from_static(b"token"), Value::Bytes(token.clone()));
                    if let Some(peers) = peers {
                        let values = peers
                            .iter()
                            .filter_map(|addr| compact_peer(addr))
                            .map(|data| Value::bytes(&data))
                            .collect();
                        ret.insert(Bytes::from_static(b"values"), Value::List(values));
                    }
                    if let Some(nodes) = nodes {
                        ret.insert(
                            Bytes::from_static(b"nodes"),
                            Value::Bytes(compact_nodes(nodes)),
                        );
                    }
                }
                DhtResponse::Error { .. } => unreachable!(),
            }

            dict.insert(Bytes::from_static(b"r"), Value::Dict(ret));
        }

        encode(&Value::Dict(dict))
    }
}

fn compact_nodes(nodes: &[Node]) -> Bytes {
    let mut data = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for node in nodes {
        if let Some(compact) = node.to_compact() {
            data.extend_from_slice(&compact);
        }
    }
    Bytes::from(data)
}

fn required_info_hash(args: &BTreeMap<Bytes, Value>) -> Result<[u8; ID_LEN], DhtError> {
    args.get(b"info_hash".as_slice())
        .and_then(|v| v.as_bytes())
        .filter(|b| b.len() == ID_LEN)
        .map(|b| {
            let mut hash = [0u8; ID_LEN];
            hash.copy_from_slice(b);
            hash
        })
        .ok_or_else(|| DhtError::Malformed("missing or bad info_hash".into()))
}
