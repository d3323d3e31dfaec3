//! rdht - A BitTorrent Mainline DHT node
//!
//! This library implements the trackerless peer discovery half of
//! BitTorrent: a Kademlia-style DHT node speaking bencoded KRPC over UDP,
//! interoperable with the Mainline DHT per BEP-5.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 bencode encoding/decoding
//! - [`dht`] - BEP-5 DHT node: routing table, lookups, announce store
//! - [`constants`] - protocol constants and tuning parameters
//!
//! # Quick start
//!
//! ```no_run
//! use rdht::{DhtConfig, DhtServer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let dht = DhtServer::bind(DhtConfig::default()).await?;
//! tokio::spawn(dht.clone().run());
//!
//! dht.bootstrap().await?;
//! let peers = dht.get_peers([0u8; 20]).await?;
//! # Ok(())
//! # }
//! ```

pub mod bencode;
pub mod constants;
pub mod dht;

pub use bencode::{decode, encode, BencodeError, Value};
pub use dht::{
    load_state, DhtConfig, DhtError, DhtMessage, DhtQuery, DhtResponse, DhtServer, LookupEvent,
    LookupOutcome, LookupTermination, Node, NodeId, NodeStatus, RNode, TransactionId,
};
