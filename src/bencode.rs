//! Bencode encoding and decoding ([BEP-3]).
//!
//! Bencode is the serialization format underneath everything in BitTorrent,
//! including the KRPC messages the DHT speaks over UDP.
//!
//! # Data Types
//!
//! | Type | Format | Example |
//! |------|--------|---------|
//! | Integer | `i<number>e` | `i42e` → 42 |
//! | Byte string | `<length>:<data>` | `4:spam` → "spam" |
//! | List | `l<items>e` | `l4:spami42ee` → ["spam", 42] |
//! | Dictionary | `d<key><value>...e` | `d3:foo3:bare` → {"foo": "bar"} |
//!
//! # Examples
//!
//! ```
//! use rdht::bencode::{decode, encode, Value};
//! use bytes::Bytes;
//! use std::collections::BTreeMap;
//!
//! let value = decode(b"d1:q4:ping1:y1:qe").unwrap();
//! assert_eq!(value.get(b"y").and_then(|v| v.as_str()), Some("q"));
//!
//! let mut dict = BTreeMap::new();
//! dict.insert(Bytes::from_static(b"y"), Value::string("r"));
//! assert_eq!(encode(&Value::Dict(dict)), b"d1:y1:re");
//! ```
//!
//! Decoding is strict: leading-zero integers, non-string dictionary keys,
//! trailing bytes, and over-deep nesting are all rejected with a
//! [`BencodeError`]. Encoding is canonical and infallible.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::encode;
pub use error::BencodeError;
pub use value::Value;
