use thiserror::Error;

/// Errors surfaced by the DHT node.
///
/// Network-born conditions (malformed packets, unknown transactions,
/// per-query timeouts of remote nodes) are absorbed internally and only
/// logged; what reaches the caller is limited to I/O problems, argument
/// errors, and terminal query outcomes.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid node id length")]
    InvalidNodeId,

    #[error("log distance out of range")]
    InvalidLogDistance,

    #[error("query timed out")]
    Timeout,

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("rate limited")]
    RateLimited,

    #[error("server shut down")]
    Cancelled,
}
