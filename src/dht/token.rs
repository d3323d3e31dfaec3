use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use sha1::{Digest, Sha1};

use crate::constants::{TOKEN_LEN, TOKEN_ROTATION};

/// Issues and checks the opaque write tokens that gate announce_peer
/// ([BEP-5]).
///
/// A token is a truncated SHA-1 over a rotating secret and the requester's
/// IP, so only a node that actually received our get_peers response at
/// that address can announce. Secrets rotate every [`TOKEN_ROTATION`] and
/// the previous secret stays acceptable for one extra window; there is no
/// replay protection beyond that expiry.
///
/// [BEP-5]: http://bittorrent.org/beps/bep_0005.html
pub struct TokenManager {
    current: [u8; 16],
    previous: [u8; 16],
    rotated_at: Instant,
}

impl TokenManager {
    pub fn new(now: Instant) -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
            rotated_at: now,
        }
    }

    /// Issues a token for the given source address.
    pub fn generate(&mut self, addr: &SocketAddr, now: Instant) -> Bytes {
        self.rotate_if_due(now);
        make_token(&self.current, addr)
    }

    /// Checks a token presented by `addr`; accepts tokens formed under the
    /// current or the previous secret.
    pub fn validate(&mut self, addr: &SocketAddr, token: &[u8], now: Instant) -> bool {
        self.rotate_if_due(now);
        token == make_token(&self.current, addr)
            || token == make_token(&self.previous, addr)
    }

    fn rotate_if_due(&mut self, now: Instant) {
        let age = now.duration_since(self.rotated_at);
        if age <= TOKEN_ROTATION {
            return;
        }

        if age > TOKEN_ROTATION * 2 {
            // Two full windows with no traffic: both secrets are stale.
            self.current = rand::random();
            self.previous = rand::random();
        } else {
            self.previous = self.current;
            self.current = rand::random();
        }
        self.rotated_at = now;
    }
}

/// Tokens are bound to the source IP only, not the port: NATs may rewrite
/// the port between the get_peers and the announce.
fn make_token(secret: &[u8; 16], addr: &SocketAddr) -> Bytes {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    match addr.ip() {
        std::net::IpAddr::V4(ip) => hasher.update(ip.octets()),
        std::net::IpAddr::V6(ip) => hasher.update(ip.octets()),
    }

    let digest = hasher.finalize();
    Bytes::copy_from_slice(&digest[..TOKEN_LEN])
}
