use std::fmt;

use rand::Rng as _;

use super::error::DhtError;

/// Length in bytes of a DHT node id / info-hash.
pub const ID_LEN: usize = 20;

/// A 160-bit identifier in the Kademlia XOR metric space.
///
/// Node ids and info-hashes share this space; peers for an info-hash are
/// found near the nodes whose ids are XOR-closest to it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    /// Generates a uniformly random id from the OS entropy source.
    pub fn generate() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::rng().fill(&mut id);
        Self(id)
    }

    /// Builds an id from a byte slice; fails unless it is exactly 20 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != ID_LEN {
            return Err(DhtError::InvalidNodeId);
        }
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    /// Parses the 40-hex-digit form produced by [`Display`](fmt::Display).
    pub fn from_hex(s: &str) -> Result<Self, DhtError> {
        if s.len() != ID_LEN * 2 || !s.is_ascii() {
            return Err(DhtError::InvalidNodeId);
        }
        let mut id = [0u8; ID_LEN];
        for (i, byte) in id.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| DhtError::InvalidNodeId)?;
        }
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// XOR distance to `other` as a big-endian 160-bit value.
    pub fn distance(&self, other: &NodeId) -> [u8; ID_LEN] {
        let mut dist = [0u8; ID_LEN];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Position of the highest set bit of the XOR distance:
    /// `floor(log2(self XOR other))`, in `0..=159`, or `-1` when the ids
    /// are equal. Symmetric in its arguments.
    pub fn log_distance(&self, other: &NodeId) -> i32 {
        let dist = self.distance(other);
        for (i, &byte) in dist.iter().enumerate() {
            if byte != 0 {
                let bit = i * 8 + byte.leading_zeros() as usize;
                return 159 - bit as i32;
            }
        }
        -1
    }

    /// Generates an id at exactly log-distance `ld` from `self`: the bits
    /// above the distance's top bit are copied, that bit is flipped, and
    /// everything below is random. Fails outside `0..160`.
    pub fn at_log_distance(&self, ld: i32) -> Result<NodeId, DhtError> {
        if !(0..160).contains(&ld) {
            return Err(DhtError::InvalidLogDistance);
        }

        // bit position from the most-significant end
        let bit = (159 - ld) as usize;
        let byte_idx = bit / 8;
        let top = 0x80u8 >> (bit % 8);
        let below = top - 1;

        let mut rng = rand::rng();
        let mut id = self.0;
        id[byte_idx] ^= top;
        id[byte_idx] = (id[byte_idx] & !below) | (rng.random::<u8>() & below);
        for b in id.iter_mut().skip(byte_idx + 1) {
            *b = rng.random();
        }

        Ok(NodeId(id))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NodeId({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
