use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;
use std::str::FromStr;

use crate::error::CryptoError;

/// 32-byte SHA3-256 digest.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// SHA3-256 of `data`.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(data);
        Self::from_hasher(hasher)
    }

    /// SHA3-256 of `left || right`, the merkle parent of two nodes.
    pub fn concat(left: &Hash, right: &Hash) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(left.0);
        hasher.update(right.0);
        Self::from_hasher(hasher)
    }

    /// SHA3-256 over a sequence of byte slices, fed in order.
    pub fn digest_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha3_256::new();
        for part in parts {
            hasher.update(part);
        }
        Self::from_hasher(hasher)
    }

    fn from_hasher(hasher: Sha3_256) -> Self {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&hasher.finalize());
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..16])
    }
}

impl FromStr for Hash {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidHex("expected 32 bytes".to_string()))?;
        Ok(Hash(array))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_digest_is_sha3_of_empty_string() {
        assert_eq!(
            Hash::digest(b"").to_hex(),
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
    }

    #[test]
    fn test_concat_matches_digest_of_joined_bytes() {
        let a = Hash::digest(b"left");
        let b = Hash::digest(b"right");
        let mut joined = a.0.to_vec();
        joined.extend_from_slice(&b.0);
        assert_eq!(Hash::concat(&a, &b), Hash::digest(&joined));
        assert_ne!(Hash::concat(&a, &b), Hash::concat(&b, &a));
    }

    #[test]
    fn test_hex_parse_round_trip() {
        let h = Hash::digest(b"block");
        let parsed: Hash = h.to_hex().parse().unwrap();
        assert_eq!(parsed, h);
        assert!("zz".parse::<Hash>().is_err());
        assert!("abcd".parse::<Hash>().is_err());
    }
}
