use serde::{Deserialize, Serialize};
use shardbft_crypto::Hash;

const DOMAIN_TX: &[u8] = b"shardbft/tx";

/// A coin created by a transaction, owned by `public_key`.
///
/// The destination shard is derived from the last byte of the owner key, so a
/// coin's shard is fixed for a given shard count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputCoin {
    pub public_key: Vec<u8>,
    pub value: u64,
    pub serial: Hash,
}

impl OutputCoin {
    /// Shard this coin belongs to. `shard_count` must be non-zero.
    pub fn shard_id(&self, shard_count: usize) -> u8 {
        let last = self.public_key.last().copied().unwrap_or_default() as usize;
        (last % shard_count) as u8
    }

    /// Canonical byte encoding used for merkle leaves.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.public_key.len() + 4 + 8 + 32);
        bytes.extend_from_slice(&(self.public_key.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.public_key);
        bytes.extend_from_slice(&self.value.to_le_bytes());
        bytes.extend_from_slice(self.serial.as_bytes());
        bytes
    }
}

/// A value transfer: spends `inputs` (coin serials) and creates `outputs`.
///
/// Input ownership and amounts are checked by the state layer, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<Hash>,
    pub outputs: Vec<OutputCoin>,
    pub fee: u64,
}

impl Transaction {
    pub fn hash(&self) -> Hash {
        let mut parts: Vec<Vec<u8>> = Vec::with_capacity(self.inputs.len() + self.outputs.len() + 2);
        parts.push(DOMAIN_TX.to_vec());
        parts.extend(self.inputs.iter().map(|input| input.0.to_vec()));
        parts.extend(self.outputs.iter().map(OutputCoin::to_bytes));
        parts.push(self.fee.to_le_bytes().to_vec());
        let slices: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
        Hash::digest_parts(&slices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coin(last: u8, value: u64) -> OutputCoin {
        OutputCoin {
            public_key: vec![7, 7, last],
            value,
            serial: Hash::digest(&[last]),
        }
    }

    #[test]
    fn test_shard_from_last_key_byte() {
        assert_eq!(coin(5, 1).shard_id(4), 1);
        assert_eq!(coin(8, 1).shard_id(4), 0);
        assert_eq!(coin(255, 1).shard_id(1), 0);
    }

    #[test]
    fn test_tx_hash_covers_outputs_and_fee() {
        let tx = Transaction {
            inputs: vec![Hash::digest(b"in")],
            outputs: vec![coin(1, 10)],
            fee: 1,
        };
        let mut other = tx.clone();
        other.outputs[0].value = 11;
        assert_ne!(tx.hash(), other.hash());
        let mut cheaper = tx.clone();
        cheaper.fee = 0;
        assert_ne!(tx.hash(), cheaper.hash());
    }
}
