// CROSS-SHARD MERKLE PROOFS
// A shard block commits to the coins it sends every shard through one merkle
// root in its header. A receiving shard accepts its batch when the path
// rebuilds that root and the source committee signed the header.
//
//   leaves:  H(coins for shard 0) ... H(coins for shard S-1)   (empty batch = H(""))
//   parent:  H(left || right), paired left to right
//   path:    sibling at each level, leaf to root
//
// SAFETY INVARIANTS:
// 1. All S leaves are always present, so every path has exactly log2(S) entries
// 2. Folding is position-aware: the accumulator goes left at even indices, right at odd
// 3. A cross-shard block is accepted only when BOTH the signature and the path verify

use log::debug;
use serde::{Deserialize, Serialize};
use shardbft_crypto::Hash;

use crate::block::{ConsensusArtifacts, ShardBlock, ShardHeader};
use crate::committee::Committee;
use crate::error::CrossShardError;
use crate::transaction::{OutputCoin, Transaction};

/// Largest supported shard count: shard ids are one byte.
pub const MAX_SHARDS: usize = 256;

pub fn validate_shard_count(shard_count: usize) -> Result<(), CrossShardError> {
    if shard_count == 0 || shard_count > MAX_SHARDS || !shard_count.is_power_of_two() {
        return Err(CrossShardError::InvalidShardCount(shard_count));
    }
    Ok(())
}

fn check_shard(shard: u8, shard_count: usize) -> Result<(), CrossShardError> {
    if shard as usize >= shard_count {
        return Err(CrossShardError::ShardOutOfRange { shard, shard_count });
    }
    Ok(())
}

/// Partition every output coin in `transactions` by destination shard.
pub fn group_coins_by_shard(
    transactions: &[Transaction],
    shard_count: usize,
) -> Result<Vec<Vec<OutputCoin>>, CrossShardError> {
    validate_shard_count(shard_count)?;
    let mut groups = vec![Vec::new(); shard_count];
    for coin in transactions.iter().flat_map(|tx| tx.outputs.iter()) {
        groups[coin.shard_id(shard_count) as usize].push(coin.clone());
    }
    Ok(groups)
}

/// Leaf hash of one shard's coin batch: SHA3 of the concatenated coin bytes.
pub fn coin_batch_hash(coins: &[OutputCoin]) -> Hash {
    let bytes: Vec<u8> = coins.iter().flat_map(OutputCoin::to_bytes).collect();
    Hash::digest(&bytes)
}

/// Complete binary merkle tree over the per-shard coin batches of one block.
#[derive(Debug, Clone)]
pub struct CrossShardMerkle {
    /// `levels[0]` are the leaves, the last level holds only the root
    levels: Vec<Vec<Hash>>,
}

impl CrossShardMerkle {
    pub fn build(transactions: &[Transaction], shard_count: usize) -> Result<Self, CrossShardError> {
        let leaves = group_coins_by_shard(transactions, shard_count)?
            .iter()
            .map(|coins| coin_batch_hash(coins))
            .collect();
        Self::from_leaves(leaves)
    }

    pub fn from_leaves(leaves: Vec<Hash>) -> Result<Self, CrossShardError> {
        validate_shard_count(leaves.len())?;
        let mut levels = vec![leaves];
        while let Some(level) = levels.last().filter(|level| level.len() > 1) {
            let parent = level
                .chunks_exact(2)
                .map(|pair| Hash::concat(&pair[0], &pair[1]))
                .collect();
            levels.push(parent);
        }
        Ok(Self { levels })
    }

    pub fn root(&self) -> Hash {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or_default()
    }

    pub fn shard_count(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or_default()
    }

    /// Sibling hashes from the leaf of `shard` up to (not including) the root.
    pub fn path(&self, shard: u8) -> Result<Vec<Hash>, CrossShardError> {
        check_shard(shard, self.shard_count())?;
        let mut index = shard as usize;
        let mut path = Vec::with_capacity(self.levels.len().saturating_sub(1));
        for level in &self.levels[..self.levels.len() - 1] {
            path.push(level[index ^ 1]);
            index /= 2;
        }
        Ok(path)
    }
}

pub fn compute_shard_tx_root(transactions: &[Transaction], shard_count: usize) -> Result<Hash, CrossShardError> {
    Ok(CrossShardMerkle::build(transactions, shard_count)?.root())
}

/// Rebuild the root from `coins` at leaf `shard` and compare with `root`.
pub fn verify_merkle_path(
    coins: &[OutputCoin],
    shard: u8,
    path: &[Hash],
    root: &Hash,
    shard_count: usize,
) -> Result<(), CrossShardError> {
    validate_shard_count(shard_count)?;
    check_shard(shard, shard_count)?;
    let expected = shard_count.trailing_zeros() as usize;
    if path.len() != expected {
        return Err(CrossShardError::PathLength {
            expected,
            actual: path.len(),
        });
    }

    let mut index = shard as usize;
    let mut acc = coin_batch_hash(coins);
    for sibling in path {
        acc = if index % 2 == 0 {
            Hash::concat(&acc, sibling)
        } else {
            Hash::concat(sibling, &acc)
        };
        index /= 2;
    }

    if acc != *root {
        return Err(CrossShardError::RootMismatch);
    }
    Ok(())
}

// ==================== CROSS-SHARD BLOCK ====================

/// Coins one finalized shard block sends to another shard, with everything
/// the receiver needs to trust them without replaying the source chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossShardBlock {
    pub header: ShardHeader,
    pub to_shard: u8,
    pub output_coins: Vec<OutputCoin>,
    pub merkle_path: Vec<Hash>,
    pub consensus: ConsensusArtifacts,
}

impl CrossShardBlock {
    /// Extract the batch for `to_shard` from a finalized shard block.
    pub fn from_finalized(block: &ShardBlock, to_shard: u8, shard_count: usize) -> Result<Self, CrossShardError> {
        let consensus = block.consensus.clone().ok_or(CrossShardError::NotFinalized)?;
        check_shard(to_shard, shard_count)?;
        if to_shard == block.header.shard_id {
            return Err(CrossShardError::SameShard(to_shard));
        }

        let merkle = CrossShardMerkle::build(&block.body.transactions, shard_count)?;
        let mut groups = group_coins_by_shard(&block.body.transactions, shard_count)?;
        Ok(Self {
            header: block.header.clone(),
            to_shard,
            output_coins: std::mem::take(&mut groups[to_shard as usize]),
            merkle_path: merkle.path(to_shard)?,
            consensus,
        })
    }

    pub fn from_shard(&self) -> u8 {
        self.header.shard_id
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Hash of the source block header.
    pub fn hash(&self) -> Result<Hash, CrossShardError> {
        self.header
            .hash()
            .map_err(|e| CrossShardError::Encoding(e.to_string()))
    }

    /// The source committee's aggregated signature over the header.
    pub fn verify_signature(&self, source_committee: &Committee) -> Result<(), CrossShardError> {
        self.consensus.verify(source_committee, &self.hash()?)?;
        Ok(())
    }

    /// The coin batch against the header's committed shard root.
    pub fn verify_merkle_path(&self, shard_count: usize) -> Result<(), CrossShardError> {
        verify_merkle_path(
            &self.output_coins,
            self.to_shard,
            &self.merkle_path,
            &self.header.shard_tx_root,
            shard_count,
        )
    }

    pub fn verify(&self, source_committee: &Committee, shard_count: usize) -> Result<(), CrossShardError> {
        if self.to_shard == self.from_shard() {
            return Err(CrossShardError::SameShard(self.to_shard));
        }
        self.verify_signature(source_committee)?;
        self.verify_merkle_path(shard_count)?;
        debug!(
            "cross-shard block {} -> {} at height {} verified ({} coins)",
            self.from_shard(),
            self.to_shard,
            self.height(),
            self.output_coins.len()
        );
        Ok(())
    }
}

/// Ask the source shard to resend a cross-shard block that failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossShardRequest {
    pub block_hash: Hash,
    pub from_shard: u8,
    pub to_shard: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coin(last: u8, value: u64) -> OutputCoin {
        OutputCoin {
            public_key: vec![0xaa, last],
            value,
            serial: Hash::digest(&value.to_le_bytes()),
        }
    }

    fn txs() -> Vec<Transaction> {
        vec![
            Transaction {
                inputs: vec![],
                outputs: vec![coin(1, 10), coin(2, 20)],
                fee: 0,
            },
            Transaction {
                inputs: vec![],
                outputs: vec![coin(5, 30)],
                fee: 0,
            },
        ]
    }

    #[test]
    fn test_empty_leaf_is_hash_of_empty_string() {
        assert_eq!(coin_batch_hash(&[]), Hash::digest(b""));
        let groups = group_coins_by_shard(&txs(), 4).unwrap();
        assert!(groups[3].is_empty());
        assert_eq!(groups[1].len(), 2);
    }

    #[test]
    fn test_shard_count_must_be_power_of_two() {
        assert_eq!(validate_shard_count(0), Err(CrossShardError::InvalidShardCount(0)));
        assert_eq!(validate_shard_count(6), Err(CrossShardError::InvalidShardCount(6)));
        assert_eq!(validate_shard_count(512), Err(CrossShardError::InvalidShardCount(512)));
        assert!(validate_shard_count(1).is_ok());
        assert!(validate_shard_count(8).is_ok());
    }

    #[test]
    fn test_four_leaf_tree_layout() {
        let leaves: Vec<Hash> = (0u8..4).map(|i| Hash::digest(&[i])).collect();
        let merkle = CrossShardMerkle::from_leaves(leaves.clone()).unwrap();
        let left = Hash::concat(&leaves[0], &leaves[1]);
        let right = Hash::concat(&leaves[2], &leaves[3]);
        assert_eq!(merkle.root(), Hash::concat(&left, &right));
        assert_eq!(merkle.path(2).unwrap(), vec![leaves[3], left]);
        assert_eq!(merkle.path(1).unwrap(), vec![leaves[0], right]);
    }

    #[test]
    fn test_every_shard_verifies() {
        let txs = txs();
        let merkle = CrossShardMerkle::build(&txs, 4).unwrap();
        let groups = group_coins_by_shard(&txs, 4).unwrap();
        for shard in 0..4u8 {
            let path = merkle.path(shard).unwrap();
            verify_merkle_path(&groups[shard as usize], shard, &path, &merkle.root(), 4).unwrap();
        }
    }

    #[test]
    fn test_single_shard_tree_has_empty_path() {
        let txs = txs();
        let merkle = CrossShardMerkle::build(&txs, 1).unwrap();
        assert!(merkle.path(0).unwrap().is_empty());
        let all: Vec<OutputCoin> = txs.iter().flat_map(|tx| tx.outputs.clone()).collect();
        verify_merkle_path(&all, 0, &[], &merkle.root(), 1).unwrap();
    }

    #[test]
    fn test_truncated_path_rejected() {
        let txs = txs();
        let merkle = CrossShardMerkle::build(&txs, 4).unwrap();
        let groups = group_coins_by_shard(&txs, 4).unwrap();
        let path = merkle.path(1).unwrap();
        assert_eq!(
            verify_merkle_path(&groups[1], 1, &path[..1], &merkle.root(), 4),
            Err(CrossShardError::PathLength {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_path_out_of_range_shard() {
        let merkle = CrossShardMerkle::build(&txs(), 4).unwrap();
        assert_eq!(
            merkle.path(4),
            Err(CrossShardError::ShardOutOfRange {
                shard: 4,
                shard_count: 4
            })
        );
    }
}
