use log::{debug, warn};
use shardbft_crypto::Hash;
use std::collections::{BTreeMap, HashSet};

use crate::committee::Committee;
use crate::cross_shard::{validate_shard_count, CrossShardBlock};
use crate::error::CrossShardError;

/// Verified cross-shard blocks waiting to be consumed by their destination shard.
///
/// Blocks are keyed by `(source shard, source height, header hash)` so a shard
/// builder always sees them in a deterministic order.
#[derive(Debug)]
pub struct CrossShardPool {
    shard_count: usize,
    pending: BTreeMap<u8, BTreeMap<(u8, u64, Hash), CrossShardBlock>>,
    seen: HashSet<(Hash, u8)>,
}

impl CrossShardPool {
    pub fn new(shard_count: usize) -> Result<Self, CrossShardError> {
        validate_shard_count(shard_count)?;
        Ok(Self {
            shard_count,
            pending: BTreeMap::new(),
            seen: HashSet::new(),
        })
    }

    /// Verify `block` against its source committee and store it.
    ///
    /// Returns `Ok(false)` for a block already seen for the same destination.
    pub fn insert(&mut self, block: CrossShardBlock, source_committee: &Committee) -> Result<bool, CrossShardError> {
        let hash = block.hash()?;
        if self.seen.contains(&(hash, block.to_shard)) {
            debug!("cross-shard block {} -> {} already pooled", block.from_shard(), block.to_shard);
            return Ok(false);
        }
        if let Err(e) = block.verify(source_committee, self.shard_count) {
            warn!(
                "rejecting cross-shard block {} -> {} at height {}: {}",
                block.from_shard(),
                block.to_shard,
                block.height(),
                e
            );
            return Err(e);
        }

        self.seen.insert((hash, block.to_shard));
        self.pending
            .entry(block.to_shard)
            .or_default()
            .insert((block.from_shard(), block.height(), hash), block);
        Ok(true)
    }

    /// Blocks waiting for `to_shard`, in source order.
    pub fn pending_for_shard(&self, to_shard: u8) -> Vec<CrossShardBlock> {
        self.pending
            .get(&to_shard)
            .map(|blocks| blocks.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop blocks a finalized shard block has consumed.
    pub fn remove_consumed(&mut self, to_shard: u8, consumed: &[Hash]) {
        if let Some(blocks) = self.pending.get_mut(&to_shard) {
            blocks.retain(|(_, _, hash), _| !consumed.contains(hash));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
