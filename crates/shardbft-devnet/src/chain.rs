//! In-memory beacon and shard chains shared by every engine of a devnet.
//!
//! One [`MemoryChain`] answers best-state queries, pre-validates proposals,
//! serves the (static) committees and accepts finalized blocks. Finalizing the
//! same block twice is a no-op, since every committee member reports it.

use log::info;
use parking_lot::RwLock;
use shardbft_consensus::{ChainReader, CollaboratorError, CommitteeProvider, FinalizedBlockSink};
use shardbft_core::{ChainLayer, Committee, PendingBlock, ShardBlock};
use shardbft_crypto::Hash;
use std::collections::{BTreeMap, HashMap, HashSet};

const DOMAIN_GENESIS: &[u8] = b"shardbft/genesis";

/// Parent hash of height 1 on `layer`.
pub fn genesis_hash(layer: ChainLayer) -> Hash {
    Hash::digest_parts(&[DOMAIN_GENESIS, layer.to_string().as_bytes()])
}

#[derive(Default)]
struct ChainState {
    /// Finalized blocks per layer; index `h - 1` holds height `h`
    layers: HashMap<ChainLayer, Vec<(Hash, PendingBlock)>>,
    shard_blocks: HashMap<Hash, ShardBlock>,
    consumed: HashSet<Hash>,
}

impl ChainState {
    fn tip(&self, layer: ChainLayer) -> (u64, Hash) {
        match self.layers.get(&layer).and_then(|blocks| blocks.last()) {
            Some((hash, block)) => (block.height(), *hash),
            None => (0, genesis_hash(layer)),
        }
    }

    fn hash_at(&self, layer: ChainLayer, height: u64) -> Option<Hash> {
        let index = usize::try_from(height.checked_sub(1)?).ok()?;
        self.layers
            .get(&layer)
            .and_then(|blocks| blocks.get(index))
            .map(|(hash, _)| *hash)
    }
}

pub struct MemoryChain {
    shard_count: usize,
    committees: BTreeMap<ChainLayer, Committee>,
    state: RwLock<ChainState>,
}

impl MemoryChain {
    pub fn new(shard_count: usize, committees: BTreeMap<ChainLayer, Committee>) -> Self {
        Self {
            shard_count,
            committees,
            state: RwLock::new(ChainState::default()),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    pub fn layers(&self) -> Vec<ChainLayer> {
        self.committees.keys().copied().collect()
    }

    pub fn tip(&self, layer: ChainLayer) -> (u64, Hash) {
        self.state.read().tip(layer)
    }

    pub fn block_at(&self, layer: ChainLayer, height: u64) -> Option<PendingBlock> {
        let index = usize::try_from(height.checked_sub(1)?).ok()?;
        self.state
            .read()
            .layers
            .get(&layer)
            .and_then(|blocks| blocks.get(index))
            .map(|(_, block)| block.clone())
    }

    /// Whether a cross-shard block (by source header hash) was already spent.
    pub fn is_consumed(&self, cross_shard_hash: &Hash) -> bool {
        self.state.read().consumed.contains(cross_shard_hash)
    }

    fn committee_for(&self, layer: ChainLayer) -> Result<&Committee, CollaboratorError> {
        self.committees
            .get(&layer)
            .ok_or_else(|| CollaboratorError::Unavailable(format!("no committee for {}", layer)))
    }

    fn check_links(&self, state: &ChainState, block: &PendingBlock) -> Result<(), CollaboratorError> {
        let layer = block.layer();
        let (best_height, best_hash) = state.tip(layer);
        if block.height() != best_height + 1 {
            return Err(CollaboratorError::Rejected(format!(
                "{} block at height {} does not extend best height {}",
                layer,
                block.height(),
                best_height
            )));
        }
        if block.prev_block_hash() != best_hash {
            return Err(CollaboratorError::Rejected(format!(
                "{} block at height {} does not link to {}",
                layer,
                block.height(),
                best_hash
            )));
        }
        Ok(())
    }

    fn check_contents(&self, state: &ChainState, block: &PendingBlock) -> Result<(), CollaboratorError> {
        match block {
            PendingBlock::Shard(shard_block) => {
                let mut seen = HashSet::new();
                for input in &shard_block.body.cross_shard_inputs {
                    let hash = input.hash()?;
                    if state.consumed.contains(&hash) || !seen.insert(hash) {
                        return Err(CollaboratorError::Rejected(format!(
                            "cross-shard block {} from shard {} already consumed",
                            hash,
                            input.from_shard()
                        )));
                    }
                }
            }
            PendingBlock::Beacon(beacon_block) => {
                for shard_state in &beacon_block.body.shard_states {
                    if usize::from(shard_state.shard_id) >= self.shard_count {
                        return Err(CollaboratorError::Rejected(format!(
                            "beacon block references unknown shard {}",
                            shard_state.shard_id
                        )));
                    }
                    let known = state.hash_at(ChainLayer::Shard(shard_state.shard_id), shard_state.height);
                    if known != Some(shard_state.block_hash) {
                        return Err(CollaboratorError::Rejected(format!(
                            "beacon block references unfinalized shard-{} block at height {}",
                            shard_state.shard_id, shard_state.height
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl ChainReader for MemoryChain {
    fn best_state_hash(&self, layer: ChainLayer) -> Hash {
        self.tip(layer).1
    }

    fn best_height(&self, layer: ChainLayer) -> u64 {
        self.tip(layer).0
    }

    fn pre_validate(&self, block: &PendingBlock) -> Result<(), CollaboratorError> {
        let state = self.state.read();
        self.check_links(&state, block)?;
        self.check_contents(&state, block)
    }

    fn finalized_shard_block(&self, hash: &Hash) -> Option<ShardBlock> {
        self.state.read().shard_blocks.get(hash).cloned()
    }
}

impl CommitteeProvider for MemoryChain {
    fn committee(&self, layer: ChainLayer, _height: u64) -> Result<Committee, CollaboratorError> {
        self.committee_for(layer).cloned()
    }
}

impl FinalizedBlockSink for MemoryChain {
    fn block_finalized(&self, block: &PendingBlock) -> Result<(), CollaboratorError> {
        let layer = block.layer();
        block.verify_finality(self.committee_for(layer)?)?;
        let hash = block.hash()?;

        let mut state = self.state.write();
        if let Some(stored) = state.hash_at(layer, block.height()) {
            if stored == hash {
                return Ok(());
            }
            return Err(CollaboratorError::Rejected(format!(
                "conflicting {} block {} at height {} (have {})",
                layer,
                hash,
                block.height(),
                stored
            )));
        }
        self.check_links(&state, block)?;
        self.check_contents(&state, block)?;

        if let PendingBlock::Shard(shard_block) = block {
            for input in &shard_block.body.cross_shard_inputs {
                let consumed = input.hash()?;
                state.consumed.insert(consumed);
            }
            state.shard_blocks.insert(hash, shard_block.clone());
        }
        state
            .layers
            .entry(layer)
            .or_default()
            .push((hash, block.clone()));

        let signers = block.consensus().map_or(0, |c| c.validators_idx_sig.len());
        info!("{}: finalized height {} block {} ({} signers)", layer, block.height(), hash, signers);
        Ok(())
    }
}
