use chrono::Utc;
use log::debug;
use parking_lot::Mutex;
use shardbft_consensus::{BlockBuilder, ChainReader, CollaboratorError};
use shardbft_core::{
    BeaconBlock, BeaconBody, ChainLayer, CrossShardPool, OutputCoin, PendingBlock, ShardBlock, ShardBody, ShardState,
    Transaction,
};
use shardbft_crypto::{Hash, ValidatorKey};
use std::sync::Arc;

use crate::chain::MemoryChain;

const DOMAIN_SAMPLE_TX: &[u8] = b"shardbft/devnet-tx";

/// Builds candidates from synthetic transactions, pending cross-shard
/// inputs and the latest finalized shard tips.
pub struct SampleBlockBuilder {
    chain: Arc<MemoryChain>,
    cross_shard_pool: Arc<Mutex<CrossShardPool>>,
    transactions_per_block: usize,
}

impl SampleBlockBuilder {
    pub fn new(
        chain: Arc<MemoryChain>,
        cross_shard_pool: Arc<Mutex<CrossShardPool>>,
        transactions_per_block: usize,
    ) -> Self {
        Self {
            chain,
            cross_shard_pool,
            transactions_per_block,
        }
    }

    /// Transaction `index` of a block. Its single output lands on shard
    /// `index % shard_count`, so consecutive transactions spread over every shard.
    fn sample_transaction(&self, shard_id: u8, height: u64, index: usize) -> Transaction {
        let seed = |tag: &[u8]| {
            Hash::digest_parts(&[
                DOMAIN_SAMPLE_TX,
                tag,
                &[shard_id],
                &height.to_le_bytes(),
                &(index as u64).to_le_bytes(),
            ])
        };
        let destination = (index % self.chain.shard_count()) as u8;
        Transaction {
            inputs: vec![seed(b"input")],
            outputs: vec![OutputCoin {
                public_key: vec![0x02, shard_id, destination],
                value: 100 + index as u64,
                serial: seed(b"serial"),
            }],
            fee: 1,
        }
    }

    fn build_shard(&self, shard_id: u8, height: u64, proposer: &ValidatorKey) -> Result<ShardBlock, CollaboratorError> {
        let layer = ChainLayer::Shard(shard_id);
        let transactions = (0..self.transactions_per_block)
            .map(|index| self.sample_transaction(shard_id, height, index))
            .collect();
        let cross_shard_inputs: Vec<_> = self
            .cross_shard_pool
            .lock()
            .pending_for_shard(shard_id)
            .into_iter()
            .filter(|input| input.hash().map_or(false, |hash| !self.chain.is_consumed(&hash)))
            .collect();
        if !cross_shard_inputs.is_empty() {
            debug!("{}: including {} cross-shard inputs", layer, cross_shard_inputs.len());
        }

        let block = ShardBlock::new(
            shard_id,
            height,
            self.chain.best_state_hash(layer),
            proposer.clone(),
            Utc::now().timestamp(),
            self.chain.best_height(ChainLayer::Beacon),
            ShardBody {
                transactions,
                cross_shard_inputs,
            },
            self.chain.shard_count(),
        )?;
        Ok(block)
    }

    fn build_beacon(&self, height: u64, proposer: &ValidatorKey) -> Result<BeaconBlock, CollaboratorError> {
        let shard_states = (0..self.chain.shard_count())
            .map(|shard| shard as u8)
            .filter_map(|shard_id| {
                let (height, block_hash) = self.chain.tip(ChainLayer::Shard(shard_id));
                (height > 0).then_some(ShardState {
                    shard_id,
                    height,
                    block_hash,
                })
            })
            .collect();

        let block = BeaconBlock::new(
            height,
            self.chain.best_state_hash(ChainLayer::Beacon),
            proposer.clone(),
            Utc::now().timestamp(),
            BeaconBody { shard_states },
        )?;
        Ok(block)
    }
}

impl BlockBuilder for SampleBlockBuilder {
    fn build_candidate(
        &self,
        layer: ChainLayer,
        height: u64,
        proposer: &ValidatorKey,
    ) -> Result<PendingBlock, CollaboratorError> {
        match layer {
            ChainLayer::Beacon => self.build_beacon(height, proposer).map(PendingBlock::Beacon),
            ChainLayer::Shard(shard_id) => self.build_shard(shard_id, height, proposer).map(PendingBlock::Shard),
        }
    }
}
