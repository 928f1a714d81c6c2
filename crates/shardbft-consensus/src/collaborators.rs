//! Services a round calls but does not own.
//!
//! Implementations are shared between the concurrently running beacon and
//! shard rounds, so every trait is `Send + Sync` and every method takes `&self`.

use shardbft_core::{ChainLayer, Committee, CrossShardBlock, CrossShardRequest, PendingBlock, ShardBlock};
use shardbft_crypto::{Hash, ValidatorKey};
use std::sync::Arc;

use crate::error::CollaboratorError;
use crate::message::ConsensusMessage;

pub trait BlockBuilder: Send + Sync {
    /// Build an unsigned candidate for `layer` at `height` produced by `proposer`.
    fn build_candidate(
        &self,
        layer: ChainLayer,
        height: u64,
        proposer: &ValidatorKey,
    ) -> Result<PendingBlock, CollaboratorError>;
}

pub trait ChainReader: Send + Sync {
    fn best_state_hash(&self, layer: ChainLayer) -> Hash;

    fn best_height(&self, layer: ChainLayer) -> u64;

    /// Structural checks against local best state (parent link, height,
    /// already-consumed cross-shard inputs).
    fn pre_validate(&self, block: &PendingBlock) -> Result<(), CollaboratorError>;

    /// A finalized shard block by header hash, used to answer cross-shard re-requests.
    fn finalized_shard_block(&self, _hash: &Hash) -> Option<ShardBlock> {
        None
    }
}

/// Fire-and-forget outbound transport. Delivery is best effort.
pub trait NetworkSender: Send + Sync {
    fn broadcast_to_layer(&self, layer: ChainLayer, message: ConsensusMessage);

    fn send_cross_shard(&self, block: CrossShardBlock) {
        log::debug!(
            "no cross-shard transport, dropping block {} -> {}",
            block.from_shard(),
            block.to_shard
        );
    }

    fn request_cross_shard(&self, request: CrossShardRequest) {
        log::debug!(
            "no cross-shard transport, dropping request for {} from shard {}",
            request.block_hash,
            request.from_shard
        );
    }
}

pub trait CommitteeProvider: Send + Sync {
    fn committee(&self, layer: ChainLayer, height: u64) -> Result<Committee, CollaboratorError>;
}

pub trait FinalizedBlockSink: Send + Sync {
    fn block_finalized(&self, block: &PendingBlock) -> Result<(), CollaboratorError>;
}

/// The collaborators one round needs, cloned cheaply per round.
#[derive(Clone)]
pub struct RoundServices {
    pub builder: Arc<dyn BlockBuilder>,
    pub chain: Arc<dyn ChainReader>,
    pub network: Arc<dyn NetworkSender>,
    pub committees: Arc<dyn CommitteeProvider>,
}
