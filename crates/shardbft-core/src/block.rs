// BEACON & SHARD BLOCKS
// A block is proposed by one committee member, agreed on by the committee and
// finalized once the consensus artifacts are attached.
//
// SAFETY INVARIANTS:
// 1. The header hash covers every header field; body fields are bound through header roots
// 2. Consensus artifacts live outside the header so attaching them never changes the hash
// 3. A block is final only when its aggregated signature verifies against the committee
// 4. Decoding a block for the wrong layer is a typed rejection, never a panic

use serde::{Deserialize, Serialize};
use shardbft_crypto::{
    verify_aggregated, AggregatedSignature, Hash, MessageSignature, MultiSigError,
    NonceCommitment, ValidatorKey, ValidatorKeypair,
};

use crate::committee::{ChainLayer, Committee};
use crate::cross_shard::{compute_shard_tx_root, CrossShardBlock};
use crate::error::BlockError;
use crate::transaction::Transaction;

const DOMAIN_TX_ROOT: &[u8] = b"shardbft/tx-root";
const DOMAIN_SHARD_STATES: &[u8] = b"shardbft/shard-states";

/// SHA3-256 of the bincode encoding of `value`.
pub(crate) fn canonical_hash<T: Serialize>(value: &T) -> Result<Hash, bincode::Error> {
    Ok(Hash::digest(&bincode::serialize(value)?))
}

// ==================== CONSENSUS ARTIFACTS ====================

/// Output of a successful commit phase, attached to the finalized block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusArtifacts {
    /// Combined randomness `R`
    pub r: NonceCommitment,

    pub aggregated_sig: AggregatedSignature,

    /// Committee indices whose nonces were combined into `R`
    pub validators_idx_r: Vec<usize>,

    /// Committee indices whose partial signatures are in `aggregated_sig`
    pub validators_idx_sig: Vec<usize>,
}

impl ConsensusArtifacts {
    /// Check the aggregated signature over `message` and that a strict
    /// majority of the committee signed.
    pub fn verify(&self, committee: &Committee, message: &Hash) -> Result<(), MultiSigError> {
        if self.validators_idx_sig.len() < committee.majority() {
            return Err(MultiSigError::InsufficientSigners {
                signers: self.validators_idx_sig.len(),
                committee_size: committee.len(),
            });
        }
        verify_aggregated(
            committee.members(),
            &self.validators_idx_r,
            &self.validators_idx_sig,
            &self.r,
            &self.aggregated_sig,
            message,
        )
    }
}

// ==================== SHARD BLOCK ====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardHeader {
    pub shard_id: u8,
    pub height: u64,
    pub prev_block_hash: Hash,
    pub producer: ValidatorKey,
    pub timestamp: i64,

    /// Beacon height this block was built against
    pub beacon_height: u64,

    /// Commitment over transactions and consumed cross-shard inputs
    pub tx_root: Hash,

    /// Root of the per-destination output coin merkle tree
    pub shard_tx_root: Hash,
}

impl ShardHeader {
    pub fn hash(&self) -> Result<Hash, BlockError> {
        canonical_hash(self).map_err(|e| BlockError::Encoding(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardBody {
    pub transactions: Vec<Transaction>,

    /// Cross-shard blocks whose coins this block brings into the shard
    pub cross_shard_inputs: Vec<CrossShardBlock>,
}

impl ShardBody {
    pub fn tx_root(&self) -> Result<Hash, BlockError> {
        let mut parts: Vec<Hash> = self.transactions.iter().map(Transaction::hash).collect();
        for input in &self.cross_shard_inputs {
            parts.push(input.hash()?);
        }
        let mut slices: Vec<&[u8]> = Vec::with_capacity(parts.len() + 1);
        slices.push(DOMAIN_TX_ROOT);
        slices.extend(parts.iter().map(|h| h.as_bytes().as_slice()));
        Ok(Hash::digest_parts(&slices))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardBlock {
    pub header: ShardHeader,
    pub body: ShardBody,
    pub producer_sig: MessageSignature,
    pub consensus: Option<ConsensusArtifacts>,
}

impl ShardBlock {
    /// Build an unsigned block, filling both header roots from `body`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard_id: u8,
        height: u64,
        prev_block_hash: Hash,
        producer: ValidatorKey,
        timestamp: i64,
        beacon_height: u64,
        body: ShardBody,
        shard_count: usize,
    ) -> Result<Self, BlockError> {
        let tx_root = body.tx_root()?;
        let shard_tx_root = compute_shard_tx_root(&body.transactions, shard_count)?;
        Ok(Self {
            header: ShardHeader {
                shard_id,
                height,
                prev_block_hash,
                producer,
                timestamp,
                beacon_height,
                tx_root,
                shard_tx_root,
            },
            body,
            producer_sig: MessageSignature::default(),
            consensus: None,
        })
    }

    pub fn hash(&self) -> Result<Hash, BlockError> {
        self.header.hash()
    }

    /// Recompute both header roots from the body.
    pub fn check_body_commitments(&self, shard_count: usize) -> Result<(), BlockError> {
        if self.body.tx_root()? != self.header.tx_root {
            return Err(BlockError::TxRootMismatch);
        }
        if compute_shard_tx_root(&self.body.transactions, shard_count)? != self.header.shard_tx_root {
            return Err(BlockError::ShardTxRootMismatch);
        }
        Ok(())
    }
}

// ==================== BEACON BLOCK ====================

/// Latest shard block the beacon chain has observed for one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardState {
    pub shard_id: u8,
    pub height: u64,
    pub block_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconHeader {
    pub height: u64,
    pub prev_block_hash: Hash,
    pub producer: ValidatorKey,
    pub timestamp: i64,
    pub shard_states_root: Hash,
}

impl BeaconHeader {
    pub fn hash(&self) -> Result<Hash, BlockError> {
        canonical_hash(self).map_err(|e| BlockError::Encoding(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconBody {
    pub shard_states: Vec<ShardState>,
}

impl BeaconBody {
    pub fn shard_states_root(&self) -> Result<Hash, BlockError> {
        let encoded =
            bincode::serialize(&self.shard_states).map_err(|e| BlockError::Encoding(e.to_string()))?;
        Ok(Hash::digest_parts(&[DOMAIN_SHARD_STATES, &encoded]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconBlock {
    pub header: BeaconHeader,
    pub body: BeaconBody,
    pub producer_sig: MessageSignature,
    pub consensus: Option<ConsensusArtifacts>,
}

impl BeaconBlock {
    pub fn new(
        height: u64,
        prev_block_hash: Hash,
        producer: ValidatorKey,
        timestamp: i64,
        body: BeaconBody,
    ) -> Result<Self, BlockError> {
        let shard_states_root = body.shard_states_root()?;
        Ok(Self {
            header: BeaconHeader {
                height,
                prev_block_hash,
                producer,
                timestamp,
                shard_states_root,
            },
            body,
            producer_sig: MessageSignature::default(),
            consensus: None,
        })
    }

    pub fn hash(&self) -> Result<Hash, BlockError> {
        self.header.hash()
    }

    pub fn check_body_commitments(&self) -> Result<(), BlockError> {
        if self.body.shard_states_root()? != self.header.shard_states_root {
            return Err(BlockError::ShardStatesRootMismatch);
        }
        Ok(())
    }
}

// ==================== PENDING BLOCK ====================

/// The block under agreement in one round, selected by layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingBlock {
    Beacon(BeaconBlock),
    Shard(ShardBlock),
}

impl PendingBlock {
    pub fn layer(&self) -> ChainLayer {
        match self {
            PendingBlock::Beacon(_) => ChainLayer::Beacon,
            PendingBlock::Shard(block) => ChainLayer::Shard(block.header.shard_id),
        }
    }

    pub fn height(&self) -> u64 {
        match self {
            PendingBlock::Beacon(block) => block.header.height,
            PendingBlock::Shard(block) => block.header.height,
        }
    }

    pub fn prev_block_hash(&self) -> Hash {
        match self {
            PendingBlock::Beacon(block) => block.header.prev_block_hash,
            PendingBlock::Shard(block) => block.header.prev_block_hash,
        }
    }

    pub fn producer(&self) -> &ValidatorKey {
        match self {
            PendingBlock::Beacon(block) => &block.header.producer,
            PendingBlock::Shard(block) => &block.header.producer,
        }
    }

    pub fn producer_sig(&self) -> &MessageSignature {
        match self {
            PendingBlock::Beacon(block) => &block.producer_sig,
            PendingBlock::Shard(block) => &block.producer_sig,
        }
    }

    pub fn hash(&self) -> Result<Hash, BlockError> {
        match self {
            PendingBlock::Beacon(block) => block.hash(),
            PendingBlock::Shard(block) => block.hash(),
        }
    }

    pub fn consensus(&self) -> Option<&ConsensusArtifacts> {
        match self {
            PendingBlock::Beacon(block) => block.consensus.as_ref(),
            PendingBlock::Shard(block) => block.consensus.as_ref(),
        }
    }

    pub fn set_consensus(&mut self, artifacts: ConsensusArtifacts) {
        match self {
            PendingBlock::Beacon(block) => block.consensus = Some(artifacts),
            PendingBlock::Shard(block) => block.consensus = Some(artifacts),
        }
    }

    pub fn cross_shard_inputs(&self) -> &[CrossShardBlock] {
        match self {
            PendingBlock::Beacon(_) => &[],
            PendingBlock::Shard(block) => &block.body.cross_shard_inputs,
        }
    }

    /// Sign the header hash as the block producer.
    pub fn sign_as_producer(&mut self, keypair: &ValidatorKeypair) -> Result<(), BlockError> {
        let signature = keypair.sign(self.hash()?.as_bytes());
        match self {
            PendingBlock::Beacon(block) => block.producer_sig = signature,
            PendingBlock::Shard(block) => block.producer_sig = signature,
        }
        Ok(())
    }

    pub fn verify_producer_signature(&self) -> Result<(), BlockError> {
        let hash = self.hash()?;
        self.producer()
            .verify(hash.as_bytes(), self.producer_sig())
            .map_err(BlockError::ProducerSignature)
    }

    pub fn check_body_commitments(&self, shard_count: usize) -> Result<(), BlockError> {
        match self {
            PendingBlock::Beacon(block) => block.check_body_commitments(),
            PendingBlock::Shard(block) => block.check_body_commitments(shard_count),
        }
    }

    /// Verify the attached consensus artifacts against `committee`.
    pub fn verify_finality(&self, committee: &Committee) -> Result<(), BlockError> {
        let artifacts = self.consensus().ok_or(BlockError::NotFinalized)?;
        artifacts.verify(committee, &self.hash()?)?;
        Ok(())
    }

    pub fn is_final(&self, committee: &Committee) -> bool {
        self.verify_finality(committee).is_ok()
    }

    /// Encode the inner block for a `Propose` payload.
    pub fn encode(&self) -> Result<Vec<u8>, BlockError> {
        let encoded = match self {
            PendingBlock::Beacon(block) => bincode::serialize(block),
            PendingBlock::Shard(block) => bincode::serialize(block),
        };
        encoded.map_err(|e| BlockError::Encoding(e.to_string()))
    }

    /// Decode a `Propose` payload as the block type `layer` carries.
    pub fn decode(layer: ChainLayer, bytes: &[u8]) -> Result<Self, BlockError> {
        let block = match layer {
            ChainLayer::Beacon => bincode::deserialize::<BeaconBlock>(bytes).map(PendingBlock::Beacon),
            ChainLayer::Shard(_) => bincode::deserialize::<ShardBlock>(bytes).map(PendingBlock::Shard),
        }
        .map_err(|e| BlockError::Encoding(e.to_string()))?;

        if block.layer() != layer {
            return Err(BlockError::LayerMismatch {
                expected: layer,
                actual: block.layer(),
            });
        }
        Ok(block)
    }
}
