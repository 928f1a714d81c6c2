use shardbft_crypto::{CryptoError, MultiSigError};
use thiserror::Error;

use crate::committee::ChainLayer;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitteeError {
    #[error("committee is empty")]
    Empty,

    #[error("validator {0} appears twice in the committee")]
    DuplicateMember(String),
}

/// Errors raised while encoding, signing or checking beacon and shard blocks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("block encoding failed: {0}")]
    Encoding(String),

    #[error("block payload is for {actual}, expected {expected}")]
    LayerMismatch { expected: ChainLayer, actual: ChainLayer },

    #[error("producer signature invalid: {0}")]
    ProducerSignature(CryptoError),

    #[error("transaction root does not match block body")]
    TxRootMismatch,

    #[error("cross-shard root does not match block body")]
    ShardTxRootMismatch,

    #[error("shard state root does not match block body")]
    ShardStatesRootMismatch,

    #[error("block carries no consensus artifacts")]
    NotFinalized,

    #[error("consensus artifacts invalid: {0}")]
    Consensus(#[from] MultiSigError),

    #[error(transparent)]
    CrossShard(#[from] CrossShardError),
}

/// Errors raised while building or verifying cross-shard merkle proofs.
///
/// Every variant is a hard rejection of the cross-shard block it was raised for.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrossShardError {
    #[error("shard count {0} is not a power of two in 1..=256")]
    InvalidShardCount(usize),

    #[error("shard {shard} out of range for {shard_count} shards")]
    ShardOutOfRange { shard: u8, shard_count: usize },

    #[error("cross-shard block from shard {0} addressed to itself")]
    SameShard(u8),

    #[error("cross-shard block addressed to shard {actual}, expected {expected}")]
    WrongDestination { expected: u8, actual: u8 },

    #[error("source block is not finalized")]
    NotFinalized,

    #[error("merkle path has {actual} entries, expected {expected}")]
    PathLength { expected: usize, actual: usize },

    #[error("merkle path does not reconstruct the committed shard root")]
    RootMismatch,

    #[error("aggregated signature rejected: {0}")]
    Signature(#[from] MultiSigError),

    #[error("cross-shard encoding failed: {0}")]
    Encoding(String),
}
