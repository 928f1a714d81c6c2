use shardbft_consensus::{ConfigError, EngineError};
use shardbft_core::{ChainLayer, CommitteeError, CrossShardError};
use shardbft_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DevnetError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("validator key derivation failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("invalid committee: {0}")]
    Committee(#[from] CommitteeError),

    #[error(transparent)]
    CrossShard(#[from] CrossShardError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{layer} has no validator {index}")]
    UnknownValidator { layer: ChainLayer, index: usize },

    #[error("{layer} reached height {reached}, target was {target}")]
    TargetMissed { layer: ChainLayer, reached: u64, target: u64 },

    #[error("validator task failed: {0}")]
    Task(String),
}
