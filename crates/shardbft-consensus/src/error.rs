use shardbft_core::{BlockError, ChainLayer, CrossShardError};
use shardbft_crypto::{CryptoError, MultiSigError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("announce delay {announce_delay_ms}ms must be shorter than the {phase_window_ms}ms phase window")]
    AnnounceDelayTooLong { announce_delay_ms: u64, phase_window_ms: u64 },

    #[error("max_round_attempts must be greater than zero")]
    ZeroAttempts,

    #[error("shard count {0} is not a power of two in 1..=256")]
    ShardCount(usize),
}

/// Rejection of an inbound consensus message. Never round-fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("message encoding failed: {0}")]
    Encoding(String),

    #[error("sender {0} is not in the committee")]
    UnknownSender(String),

    #[error("message signature invalid: {0}")]
    BadSignature(#[from] CryptoError),
}

/// Failure reported by an external collaborator (builder, chain, network).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    CrossShard(#[from] CrossShardError),
}

/// Why a received (or self-built) block is not a valid proposal for this round.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProposalError {
    #[error("proposal for {actual}, round runs {expected}")]
    WrongLayer { expected: ChainLayer, actual: ChainLayer },

    #[error("proposal at height {actual}, round runs height {expected}")]
    WrongHeight { expected: u64, actual: u64 },

    #[error("producer {0} is not in the committee")]
    ProducerNotInCommittee(String),

    #[error("proposal relayed by {sender} but produced by {producer}")]
    SenderNotProducer { sender: String, producer: String },

    #[error("cross-shard input from shard {from_shard} rejected: {source}")]
    CrossShardInput { from_shard: u8, source: CrossShardError },

    #[error("cross-shard input addressed to shard {actual} in a block for {expected}")]
    MisroutedCrossShardInput { expected: ChainLayer, actual: u8 },

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Chain(#[from] CollaboratorError),
}

/// Round-fatal outcome of [`crate::round::ConsensusRound::start`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoundError {
    #[error("consensus quit")]
    Quit,

    #[error("not enough ready ({received} of {required})")]
    NotEnoughReady { received: usize, required: usize },

    #[error("listen timeout")]
    ListenTimeout,

    #[error("not enough Ri ({collected} of {required})")]
    NotEnoughRi { collected: usize, required: usize },

    #[error("not enough sigs to combine")]
    NotEnoughSigs,

    #[error("invalid partial signature from {signer}: {source}")]
    InvalidPartialSignature { signer: String, source: MultiSigError },

    #[error("invalid proposal: {0}")]
    InvalidProposal(#[from] ProposalError),

    #[error("local node is not in the committee")]
    NotInCommittee,

    #[error("multisignature failed: {0}")]
    MultiSig(#[from] MultiSigError),

    #[error("block builder failed: {0}")]
    Builder(CollaboratorError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Message(#[from] MessageError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no committee for {layer}: {source}")]
    Committee { layer: ChainLayer, source: CollaboratorError },

    #[error("round for {layer} at height {height} failed: {source}")]
    Round {
        layer: ChainLayer,
        height: u64,
        source: RoundError,
    },

    #[error("cross-shard block from shard {from_shard} rejected: {source}")]
    CrossShard { from_shard: u8, source: CrossShardError },

    #[error("finalized block rejected by sink: {0}")]
    Sink(CollaboratorError),

    #[error("engine shut down")]
    Shutdown,
}
