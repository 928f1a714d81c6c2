//! Commit-and-reveal BFT consensus for the beacon chain and each shard.
//!
//! A [`ConsensusRound`] agrees on one block at one height through the
//! Propose/Listen, Prepare and Commit phases and produces a block carrying an
//! aggregated committee signature. The [`RoundEngine`] runs consecutive rounds
//! per layer, routes inbound messages to the active round and forwards
//! cross-shard outputs of finalized shard blocks.

pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod message;
pub mod round;
pub mod timer;
pub mod validation;

pub use collaborators::{BlockBuilder, ChainReader, CommitteeProvider, FinalizedBlockSink, NetworkSender, RoundServices};
pub use config::ConsensusConfig;
pub use engine::RoundEngine;
pub use error::{CollaboratorError, ConfigError, EngineError, MessageError, ProposalError, RoundError};
pub use message::{ConsensusMessage, MessageBody, MessageKind};
pub use round::{combine_threshold, nonce_quorum, ready_quorum, ConsensusRound, Phase, RoundSetup};
pub use timer::{DelayedAnnouncement, PhaseEnd, PhaseTimer};
pub use validation::ProposalContext;
