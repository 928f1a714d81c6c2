//! Cryptographic primitives for the shardbft node.
//!
//! - [`hash`]: SHA3-256 digests used for headers, merkle nodes and message payloads.
//! - [`keys`]: validator keypairs, compressed public keys and ECDSA message signatures.
//! - [`multisig`]: the two-round commit-and-reveal Schnorr multisignature a committee
//!   uses to produce one aggregated signature per finalized block.

pub mod error;
pub mod hash;
pub mod keys;
pub mod multisig;

pub use error::{CryptoError, MultiSigError};
pub use hash::Hash;
pub use keys::{MessageSignature, ValidatorKey, ValidatorKeypair};
pub use multisig::{
    verify_aggregated, AggregatedSignature, Aggregation, CombinedCommit, CommittedSig, MultiSigScheme,
    NonceCommitment, PartialSignature,
};
