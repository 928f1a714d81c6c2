use thiserror::Error;

/// Errors raised while decoding or checking keys, points and signatures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid public key encoding")]
    InvalidPublicKey,

    #[error("invalid secret key")]
    InvalidSecretKey,

    #[error("invalid curve point encoding")]
    InvalidPoint,

    #[error("invalid scalar encoding")]
    InvalidScalar,

    #[error("malformed signature")]
    MalformedSignature,

    #[error("signature verification failed")]
    SignatureMismatch,

    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

/// Errors raised by the commit-and-reveal multisignature.
///
/// Every variant is a rejection of input that may have been produced by a
/// remote committee member; none of them indicate a local programming error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultiSigError {
    #[error("nonce has not been prepared for this round")]
    NonceNotPrepared,

    #[error("no message digest has been set for this round")]
    NoDataToSign,

    #[error("validator {0} is not a committee member")]
    UnknownSigner(String),

    #[error("validator index {index} out of range for committee of {committee_size}")]
    IndexOutOfRange { index: usize, committee_size: usize },

    #[error("validator index list is empty")]
    EmptyIndexList,

    #[error("duplicate validator index {0}")]
    DuplicateIndex(usize),

    #[error("local nonce commitment missing from collected set")]
    LocalNonceMissing,

    #[error("signer {0} did not contribute to the combined randomness")]
    SignerNotInNonceSet(String),

    #[error("nonce commitment of {0} differs from its revealed value")]
    NonceMismatch(String),

    #[error("partial signature from {0} does not verify")]
    InvalidPartialSignature(String),

    #[error("partial signatures were produced under different nonce sets")]
    MismatchedNonceSet,

    #[error("duplicate partial signature from {0}")]
    DuplicateSigner(String),

    #[error("signer index {0} did not contribute to the combined randomness")]
    SignerIndexNotInNonceSet(usize),

    #[error("nonces of a full signer set do not sum to the combined randomness")]
    NonceSumMismatch,

    #[error("no partial signatures to combine")]
    NothingToCombine,

    #[error("aggregated signature carries {signers} signers, committee of {committee_size} needs a majority")]
    InsufficientSigners { signers: usize, committee_size: usize },

    #[error("aggregated signature does not verify")]
    InvalidAggregatedSignature,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
