// VALIDATOR KEYS & MESSAGE AUTHENTICATION
// Every committee member is identified by a compressed secp256k1 public key.
//
// SAFETY INVARIANTS:
// 1. A ValidatorKey is only usable after it decodes to a non-identity curve point
// 2. The same secret backs both ECDSA message signatures and multisig partial signatures
// 3. Verification never panics on attacker-supplied bytes

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::{AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint, Scalar};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CryptoError;

/// Length of a SEC1 compressed secp256k1 point.
pub const COMPRESSED_POINT_LEN: usize = 33;

/// Public identity of a validator: SEC1 compressed secp256k1 point.
///
/// Ordering is byte-wise so maps keyed by validator are deterministic.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValidatorKey(Vec<u8>);

impl ValidatorKey {
    /// Parse a compressed public key, rejecting anything that is not a valid point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != COMPRESSED_POINT_LEN {
            return Err(CryptoError::InvalidPublicKey);
        }
        decode_point(bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self(bytes.to_vec()))
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Decode to a curve point. Fails for keys that arrived through deserialization
    /// without passing [`ValidatorKey::from_bytes`].
    pub fn to_point(&self) -> Result<ProjectivePoint, CryptoError> {
        decode_point(&self.0).map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// Verify an ECDSA signature over `message` made by this key.
    pub fn verify(&self, message: &[u8], signature: &MessageSignature) -> Result<(), CryptoError> {
        let verifying_key =
            VerifyingKey::from_sec1_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        let signature =
            Signature::from_slice(&signature.0).map_err(|_| CryptoError::MalformedSignature)?;
        verifying_key
            .verify(message, &signature)
            .map_err(|_| CryptoError::SignatureMismatch)
    }
}

impl fmt::Display for ValidatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.to_hex();
        write!(f, "{}", &encoded[..encoded.len().min(12)])
    }
}

impl fmt::Debug for ValidatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValidatorKey({})", self)
    }
}

/// ECDSA signature (64-byte `r || s`) over an arbitrary message.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MessageSignature(pub Vec<u8>);

impl MessageSignature {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for MessageSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageSignature({} bytes)", self.0.len())
    }
}

/// A validator's secret key together with its public identity.
pub struct ValidatorKeypair {
    signing_key: SigningKey,
    public: ValidatorKey,
}

impl ValidatorKeypair {
    /// Generate a fresh keypair from the operating system RNG.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Deterministic keypair from a 32-byte secret. Used by devnets and tests.
    pub fn from_seed(seed: [u8; 32]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_bytes(&FieldBytes::from(seed))
            .map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let point = ProjectivePoint::GENERATOR * secret_scalar(&signing_key);
        let public = ValidatorKey(encode_point(&point));
        Self {
            signing_key,
            public,
        }
    }

    pub fn public(&self) -> &ValidatorKey {
        &self.public
    }

    /// ECDSA-sign `message`.
    pub fn sign(&self, message: &[u8]) -> MessageSignature {
        let signature: Signature = self.signing_key.sign(message);
        MessageSignature(signature.to_bytes().to_vec())
    }

    pub(crate) fn secret(&self) -> Scalar {
        secret_scalar(&self.signing_key)
    }
}

impl fmt::Debug for ValidatorKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatorKeypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

fn secret_scalar(signing_key: &SigningKey) -> Scalar {
    let scalar: &Scalar = signing_key.as_nonzero_scalar().as_ref();
    *scalar
}

/// SEC1-compressed encoding of a point.
pub(crate) fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

/// Decode a SEC1 point and reject the identity.
pub(crate) fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint, CryptoError> {
    let encoded = EncodedPoint::from_bytes(bytes).map_err(|_| CryptoError::InvalidPoint)?;
    let affine: Option<AffinePoint> = AffinePoint::from_encoded_point(&encoded).into();
    let point = ProjectivePoint::from(affine.ok_or(CryptoError::InvalidPoint)?);
    if point == ProjectivePoint::IDENTITY {
        return Err(CryptoError::InvalidPoint);
    }
    Ok(point)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_keypair_is_deterministic() {
        let a = ValidatorKeypair::from_seed([7u8; 32]).unwrap();
        let b = ValidatorKeypair::from_seed([7u8; 32]).unwrap();
        assert_eq!(a.public(), b.public());
        assert_eq!(a.public().as_bytes().len(), COMPRESSED_POINT_LEN);
    }

    #[test]
    fn test_zero_seed_rejected() {
        assert_eq!(
            ValidatorKeypair::from_seed([0u8; 32]).unwrap_err(),
            CryptoError::InvalidSecretKey
        );
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = ValidatorKeypair::generate();
        let sig = keypair.sign(b"ready");
        assert!(keypair.public().verify(b"ready", &sig).is_ok());
        assert_eq!(
            keypair.public().verify(b"tampered", &sig),
            Err(CryptoError::SignatureMismatch)
        );
    }

    #[test]
    fn test_verify_rejects_wrong_signer() {
        let alice = ValidatorKeypair::from_seed([1u8; 32]).unwrap();
        let bob = ValidatorKeypair::from_seed([2u8; 32]).unwrap();
        let sig = alice.sign(b"payload");
        assert!(bob.public().verify(b"payload", &sig).is_err());
    }

    #[test]
    fn test_malformed_inputs_are_rejected() {
        assert!(ValidatorKey::from_bytes(&[2u8; 5]).is_err());
        assert!(ValidatorKey::from_bytes(&[9u8; COMPRESSED_POINT_LEN]).is_err());

        let keypair = ValidatorKeypair::generate();
        assert_eq!(
            keypair.public().verify(b"x", &MessageSignature(vec![1, 2, 3])),
            Err(CryptoError::MalformedSignature)
        );
    }

    #[test]
    fn test_hex_round_trip() {
        let keypair = ValidatorKeypair::from_seed([3u8; 32]).unwrap();
        let parsed = ValidatorKey::from_hex(&keypair.public().to_hex()).unwrap();
        assert_eq!(&parsed, keypair.public());
    }
}
