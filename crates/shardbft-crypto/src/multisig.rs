// COMMIT-AND-REVEAL SCHNORR MULTISIGNATURE
// Two-round multisignature over a committee, no trusted aggregator.
//
//   round 1 (Prepare): every participant samples a nonce r_i and reveals R_i = r_i·G
//   round 2 (Commit):  R = Σ R_i over the contributors idxR,
//                      X~ = Σ a_j·X_j with a_j = H(L || X_j), L = H(X_j for j in idxR),
//                      c = H(X~ || R || m), s_i = r_i + c·a_i·x_i
//   aggregate:         over signers idxSig ⊆ idxR, s = Σ s_i and R_sig = Σ R_i,
//                      valid iff s·G == R_sig + c·Σ a_i·X_i (i in idxSig)
//
// The challenge stays bound to R and idxR, so a majority of the contributors
// can finish the round when a contributor withholds its partial signature.
//
// SAFETY INVARIANTS:
// 1. A local nonce signs at most once (the secret is consumed by sign_data)
// 2. Partial signatures are only combined when they share R and idxR
// 3. Signers of an aggregate are a subset of the nonce contributors
// 4. When every contributor signed, R_sig must equal R
// 5. All decoding of remote points/scalars is fallible, never panicking

use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::{Field, PrimeField};
use k256::{FieldBytes, ProjectivePoint, Scalar, U256};
use log::debug;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{CryptoError, MultiSigError};
use crate::hash::Hash;
use crate::keys::{decode_point, encode_point, ValidatorKey, ValidatorKeypair, COMPRESSED_POINT_LEN};

const DOMAIN_KEY_LIST: &[u8] = b"shardbft/multisig/key-list";
const DOMAIN_KEY_COEFFICIENT: &[u8] = b"shardbft/multisig/key-coefficient";
const DOMAIN_CHALLENGE: &[u8] = b"shardbft/multisig/challenge";

// ==================== WIRE TYPES ====================

/// A public nonce commitment: a participant's `R_i`, or the combined `R`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NonceCommitment(Vec<u8>);

impl NonceCommitment {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != COMPRESSED_POINT_LEN {
            return Err(CryptoError::InvalidPoint);
        }
        decode_point(bytes)?;
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn to_point(&self) -> Result<ProjectivePoint, CryptoError> {
        decode_point(&self.0)
    }

    fn from_point(point: &ProjectivePoint) -> Self {
        Self(encode_point(point))
    }
}

impl fmt::Debug for NonceCommitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.to_hex();
        write!(f, "NonceCommitment({})", &encoded[..encoded.len().min(12)])
    }
}

/// One committee member's contribution to the aggregated signature.
///
/// Carries the signer's own `R_i` so the partial signature can be checked on
/// its own, and so aggregation can confirm the nonces add up to `R`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignature {
    pub nonce: NonceCommitment,
    pub s: [u8; 32],
}

/// A verified partial signature as collected during the commit phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedSig {
    pub signer: ValidatorKey,
    pub signature: PartialSignature,
    pub validators_idx_r: Vec<usize>,
}

/// The aggregated scalar `s` and the signers' nonce sum `R_sig`; verified
/// together with `R` and the index lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedSignature {
    pub nonce: NonceCommitment,
    pub s: [u8; 32],
}

/// Local result of the reveal round: the combined randomness, who contributed
/// to it, and this node's partial signature under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedCommit {
    pub r: NonceCommitment,
    pub validators_idx_r: Vec<usize>,
    pub commit_sig: PartialSignature,
}

/// Output of [`MultiSigScheme::combine_sigs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregation {
    pub signature: AggregatedSignature,
    pub validators_idx_sig: Vec<usize>,
}

// ==================== SCHEME ====================

/// Per-round multisignature state for one committee member.
///
/// Lifecycle: [`prepare`](Self::prepare) once at round start,
/// [`set_data_to_sign`](Self::set_data_to_sign) once the block is known,
/// [`sign_data`](Self::sign_data) at the end of the reveal round, then
/// [`verify_commit_sig`](Self::verify_commit_sig) /
/// [`combine_sigs`](Self::combine_sigs) during commit.
pub struct MultiSigScheme {
    keypair: Arc<ValidatorKeypair>,
    committee: Vec<ValidatorKey>,
    nonce_secret: Option<Scalar>,
    nonce_commitment: Option<NonceCommitment>,
    data_to_sign: Option<Hash>,
    combine: Option<CombinedCommit>,
}

impl MultiSigScheme {
    pub fn new(keypair: Arc<ValidatorKeypair>, committee: Vec<ValidatorKey>) -> Self {
        Self {
            keypair,
            committee,
            nonce_secret: None,
            nonce_commitment: None,
            data_to_sign: None,
            combine: None,
        }
    }

    /// Sample this round's private nonce and return its public commitment `R_i`.
    ///
    /// Calling it again replaces the nonce; a round calls it exactly once.
    pub fn prepare(&mut self) -> NonceCommitment {
        let secret = Scalar::random(&mut OsRng);
        let commitment = NonceCommitment::from_point(&(ProjectivePoint::GENERATOR * secret));
        self.nonce_secret = Some(secret);
        self.nonce_commitment = Some(commitment.clone());
        self.combine = None;
        commitment
    }

    pub fn nonce_commitment(&self) -> Option<&NonceCommitment> {
        self.nonce_commitment.as_ref()
    }

    pub fn set_data_to_sign(&mut self, digest: Hash) {
        self.data_to_sign = Some(digest);
    }

    pub fn data_to_sign(&self) -> Option<Hash> {
        self.data_to_sign
    }

    pub fn combined(&self) -> Option<&CombinedCommit> {
        self.combine.as_ref()
    }

    pub fn committee(&self) -> &[ValidatorKey] {
        &self.committee
    }

    /// Combine the collected `R_i` into `R` and sign the round digest under it.
    ///
    /// `collected` must contain this node's own commitment. Keys outside the
    /// committee are rejected rather than skipped: the caller only inserts
    /// authenticated committee members.
    pub fn sign_data(
        &mut self,
        collected: &BTreeMap<ValidatorKey, NonceCommitment>,
    ) -> Result<&CombinedCommit, MultiSigError> {
        let data = self.data_to_sign.ok_or(MultiSigError::NoDataToSign)?;
        let own_commitment = self
            .nonce_commitment
            .clone()
            .ok_or(MultiSigError::NonceNotPrepared)?;
        let own_key = self.keypair.public().clone();

        match collected.get(&own_key) {
            Some(commitment) if *commitment == own_commitment => {}
            Some(_) => return Err(MultiSigError::NonceMismatch(own_key.to_string())),
            None => return Err(MultiSigError::LocalNonceMissing),
        }

        let mut validators_idx_r = Vec::with_capacity(collected.len());
        let mut r = ProjectivePoint::IDENTITY;
        for (key, commitment) in collected {
            validators_idx_r.push(self.index_of(key)?);
            r += commitment.to_point()?;
        }
        validators_idx_r.sort_unstable();

        let aggregation = aggregate_keys(&self.committee, &validators_idx_r)?;
        let c = challenge(&aggregation.aggregated, &r, &data);
        let own_index = self.index_of(&own_key)?;
        let a = aggregation.coefficient(own_index)?;

        let secret = self
            .nonce_secret
            .take()
            .ok_or(MultiSigError::NonceNotPrepared)?;
        let s = secret + c * a * self.keypair.secret();

        debug!(
            "multisig: {} signed under R from {} contributors",
            own_key,
            validators_idx_r.len()
        );

        Ok(self.combine.insert(CombinedCommit {
            r: NonceCommitment::from_point(&r),
            validators_idx_r,
            commit_sig: PartialSignature {
                nonce: own_commitment,
                s: scalar_to_bytes(&s),
            },
        }))
    }

    /// Check one committee member's partial signature against the claimed `R`
    /// and contributor list. A failure here is evidence of a faulty or
    /// malicious signer.
    pub fn verify_commit_sig(
        &self,
        signer: &ValidatorKey,
        signature: &PartialSignature,
        r: &NonceCommitment,
        validators_idx_r: &[usize],
    ) -> Result<(), MultiSigError> {
        let data = self.data_to_sign.ok_or(MultiSigError::NoDataToSign)?;
        let validators_idx_r = normalize_indices(validators_idx_r, self.committee.len())?;
        let signer_index = self.index_of(signer)?;
        if validators_idx_r.binary_search(&signer_index).is_err() {
            return Err(MultiSigError::SignerNotInNonceSet(signer.to_string()));
        }

        let r_point = r.to_point()?;
        let r_i = signature.nonce.to_point()?;
        let s_i = scalar_from_bytes(&signature.s)?;
        let x_i = signer.to_point()?;

        let aggregation = aggregate_keys(&self.committee, &validators_idx_r)?;
        let c = challenge(&aggregation.aggregated, &r_point, &data);
        let a_i = aggregation.coefficient(signer_index)?;

        if ProjectivePoint::GENERATOR * s_i != r_i + x_i * (c * a_i) {
            return Err(MultiSigError::InvalidPartialSignature(signer.to_string()));
        }
        Ok(())
    }

    /// Sum partial signatures that share `r` into one aggregated signature.
    ///
    /// The signers may be any subset of the nonce contributors. Signatures must
    /// already have passed [`verify_commit_sig`](Self::verify_commit_sig); the
    /// result is re-verified before it is returned.
    pub fn combine_sigs(
        &self,
        r: &NonceCommitment,
        sigs: &[CommittedSig],
    ) -> Result<Aggregation, MultiSigError> {
        let data = self.data_to_sign.ok_or(MultiSigError::NoDataToSign)?;
        let first = sigs.first().ok_or(MultiSigError::NothingToCombine)?;
        let contributors = normalize_indices(&first.validators_idx_r, self.committee.len())?;

        let mut signers = BTreeSet::new();
        let mut nonce_sum = ProjectivePoint::IDENTITY;
        let mut s = Scalar::ZERO;
        for sig in sigs {
            if normalize_indices(&sig.validators_idx_r, self.committee.len())? != contributors {
                return Err(MultiSigError::MismatchedNonceSet);
            }
            if !signers.insert(self.index_of(&sig.signer)?) {
                return Err(MultiSigError::DuplicateSigner(sig.signer.to_string()));
            }
            nonce_sum += sig.signature.nonce.to_point()?;
            s += scalar_from_bytes(&sig.signature.s)?;
        }

        let validators_idx_sig: Vec<usize> = signers.into_iter().collect();
        let signature = AggregatedSignature {
            nonce: NonceCommitment::from_point(&nonce_sum),
            s: scalar_to_bytes(&s),
        };
        verify_aggregated(
            &self.committee,
            &contributors,
            &validators_idx_sig,
            r,
            &signature,
            &data,
        )?;

        Ok(Aggregation {
            signature,
            validators_idx_sig,
        })
    }

    fn index_of(&self, key: &ValidatorKey) -> Result<usize, MultiSigError> {
        self.committee
            .iter()
            .position(|member| member == key)
            .ok_or_else(|| MultiSigError::UnknownSigner(key.to_string()))
    }
}

/// Verify an aggregated signature against a committee and message digest.
///
/// The signer list must be a subset of the nonce contributor list. Key
/// coefficients and the challenge are computed over the contributors, the
/// public key side of the check only over the signers.
pub fn verify_aggregated(
    committee: &[ValidatorKey],
    validators_idx_r: &[usize],
    validators_idx_sig: &[usize],
    r: &NonceCommitment,
    signature: &AggregatedSignature,
    message: &Hash,
) -> Result<(), MultiSigError> {
    let contributors = normalize_indices(validators_idx_r, committee.len())?;
    let signers = normalize_indices(validators_idx_sig, committee.len())?;
    if let Some(&index) = signers.iter().find(|&&index| contributors.binary_search(&index).is_err()) {
        return Err(MultiSigError::SignerIndexNotInNonceSet(index));
    }

    let r_point = r.to_point()?;
    let signers_nonce = signature.nonce.to_point()?;
    if signers == contributors && signers_nonce != r_point {
        return Err(MultiSigError::NonceSumMismatch);
    }
    let s = scalar_from_bytes(&signature.s)?;
    let aggregation = aggregate_keys(committee, &contributors)?;
    let c = challenge(&aggregation.aggregated, &r_point, message);

    let mut signers_key = ProjectivePoint::IDENTITY;
    for &index in &signers {
        signers_key += committee[index].to_point()? * aggregation.coefficient(index)?;
    }

    if ProjectivePoint::GENERATOR * s != signers_nonce + signers_key * c {
        return Err(MultiSigError::InvalidAggregatedSignature);
    }
    Ok(())
}

// ==================== INTERNALS ====================

struct KeyAggregation {
    coefficients: BTreeMap<usize, Scalar>,
    aggregated: ProjectivePoint,
}

impl KeyAggregation {
    fn coefficient(&self, index: usize) -> Result<Scalar, MultiSigError> {
        self.coefficients
            .get(&index)
            .copied()
            .ok_or(MultiSigError::IndexOutOfRange {
                index,
                committee_size: self.coefficients.len(),
            })
    }
}

/// MuSig-style key aggregation over `indices` (already normalized).
fn aggregate_keys(committee: &[ValidatorKey], indices: &[usize]) -> Result<KeyAggregation, MultiSigError> {
    let mut key_list: Vec<&[u8]> = Vec::with_capacity(indices.len() + 1);
    key_list.push(DOMAIN_KEY_LIST);
    for &index in indices {
        key_list.push(committee[index].as_bytes());
    }
    let list_hash = Hash::digest_parts(&key_list);

    let mut coefficients = BTreeMap::new();
    let mut aggregated = ProjectivePoint::IDENTITY;
    for &index in indices {
        let key = &committee[index];
        let a = hash_to_scalar(&[DOMAIN_KEY_COEFFICIENT, list_hash.as_bytes(), key.as_bytes()]);
        aggregated += key.to_point()? * a;
        coefficients.insert(index, a);
    }

    Ok(KeyAggregation {
        coefficients,
        aggregated,
    })
}

fn challenge(aggregated_key: &ProjectivePoint, r: &ProjectivePoint, message: &Hash) -> Scalar {
    hash_to_scalar(&[
        DOMAIN_CHALLENGE,
        &encode_point(aggregated_key),
        &encode_point(r),
        message.as_bytes(),
    ])
}

fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let digest = Hash::digest_parts(parts);
    <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(digest.0))
}

/// Sort an index list and reject duplicates, empties and out-of-range entries.
fn normalize_indices(indices: &[usize], committee_size: usize) -> Result<Vec<usize>, MultiSigError> {
    if indices.is_empty() {
        return Err(MultiSigError::EmptyIndexList);
    }
    let mut sorted = indices.to_vec();
    sorted.sort_unstable();
    for pair in sorted.windows(2) {
        if pair[0] == pair[1] {
            return Err(MultiSigError::DuplicateIndex(pair[0]));
        }
    }
    if let Some(&index) = sorted.iter().find(|&&index| index >= committee_size) {
        return Err(MultiSigError::IndexOutOfRange {
            index,
            committee_size,
        });
    }
    Ok(sorted)
}

fn scalar_from_bytes(bytes: &[u8; 32]) -> Result<Scalar, CryptoError> {
    Option::<Scalar>::from(Scalar::from_repr(FieldBytes::from(*bytes))).ok_or(CryptoError::InvalidScalar)
}

fn scalar_to_bytes(scalar: &Scalar) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&scalar.to_bytes());
    out
}
