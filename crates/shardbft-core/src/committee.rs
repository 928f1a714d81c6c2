use serde::{Deserialize, Serialize};
use shardbft_crypto::ValidatorKey;
use std::collections::HashSet;
use std::fmt;

use crate::error::CommitteeError;

/// The chain a round, message or block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChainLayer {
    Beacon,
    Shard(u8),
}

impl ChainLayer {
    pub fn shard_id(&self) -> Option<u8> {
        match self {
            ChainLayer::Beacon => None,
            ChainLayer::Shard(id) => Some(*id),
        }
    }

    pub fn is_beacon(&self) -> bool {
        matches!(self, ChainLayer::Beacon)
    }
}

impl fmt::Display for ChainLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainLayer::Beacon => write!(f, "beacon"),
            ChainLayer::Shard(id) => write!(f, "shard-{}", id),
        }
    }
}

/// Ordered validator set of one chain at one height.
///
/// Position in the list is the canonical validator index used by the
/// multisignature index lists. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committee {
    members: Vec<ValidatorKey>,
}

impl Committee {
    pub fn new(members: Vec<ValidatorKey>) -> Result<Self, CommitteeError> {
        if members.is_empty() {
            return Err(CommitteeError::Empty);
        }
        let mut seen = HashSet::with_capacity(members.len());
        for member in &members {
            if !seen.insert(member) {
                return Err(CommitteeError::DuplicateMember(member.to_string()));
            }
        }
        Ok(Self { members })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always false; an empty committee cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[ValidatorKey] {
        &self.members
    }

    pub fn get(&self, index: usize) -> Option<&ValidatorKey> {
        self.members.get(index)
    }

    pub fn index_of(&self, key: &ValidatorKey) -> Option<usize> {
        self.members.iter().position(|member| member == key)
    }

    pub fn contains(&self, key: &ValidatorKey) -> bool {
        self.index_of(key).is_some()
    }

    /// Smallest signer count strictly above `N/2`.
    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Round-robin proposer for `height`, shifted by the retry `attempt`.
    pub fn proposer(&self, height: u64, attempt: u64) -> &ValidatorKey {
        let n = self.members.len() as u64;
        let index = (height.wrapping_add(attempt) % n) as usize;
        &self.members[index]
    }
}
