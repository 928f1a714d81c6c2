// CONSENSUS MESSAGES
// Every message is an authenticated envelope around one of the four phase
// payloads. The sender's ECDSA signature covers a domain-separated encoding of
// (layer, height, sender, body), so a message cannot be replayed on another
// chain or height.

use serde::{Deserialize, Serialize};
use shardbft_core::{ChainLayer, Committee};
use shardbft_crypto::{Hash, MessageSignature, NonceCommitment, PartialSignature, ValidatorKey, ValidatorKeypair};
use std::fmt;

use crate::error::MessageError;

const DOMAIN_MESSAGE: &[u8] = b"shardbft/consensus-message/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Propose,
    Ready,
    Prepare,
    Commit,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Propose => "propose",
            MessageKind::Ready => "ready",
            MessageKind::Prepare => "prepare",
            MessageKind::Commit => "commit",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Encoded candidate block
    Propose { block: Vec<u8> },

    /// Acknowledges the best state the sender is building on
    Ready { best_state_hash: Hash },

    /// Nonce commitment reveal
    Prepare { ri: NonceCommitment, block_hash: Hash },

    /// Partial signature under `r`, with the contributors of `r`
    Commit {
        r: NonceCommitment,
        partial_sig: PartialSignature,
        validators_idx_r: Vec<usize>,
        block_hash: Hash,
    },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Propose { .. } => MessageKind::Propose,
            MessageBody::Ready { .. } => MessageKind::Ready,
            MessageBody::Prepare { .. } => MessageKind::Prepare,
            MessageBody::Commit { .. } => MessageKind::Commit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMessage {
    pub layer: ChainLayer,
    pub height: u64,
    pub sender: ValidatorKey,
    pub body: MessageBody,
    pub signature: MessageSignature,
}

impl ConsensusMessage {
    pub fn new_signed(
        layer: ChainLayer,
        height: u64,
        body: MessageBody,
        keypair: &ValidatorKeypair,
    ) -> Result<Self, MessageError> {
        let sender = keypair.public().clone();
        let payload = signing_payload(layer, height, &sender, &body)?;
        Ok(Self {
            layer,
            height,
            sender,
            body,
            signature: keypair.sign(&payload),
        })
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Check that the sender is a committee member and signed this exact message.
    pub fn authenticate(&self, committee: &Committee) -> Result<(), MessageError> {
        if !committee.contains(&self.sender) {
            return Err(MessageError::UnknownSender(self.sender.to_string()));
        }
        let payload = signing_payload(self.layer, self.height, &self.sender, &self.body)?;
        self.sender.verify(&payload, &self.signature)?;
        Ok(())
    }
}

fn signing_payload(
    layer: ChainLayer,
    height: u64,
    sender: &ValidatorKey,
    body: &MessageBody,
) -> Result<Vec<u8>, MessageError> {
    bincode::serialize(&(DOMAIN_MESSAGE, layer, height, sender, body))
        .map_err(|e| MessageError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (ValidatorKeypair, ValidatorKeypair, Committee) {
        let alice = ValidatorKeypair::from_seed([1u8; 32]).unwrap();
        let bob = ValidatorKeypair::from_seed([2u8; 32]).unwrap();
        let committee = Committee::new(vec![alice.public().clone(), bob.public().clone()]).unwrap();
        (alice, bob, committee)
    }

    fn ready() -> MessageBody {
        MessageBody::Ready {
            best_state_hash: Hash::digest(b"best"),
        }
    }

    #[test]
    fn test_signed_message_authenticates() {
        let (alice, _, committee) = setup();
        let msg = ConsensusMessage::new_signed(ChainLayer::Shard(0), 7, ready(), &alice).unwrap();
        assert_eq!(msg.kind(), MessageKind::Ready);
        msg.authenticate(&committee).unwrap();
    }

    #[test]
    fn test_outsider_rejected() {
        let (_, _, committee) = setup();
        let mallory = ValidatorKeypair::from_seed([9u8; 32]).unwrap();
        let msg = ConsensusMessage::new_signed(ChainLayer::Beacon, 1, ready(), &mallory).unwrap();
        assert!(matches!(
            msg.authenticate(&committee),
            Err(MessageError::UnknownSender(_))
        ));
    }

    #[test]
    fn test_signature_binds_height_and_layer() {
        let (alice, _, committee) = setup();
        let mut msg = ConsensusMessage::new_signed(ChainLayer::Shard(0), 7, ready(), &alice).unwrap();
        msg.height = 8;
        assert!(matches!(
            msg.authenticate(&committee),
            Err(MessageError::BadSignature(_))
        ));

        let mut msg = ConsensusMessage::new_signed(ChainLayer::Shard(0), 7, ready(), &alice).unwrap();
        msg.layer = ChainLayer::Shard(1);
        assert!(msg.authenticate(&committee).is_err());
    }

    #[test]
    fn test_impersonation_rejected() {
        let (alice, bob, committee) = setup();
        let mut msg = ConsensusMessage::new_signed(ChainLayer::Beacon, 3, ready(), &alice).unwrap();
        msg.sender = bob.public().clone();
        assert!(matches!(
            msg.authenticate(&committee),
            Err(MessageError::BadSignature(_))
        ));
    }
}
