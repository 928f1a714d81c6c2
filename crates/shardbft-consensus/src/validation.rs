use log::debug;
use shardbft_core::{ChainLayer, Committee, PendingBlock};
use shardbft_crypto::ValidatorKey;

use crate::collaborators::{ChainReader, CommitteeProvider};
use crate::error::ProposalError;

/// Everything a proposal is checked against in one round.
pub struct ProposalContext<'a> {
    pub layer: ChainLayer,
    pub height: u64,
    pub committee: &'a Committee,
    pub shard_count: usize,
    pub chain: &'a dyn ChainReader,
    pub committees: &'a dyn CommitteeProvider,
}

impl ProposalContext<'_> {
    /// Validate a candidate block relayed by `sender`.
    ///
    /// Checks run cheapest first; the chain's own pre-validation runs last.
    pub fn validate(&self, block: &PendingBlock, sender: &ValidatorKey) -> Result<(), ProposalError> {
        if block.layer() != self.layer {
            return Err(ProposalError::WrongLayer {
                expected: self.layer,
                actual: block.layer(),
            });
        }
        if block.height() != self.height {
            return Err(ProposalError::WrongHeight {
                expected: self.height,
                actual: block.height(),
            });
        }

        let producer = block.producer();
        if producer != sender {
            return Err(ProposalError::SenderNotProducer {
                sender: sender.to_string(),
                producer: producer.to_string(),
            });
        }
        if !self.committee.contains(producer) {
            return Err(ProposalError::ProducerNotInCommittee(producer.to_string()));
        }

        block.verify_producer_signature()?;
        block.check_body_commitments(self.shard_count)?;
        self.validate_cross_shard_inputs(block)?;
        self.chain.pre_validate(block)?;

        debug!("{} proposal at height {} from {} is valid", self.layer, self.height, producer);
        Ok(())
    }

    /// Each embedded cross-shard block must be addressed here and carry both a
    /// valid source-committee signature and a valid merkle path.
    fn validate_cross_shard_inputs(&self, block: &PendingBlock) -> Result<(), ProposalError> {
        for input in block.cross_shard_inputs() {
            if Some(input.to_shard) != self.layer.shard_id() {
                return Err(ProposalError::MisroutedCrossShardInput {
                    expected: self.layer,
                    actual: input.to_shard,
                });
            }
            let from_shard = input.from_shard();
            let source_committee = self
                .committees
                .committee(ChainLayer::Shard(from_shard), input.height())?;
            input
                .verify(&source_committee, self.shard_count)
                .map_err(|source| ProposalError::CrossShardInput { from_shard, source })?;
        }
        Ok(())
    }
}
