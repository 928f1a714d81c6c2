// CONSENSUS ROUND
// One instance agrees on one block for one (layer, height):
//
//   proposer: Propose --(Ready quorum)--> Prepare --(timer)--> Commit --> finalized block
//   listener: Listen  --(valid Propose)-> Prepare --(timer)--> Commit --> finalized block
//
// SAFETY INVARIANTS:
// 1. Only authenticated messages from committee members reach round state
// 2. Exactly one phase is active; its timer completes exactly once
// 3. A partial signature is stored only after it verifies; an invalid one aborts the round
// 4. Partial signatures are only combined within one R group holding more than N/2 of them
// 5. Quit aborts the round from any wait; collected state is dropped with the round

use log::{debug, info, warn};
use shardbft_core::{ChainLayer, Committee, ConsensusArtifacts, PendingBlock};
use shardbft_crypto::{
    CommittedSig, Hash, MultiSigError, MultiSigScheme, NonceCommitment, ValidatorKey, ValidatorKeypair,
};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::collaborators::RoundServices;
use crate::config::ConsensusConfig;
use crate::error::{ProposalError, RoundError};
use crate::message::{ConsensusMessage, MessageBody, MessageKind};
use crate::timer::{DelayedAnnouncement, PhaseEnd, PhaseTimer};
use crate::validation::ProposalContext;

/// Buffered future-phase messages allowed per committee member.
const DEFERRED_PER_MEMBER: usize = 4;

/// Distinct Ready acknowledgements a proposer needs: `(2N/3) - 1`, floored at zero.
pub fn ready_quorum(committee_size: usize) -> usize {
    (2 * committee_size / 3).saturating_sub(1)
}

/// Nonce reveals needed to leave Prepare: at least `N/2`, own nonce included.
pub fn nonce_quorum(committee_size: usize) -> usize {
    committee_size / 2
}

/// An R group must hold strictly more than this many signatures to be combined.
pub fn combine_threshold(committee_size: usize) -> usize {
    committee_size / 2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Propose,
    Listen,
    Prepare,
    Commit,
}

impl Phase {
    fn rank(self) -> u8 {
        match self {
            Phase::Propose | Phase::Listen => 0,
            Phase::Prepare => 1,
            Phase::Commit => 2,
        }
    }
}

fn message_rank(kind: MessageKind) -> u8 {
    match kind {
        MessageKind::Propose | MessageKind::Ready => 0,
        MessageKind::Prepare => 1,
        MessageKind::Commit => 2,
    }
}

enum Event {
    Quit,
    Timer(PhaseEnd),
    Announce,
    Message(ConsensusMessage),
}

/// Which round to run and who leads it.
#[derive(Debug, Clone)]
pub struct RoundSetup {
    pub layer: ChainLayer,
    pub height: u64,
    pub proposer: ValidatorKey,
    pub committee: Committee,
}

pub struct ConsensusRound {
    setup: RoundSetup,
    keypair: Arc<ValidatorKeypair>,
    config: Arc<ConsensusConfig>,
    services: RoundServices,
    inbox: UnboundedReceiver<ConsensusMessage>,
    inbox_open: bool,
    quit: CancellationToken,

    phase: Phase,
    deferred: VecDeque<ConsensusMessage>,
    multisig: MultiSigScheme,
    ready_from: BTreeSet<ValidatorKey>,
    collected_nonces: BTreeMap<ValidatorKey, NonceCommitment>,
    collected_sigs: BTreeMap<NonceCommitment, Vec<CommittedSig>>,
    committed_by: BTreeSet<ValidatorKey>,
}

impl ConsensusRound {
    pub fn new(
        setup: RoundSetup,
        keypair: Arc<ValidatorKeypair>,
        config: Arc<ConsensusConfig>,
        services: RoundServices,
        inbox: UnboundedReceiver<ConsensusMessage>,
        quit: CancellationToken,
    ) -> Result<Self, RoundError> {
        if !setup.committee.contains(keypair.public()) {
            return Err(RoundError::NotInCommittee);
        }
        let phase = if setup.proposer == *keypair.public() {
            Phase::Propose
        } else {
            Phase::Listen
        };
        let mut multisig = MultiSigScheme::new(keypair.clone(), setup.committee.members().to_vec());
        multisig.prepare();

        Ok(Self {
            setup,
            keypair,
            config,
            services,
            inbox,
            inbox_open: true,
            quit,
            phase,
            deferred: VecDeque::new(),
            multisig,
            ready_from: BTreeSet::new(),
            collected_nonces: BTreeMap::new(),
            collected_sigs: BTreeMap::new(),
            committed_by: BTreeSet::new(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Drive the round to a finalized block or a round-fatal error.
    pub async fn start(mut self) -> Result<PendingBlock, RoundError> {
        info!(
            "starting {} round at height {} as {} (committee of {})",
            self.setup.layer,
            self.setup.height,
            if self.phase == Phase::Propose { "proposer" } else { "listener" },
            self.setup.committee.len()
        );

        let (block, block_hash) = match self.phase {
            Phase::Propose => self.propose_phase().await?,
            _ => self.listen_phase().await?,
        };
        self.prepare_phase(block_hash).await?;
        self.commit_phase(block, block_hash).await
    }

    // ==================== PHASES ====================

    async fn propose_phase(&mut self) -> Result<(PendingBlock, Hash), RoundError> {
        self.phase = Phase::Propose;
        let layer = self.setup.layer;
        let own_key = self.keypair.public().clone();

        let mut block = self
            .services
            .builder
            .build_candidate(layer, self.setup.height, &own_key)
            .map_err(RoundError::Builder)?;
        block.sign_as_producer(&self.keypair)?;
        self.proposal_context().validate(&block, &own_key)?;
        let block_hash = block.hash()?;
        let payload = block.encode()?;

        let best_state_hash = self.services.chain.best_state_hash(layer);
        let required = ready_quorum(self.setup.committee.len());
        let mut timer = PhaseTimer::start(self.config.propose_timeout());
        let mut idle = DelayedAnnouncement::default();
        if required == 0 {
            timer.complete_early();
        }

        loop {
            match self.next_event(&mut timer, &mut idle).await {
                Event::Quit => return Err(RoundError::Quit),
                Event::Timer(end) => {
                    self.phase_ended(end);
                    break;
                }
                Event::Announce => {}
                Event::Message(msg) => {
                    let MessageBody::Ready { best_state_hash: theirs } = msg.body else {
                        continue;
                    };
                    if theirs != best_state_hash {
                        debug!("{}: ready from {} on a different best state", layer, msg.sender);
                        continue;
                    }
                    if self.ready_from.insert(msg.sender) && self.ready_from.len() >= required && timer.complete_early() {
                        info!("{}: collected {} ready", layer, self.ready_from.len());
                    }
                }
            }
        }

        let received = self.ready_from.len();
        if received < required {
            return Err(RoundError::NotEnoughReady { received, required });
        }

        tokio::select! {
            biased;
            _ = self.quit.cancelled() => return Err(RoundError::Quit),
            _ = sleep(self.config.broadcast_delay()) => {}
        }

        info!("{}: proposing block {} at height {}", layer, block_hash, self.setup.height);
        let propose = ConsensusMessage::new_signed(
            layer,
            self.setup.height,
            MessageBody::Propose { block: payload },
            &self.keypair,
        )?;
        self.services.network.broadcast_to_layer(layer, propose);
        Ok((block, block_hash))
    }

    async fn listen_phase(&mut self) -> Result<(PendingBlock, Hash), RoundError> {
        self.phase = Phase::Listen;
        let layer = self.setup.layer;

        let ready = ConsensusMessage::new_signed(
            layer,
            self.setup.height,
            MessageBody::Ready {
                best_state_hash: self.services.chain.best_state_hash(layer),
            },
            &self.keypair,
        )?;
        self.services.network.broadcast_to_layer(layer, ready);

        let mut timer = PhaseTimer::start(self.config.listen_timeout());
        let mut idle = DelayedAnnouncement::default();
        loop {
            match self.next_event(&mut timer, &mut idle).await {
                Event::Quit => return Err(RoundError::Quit),
                Event::Timer(end) => {
                    self.phase_ended(end);
                    return Err(RoundError::ListenTimeout);
                }
                Event::Announce => {}
                Event::Message(msg) => {
                    let MessageBody::Propose { block } = &msg.body else {
                        continue;
                    };
                    match self.accept_proposal(block, &msg.sender) {
                        Ok(accepted) => {
                            timer.complete_early();
                            info!(
                                "{}: accepted block {} at height {} from {}",
                                layer, accepted.1, self.setup.height, msg.sender
                            );
                            return Ok(accepted);
                        }
                        Err(e) => warn!("{}: rejecting proposal from {}: {}", layer, msg.sender, e),
                    }
                }
            }
        }
    }

    async fn prepare_phase(&mut self, block_hash: Hash) -> Result<(), RoundError> {
        self.phase = Phase::Prepare;
        let layer = self.setup.layer;
        info!("{}: prepare phase for {}", layer, block_hash);

        self.multisig.set_data_to_sign(block_hash);
        let own_ri = self
            .multisig
            .nonce_commitment()
            .cloned()
            .ok_or(MultiSigError::NonceNotPrepared)?;
        self.collected_nonces
            .insert(self.keypair.public().clone(), own_ri.clone());

        let mut timer = PhaseTimer::start(self.config.prepare_timeout());
        let mut announcement = DelayedAnnouncement::schedule(
            self.config.announce_delay(),
            ConsensusMessage::new_signed(
                layer,
                self.setup.height,
                MessageBody::Prepare { ri: own_ri, block_hash },
                &self.keypair,
            )?,
        );

        loop {
            match self.next_event(&mut timer, &mut announcement).await {
                Event::Quit => return Err(RoundError::Quit),
                Event::Timer(end) => {
                    self.phase_ended(end);
                    break;
                }
                Event::Announce => self.flush(&mut announcement),
                Event::Message(msg) => {
                    let MessageBody::Prepare { ri, block_hash: theirs } = msg.body else {
                        continue;
                    };
                    if theirs != block_hash {
                        debug!("{}: prepare from {} for another block", layer, msg.sender);
                        continue;
                    }
                    if ri.to_point().is_err() {
                        warn!("{}: malformed nonce commitment from {}", layer, msg.sender);
                        continue;
                    }
                    match self.collected_nonces.entry(msg.sender) {
                        Entry::Vacant(slot) => {
                            debug!("{}: nonce from {}", layer, slot.key());
                            slot.insert(ri);
                        }
                        Entry::Occupied(slot) => debug!("{}: duplicate nonce from {}", layer, slot.key()),
                    }
                }
            }
        }
        self.flush(&mut announcement);

        let collected = self.collected_nonces.len();
        let required = nonce_quorum(self.setup.committee.len());
        if collected < required {
            return Err(RoundError::NotEnoughRi { collected, required });
        }
        self.multisig.sign_data(&self.collected_nonces)?;
        Ok(())
    }

    async fn commit_phase(&mut self, mut block: PendingBlock, block_hash: Hash) -> Result<PendingBlock, RoundError> {
        self.phase = Phase::Commit;
        let layer = self.setup.layer;
        let own_key = self.keypair.public().clone();
        let combined = self
            .multisig
            .combined()
            .cloned()
            .ok_or(MultiSigError::NonceNotPrepared)?;
        info!(
            "{}: commit phase, R from {} contributors",
            layer,
            combined.validators_idx_r.len()
        );

        self.committed_by.insert(own_key.clone());
        self.collected_sigs
            .entry(combined.r.clone())
            .or_default()
            .push(CommittedSig {
                signer: own_key,
                signature: combined.commit_sig.clone(),
                validators_idx_r: combined.validators_idx_r.clone(),
            });

        let mut timer = PhaseTimer::start(self.config.commit_timeout());
        let mut announcement = DelayedAnnouncement::schedule(
            self.config.announce_delay(),
            ConsensusMessage::new_signed(
                layer,
                self.setup.height,
                MessageBody::Commit {
                    r: combined.r.clone(),
                    partial_sig: combined.commit_sig.clone(),
                    validators_idx_r: combined.validators_idx_r.clone(),
                    block_hash,
                },
                &self.keypair,
            )?,
        );
        if self.group_ready(&combined.r) {
            timer.complete_early();
        }

        loop {
            match self.next_event(&mut timer, &mut announcement).await {
                Event::Quit => return Err(RoundError::Quit),
                Event::Timer(end) => {
                    self.phase_ended(end);
                    break;
                }
                Event::Announce => self.flush(&mut announcement),
                Event::Message(msg) => {
                    let sender = msg.sender;
                    let MessageBody::Commit {
                        r,
                        partial_sig,
                        validators_idx_r,
                        block_hash: theirs,
                    } = msg.body
                    else {
                        continue;
                    };
                    if theirs != block_hash {
                        debug!("{}: commit from {} for another block", layer, sender);
                        continue;
                    }
                    if self.committed_by.contains(&sender) {
                        debug!("{}: duplicate commit from {}", layer, sender);
                        continue;
                    }
                    if let Some(revealed) = self.collected_nonces.get(&sender) {
                        if *revealed != partial_sig.nonce {
                            return Err(RoundError::InvalidPartialSignature {
                                signer: sender.to_string(),
                                source: MultiSigError::NonceMismatch(sender.to_string()),
                            });
                        }
                    }
                    self.multisig
                        .verify_commit_sig(&sender, &partial_sig, &r, &validators_idx_r)
                        .map_err(|source| RoundError::InvalidPartialSignature {
                            signer: sender.to_string(),
                            source,
                        })?;

                    debug!("{}: partial signature from {}", layer, sender);
                    self.committed_by.insert(sender.clone());
                    self.collected_sigs.entry(r.clone()).or_default().push(CommittedSig {
                        signer: sender,
                        signature: partial_sig,
                        validators_idx_r,
                    });
                    if self.group_ready(&r) && timer.complete_early() {
                        info!("{}: collected enough partial signatures", layer);
                    }
                }
            }
        }
        self.flush(&mut announcement);

        let (r, sigs) = self.select_group().ok_or(RoundError::NotEnoughSigs)?;
        let aggregation = self.multisig.combine_sigs(&r, &sigs)?;
        let mut validators_idx_r = sigs[0].validators_idx_r.clone();
        validators_idx_r.sort_unstable();

        block.set_consensus(ConsensusArtifacts {
            r,
            aggregated_sig: aggregation.signature,
            validators_idx_r,
            validators_idx_sig: aggregation.validators_idx_sig,
        });
        info!(
            "{}: block {} at height {} reached consensus with {} signers",
            layer,
            block_hash,
            self.setup.height,
            sigs.len()
        );
        Ok(block)
    }

    // ==================== HELPERS ====================

    fn proposal_context(&self) -> ProposalContext<'_> {
        ProposalContext {
            layer: self.setup.layer,
            height: self.setup.height,
            committee: &self.setup.committee,
            shard_count: self.config.shard_count,
            chain: self.services.chain.as_ref(),
            committees: self.services.committees.as_ref(),
        }
    }

    fn accept_proposal(&self, payload: &[u8], sender: &ValidatorKey) -> Result<(PendingBlock, Hash), ProposalError> {
        let block = PendingBlock::decode(self.setup.layer, payload)?;
        self.proposal_context().validate(&block, sender)?;
        let block_hash = block.hash()?;
        Ok((block, block_hash))
    }

    /// The commit wait ends early once every nonce contributor of a combinable
    /// group signed; otherwise the timer runs out and the largest group wins.
    fn group_ready(&self, r: &NonceCommitment) -> bool {
        let Some(sigs) = self.collected_sigs.get(r) else {
            return false;
        };
        let Some(first) = sigs.first() else {
            return false;
        };
        sigs.len() > combine_threshold(self.setup.committee.len()) && sigs.len() == first.validators_idx_r.len()
    }

    /// The largest R group holding more than `N/2` signatures, if any.
    fn select_group(&self) -> Option<(NonceCommitment, Vec<CommittedSig>)> {
        let threshold = combine_threshold(self.setup.committee.len());
        let mut best: Option<(&NonceCommitment, &Vec<CommittedSig>)> = None;
        for (r, sigs) in &self.collected_sigs {
            if sigs.len() <= threshold {
                continue;
            }
            if sigs.len() < sigs[0].validators_idx_r.len() {
                debug!(
                    "{}: {} of {} nonce contributors signed under one R",
                    self.setup.layer,
                    sigs.len(),
                    sigs[0].validators_idx_r.len()
                );
            }
            if best.map_or(true, |(_, current)| sigs.len() > current.len()) {
                best = Some((r, sigs));
            }
        }
        best.map(|(r, sigs)| (r.clone(), sigs.clone()))
    }

    fn phase_ended(&self, end: PhaseEnd) {
        debug!("{}: {:?} phase over, {}", self.setup.layer, self.phase, end);
    }

    fn flush(&self, announcement: &mut DelayedAnnouncement) {
        if let Some(message) = announcement.take() {
            debug!("{}: sending {}", self.setup.layer, message.kind());
            self.services.network.broadcast_to_layer(self.setup.layer, message);
        }
    }

    /// Wait for the next event of the current phase.
    ///
    /// Buffered messages for the current phase are replayed first. Inbound
    /// messages are filtered by [`admit`](Self::admit) before they are returned.
    async fn next_event(&mut self, timer: &mut PhaseTimer, announcement: &mut DelayedAnnouncement) -> Event {
        loop {
            if let Some(message) = self.take_deferred() {
                return Event::Message(message);
            }
            let inbox_open = self.inbox_open;
            let received = tokio::select! {
                biased;
                _ = self.quit.cancelled() => return Event::Quit,
                end = timer.wait() => return Event::Timer(end),
                _ = announcement.due(), if announcement.is_pending() => return Event::Announce,
                received = self.inbox.recv(), if inbox_open => received,
            };
            match received {
                Some(message) => {
                    if let Some(message) = self.admit(message) {
                        return Event::Message(message);
                    }
                }
                None => {
                    debug!("{}: inbox closed", self.setup.layer);
                    self.inbox_open = false;
                }
            }
        }
    }

    /// Authenticate an inbound message and route it by phase: current-phase
    /// messages are returned, future-phase messages are buffered, the rest dropped.
    fn admit(&mut self, message: ConsensusMessage) -> Option<ConsensusMessage> {
        let layer = self.setup.layer;
        if message.layer != layer || message.height != self.setup.height {
            debug!(
                "{}: ignoring {} for {} at height {}",
                layer,
                message.kind(),
                message.layer,
                message.height
            );
            return None;
        }
        if message.sender == *self.keypair.public() {
            return None;
        }
        if let Err(e) = message.authenticate(&self.setup.committee) {
            warn!("{}: dropping {} from {}: {}", layer, message.kind(), message.sender, e);
            return None;
        }

        let rank = message_rank(message.kind());
        let current = self.phase.rank();
        if rank == current {
            return Some(message);
        }
        if rank > current {
            if self.deferred.len() >= DEFERRED_PER_MEMBER * self.setup.committee.len() {
                warn!("{}: deferred queue full, dropping {} from {}", layer, message.kind(), message.sender);
            } else {
                debug!("{}: deferring {} from {}", layer, message.kind(), message.sender);
                self.deferred.push_back(message);
            }
        }
        None
    }

    fn take_deferred(&mut self) -> Option<ConsensusMessage> {
        let current = self.phase.rank();
        self.deferred
            .retain(|message| message_rank(message.kind()) >= current);
        let index = self
            .deferred
            .iter()
            .position(|message| message_rank(message.kind()) == current)?;
        self.deferred.remove(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_for_four_members() {
        assert_eq!(ready_quorum(4), 1);
        assert_eq!(nonce_quorum(4), 2);
        assert_eq!(combine_threshold(4), 2);
    }

    #[test]
    fn test_thresholds_for_small_committees() {
        assert_eq!(ready_quorum(1), 0);
        assert_eq!(ready_quorum(2), 0);
        assert_eq!(ready_quorum(3), 1);
        assert_eq!(nonce_quorum(1), 0);
        assert_eq!(combine_threshold(1), 0);
    }

    #[test]
    fn test_thresholds_for_larger_committees() {
        assert_eq!(ready_quorum(7), 3);
        assert_eq!(nonce_quorum(7), 3);
        assert_eq!(ready_quorum(10), 5);
        assert_eq!(combine_threshold(10), 5);
    }

    #[test]
    fn test_message_ranks_follow_phases() {
        assert_eq!(message_rank(MessageKind::Ready), Phase::Propose.rank());
        assert_eq!(message_rank(MessageKind::Propose), Phase::Listen.rank());
        assert_eq!(message_rank(MessageKind::Prepare), Phase::Prepare.rank());
        assert_eq!(message_rank(MessageKind::Commit), Phase::Commit.rank());
    }
}
