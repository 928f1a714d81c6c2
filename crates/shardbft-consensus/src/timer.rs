// PHASE TIMERS
// Each phase has exactly one timer, completed exactly once: either its
// deadline elapses or quorum completes it early. Whichever happens first
// wins; the other is a no-op.

use std::fmt;
use std::future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, Sleep};

use crate::message::ConsensusMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEnd {
    Elapsed,
    QuorumReached,
}

impl fmt::Display for PhaseEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseEnd::Elapsed => write!(f, "timer elapsed"),
            PhaseEnd::QuorumReached => write!(f, "quorum reached"),
        }
    }
}

/// Deadline of the current phase.
///
/// Completion is latched: once an outcome is recorded, every later
/// [`wait`](Self::wait) returns it immediately and the underlying sleep is
/// dropped, so it can never fire into a later phase.
#[derive(Debug)]
pub struct PhaseTimer {
    sleep: Option<Pin<Box<Sleep>>>,
    outcome: Option<PhaseEnd>,
}

impl PhaseTimer {
    pub fn start(duration: Duration) -> Self {
        Self {
            sleep: Some(Box::pin(sleep(duration))),
            outcome: None,
        }
    }

    /// Complete the phase on quorum. Returns false if it had already completed.
    pub fn complete_early(&mut self) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.sleep = None;
        self.outcome = Some(PhaseEnd::QuorumReached);
        true
    }

    /// Resolve when the phase completes. Cancel-safe.
    pub async fn wait(&mut self) -> PhaseEnd {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        if let Some(deadline) = self.sleep.as_mut() {
            deadline.await;
        }
        self.sleep = None;
        *self.outcome.get_or_insert(PhaseEnd::Elapsed)
    }
}

/// A message this node emits a short while after entering a phase.
#[derive(Debug, Default)]
pub struct DelayedAnnouncement {
    pending: Option<(Pin<Box<Sleep>>, ConsensusMessage)>,
}

impl DelayedAnnouncement {
    pub fn schedule(delay: Duration, message: ConsensusMessage) -> Self {
        Self {
            pending: Some((Box::pin(sleep(delay)), message)),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Resolve when the delay elapses; never resolves once taken.
    pub async fn due(&mut self) {
        match self.pending.as_mut() {
            Some((delay, _)) => delay.await,
            None => future::pending::<()>().await,
        }
    }

    /// Take the message for sending, whether or not the delay has elapsed.
    pub fn take(&mut self) -> Option<ConsensusMessage> {
        self.pending.take().map(|(_, message)| message)
    }
}
