use serde::{Deserialize, Serialize};
use shardbft_core::validate_shard_count;
use std::time::Duration;

use crate::error::ConfigError;

/// Timing and topology parameters shared by every round a node runs.
///
/// SAFETY: all committee members must run with the same phase timings; the
/// round relies on roughly aligned phase boundaries across the committee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// How long a proposer waits for Ready acknowledgements
    pub propose_timeout_ms: u64,

    /// How long a listener waits for a valid Propose
    pub listen_timeout_ms: u64,

    /// Nonce reveal window
    pub prepare_timeout_ms: u64,

    /// Partial signature window
    pub commit_timeout_ms: u64,

    /// Delay before a node emits its own Prepare/Commit after entering the phase
    pub announce_delay_ms: u64,

    /// Pause between reaching Ready quorum and broadcasting the proposal
    pub broadcast_delay_ms: u64,

    /// Pause before the orchestrator retries a failed round
    pub retry_backoff_ms: u64,

    /// Failed rounds tolerated at one height before the orchestrator gives up
    pub max_round_attempts: u32,

    /// Number of shard chains; a power of two
    pub shard_count: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            propose_timeout_ms: 20_000,
            listen_timeout_ms: 20_000,
            prepare_timeout_ms: 5_000,
            commit_timeout_ms: 5_000,
            announce_delay_ms: 1_500,
            broadcast_delay_ms: 2_000,
            retry_backoff_ms: 1_000,
            max_round_attempts: 5,
            shard_count: 4,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("propose_timeout_ms", self.propose_timeout_ms),
            ("listen_timeout_ms", self.listen_timeout_ms),
            ("prepare_timeout_ms", self.prepare_timeout_ms),
            ("commit_timeout_ms", self.commit_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroTimeout(*name));
        }
        let phase_window = self.prepare_timeout_ms.min(self.commit_timeout_ms);
        if self.announce_delay_ms >= phase_window {
            return Err(ConfigError::AnnounceDelayTooLong {
                announce_delay_ms: self.announce_delay_ms,
                phase_window_ms: phase_window,
            });
        }
        if self.max_round_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        validate_shard_count(self.shard_count).map_err(|_| ConfigError::ShardCount(self.shard_count))?;
        Ok(())
    }

    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout_ms)
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_timeout_ms)
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn announce_delay(&self) -> Duration {
        Duration::from_millis(self.announce_delay_ms)
    }

    pub fn broadcast_delay(&self) -> Duration {
        Duration::from_millis(self.broadcast_delay_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ConsensusConfig::default();
        config.validate().unwrap();
        assert_eq!(config.announce_delay(), Duration::from_millis(1500));
        assert_eq!(config.listen_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let config = ConsensusConfig {
            commit_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroTimeout("commit_timeout_ms")));
    }

    #[test]
    fn test_rejects_announce_after_phase_end() {
        let config = ConsensusConfig {
            announce_delay_ms: 5_000,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AnnounceDelayTooLong { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_shard_count() {
        let config = ConsensusConfig {
            shard_count: 3,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ShardCount(3)));
    }
}
