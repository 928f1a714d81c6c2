// NODE CONFIGURATION
// Layered: built-in defaults, then an optional YAML/TOML file, then
// SHARDBFT__* environment variables (`__` separates nesting, e.g.
// SHARDBFT__CONSENSUS__COMMIT_TIMEOUT_MS). CLI flags are applied last by the
// binary.

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use shardbft_consensus::{ConfigError as ConsensusConfigError, ConsensusConfig};
use shardbft_devnet::DevnetOptions;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

pub const ENV_PREFIX: &str = "SHARDBFT";

#[derive(Debug, Error)]
pub enum NodeConfigError {
    #[error("cannot load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid consensus configuration: {0}")]
    Consensus(#[from] ConsensusConfigError),

    #[error("devnet.{0} must be greater than zero")]
    ZeroDevnetValue(&'static str),

    #[error("cannot render configuration: {0}")]
    Render(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevnetSection {
    /// Validators in the beacon committee and in each shard committee
    pub validators_per_committee: usize,
    /// Blocks every layer must finalize before the run ends
    pub heights: u64,
    pub transactions_per_block: usize,
}

impl Default for DevnetSection {
    fn default() -> Self {
        Self {
            validators_per_committee: 4,
            heights: 3,
            transactions_per_block: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Default log filter; `RUST_LOG` takes precedence
    pub log_level: String,
    pub devnet: DevnetSection,
    pub consensus: ConsensusConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            devnet: DevnetSection::default(),
            consensus: ConsensusConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load from `path` (if any) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, NodeConfigError> {
        Self::load_with_env(path, None)
    }

    /// Like [`load`](Self::load), reading overrides from `env` instead of the
    /// process environment when given.
    pub fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self, NodeConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&NodeConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config: NodeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NodeConfigError> {
        self.consensus.validate()?;
        if self.devnet.validators_per_committee == 0 {
            return Err(NodeConfigError::ZeroDevnetValue("validators_per_committee"));
        }
        if self.devnet.heights == 0 {
            return Err(NodeConfigError::ZeroDevnetValue("heights"));
        }
        Ok(())
    }

    pub fn devnet_options(&self) -> DevnetOptions {
        DevnetOptions {
            validators_per_committee: self.devnet.validators_per_committee,
            transactions_per_block: self.devnet.transactions_per_block,
        }
    }

    pub fn to_yaml(&self) -> Result<String, NodeConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }
}
