// DEVNET
// A beacon committee plus one committee per shard, all running in this
// process over the memory network and sharing one chain and one
// cross-shard pool.
//
// SAFETY INVARIANTS:
// 1. Validator keys are derived deterministically from (layer, index)
// 2. Every engine serves exactly one layer
// 3. A layer counts as done only when the shared chain reached the target height

use log::{error, info};
use parking_lot::Mutex;
use shardbft_consensus::{ChainReader, ConsensusConfig, EngineError, RoundEngine, RoundServices};
use shardbft_core::{ChainLayer, Committee, CrossShardPool, PendingBlock};
use shardbft_crypto::{Hash, ValidatorKeypair};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;

use crate::builder::SampleBlockBuilder;
use crate::chain::MemoryChain;
use crate::error::DevnetError;
use crate::network::MemoryNetwork;

const DOMAIN_DEVNET_KEY: &[u8] = b"shardbft/devnet-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevnetOptions {
    pub validators_per_committee: usize,
    pub transactions_per_block: usize,
}

impl Default for DevnetOptions {
    fn default() -> Self {
        Self {
            validators_per_committee: 4,
            transactions_per_block: 8,
        }
    }
}

/// Final tip of one layer after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerReport {
    pub layer: ChainLayer,
    pub height: u64,
    pub tip: Hash,
}

pub struct Devnet {
    chain: Arc<MemoryChain>,
    network: Arc<MemoryNetwork>,
    cross_shard_pool: Arc<Mutex<CrossShardPool>>,
    engines: BTreeMap<ChainLayer, Vec<Arc<RoundEngine>>>,
}

/// Deterministic keypair of validator `index` on `layer`.
pub fn devnet_keypair(layer: ChainLayer, index: usize) -> Result<ValidatorKeypair, DevnetError> {
    let seed = Hash::digest_parts(&[
        DOMAIN_DEVNET_KEY,
        layer.to_string().as_bytes(),
        &(index as u64).to_le_bytes(),
    ]);
    Ok(ValidatorKeypair::from_seed(seed.0)?)
}

impl Devnet {
    pub fn new(options: DevnetOptions, config: ConsensusConfig) -> Result<Self, DevnetError> {
        config.validate()?;

        let layers: Vec<ChainLayer> = std::iter::once(ChainLayer::Beacon)
            .chain((0..config.shard_count).map(|shard| ChainLayer::Shard(shard as u8)))
            .collect();

        let mut keypairs = BTreeMap::new();
        let mut committees = BTreeMap::new();
        for &layer in &layers {
            let members = (0..options.validators_per_committee)
                .map(|index| devnet_keypair(layer, index).map(Arc::new))
                .collect::<Result<Vec<_>, _>>()?;
            let committee = Committee::new(members.iter().map(|k| k.public().clone()).collect())?;
            committees.insert(layer, committee);
            keypairs.insert(layer, members);
        }

        let chain = Arc::new(MemoryChain::new(config.shard_count, committees));
        let network = MemoryNetwork::new();
        let cross_shard_pool = Arc::new(Mutex::new(CrossShardPool::new(config.shard_count)?));
        let services = RoundServices {
            builder: Arc::new(SampleBlockBuilder::new(
                chain.clone(),
                cross_shard_pool.clone(),
                options.transactions_per_block,
            )),
            chain: chain.clone(),
            network: network.clone(),
            committees: chain.clone(),
        };

        let mut engines = BTreeMap::new();
        for (layer, members) in keypairs {
            let mut layer_engines = Vec::with_capacity(members.len());
            for keypair in members {
                let engine = Arc::new(RoundEngine::new(
                    keypair,
                    config.clone(),
                    services.clone(),
                    chain.clone(),
                    cross_shard_pool.clone(),
                )?);
                network.register(layer, &engine);
                layer_engines.push(engine);
            }
            engines.insert(layer, layer_engines);
        }

        info!(
            "devnet ready: {} layers, {} validators per committee",
            layers.len(),
            options.validators_per_committee
        );
        Ok(Self {
            chain,
            network,
            cross_shard_pool,
            engines,
        })
    }

    pub fn chain(&self) -> &Arc<MemoryChain> {
        &self.chain
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    pub fn cross_shard_pool(&self) -> &Arc<Mutex<CrossShardPool>> {
        &self.cross_shard_pool
    }

    pub fn layers(&self) -> Vec<ChainLayer> {
        self.engines.keys().copied().collect()
    }

    /// Engines of `layer`, in committee order.
    pub fn engines(&self, layer: ChainLayer) -> &[Arc<RoundEngine>] {
        self.engines.get(&layer).map(Vec::as_slice).unwrap_or_default()
    }

    /// Cancel every engine's active and future rounds.
    pub fn shutdown(&self) {
        for engine in self.engines.values().flatten() {
            engine.shutdown();
        }
    }

    /// Run one round on every engine of `layer`.
    pub async fn run_round(
        &self,
        layer: ChainLayer,
        attempt: u64,
    ) -> Result<Vec<Result<PendingBlock, EngineError>>, DevnetError> {
        let everyone: Vec<usize> = (0..self.engines(layer).len()).collect();
        self.run_round_with(layer, attempt, &everyone).await
    }

    /// Run one round on the engines at `participants`; the others stay silent.
    /// Results come back in the order of `participants`.
    pub async fn run_round_with(
        &self,
        layer: ChainLayer,
        attempt: u64,
        participants: &[usize],
    ) -> Result<Vec<Result<PendingBlock, EngineError>>, DevnetError> {
        let engines = self.engines(layer);
        let mut tasks = JoinSet::new();
        for (slot, &index) in participants.iter().enumerate() {
            let engine = engines
                .get(index)
                .cloned()
                .ok_or(DevnetError::UnknownValidator { layer, index })?;
            tasks.spawn(async move { (slot, engine.run_round(layer, attempt).await) });
        }

        let mut results: Vec<Option<Result<PendingBlock, EngineError>>> = participants.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (slot, result) = joined.map_err(|e| DevnetError::Task(e.to_string()))?;
            results[slot] = Some(result);
        }
        Ok(results.into_iter().flatten().collect())
    }

    /// Run `layer` until `heights` more blocks are final on the shared chain.
    pub async fn run_layer(&self, layer: ChainLayer, heights: u64) -> Result<LayerReport, DevnetError> {
        let target = self.chain.best_height(layer) + heights;
        let mut tasks = JoinSet::new();
        for engine in self.engines(layer) {
            let engine = engine.clone();
            tasks.spawn(async move { engine.run_layer(layer, heights).await });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(|e| DevnetError::Task(e.to_string()))? {
                Ok(_) => {}
                Err(e) => {
                    error!("{}: validator stopped: {}", layer, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        let (height, tip) = self.chain.tip(layer);
        if height >= target {
            return Ok(LayerReport { layer, height, tip });
        }
        Err(match first_error {
            Some(e) => DevnetError::Engine(e),
            None => DevnetError::TargetMissed {
                layer,
                reached: height,
                target,
            },
        })
    }

    /// Run the beacon chain and every shard concurrently for `heights` blocks.
    pub async fn run(self: &Arc<Self>, heights: u64) -> Result<Vec<LayerReport>, DevnetError> {
        let mut tasks = JoinSet::new();
        for layer in self.layers() {
            let devnet = self.clone();
            tasks.spawn(async move { devnet.run_layer(layer, heights).await });
        }

        let mut reports = Vec::new();
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(|e| DevnetError::Task(e.to_string()))? {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!("{}", e);
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        reports.sort_by_key(|report| report.layer);
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_deterministic_and_distinct_per_layer() {
        let a = devnet_keypair(ChainLayer::Shard(0), 0).unwrap();
        let b = devnet_keypair(ChainLayer::Shard(0), 0).unwrap();
        let c = devnet_keypair(ChainLayer::Shard(1), 0).unwrap();
        assert_eq!(a.public(), b.public());
        assert_ne!(a.public(), c.public());
    }

    #[test]
    fn test_devnet_builds_one_committee_per_layer() {
        let config = ConsensusConfig {
            shard_count: 2,
            ..ConsensusConfig::default()
        };
        let devnet = Devnet::new(DevnetOptions::default(), config).unwrap();

        assert_eq!(
            devnet.layers(),
            vec![ChainLayer::Beacon, ChainLayer::Shard(0), ChainLayer::Shard(1)]
        );
        assert_eq!(devnet.engines(ChainLayer::Shard(1)).len(), 4);
        assert!(devnet.engines(ChainLayer::Shard(7)).is_empty());
    }

    #[test]
    fn test_devnet_rejects_empty_committees() {
        let options = DevnetOptions {
            validators_per_committee: 0,
            ..DevnetOptions::default()
        };
        assert!(matches!(
            Devnet::new(options, ConsensusConfig::default()),
            Err(DevnetError::Committee(_))
        ));
    }
}
