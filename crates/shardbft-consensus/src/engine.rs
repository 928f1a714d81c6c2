// ROUND ENGINE
// Drives consecutive rounds for each layer this node serves: picks the height
// and proposer, opens an inbox for the round, routes inbound traffic to it,
// hands finalized blocks to the sink and runs the cross-shard pipeline.
//
// SAFETY INVARIANTS:
// 1. At most one active round per layer; its inbox only receives its own height
// 2. Messages for a height whose round has not opened yet are kept (bounded), never lost silently
// 3. Cross-shard blocks enter the pool only after full verification
// 4. Shutdown cancels every active round through a child token

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use shardbft_core::{
    ChainLayer, CrossShardBlock, CrossShardPool, CrossShardRequest, PendingBlock, ShardBlock,
};
use shardbft_crypto::{Hash, ValidatorKeypair};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{FinalizedBlockSink, RoundServices};
use crate::config::ConsensusConfig;
use crate::error::{EngineError, RoundError};
use crate::message::ConsensusMessage;
use crate::round::{ConsensusRound, RoundSetup};

/// Messages kept per layer for rounds that have not opened yet.
const MAX_BACKLOG_PER_LAYER: usize = 1024;

struct Route {
    height: u64,
    inbox: UnboundedSender<ConsensusMessage>,
}

#[derive(Default)]
struct Router {
    routes: HashMap<ChainLayer, Route>,
    backlog: HashMap<ChainLayer, VecDeque<ConsensusMessage>>,
}

pub struct RoundEngine {
    keypair: Arc<ValidatorKeypair>,
    config: Arc<ConsensusConfig>,
    services: RoundServices,
    sink: Arc<dyn FinalizedBlockSink>,
    cross_shard_pool: Arc<Mutex<CrossShardPool>>,
    router: Mutex<Router>,
    shutdown: CancellationToken,
}

impl RoundEngine {
    pub fn new(
        keypair: Arc<ValidatorKeypair>,
        config: ConsensusConfig,
        services: RoundServices,
        sink: Arc<dyn FinalizedBlockSink>,
        cross_shard_pool: Arc<Mutex<CrossShardPool>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            keypair,
            config: Arc::new(config),
            services,
            sink,
            cross_shard_pool,
            router: Mutex::new(Router::default()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn keypair(&self) -> &Arc<ValidatorKeypair> {
        &self.keypair
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Abort every active round and stop [`run_layer`](Self::run_layer) loops.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ==================== ROUNDS ====================

    /// Run one round for the next height of `layer`.
    ///
    /// `attempt` shifts the proposer so a failed height is retried under a
    /// different leader.
    pub async fn run_round(&self, layer: ChainLayer, attempt: u64) -> Result<PendingBlock, EngineError> {
        let height = self.services.chain.best_height(layer) + 1;
        let committee = self
            .services
            .committees
            .committee(layer, height)
            .map_err(|source| EngineError::Committee { layer, source })?;
        let proposer = committee.proposer(height, attempt).clone();
        let round_error = |source| EngineError::Round { layer, height, source };

        let (sender, inbox) = unbounded_channel();
        let round = ConsensusRound::new(
            RoundSetup {
                layer,
                height,
                proposer,
                committee,
            },
            self.keypair.clone(),
            self.config.clone(),
            self.services.clone(),
            inbox,
            self.shutdown.child_token(),
        )
        .map_err(round_error)?;

        self.open_route(layer, height, sender);
        let outcome = round.start().await;
        self.close_route(layer, height);
        let block = outcome.map_err(round_error)?;

        self.sink.block_finalized(&block).map_err(EngineError::Sink)?;
        if let PendingBlock::Shard(shard_block) = &block {
            self.after_shard_block(shard_block);
        }
        Ok(block)
    }

    /// Keep running rounds for `layer` until `heights` more blocks are final.
    ///
    /// A failed round is retried with the next attempt number after the
    /// configured backoff; the attempt counter resets whenever the chain
    /// advances. Returns the height reached.
    pub async fn run_layer(&self, layer: ChainLayer, heights: u64) -> Result<u64, EngineError> {
        let target = self.services.chain.best_height(layer) + heights;
        let mut attempt: u64 = 0;
        let mut attempt_height = 0;

        loop {
            let best = self.services.chain.best_height(layer);
            if best >= target {
                return Ok(best);
            }
            if self.shutdown.is_cancelled() {
                return Err(EngineError::Shutdown);
            }
            if best + 1 != attempt_height {
                attempt_height = best + 1;
                attempt = 0;
            }

            match self.run_round(layer, attempt).await {
                Ok(block) => debug!("{}: height {} final", layer, block.height()),
                Err(EngineError::Round {
                    source: RoundError::Quit,
                    ..
                }) => return Err(EngineError::Shutdown),
                Err(e) => {
                    attempt += 1;
                    error!("{}: {} (attempt {})", layer, e, attempt);
                    if self.services.chain.best_height(layer) >= attempt_height {
                        continue;
                    }
                    if attempt >= u64::from(self.config.max_round_attempts) {
                        return Err(e);
                    }
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return Err(EngineError::Shutdown),
                        _ = sleep(self.config.retry_backoff()) => {}
                    }
                }
            }
        }
    }

    // ==================== ROUTING ====================

    /// Route an inbound message to the active round of its layer.
    ///
    /// Fire-and-forget: never blocks, never fails. Messages for a future
    /// height wait in a bounded backlog until that round opens.
    pub fn deliver(&self, message: ConsensusMessage) {
        let layer = message.layer;
        let mut router = self.router.lock();
        if let Some(route) = router.routes.get(&layer) {
            if message.height == route.height {
                if route.inbox.send(message).is_err() {
                    debug!("{}: round already finished, message dropped", layer);
                }
                return;
            }
            if message.height < route.height {
                debug!("{}: stale message for height {}", layer, message.height);
                return;
            }
        } else if message.height <= self.services.chain.best_height(layer) {
            debug!("{}: message for finalized height {}", layer, message.height);
            return;
        }

        let queue = router.backlog.entry(layer).or_default();
        if queue.len() >= MAX_BACKLOG_PER_LAYER {
            warn!("{}: backlog full, dropping oldest message", layer);
            queue.pop_front();
        }
        queue.push_back(message);
    }

    fn open_route(&self, layer: ChainLayer, height: u64, inbox: UnboundedSender<ConsensusMessage>) {
        let mut router = self.router.lock();
        if let Some(queue) = router.backlog.get_mut(&layer) {
            queue.retain(|message| message.height >= height);
            let (ready, later): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(|message| message.height == height);
            *queue = later;
            for message in ready {
                // the receiver is alive: the round has not started yet
                let _ = inbox.send(message);
            }
        }
        router.routes.insert(layer, Route { height, inbox });
    }

    fn close_route(&self, layer: ChainLayer, height: u64) {
        let mut router = self.router.lock();
        if router.routes.get(&layer).is_some_and(|route| route.height == height) {
            router.routes.remove(&layer);
        }
    }

    // ==================== CROSS-SHARD ====================

    /// Verify an incoming cross-shard block and pool it for its destination.
    ///
    /// On rejection the block is re-requested from the source shard; a resent
    /// copy is verified again from scratch. Returns false for duplicates.
    pub fn receive_cross_shard(&self, block: CrossShardBlock) -> Result<bool, EngineError> {
        let from_shard = block.from_shard();
        let result = self
            .services
            .committees
            .committee(ChainLayer::Shard(from_shard), block.height())
            .map_err(|source| EngineError::Committee {
                layer: ChainLayer::Shard(from_shard),
                source,
            })
            .and_then(|committee| {
                self.cross_shard_pool
                    .lock()
                    .insert(block.clone(), &committee)
                    .map_err(|source| EngineError::CrossShard { from_shard, source })
            });

        match result {
            Ok(inserted) => {
                if inserted {
                    info!(
                        "shard-{}: pooled {} coins from shard {} height {}",
                        block.to_shard,
                        block.output_coins.len(),
                        from_shard,
                        block.height()
                    );
                }
                Ok(inserted)
            }
            Err(e) => {
                if let Ok(block_hash) = block.hash() {
                    self.services.network.request_cross_shard(CrossShardRequest {
                        block_hash,
                        from_shard,
                        to_shard: block.to_shard,
                    });
                }
                Err(e)
            }
        }
    }

    /// Answer a re-request for a cross-shard block this node can rebuild.
    pub fn handle_cross_shard_request(&self, request: &CrossShardRequest) -> bool {
        let Some(source) = self.services.chain.finalized_shard_block(&request.block_hash) else {
            debug!("no finalized block {} to resend", request.block_hash);
            return false;
        };
        match CrossShardBlock::from_finalized(&source, request.to_shard, self.config.shard_count) {
            Ok(block) => {
                self.services.network.send_cross_shard(block);
                true
            }
            Err(e) => {
                warn!("cannot rebuild cross-shard block {}: {}", request.block_hash, e);
                false
            }
        }
    }

    fn after_shard_block(&self, block: &ShardBlock) {
        let shard_id = block.header.shard_id;
        let consumed: Vec<Hash> = block
            .body
            .cross_shard_inputs
            .iter()
            .filter_map(|input| input.hash().ok())
            .collect();
        if !consumed.is_empty() {
            self.cross_shard_pool.lock().remove_consumed(shard_id, &consumed);
        }

        if block.header.producer != *self.keypair.public() {
            return;
        }
        for to_shard in (0..self.config.shard_count).map(|s| s as u8) {
            if to_shard == shard_id {
                continue;
            }
            match CrossShardBlock::from_finalized(block, to_shard, self.config.shard_count) {
                Ok(cross) if cross.output_coins.is_empty() => {}
                Ok(cross) => {
                    debug!(
                        "shard-{}: sending {} coins to shard {}",
                        shard_id,
                        cross.output_coins.len(),
                        to_shard
                    );
                    self.services.network.send_cross_shard(cross);
                }
                Err(e) => warn!("shard-{}: cannot build cross-shard block for {}: {}", shard_id, to_shard, e),
            }
        }
    }
}
