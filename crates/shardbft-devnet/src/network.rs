// MEMORY NETWORK
// Fire-and-forget hub connecting the engines of one process. Consensus
// traffic is fanned out to every other engine of the layer; cross-shard
// blocks go to the destination shard and re-requests to the source shard.
//
// SAFETY INVARIANTS:
// 1. No lock is held while an engine is called back
// 2. A sender never receives its own broadcast
// 3. Re-requests per (block, destination) are capped so a bad source cannot loop forever

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use shardbft_consensus::{ConsensusMessage, MessageKind, NetworkSender, RoundEngine};
use shardbft_core::{ChainLayer, CrossShardBlock, CrossShardRequest};
use shardbft_crypto::{Hash, ValidatorKey};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Re-requests answered per (source block, destination shard).
const MAX_RESENDS: usize = 3;

/// Decides what `target` receives for a broadcast, in delivery order: the
/// message, a rewritten or duplicated version of it, or nothing.
pub type Interceptor = Arc<dyn Fn(&ConsensusMessage, &ValidatorKey) -> Vec<ConsensusMessage> + Send + Sync>;

/// Drop every message of `kind`.
pub fn drop_kind(kind: MessageKind) -> Interceptor {
    Arc::new(move |message: &ConsensusMessage, _: &ValidatorKey| {
        (message.kind() != kind)
            .then(|| message.clone())
            .into_iter()
            .collect()
    })
}

/// Drop messages of any of `kinds` sent by one of `senders`.
pub fn drop_from(senders: Vec<ValidatorKey>, kinds: Vec<MessageKind>) -> Interceptor {
    Arc::new(move |message: &ConsensusMessage, _: &ValidatorKey| {
        let blocked = senders.contains(&message.sender) && kinds.contains(&message.kind());
        (!blocked).then(|| message.clone()).into_iter().collect()
    })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStats {
    pub delivered: usize,
    pub dropped: usize,
    pub cross_shard_sent: usize,
    pub cross_shard_requests: usize,
}

pub struct MemoryNetwork {
    peers: RwLock<BTreeMap<ChainLayer, Vec<Weak<RoundEngine>>>>,
    interceptor: RwLock<Option<Interceptor>>,
    cross_shard_link: AtomicBool,
    resends: Mutex<HashMap<(Hash, u8), usize>>,
    stats: Mutex<NetworkStats>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self {
            peers: RwLock::new(BTreeMap::new()),
            interceptor: RwLock::new(None),
            cross_shard_link: AtomicBool::new(true),
            resends: Mutex::new(HashMap::new()),
            stats: Mutex::new(NetworkStats::default()),
        }
    }
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Cut or restore delivery of cross-shard blocks between shards.
    pub fn set_cross_shard_link(&self, up: bool) {
        self.cross_shard_link.store(up, Ordering::SeqCst);
    }

    pub fn register(&self, layer: ChainLayer, engine: &Arc<RoundEngine>) {
        self.peers
            .write()
            .entry(layer)
            .or_default()
            .push(Arc::downgrade(engine));
    }

    pub fn set_interceptor(&self, interceptor: Interceptor) {
        *self.interceptor.write() = Some(interceptor);
    }

    pub fn clear_interceptor(&self) {
        *self.interceptor.write() = None;
    }

    pub fn stats(&self) -> NetworkStats {
        *self.stats.lock()
    }

    fn peers(&self, layer: ChainLayer) -> Vec<Arc<RoundEngine>> {
        self.peers
            .read()
            .get(&layer)
            .map(|engines| engines.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }
}

impl NetworkSender for MemoryNetwork {
    fn broadcast_to_layer(&self, layer: ChainLayer, message: ConsensusMessage) {
        let interceptor = self.interceptor.read().clone();
        let mut delivered = 0;
        let mut dropped = 0;

        for engine in self.peers(layer) {
            let target = engine.keypair().public();
            if *target == message.sender {
                continue;
            }
            let outgoing = match &interceptor {
                Some(intercept) => intercept(&message, target),
                None => vec![message.clone()],
            };
            if outgoing.is_empty() {
                dropped += 1;
            }
            for copy in outgoing {
                engine.deliver(copy);
                delivered += 1;
            }
        }

        let mut stats = self.stats.lock();
        stats.delivered += delivered;
        stats.dropped += dropped;
    }

    fn send_cross_shard(&self, block: CrossShardBlock) {
        if !self.cross_shard_link.load(Ordering::SeqCst) {
            debug!("cross-shard link down, dropping block {} -> {}", block.from_shard(), block.to_shard);
            self.stats.lock().dropped += 1;
            return;
        }
        self.stats.lock().cross_shard_sent += 1;
        for engine in self.peers(ChainLayer::Shard(block.to_shard)) {
            match engine.receive_cross_shard(block.clone()) {
                Ok(true) => {}
                Ok(false) => debug!("cross-shard block {} -> {} already pooled", block.from_shard(), block.to_shard),
                Err(e) => debug!("cross-shard block rejected by {}: {}", engine.keypair().public(), e),
            }
        }
    }

    fn request_cross_shard(&self, request: CrossShardRequest) {
        {
            let mut resends = self.resends.lock();
            let count = resends.entry((request.block_hash, request.to_shard)).or_default();
            if *count >= MAX_RESENDS {
                warn!(
                    "giving up on cross-shard block {} for shard {} after {} re-requests",
                    request.block_hash, request.to_shard, count
                );
                return;
            }
            *count += 1;
        }
        self.stats.lock().cross_shard_requests += 1;

        for engine in self.peers(ChainLayer::Shard(request.from_shard)) {
            if engine.handle_cross_shard_request(&request) {
                return;
            }
        }
        warn!("no validator of shard {} could resend {}", request.from_shard, request.block_hash);
    }
}
