//! Chain data model for the shardbft node.
//!
//! Committees, beacon and shard blocks with their consensus artifacts, and the
//! cross-shard merkle proofs that let one shard accept coins produced by another.

pub mod block;
pub mod committee;
pub mod cross_shard;
pub mod cross_shard_pool;
pub mod error;
pub mod transaction;

pub use block::{
    BeaconBlock, BeaconBody, BeaconHeader, ConsensusArtifacts, PendingBlock, ShardBlock, ShardBody,
    ShardHeader, ShardState,
};
pub use committee::{ChainLayer, Committee};
pub use cross_shard::{
    coin_batch_hash, compute_shard_tx_root, group_coins_by_shard, validate_shard_count,
    verify_merkle_path, CrossShardBlock, CrossShardMerkle, CrossShardRequest, MAX_SHARDS,
};
pub use cross_shard_pool::CrossShardPool;
pub use error::{BlockError, CommitteeError, CrossShardError};
pub use transaction::{OutputCoin, Transaction};
