//! Local devnet for shardbft.
//!
//! Wires [`RoundEngine`](shardbft_consensus::RoundEngine)s for a beacon
//! committee and every shard committee to an in-memory network, chain and
//! block builder, so whole multi-layer runs execute inside one process.

pub mod builder;
pub mod chain;
pub mod cluster;
pub mod error;
pub mod network;

pub use builder::SampleBlockBuilder;
pub use chain::{genesis_hash, MemoryChain};
pub use cluster::{devnet_keypair, Devnet, DevnetOptions, LayerReport};
pub use error::DevnetError;
pub use network::{drop_from, drop_kind, Interceptor, MemoryNetwork, NetworkStats};
