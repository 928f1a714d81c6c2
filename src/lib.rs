//! shardbft node: layered configuration and logging for the `shardbft` binary.
//!
//! The protocol lives in the workspace crates: `shardbft-crypto` (hashes, keys,
//! multisignature), `shardbft-core` (blocks, committees, cross-shard proofs),
//! `shardbft-consensus` (rounds and the round engine) and `shardbft-devnet`
//! (in-process network and chain).

pub mod config;
pub mod logging;

pub use crate::config::{DevnetSection, NodeConfig, NodeConfigError};
