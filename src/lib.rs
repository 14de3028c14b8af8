//! Library root for the mintrush crate.
//!
//! Submits NFT mint transactions under contention: fee estimation and
//! escalation, nonce tracking, mempool competition sampling and private
//! bundle relays, dispatched over one or many wallets.

pub use alloy;

pub mod chain;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod endpoint_pool;
pub mod error;
pub mod estimator;
pub mod flashbots;
pub mod gas_station;
pub mod ignition;
pub mod mempool;
pub mod mint;
pub mod nonce;
pub mod preflight;
pub mod provider;
pub mod stats;
pub mod stream;
pub mod tx_sender;
pub mod wallet;

#[cfg(test)]
mod mock;

pub use config::Config;
pub use error::{MintError, Result};
