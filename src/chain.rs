//! The RPC surface the submission pipeline consumes.
//!
//! Everything above this module talks to the chain through [`ChainClient`],
//! which keeps the engine independent of the transport and lets the endpoint
//! pool wrap several clients behind one handle.

use std::sync::Arc;

use alloy::primitives::{Address, B256, Bytes, U256};
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

pub type SharedClient = Arc<dyn ChainClient>;

/// Block tag used when reading an account's transaction count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceTag {
    Pending,
    Latest,
}

/// Network fee suggestions, as reported by the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeeData {
    pub gas_price: Option<u128>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
}

/// `eth_feeHistory` result reduced to what the fee oracle keeps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeeHistory {
    pub base_fee_per_gas: Vec<u128>,
    pub reward: Vec<Vec<u128>>,
}

/// A read-only call or gas estimation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Option<Address>,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

/// The parts of a pending transaction the competition monitor looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTx {
    pub hash: B256,
    pub to: Option<Address>,
    pub gas_price: Option<u128>,
    pub max_fee_per_gas: Option<u128>,
}

impl PendingTx {
    /// The bid this transaction competes with: gas price, else max fee.
    pub fn bid(&self) -> Option<u128> {
        self.gas_price.or(self.max_fee_per_gas)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub hash: B256,
    pub block_number: Option<u64>,
    pub gas_used: u64,
    pub effective_gas_price: u128,
    pub success: bool,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64>;

    async fn block_number(&self) -> Result<u64>;

    async fn transaction_count(&self, address: Address, tag: NonceTag) -> Result<u64>;

    async fn balance(&self, address: Address) -> Result<U256>;

    async fn code(&self, address: Address) -> Result<Bytes>;

    async fn fee_data(&self) -> Result<FeeData>;

    async fn fee_history(&self, block_count: u64, percentiles: &[f64]) -> Result<FeeHistory>;

    async fn call(&self, request: &CallRequest) -> Result<Bytes>;

    async fn estimate_gas(&self, request: &CallRequest) -> Result<u64>;

    async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256>;

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>>;

    async fn transaction(&self, hash: B256) -> Result<Option<PendingTx>>;

    /// Stream of pending transaction hashes as the node announces them.
    async fn pending_transactions(&self) -> Result<BoxStream<'static, B256>>;
}
