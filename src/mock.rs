//! In-memory chain and relay doubles for unit tests.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use alloy::consensus::{Transaction, TxEnvelope};
use alloy::eips::eip2718::Decodable2718;
use alloy::primitives::{Address, B256, Bytes, U256, keccak256};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde_json::json;
use url::Url;

use crate::chain::{
    CallRequest, ChainClient, FeeData, FeeHistory, NonceTag, PendingTx, TxReceipt,
};
use crate::config::{BumpPolicy, Config, NonceStrategy, RunMode, SubmitMode};
use crate::constants::GWEI;
use crate::error::{MintError, Result};
use crate::flashbots::{BundleRelay, BundleSubmission, SimulationReport};
use crate::mint::MintCall;

pub const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
pub const TEST_CONTRACT: Address = Address::repeat_byte(0xaa);

pub fn test_config() -> Config {
    Config {
        mode: RunMode::Single,
        rpc_urls: vec![Url::parse("http://localhost:8545").unwrap()],
        priority_rpc: None,
        rpc_timeout: Duration::from_secs(3),
        rpc_retry_count: 2,
        prefer_priority_rpc: true,
        contract_address: TEST_CONTRACT,
        mint_call: MintCall::from_signature("function mint(uint256 _count) payable", &[json!("1")])
            .unwrap(),
        mint_price: U256::ZERO,
        mint_amount: U256::from(1),
        gas_limit: None,
        gas_limit_buffer_percent: 25,
        submit_mode: SubmitMode::Public,
        nonce_strategy: NonceStrategy::Pending,
        nonce_offset: 0,
        retry_attempts: 8,
        retry_backoff: Duration::from_millis(1_000),
        retry_backoff_multiplier: 1.5,
        gas_bump_percent: 25,
        bump_policy: BumpPolicy::Aggressive,
        fee_override: None,
        dynamic_fee_multiplier: 1.2,
        max_fee_cap: 500 * GWEI,
        private_keys: vec![PrivateKeySigner::from_str(TEST_KEY).unwrap()],
        concurrency: 6,
        tx_delay: Duration::ZERO,
        jitter: Duration::ZERO,
        call_static_check: true,
        balance_check: true,
        mempool_monitoring: false,
        preload_nonces: true,
        wait_next_block: false,
        dry_run: false,
        start_at_block: None,
        start_at_timestamp: None,
        flashbots_relays: vec![Url::parse("https://relay.flashbots.net").unwrap()],
        flashbots_auth_key: PrivateKeySigner::random(),
        confirmation_timeout: Duration::from_secs(30),
    }
}

/// Decodes a signed raw transaction produced by the wallet.
pub fn decode_raw(raw: &Bytes) -> TxEnvelope {
    TxEnvelope::decode_2718(&mut raw.as_ref()).unwrap()
}

/// Headline fee of a signed raw transaction: gas price or max fee.
pub fn raw_fee(raw: &Bytes) -> u128 {
    let tx = decode_raw(raw);
    tx.gas_price().unwrap_or_else(|| tx.max_fee_per_gas())
}

#[derive(Default)]
struct State {
    calls: HashMap<String, u32>,
    failures: HashMap<String, u32>,
    failing_addresses: Vec<Address>,
    fee_data: FeeData,
    tx_counts: HashMap<Address, u64>,
    balances: HashMap<Address, U256>,
    code: Option<Bytes>,
    call_reverts: bool,
    estimate_with_sender: Option<u64>,
    estimate_without_sender: Option<u64>,
    sent: Vec<Bytes>,
    unmined_sends: u32,
    revert_receipts: bool,
    receipts: HashMap<B256, TxReceipt>,
    pending: Vec<PendingTx>,
}

/// A scripted chain. Every call is counted by method name and can be made to
/// fail a number of times with [`MockChain::fail_next`].
pub struct MockChain {
    block: AtomicU64,
    auto_advance: AtomicBool,
    mining: AtomicBool,
    state: Mutex<State>,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            block: AtomicU64::new(100),
            auto_advance: AtomicBool::new(false),
            mining: AtomicBool::new(true),
            state: Mutex::new(State {
                fee_data: FeeData {
                    gas_price: Some(25 * GWEI),
                    max_fee_per_gas: Some(50 * GWEI),
                    max_priority_fee_per_gas: Some(2 * GWEI),
                },
                code: Some(Bytes::from_static(&[0x60, 0x80, 0x60, 0x40])),
                estimate_with_sender: Some(100_000),
                estimate_without_sender: Some(90_000),
                ..State::default()
            }),
        }
    }

    fn enter(&self, method: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(method.to_string()).or_default() += 1;
        if let Some(left) = state.failures.get_mut(method) {
            if *left > 0 {
                *left -= 1;
                return Err(if method == "send_raw_transaction" {
                    MintError::Broadcast(format!("{method} rejected"))
                } else {
                    MintError::Rpc(format!("{method} unavailable"))
                });
            }
        }
        Ok(())
    }

    pub fn fail_next(&self, method: &str, times: u32) {
        self.state.lock().unwrap().failures.insert(method.to_string(), times);
    }

    pub fn calls(&self, method: &str) -> u32 {
        self.state.lock().unwrap().calls.get(method).copied().unwrap_or(0)
    }

    pub fn current_block(&self) -> u64 {
        self.block.load(Ordering::SeqCst)
    }

    pub fn set_block(&self, block: u64) {
        self.block.store(block, Ordering::SeqCst);
    }

    /// Every `block_number` call moves the chain one block forward.
    pub fn set_auto_advance(&self, enabled: bool) {
        self.auto_advance.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fee_data(&self, fee_data: FeeData) {
        self.state.lock().unwrap().fee_data = fee_data;
    }

    pub fn set_transaction_count(&self, address: Address, count: u64) {
        self.state.lock().unwrap().tx_counts.insert(address, count);
    }

    pub fn fail_address(&self, address: Address) {
        self.state.lock().unwrap().failing_addresses.push(address);
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.state.lock().unwrap().balances.insert(address, balance);
    }

    pub fn set_code(&self, code: Bytes) {
        self.state.lock().unwrap().code = Some(code);
    }

    pub fn set_call_reverts(&self, reverts: bool) {
        self.state.lock().unwrap().call_reverts = reverts;
    }

    /// `None` makes the matching estimate fail.
    pub fn set_estimates(&self, with_sender: Option<u64>, without_sender: Option<u64>) {
        let mut state = self.state.lock().unwrap();
        state.estimate_with_sender = with_sender;
        state.estimate_without_sender = without_sender;
    }

    /// Broadcasts are mined into a receipt while mining is enabled.
    pub fn set_mining(&self, enabled: bool) {
        self.mining.store(enabled, Ordering::SeqCst);
    }

    /// The next `count` accepted broadcasts never get a receipt.
    pub fn skip_mining(&self, count: u32) {
        self.state.lock().unwrap().unmined_sends = count;
    }

    pub fn set_revert_receipts(&self, revert: bool) {
        self.state.lock().unwrap().revert_receipts = revert;
    }

    pub fn push_pending(&self, tx: PendingTx) {
        self.state.lock().unwrap().pending.push(tx);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Stores a receipt for `raw` in the current block.
    pub fn mine(&self, raw: &Bytes) -> B256 {
        let hash = keccak256(raw);
        let block = self.current_block();
        let mut state = self.state.lock().unwrap();
        let success = !state.revert_receipts;
        state.receipts.insert(
            hash,
            TxReceipt {
                hash,
                block_number: Some(block),
                gas_used: 100_000,
                effective_gas_price: 30 * GWEI,
                success,
            },
        );
        hash
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn chain_id(&self) -> Result<u64> {
        self.enter("chain_id")?;
        Ok(1)
    }

    async fn block_number(&self) -> Result<u64> {
        self.enter("block_number")?;
        if self.auto_advance.load(Ordering::SeqCst) {
            Ok(self.block.fetch_add(1, Ordering::SeqCst))
        } else {
            Ok(self.current_block())
        }
    }

    async fn transaction_count(&self, address: Address, _tag: NonceTag) -> Result<u64> {
        self.enter("transaction_count")?;
        let state = self.state.lock().unwrap();
        if state.failing_addresses.contains(&address) {
            return Err(MintError::Rpc(format!("no account state for {address}")));
        }
        Ok(state.tx_counts.get(&address).copied().unwrap_or(0))
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        self.enter("balance")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .balances
            .get(&address)
            .copied()
            .unwrap_or(U256::from(10u128.pow(18))))
    }

    async fn code(&self, _address: Address) -> Result<Bytes> {
        self.enter("code")?;
        Ok(self.state.lock().unwrap().code.clone().unwrap_or_default())
    }

    async fn fee_data(&self) -> Result<FeeData> {
        self.enter("fee_data")?;
        Ok(self.state.lock().unwrap().fee_data)
    }

    async fn fee_history(&self, block_count: u64, _percentiles: &[f64]) -> Result<FeeHistory> {
        self.enter("fee_history")?;
        let blocks = block_count.max(1) as usize;
        let mut base_fee_per_gas: Vec<u128> = (0..blocks).map(|i| (20 + i as u128 % 5) * GWEI).collect();
        base_fee_per_gas.push(30 * GWEI);
        Ok(FeeHistory {
            base_fee_per_gas,
            reward: vec![vec![GWEI, 2 * GWEI, 3 * GWEI]; blocks],
        })
    }

    async fn call(&self, request: &CallRequest) -> Result<Bytes> {
        self.enter("call")?;
        if self.state.lock().unwrap().call_reverts {
            return Err(MintError::Rpc(format!(
                "execution reverted: mint not active ({})",
                request.to
            )));
        }
        Ok(Bytes::new())
    }

    async fn estimate_gas(&self, request: &CallRequest) -> Result<u64> {
        self.enter("estimate_gas")?;
        let state = self.state.lock().unwrap();
        let estimate = match request.from {
            Some(_) => state.estimate_with_sender,
            None => state.estimate_without_sender,
        };
        estimate.ok_or_else(|| MintError::Rpc("gas estimation failed".into()))
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256> {
        self.enter("send_raw_transaction")?;
        let mine = {
            let mut state = self.state.lock().unwrap();
            state.sent.push(raw.clone());
            if state.unmined_sends > 0 {
                state.unmined_sends -= 1;
                false
            } else {
                self.mining.load(Ordering::SeqCst)
            }
        };
        if mine {
            Ok(self.mine(raw))
        } else {
            Ok(keccak256(raw))
        }
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>> {
        self.enter("transaction_receipt")?;
        Ok(self.state.lock().unwrap().receipts.get(&hash).copied())
    }

    async fn transaction(&self, hash: B256) -> Result<Option<PendingTx>> {
        self.enter("transaction")?;
        let state = self.state.lock().unwrap();
        Ok(state.pending.iter().find(|tx| tx.hash == hash).copied())
    }

    async fn pending_transactions(&self) -> Result<BoxStream<'static, B256>> {
        self.enter("pending_transactions")?;
        let hashes: Vec<B256> = self.state.lock().unwrap().pending.iter().map(|tx| tx.hash).collect();
        Ok(stream::iter(hashes).chain(stream::pending()).boxed())
    }
}

/// A relay that records every bundle and, when `including`, mines the first
/// transaction of each submitted bundle into the backing chain.
pub struct MockRelay {
    url: Url,
    chain: std::sync::Arc<MockChain>,
    including: AtomicBool,
    state: Mutex<RelayState>,
}

#[derive(Default)]
struct RelayState {
    simulation_failures: u32,
    simulations: u32,
    submissions: Vec<(Vec<Bytes>, u64)>,
}

impl MockRelay {
    pub fn new(chain: std::sync::Arc<MockChain>) -> Self {
        Self {
            url: Url::parse("https://relay.test").unwrap(),
            chain,
            including: AtomicBool::new(false),
            state: Mutex::new(RelayState::default()),
        }
    }

    pub fn set_including(&self, including: bool) {
        self.including.store(including, Ordering::SeqCst);
    }

    pub fn fail_simulations(&self, times: u32) {
        self.state.lock().unwrap().simulation_failures = times;
    }

    pub fn simulations(&self) -> u32 {
        self.state.lock().unwrap().simulations
    }

    pub fn submissions(&self) -> Vec<(Vec<Bytes>, u64)> {
        self.state.lock().unwrap().submissions.clone()
    }
}

#[async_trait]
impl BundleRelay for MockRelay {
    fn endpoint(&self) -> &Url {
        &self.url
    }

    async fn simulate(&self, _txs: &[Bytes], _target_block: u64) -> Result<SimulationReport> {
        let mut state = self.state.lock().unwrap();
        state.simulations += 1;
        if state.simulation_failures > 0 {
            state.simulation_failures -= 1;
            return Err(MintError::Simulation("execution reverted".into()));
        }
        Ok(SimulationReport {
            bundle_hash: Some(B256::repeat_byte(0xbb)),
            gas_used: 100_000,
        })
    }

    async fn send_bundle(&self, txs: &[Bytes], target_block: u64) -> Result<BundleSubmission> {
        self.state
            .lock()
            .unwrap()
            .submissions
            .push((txs.to_vec(), target_block));
        if self.including.load(Ordering::SeqCst) {
            if let Some(raw) = txs.first() {
                self.chain.mine(raw);
            }
        }
        Ok(BundleSubmission {
            bundle_hash: Some(B256::repeat_byte(0xbb)),
        })
    }
}

/// Hands out the same relay for every url.
pub struct StaticConnector(pub std::sync::Arc<MockRelay>);

#[async_trait]
impl crate::flashbots::RelayConnector for StaticConnector {
    async fn connect(&self, _url: &Url) -> Result<std::sync::Arc<dyn BundleRelay>> {
        Ok(self.0.clone())
    }
}
