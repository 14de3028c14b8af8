//! The submission engine.
//!
//! One [`TransactionSender`] drives every wallet's mint to completion. It
//! builds the request once, then either replaces it on the public mempool
//! with escalating fees until a receipt shows up, or submits it to a private
//! relay as a single-transaction bundle, block after block. Both loops spend
//! the same attempt budget and back off the same way.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, Bytes, U256};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, SharedClient, TxReceipt};
use crate::config::{BumpPolicy, Config, SubmitMode};
use crate::constants::{
    BUNDLE_RETRY_BUMP, BUNDLE_RETRY_BUMP_CONTESTED, COMPETITION_PREBUMP_PERCENT,
    RECEIPT_POLL_INTERVAL,
};
use crate::endpoint_pool::EndpointPool;
use crate::error::{MintError, Result};
use crate::estimator::GasEstimator;
use crate::flashbots::{
    BundleRelay, BundleResolution, FlashbotsConnector, RelayConnector, connect_first,
    resolve_bundle,
};
use crate::gas_station::{FeeQuote, GasStation};
use crate::mempool::CompetitionMonitor;
use crate::nonce::NonceManager;
use crate::preflight::wait_until_block;
use crate::stats::RunStats;
use crate::wallet::{SignedTx, WalletContext};

/// A mint transaction before signing. Replacements share everything but the
/// fees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintRequest {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas_limit: Option<u64>,
    pub nonce: u64,
    pub chain_id: Option<u64>,
    pub fees: Option<FeeQuote>,
}

impl MintRequest {
    pub fn with_fees(&self, fees: FeeQuote) -> Self {
        Self {
            fees: Some(fees),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Pending,
    Success,
    RetryableFailure,
    FatalFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionAttempt {
    pub index: u32,
    pub fees: FeeQuote,
    pub outcome: AttemptOutcome,
}

/// Knobs that differ between submission flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnginePolicy {
    pub bump_policy: BumpPolicy,
    pub mempool_monitoring: bool,
    pub prefer_priority: bool,
}

impl EnginePolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bump_policy: config.bump_policy,
            mempool_monitoring: config.mempool_monitoring,
            prefer_priority: config.prefer_priority_rpc,
        }
    }

    /// Bump multiplier after the public attempt numbered `attempt` failed.
    pub fn retry_multiplier(&self, attempt: u32) -> f64 {
        match self.bump_policy {
            BumpPolicy::Aggressive if attempt > 3 => 2.0,
            BumpPolicy::Aggressive => 1.5,
            BumpPolicy::Conservative => 1.0,
        }
    }

    /// Bump multiplier after a failed bundle.
    pub fn bundle_retry_multiplier(&self, contested: bool) -> f64 {
        if contested {
            BUNDLE_RETRY_BUMP_CONTESTED
        } else {
            BUNDLE_RETRY_BUMP
        }
    }
}

fn next_backoff(current: Duration, multiplier: f64) -> Duration {
    Duration::from_millis((current.as_millis() as f64 * multiplier).ceil() as u64)
}

/// Work the dispatcher runs once per wallet.
#[async_trait]
pub trait WalletTask: Send + Sync {
    async fn run(&self, wallet: Arc<WalletContext>) -> Result<Option<TxReceipt>>;
}

pub struct TransactionSender {
    config: Arc<Config>,
    pool: EndpointPool,
    broadcaster: EndpointPool,
    gas_station: Arc<GasStation>,
    nonces: Arc<NonceManager>,
    monitor: Arc<CompetitionMonitor>,
    estimator: GasEstimator,
    relays: Arc<dyn RelayConnector>,
    stats: Arc<RunStats>,
    policy: EnginePolicy,
    chain_id: OnceCell<u64>,
    attempts: DashMap<Address, Vec<SubmissionAttempt>>,
}

impl TransactionSender {
    pub fn new(
        config: Arc<Config>,
        pool: EndpointPool,
        gas_station: Arc<GasStation>,
        nonces: Arc<NonceManager>,
        monitor: Arc<CompetitionMonitor>,
        stats: Arc<RunStats>,
    ) -> Self {
        let policy = EnginePolicy::from_config(&config);
        let client: SharedClient = Arc::new(pool.clone());
        let relays = Arc::new(FlashbotsConnector::new(
            config.flashbots_auth_key.clone(),
            config.rpc_timeout,
        ));

        Self {
            estimator: GasEstimator::new(&config, client),
            broadcaster: pool.with_priority(policy.prefer_priority),
            pool,
            gas_station,
            nonces,
            monitor,
            relays,
            stats,
            policy,
            chain_id: OnceCell::new(),
            attempts: DashMap::new(),
            config,
        }
    }

    pub fn with_relay_connector(mut self, relays: Arc<dyn RelayConnector>) -> Self {
        self.relays = relays;
        self
    }

    pub fn policy(&self) -> EnginePolicy {
        self.policy
    }

    /// Every attempt made for `address` so far, oldest first.
    pub fn attempts(&self, address: Address) -> Vec<SubmissionAttempt> {
        self.attempts
            .get(&address)
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Preflights and submits one mint for `wallet`. Returns `None` in dry run.
    pub async fn mint(&self, wallet: &WalletContext) -> Result<Option<TxReceipt>> {
        let address = wallet.address();
        self.estimator.check_static_call(address).await?;
        let request = self.build_request(address).await?;

        if self.config.dry_run {
            info!(
                target: "tx_sender",
                wallet = %address,
                to = %request.to,
                value = %request.value,
                gas_limit = ?request.gas_limit,
                nonce = request.nonce,
                fees = ?request.fees,
                submit_mode = ?self.config.submit_mode,
                "Dry run, not broadcasting"
            );
            return Ok(None);
        }

        let receipt = match self.config.submit_mode {
            SubmitMode::Public => self.send_public(wallet, request).await?,
            SubmitMode::Flashbots => self.send_flashbots(wallet, request).await?,
        };
        Ok(Some(receipt))
    }

    async fn chain_id(&self) -> Result<u64> {
        self.chain_id
            .get_or_try_init(|| self.pool.chain_id())
            .await
            .copied()
    }

    async fn build_request(&self, address: Address) -> Result<MintRequest> {
        let dry_run = self.config.dry_run;
        let gas_limit = if dry_run {
            self.config.gas_limit
        } else {
            self.estimator.gas_limit(address).await
        };
        let nonce = self.nonces.nonce(address).await?;
        let chain_id = if dry_run {
            None
        } else {
            Some(self.chain_id().await?)
        };

        Ok(MintRequest {
            to: self.config.contract_address,
            data: self.config.mint_call.calldata(),
            value: self.config.mint_value(),
            gas_limit,
            nonce,
            chain_id,
            fees: dry_run.then(|| self.gas_station.fee_override()).flatten(),
        })
    }

    /// The oracle quote, raised when the mempool shows a higher competing
    /// bid. The flag reports whether that happened.
    async fn starting_quote(&self) -> Result<(FeeQuote, bool)> {
        let quote = self.gas_station.optimal_fees().await?;
        if !self.policy.mempool_monitoring {
            return Ok((quote, false));
        }
        match self.monitor.competing_fee() {
            Some(competing) if competing > quote.headline() => {
                let raised = self.gas_station.raise_fees(quote, COMPETITION_PREBUMP_PERCENT);
                info!(target: "tx_sender", competing, from = %quote, to = %raised, "Competition detected, raising starting fees");
                Ok((raised, true))
            }
            _ => Ok((quote, false)),
        }
    }

    fn log_attempt(&self, address: Address, index: u32, fees: FeeQuote) {
        self.attempts.entry(address).or_default().push(SubmissionAttempt {
            index,
            fees,
            outcome: AttemptOutcome::Pending,
        });
    }

    fn settle_attempt(&self, address: Address, outcome: AttemptOutcome) {
        if let Some(mut log) = self.attempts.get_mut(&address) {
            if let Some(last) = log.last_mut() {
                last.outcome = outcome;
            }
        }
    }

    async fn sign(&self, wallet: &WalletContext, request: &MintRequest) -> Result<SignedTx> {
        if request.gas_limit.is_some() {
            return wallet.sign(request).await;
        }
        let gas_limit = self.estimator.estimate(wallet.address()).await?;
        let request = MintRequest {
            gas_limit: Some(gas_limit),
            ..request.clone()
        };
        wallet.sign(&request).await
    }

    /// First receipt found among `hashes`. Replacements share a nonce, so at
    /// most one of them can be mined.
    async fn find_receipt(&self, hashes: &[B256]) -> Option<TxReceipt> {
        for &hash in hashes {
            match self.pool.transaction_receipt(hash).await {
                Ok(Some(receipt)) => return Some(receipt),
                Ok(None) => {}
                Err(e) => debug!(target: "tx_sender", %hash, error = %e, "Receipt poll failed"),
            }
        }
        None
    }

    /// Polls every hash in `hashes` until one has a receipt or the
    /// confirmation timeout passes. A reverted receipt is a failure.
    async fn wait_for_receipt(&self, hashes: &[B256]) -> Result<TxReceipt> {
        let latest = hashes.last().map(ToString::to_string).unwrap_or_default();
        let poll = async {
            loop {
                if let Some(receipt) = self.find_receipt(hashes).await {
                    return receipt;
                }
                tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
            }
        };

        let receipt = tokio::time::timeout(self.config.confirmation_timeout, poll)
            .await
            .map_err(|_| MintError::Confirmation {
                hash: latest,
                reason: format!("not mined within {:?}", self.config.confirmation_timeout),
            })?;
        if !receipt.success {
            return Err(MintError::Confirmation {
                hash: receipt.hash.to_string(),
                reason: "transaction reverted".into(),
            });
        }
        Ok(receipt)
    }

    async fn send_public(&self, wallet: &WalletContext, request: MintRequest) -> Result<TxReceipt> {
        let address = wallet.address();
        let (mut fees, _) = self.starting_quote().await?;

        if self.config.wait_next_block {
            let current = self.pool.block_number().await?;
            info!(target: "tx_sender", current, "Waiting for next block");
            wait_until_block(&self.pool, current + 1).await?;
        }

        let started = Instant::now();
        let mut attempt = 0u32;
        let mut backoff = self.config.retry_backoff;
        let mut broadcast = Vec::new();
        loop {
            let current = request.with_fees(fees);
            self.log_attempt(address, attempt, fees);

            let attempted = self.public_attempt(wallet, &current, attempt, &mut broadcast).await;
            let result = match attempted {
                // an earlier broadcast for this nonce may have been mined meanwhile
                Err(e) if e.is_retryable() => match self.find_receipt(&broadcast).await {
                    Some(receipt) if receipt.success => Ok(receipt),
                    _ => Err(e),
                },
                other => other,
            };
            let error = match result {
                Ok(receipt) => {
                    let elapsed = started.elapsed();
                    self.settle_attempt(address, AttemptOutcome::Success);
                    self.nonces.mark_used(address, current.nonce);
                    self.stats.record_confirmed(&receipt, Some(elapsed));
                    info!(
                        target: "tx_sender",
                        hash = %receipt.hash,
                        block = ?receipt.block_number,
                        gas_used = receipt.gas_used,
                        elapsed = ?elapsed,
                        "Confirmed"
                    );
                    return Ok(receipt);
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                self.settle_attempt(address, AttemptOutcome::FatalFailure);
                return Err(error);
            }
            self.settle_attempt(address, AttemptOutcome::RetryableFailure);
            attempt += 1;
            warn!(target: "tx_sender", wallet = %address, attempt, error = %error, "Attempt failed");
            if attempt >= self.config.retry_attempts {
                return Err(MintError::AttemptsExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            fees = self
                .gas_station
                .bump_fees(fees, self.policy.retry_multiplier(attempt));
            info!(target: "tx_sender", fees = %fees, retry_in = ?backoff, "Bumped fees");
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff, self.config.retry_backoff_multiplier);
        }
    }

    async fn public_attempt(
        &self,
        wallet: &WalletContext,
        request: &MintRequest,
        attempt: u32,
        broadcast: &mut Vec<B256>,
    ) -> Result<TxReceipt> {
        let signed = self.sign(wallet, request).await?;
        self.stats.record_sent();
        let hash = self.broadcaster.send_raw_transaction(&signed.raw).await?;
        broadcast.push(hash);
        info!(
            target: "tx_sender",
            %hash,
            attempt = attempt + 1,
            nonce = signed.nonce,
            fees = ?request.fees,
            "Transaction sent"
        );
        self.wait_for_receipt(broadcast).await
    }

    async fn send_flashbots(&self, wallet: &WalletContext, request: MintRequest) -> Result<TxReceipt> {
        let address = wallet.address();
        let relay = connect_first(self.relays.as_ref(), &self.config.flashbots_relays).await?;
        let (mut fees, contested) = self.starting_quote().await?;

        let mut attempt = 0u32;
        let mut backoff = self.config.retry_backoff;
        loop {
            let current = request.with_fees(fees);
            self.log_attempt(address, attempt, fees);

            let error = match self.bundle_attempt(wallet, relay.as_ref(), &current).await {
                Ok(receipt) => {
                    self.settle_attempt(address, AttemptOutcome::Success);
                    self.nonces.mark_used(address, current.nonce);
                    self.stats.record_confirmed(&receipt, None);
                    info!(target: "tx_sender", hash = %receipt.hash, block = ?receipt.block_number, "Bundle included");
                    return Ok(receipt);
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                self.settle_attempt(address, AttemptOutcome::FatalFailure);
                return Err(error);
            }
            self.settle_attempt(address, AttemptOutcome::RetryableFailure);
            attempt += 1;
            warn!(target: "tx_sender", wallet = %address, attempt, error = %error, "Bundle attempt failed");
            if attempt >= self.config.retry_attempts {
                return Err(MintError::AttemptsExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            fees = self
                .gas_station
                .bump_fees(fees, self.policy.bundle_retry_multiplier(contested));
            info!(target: "tx_sender", fees = %fees, retry_in = ?backoff, "Bumped bundle fees");
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff, self.config.retry_backoff_multiplier);
        }
    }

    async fn bundle_attempt(
        &self,
        wallet: &WalletContext,
        relay: &dyn BundleRelay,
        request: &MintRequest,
    ) -> Result<TxReceipt> {
        let signed = self.sign(wallet, request).await?;
        let target_block = self.pool.block_number().await? + 1;
        let txs = [signed.raw.clone()];

        let simulation = relay.simulate(&txs, target_block).await?;
        debug!(target: "tx_sender", gas_used = simulation.gas_used, target_block, "Bundle simulated");

        let submission = relay.send_bundle(&txs, target_block).await?;
        self.stats.record_sent();
        info!(
            target: "tx_sender",
            hash = %signed.hash,
            bundle = ?submission.bundle_hash,
            target_block,
            relay = %relay.endpoint(),
            "Bundle submitted"
        );

        match resolve_bundle(&self.pool, signed.hash, signed.nonce, wallet.address(), target_block).await? {
            BundleResolution::Included => self.wait_for_receipt(&[signed.hash]).await,
            BundleResolution::AccountNonceTooHigh => Err(MintError::NonceTooHigh),
            BundleResolution::NotIncluded => Err(MintError::BundleNotIncluded(target_block)),
        }
    }
}

#[async_trait]
impl WalletTask for TransactionSender {
    async fn run(&self, wallet: Arc<WalletContext>) -> Result<Option<TxReceipt>> {
        self.mint(&wallet).await
    }
}
