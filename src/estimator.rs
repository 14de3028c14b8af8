use alloy::primitives::{Address, Bytes, U256};
use tracing::{debug, warn};

use crate::chain::{CallRequest, SharedClient};
use crate::config::Config;
use crate::error::{MintError, Result};

/// Per-wallet preflight: static call and gas limit estimation for the mint.
pub struct GasEstimator {
    client: SharedClient,
    contract: Address,
    calldata: Bytes,
    value: U256,
    configured_limit: Option<u64>,
    buffer_percent: u64,
    call_static_check: bool,
}

impl GasEstimator {
    pub fn new(config: &Config, client: SharedClient) -> Self {
        Self {
            client,
            contract: config.contract_address,
            calldata: config.mint_call.calldata(),
            value: config.mint_value(),
            configured_limit: config.gas_limit,
            buffer_percent: config.gas_limit_buffer_percent,
            call_static_check: config.call_static_check,
        }
    }

    fn request(&self, from: Option<Address>) -> CallRequest {
        CallRequest {
            from,
            to: self.contract,
            value: self.value,
            data: self.calldata.clone(),
        }
    }

    /// Executes the mint as a static call from `wallet`. A revert is fatal
    /// for the wallet.
    pub async fn check_static_call(&self, wallet: Address) -> Result<()> {
        if !self.call_static_check {
            return Ok(());
        }
        self.client
            .call(&self.request(Some(wallet)))
            .await
            .map(|_| debug!(target: "estimator", %wallet, "Static call passed"))
            .map_err(|e| MintError::Preflight {
                wallet,
                reason: e.to_string(),
            })
    }

    /// The configured limit, or the larger of the sender-aware and the raw
    /// call estimate plus the buffer. `None` when nothing is configured and
    /// both estimates fail.
    pub async fn gas_limit(&self, wallet: Address) -> Option<u64> {
        if let Some(limit) = self.configured_limit {
            return Some(limit);
        }

        let with_sender = self.request(Some(wallet));
        let without_sender = self.request(None);
        let (a, b) = futures::join!(
            self.client.estimate_gas(&with_sender),
            self.client.estimate_gas(&without_sender),
        );
        for err in [a.as_ref().err(), b.as_ref().err()].into_iter().flatten() {
            debug!(target: "estimator", %wallet, error = %err, "Gas estimation method failed");
        }

        match a.into_iter().chain(b).max() {
            Some(estimate) => {
                let buffered = self.buffered(estimate);
                debug!(target: "estimator", %wallet, estimate, buffered, "Gas estimate");
                Some(buffered)
            }
            None => {
                warn!(target: "estimator", %wallet, "Gas estimation failed, proceeding without explicit gas limit");
                None
            }
        }
    }

    /// One plain estimate, used when a request reaches signing without a gas
    /// limit. Failure fails the attempt.
    pub async fn estimate(&self, wallet: Address) -> Result<u64> {
        self.client.estimate_gas(&self.request(Some(wallet))).await
    }

    fn buffered(&self, estimate: u64) -> u64 {
        let buffered = u128::from(estimate) * u128::from(100 + self.buffer_percent) / 100;
        u64::try_from(buffered).unwrap_or(u64::MAX)
    }
}
