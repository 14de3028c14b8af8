//! Private relay submission: bundle simulation, submission and resolution.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, Bytes, keccak256};
use alloy::signers::SignerSync;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use reqwest::header::HeaderValue;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use url::Url;

use crate::chain::{ChainClient, NonceTag};
use crate::constants::{BUNDLE_RESOLUTION_TIMEOUT, RESOLUTION_POLL_INTERVAL};
use crate::error::{MintError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationReport {
    pub bundle_hash: Option<B256>,
    pub gas_used: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSubmission {
    pub bundle_hash: Option<B256>,
}

/// A bundle relay reachable over JSON-RPC.
#[async_trait]
pub trait BundleRelay: Send + Sync {
    fn endpoint(&self) -> &Url;

    /// Simulates `txs` against the state the target block builds on. A revert
    /// inside the bundle is an error.
    async fn simulate(&self, txs: &[Bytes], target_block: u64) -> Result<SimulationReport>;

    async fn send_bundle(&self, txs: &[Bytes], target_block: u64) -> Result<BundleSubmission>;
}

#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Arc<dyn BundleRelay>>;
}

/// Connects to the first relay that accepts, in configuration order.
pub async fn connect_first(
    connector: &dyn RelayConnector,
    relays: &[Url],
) -> Result<Arc<dyn BundleRelay>> {
    for url in relays {
        match connector.connect(url).await {
            Ok(relay) => {
                info!(target: "flashbots", relay = %url, "Connected to relay");
                return Ok(relay);
            }
            Err(e) => warn!(target: "flashbots", relay = %url, error = %e, "Relay connection failed"),
        }
    }
    Err(MintError::RelayUnavailable(relays.len()))
}

/// Builds [`FlashbotsRelay`]s that sign requests with one auth key.
pub struct FlashbotsConnector {
    auth: PrivateKeySigner,
    timeout: Duration,
}

impl FlashbotsConnector {
    pub fn new(auth: PrivateKeySigner, timeout: Duration) -> Self {
        Self { auth, timeout }
    }
}

#[async_trait]
impl RelayConnector for FlashbotsConnector {
    async fn connect(&self, url: &Url) -> Result<Arc<dyn BundleRelay>> {
        let relay = FlashbotsRelay::new(url.clone(), self.auth.clone(), self.timeout)?;
        Ok(Arc::new(relay))
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    message: String,
}

/// Flashbots-style relay speaking `eth_callBundle` / `eth_sendBundle`.
pub struct FlashbotsRelay {
    url: Url,
    http: reqwest::Client,
    auth: PrivateKeySigner,
}

impl FlashbotsRelay {
    pub fn new(url: Url, auth: PrivateKeySigner, timeout: Duration) -> Result<Self> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(MintError::Relay(format!("unsupported relay scheme in {url}")));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MintError::Relay(format!("failed to build relay client: {e}")))?;
        Ok(Self { url, http, auth })
    }

    /// `X-Flashbots-Signature` value: `address:signature` where the signature
    /// is an EIP-191 signature over the hex keccak of the body.
    fn sign_body(&self, body: &[u8]) -> Result<String> {
        let digest = format!("{:?}", keccak256(body));
        let sig = self
            .auth
            .sign_message_sync(digest.as_bytes())
            .map_err(|e| MintError::Signing(format!("relay auth signature: {e}")))?;
        Ok(format!(
            "{:?}:0x{}",
            self.auth.address(),
            hex::encode(sig.as_bytes())
        ))
    }

    async fn request(&self, method: &str, params: Value) -> Result<std::result::Result<Value, RpcErrorBody>> {
        let body = serde_json::to_vec(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": [params],
        }))
        .map_err(|e| MintError::Relay(e.to_string()))?;
        let signature = HeaderValue::from_str(&self.sign_body(&body)?)
            .map_err(|e| MintError::Relay(format!("invalid signature header: {e}")))?;

        let response = self
            .http
            .post(self.url.clone())
            .header("Content-Type", "application/json")
            .header("X-Flashbots-Signature", signature)
            .body(body)
            .send()
            .await
            .map_err(|e| MintError::Relay(format!("{method} to {} failed: {e}", self.url)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| MintError::Relay(format!("{method} response unreadable: {e}")))?;
        if !status.is_success() {
            return Err(MintError::Relay(format!("{method} rejected with {status}: {text}")));
        }

        let parsed: RpcResponse = serde_json::from_str(&text)
            .map_err(|e| MintError::Relay(format!("{method} returned malformed JSON: {e}")))?;
        match (parsed.error, parsed.result) {
            (Some(error), _) => Ok(Err(error)),
            (None, Some(result)) => Ok(Ok(result)),
            (None, None) => Ok(Ok(Value::Null)),
        }
    }
}

#[async_trait]
impl BundleRelay for FlashbotsRelay {
    fn endpoint(&self) -> &Url {
        &self.url
    }

    async fn simulate(&self, txs: &[Bytes], target_block: u64) -> Result<SimulationReport> {
        let params = json!({
            "txs": txs,
            "blockNumber": format!("0x{target_block:x}"),
            "stateBlockNumber": "latest",
        });
        match self.request("eth_callBundle", params).await? {
            Ok(result) => parse_simulation(&result),
            Err(error) => Err(MintError::Simulation(format!(
                "{} (code {})",
                error.message, error.code
            ))),
        }
    }

    async fn send_bundle(&self, txs: &[Bytes], target_block: u64) -> Result<BundleSubmission> {
        let params = json!({
            "txs": txs,
            "blockNumber": format!("0x{target_block:x}"),
        });
        match self.request("eth_sendBundle", params).await? {
            Ok(result) => Ok(BundleSubmission {
                bundle_hash: result
                    .get("bundleHash")
                    .and_then(Value::as_str)
                    .and_then(|hash| hash.parse().ok()),
            }),
            Err(error) => Err(MintError::Relay(format!(
                "eth_sendBundle failed: {} (code {})",
                error.message, error.code
            ))),
        }
    }
}

/// Reads an `eth_callBundle` result. Any per-transaction error or revert
/// fails the simulation.
fn parse_simulation(result: &Value) -> Result<SimulationReport> {
    if let Some(error) = result.get("error").and_then(Value::as_str) {
        return Err(MintError::Simulation(error.to_string()));
    }

    let txs = result
        .get("results")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for tx in txs {
        let failure = tx
            .get("error")
            .or_else(|| tx.get("revert"))
            .filter(|v| !v.is_null());
        if let Some(failure) = failure {
            let reason = failure.as_str().map(String::from).unwrap_or_else(|| failure.to_string());
            return Err(MintError::Simulation(reason));
        }
    }

    Ok(SimulationReport {
        bundle_hash: result
            .get("bundleHash")
            .and_then(Value::as_str)
            .and_then(|hash| hash.parse().ok()),
        gas_used: result.get("totalGasUsed").and_then(Value::as_u64).unwrap_or_default(),
    })
}

/// What happened to a bundle once its target block passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleResolution {
    Included,
    NotIncluded,
    /// The account moved past the bundle's nonce without it.
    AccountNonceTooHigh,
}

impl BundleResolution {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BundleResolution::NotIncluded)
    }
}

/// Polls until the chain is past `target_block`, then classifies the bundle.
pub async fn wait_for_resolution(
    client: &dyn ChainClient,
    tx_hash: B256,
    nonce: u64,
    sender: Address,
    target_block: u64,
) -> Result<BundleResolution> {
    loop {
        let block = client.block_number().await?;
        if block > target_block {
            break;
        }
        tokio::time::sleep(RESOLUTION_POLL_INTERVAL).await;
    }

    if client.transaction_receipt(tx_hash).await?.is_some() {
        return Ok(BundleResolution::Included);
    }
    let account_nonce = client.transaction_count(sender, NonceTag::Latest).await?;
    if account_nonce > nonce {
        return Ok(BundleResolution::AccountNonceTooHigh);
    }
    Ok(BundleResolution::NotIncluded)
}

/// [`wait_for_resolution`] bounded by the resolution timeout. The abandoned
/// wait is dropped.
pub async fn resolve_bundle(
    client: &dyn ChainClient,
    tx_hash: B256,
    nonce: u64,
    sender: Address,
    target_block: u64,
) -> Result<BundleResolution> {
    let resolution = tokio::time::timeout(
        BUNDLE_RESOLUTION_TIMEOUT,
        wait_for_resolution(client, tx_hash, nonce, sender, target_block),
    )
    .await
    .map_err(|_| MintError::ResolutionTimeout(BUNDLE_RESOLUTION_TIMEOUT.as_secs()))??;
    debug!(target: "flashbots", %tx_hash, target_block, ?resolution, "Bundle resolved");
    Ok(resolution)
}
