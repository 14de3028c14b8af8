use std::future::Future;
use std::sync::Arc;

use alloy::primitives::{Address, B256, Bytes, U256};
use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::{debug, warn};

use crate::chain::{
    CallRequest, ChainClient, FeeData, FeeHistory, NonceTag, PendingTx, SharedClient, TxReceipt,
};
use crate::config::Config;
use crate::constants::ENDPOINT_BACKOFF_STEP;
use crate::error::{MintError, Result};
use crate::provider::HttpEndpoint;

/// Calls each client in order and returns the first success.
pub struct FallbackClient {
    clients: Vec<SharedClient>,
}

impl FallbackClient {
    pub fn new(clients: Vec<SharedClient>) -> Self {
        Self { clients }
    }

    async fn route<T, F, Fut>(&self, method: &'static str, op: F) -> Result<T>
    where
        F: Fn(SharedClient) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        let mut errors = Vec::new();
        for (idx, client) in self.clients.iter().enumerate() {
            match op(client.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(target: "endpoint_pool", error = %e, endpoint_index = idx, method, "Endpoint query failed, falling back to the next endpoint");
                    errors.push(e.to_string());
                }
            }
        }
        Err(MintError::AllEndpointsFailed {
            count: self.clients.len(),
            errors,
        })
    }
}

struct PoolInner {
    primary: SharedClient,
    priority: Option<SharedClient>,
    fallback: Option<SharedClient>,
    retry_count: u32,
}

/// The configured RPC endpoints behind one retrying handle.
///
/// Cloning is cheap. A clone made with [`EndpointPool::with_priority`] routes
/// its calls to the priority endpoint when one is configured.
#[derive(Clone)]
pub struct EndpointPool {
    inner: Arc<PoolInner>,
    prefer_priority: bool,
}

impl EndpointPool {
    pub fn new(
        endpoints: Vec<SharedClient>,
        priority: Option<SharedClient>,
        retry_count: u32,
    ) -> Result<Self> {
        let primary = endpoints
            .first()
            .or(priority.as_ref())
            .cloned()
            .ok_or_else(|| MintError::Config("no RPC endpoints configured".into()))?;
        let fallback = (endpoints.len() > 1)
            .then(|| Arc::new(FallbackClient::new(endpoints)) as SharedClient);

        Ok(Self {
            inner: Arc::new(PoolInner {
                primary,
                priority,
                fallback,
                retry_count: retry_count.max(1),
            }),
            prefer_priority: false,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let endpoints = config
            .rpc_urls
            .iter()
            .map(|url| {
                HttpEndpoint::new(url.clone(), config.rpc_timeout)
                    .map(|endpoint| Arc::new(endpoint) as SharedClient)
            })
            .collect::<Result<Vec<_>>>()?;
        let priority = config
            .priority_rpc
            .as_ref()
            .map(|url| {
                HttpEndpoint::new(url.clone(), config.rpc_timeout)
                    .map(|endpoint| Arc::new(endpoint) as SharedClient)
            })
            .transpose()?;

        Self::new(endpoints, priority, config.rpc_retry_count)
    }

    /// A handle to the same endpoints with the given priority preference.
    pub fn with_priority(&self, prefer_priority: bool) -> Self {
        Self {
            inner: self.inner.clone(),
            prefer_priority,
        }
    }

    pub fn has_priority(&self) -> bool {
        self.inner.priority.is_some()
    }

    /// Priority endpoint when asked for and available, else the fallback
    /// aggregate, else the first endpoint.
    pub fn resolve(&self, prefer_priority: bool) -> SharedClient {
        if prefer_priority {
            if let Some(priority) = &self.inner.priority {
                return priority.clone();
            }
        }
        match &self.inner.fallback {
            Some(fallback) => fallback.clone(),
            None => self.inner.primary.clone(),
        }
    }

    /// Runs `op` against the resolved endpoint, retrying with a linear
    /// backoff of 500ms per attempt. The last error is returned once the
    /// retry budget is spent.
    pub async fn execute<T, F, Fut>(&self, prefer_priority: bool, op: F) -> Result<T>
    where
        F: Fn(SharedClient) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        let retries = self.inner.retry_count;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let endpoint = self.resolve(prefer_priority);
            match op(endpoint).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < retries => {
                    debug!(target: "endpoint_pool", attempt, error = %e, "RPC attempt failed");
                    tokio::time::sleep(ENDPOINT_BACKOFF_STEP * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn route<T, F, Fut>(&self, method: &'static str, op: F) -> Result<T>
    where
        F: Fn(SharedClient) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        self.execute(self.prefer_priority, op).await.inspect_err(|e| {
            debug!(target: "endpoint_pool", method, error = %e, "RPC call exhausted retries");
        })
    }
}

/// Implements [`ChainClient`] for a type with a `route` method that decides
/// which underlying client serves each call.
macro_rules! route_chain_client {
    ($ty:ty) => {
        #[async_trait]
        impl ChainClient for $ty {
            async fn chain_id(&self) -> Result<u64> {
                self.route("eth_chainId", |c| async move { c.chain_id().await }).await
            }

            async fn block_number(&self) -> Result<u64> {
                self.route("eth_blockNumber", |c| async move { c.block_number().await })
                    .await
            }

            async fn transaction_count(&self, address: Address, tag: NonceTag) -> Result<u64> {
                self.route("eth_getTransactionCount", move |c| async move {
                    c.transaction_count(address, tag).await
                })
                .await
            }

            async fn balance(&self, address: Address) -> Result<U256> {
                self.route("eth_getBalance", move |c| async move { c.balance(address).await })
                    .await
            }

            async fn code(&self, address: Address) -> Result<Bytes> {
                self.route("eth_getCode", move |c| async move { c.code(address).await })
                    .await
            }

            async fn fee_data(&self) -> Result<FeeData> {
                self.route("fee_data", |c| async move { c.fee_data().await }).await
            }

            async fn fee_history(&self, block_count: u64, percentiles: &[f64]) -> Result<FeeHistory> {
                self.route("eth_feeHistory", |c| {
                    let percentiles = percentiles.to_vec();
                    async move { c.fee_history(block_count, &percentiles).await }
                })
                .await
            }

            async fn call(&self, request: &CallRequest) -> Result<Bytes> {
                self.route("eth_call", |c| {
                    let request = request.clone();
                    async move { c.call(&request).await }
                })
                .await
            }

            async fn estimate_gas(&self, request: &CallRequest) -> Result<u64> {
                self.route("eth_estimateGas", |c| {
                    let request = request.clone();
                    async move { c.estimate_gas(&request).await }
                })
                .await
            }

            async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256> {
                self.route("eth_sendRawTransaction", |c| {
                    let raw = raw.clone();
                    async move { c.send_raw_transaction(&raw).await }
                })
                .await
            }

            async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>> {
                self.route("eth_getTransactionReceipt", move |c| async move {
                    c.transaction_receipt(hash).await
                })
                .await
            }

            async fn transaction(&self, hash: B256) -> Result<Option<PendingTx>> {
                self.route("eth_getTransactionByHash", move |c| async move {
                    c.transaction(hash).await
                })
                .await
            }

            async fn pending_transactions(&self) -> Result<BoxStream<'static, B256>> {
                self.route("eth_newPendingTransactionFilter", |c| async move {
                    c.pending_transactions().await
                })
                .await
            }
        }
    };
}

route_chain_client!(FallbackClient);
route_chain_client!(EndpointPool);
