use std::time::Duration;

use alloy::consensus::Transaction as _;
use alloy::eips::BlockNumberOrTag;
use alloy::network::{Ethereum, TransactionBuilder};
use alloy::primitives::{Address, B256, Bytes, U256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::client::RpcClient;
use alloy::rpc::types::TransactionRequest;
use alloy::transports::http::Http;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::chain::{CallRequest, ChainClient, FeeData, FeeHistory, NonceTag, PendingTx, TxReceipt};
use crate::error::{MintError, Result};

/// A single HTTP JSON-RPC endpoint backed by an alloy provider.
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    url: Url,
    provider: RootProvider<Ethereum>,
}

impl HttpEndpoint {
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        // Persistent client so repeated calls reuse connections
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| MintError::Config(format!("failed to build http client: {e}")))?;

        let transport = Http::with_client(client, url.clone());
        let provider = RootProvider::new(RpcClient::new(transport, false));

        Ok(Self { url, provider })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl From<&CallRequest> for TransactionRequest {
    fn from(request: &CallRequest) -> Self {
        let tx = TransactionRequest::default()
            .with_to(request.to)
            .with_value(request.value)
            .with_input(request.data.clone());
        match request.from {
            Some(from) => tx.with_from(from),
            None => tx,
        }
    }
}

#[async_trait]
impl ChainClient for HttpEndpoint {
    async fn chain_id(&self) -> Result<u64> {
        self.provider.get_chain_id().await.map_err(MintError::rpc)
    }

    async fn block_number(&self) -> Result<u64> {
        self.provider.get_block_number().await.map_err(MintError::rpc)
    }

    async fn transaction_count(&self, address: Address, tag: NonceTag) -> Result<u64> {
        let call = self.provider.get_transaction_count(address);
        let count = match tag {
            NonceTag::Pending => call.pending().await,
            NonceTag::Latest => call.latest().await,
        };
        count.map_err(MintError::rpc)
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        self.provider.get_balance(address).await.map_err(MintError::rpc)
    }

    async fn code(&self, address: Address) -> Result<Bytes> {
        self.provider.get_code_at(address).await.map_err(MintError::rpc)
    }

    async fn fee_data(&self) -> Result<FeeData> {
        let gas_price = self.provider.get_gas_price().await;
        let eip1559 = self.provider.estimate_eip1559_fees().await;

        if let (Err(price_err), Err(eip_err)) = (&gas_price, &eip1559) {
            return Err(MintError::Rpc(format!(
                "fee data unavailable: {price_err}; {eip_err}"
            )));
        }
        if let Err(e) = &eip1559 {
            debug!(target: "provider", url = %self.url, error = %e, "EIP-1559 fee estimation unavailable");
        }

        let eip1559 = eip1559.ok();
        Ok(FeeData {
            gas_price: gas_price.ok(),
            max_fee_per_gas: eip1559.map(|fees| fees.max_fee_per_gas),
            max_priority_fee_per_gas: eip1559.map(|fees| fees.max_priority_fee_per_gas),
        })
    }

    async fn fee_history(&self, block_count: u64, percentiles: &[f64]) -> Result<FeeHistory> {
        let history = self
            .provider
            .get_fee_history(block_count, BlockNumberOrTag::Latest, percentiles)
            .await
            .map_err(MintError::rpc)?;
        Ok(FeeHistory {
            base_fee_per_gas: history.base_fee_per_gas,
            reward: history.reward.unwrap_or_default(),
        })
    }

    async fn call(&self, request: &CallRequest) -> Result<Bytes> {
        self.provider
            .call(<TransactionRequest as From<&CallRequest>>::from(request))
            .await
            .map_err(MintError::rpc)
    }

    async fn estimate_gas(&self, request: &CallRequest) -> Result<u64> {
        self.provider
            .estimate_gas(<TransactionRequest as From<&CallRequest>>::from(request))
            .await
            .map_err(MintError::rpc)
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| MintError::Broadcast(e.to_string()))?;
        Ok(*pending.tx_hash())
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(MintError::rpc)?;
        Ok(receipt.map(|r| TxReceipt {
            hash: r.transaction_hash,
            block_number: r.block_number,
            gas_used: r.gas_used,
            effective_gas_price: r.effective_gas_price,
            success: r.status(),
        }))
    }

    async fn transaction(&self, hash: B256) -> Result<Option<PendingTx>> {
        let tx = self
            .provider
            .get_transaction_by_hash(hash)
            .await
            .map_err(MintError::rpc)?;
        Ok(tx.map(|tx| PendingTx {
            hash,
            to: tx.to(),
            gas_price: tx.gas_price(),
            max_fee_per_gas: Some(tx.max_fee_per_gas()),
        }))
    }

    async fn pending_transactions(&self) -> Result<BoxStream<'static, B256>> {
        let poller = self
            .provider
            .watch_pending_transactions()
            .await
            .map_err(MintError::rpc)?;
        Ok(poller.into_stream().flat_map(stream::iter).boxed())
    }
}
