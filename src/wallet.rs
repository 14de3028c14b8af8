use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, B256, Bytes};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;

use crate::error::{MintError, Result};
use crate::gas_station::FeeQuote;
use crate::tx_sender::MintRequest;

/// A signed transaction ready for broadcast or bundling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub raw: Bytes,
    pub hash: B256,
    pub nonce: u64,
}

/// One signing identity, created from a configured key at startup.
#[derive(Clone)]
pub struct WalletContext {
    address: Address,
    wallet: EthereumWallet,
}

impl WalletContext {
    pub fn new(signer: PrivateKeySigner) -> Self {
        Self {
            address: signer.address(),
            wallet: EthereumWallet::from(signer),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Signs `request` locally. The request must carry fees, a gas limit and
    /// a chain id.
    pub async fn sign(&self, request: &MintRequest) -> Result<SignedTx> {
        let fees = request
            .fees
            .ok_or_else(|| MintError::Signing("request has no fee quote".into()))?;
        let gas_limit = request
            .gas_limit
            .ok_or_else(|| MintError::Signing("request has no gas limit".into()))?;
        let chain_id = request
            .chain_id
            .ok_or_else(|| MintError::Signing("request has no chain id".into()))?;

        let tx = TransactionRequest::default()
            .with_from(self.address)
            .with_to(request.to)
            .with_input(request.data.clone())
            .with_value(request.value)
            .with_nonce(request.nonce)
            .with_chain_id(chain_id)
            .with_gas_limit(gas_limit);
        let tx = match fees {
            FeeQuote::Legacy { gas_price } => tx.with_gas_price(gas_price),
            FeeQuote::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => tx
                .with_max_fee_per_gas(max_fee_per_gas)
                .with_max_priority_fee_per_gas(max_priority_fee_per_gas),
        };

        let envelope = tx
            .build(&self.wallet)
            .await
            .map_err(|e| MintError::Signing(e.to_string()))?;
        Ok(SignedTx {
            raw: envelope.encoded_2718().into(),
            hash: *envelope.tx_hash(),
            nonce: request.nonce,
        })
    }
}

impl std::fmt::Debug for WalletContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletContext")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
