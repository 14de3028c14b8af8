use alloy::primitives::Address;
use thiserror::Error;

/// Every failure the submission pipeline can surface.
///
/// Variants are grouped by how the engine reacts to them: configuration and
/// preflight problems are fatal for the run or the wallet, attempt failures
/// are retried with bumped fees until the attempt budget runs out.
#[derive(Debug, Error)]
pub enum MintError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("preflight failed for {wallet}: {reason}")]
    Preflight { wallet: Address, reason: String },

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("all {count} endpoints failed: {errors:?}")]
    AllEndpointsFailed { count: usize, errors: Vec<String> },

    #[error("abi error: {0}")]
    Abi(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("broadcast rejected: {0}")]
    Broadcast(String),

    #[error("confirmation failed for {hash}: {reason}")]
    Confirmation { hash: String, reason: String },

    #[error("bundle simulation failed: {0}")]
    Simulation(String),

    #[error("relay error: {0}")]
    Relay(String),

    #[error("bundle not included in block {0}")]
    BundleNotIncluded(u64),

    #[error("bundle resolution timed out after {0}s")]
    ResolutionTimeout(u64),

    #[error("nonce too high: transaction already mined or replaced")]
    NonceTooHigh,

    #[error("failed to connect to any relay ({0} tried)")]
    RelayUnavailable(usize),

    #[error("max attempts ({attempts}) reached: {last}")]
    AttemptsExhausted { attempts: u32, last: Box<MintError> },
}

impl MintError {
    /// Whether a submission attempt that failed with this error may be retried
    /// with escalated fees.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MintError::Rpc(_)
                | MintError::AllEndpointsFailed { .. }
                | MintError::Broadcast(_)
                | MintError::Confirmation { .. }
                | MintError::Simulation(_)
                | MintError::Relay(_)
                | MintError::BundleNotIncluded(_)
                | MintError::ResolutionTimeout(_)
        )
    }

    pub fn rpc(err: impl std::fmt::Display) -> Self {
        MintError::Rpc(err.to_string())
    }
}

pub type Result<T, E = MintError> = std::result::Result<T, E>;
