use alloy::primitives::Address;
use alloy::primitives::utils::format_ether;
use chrono::Utc;
use futures::future::join_all;
use tracing::{info, warn};

use crate::chain::ChainClient;
use crate::config::Config;
use crate::constants::BLOCK_POLL_INTERVAL;
use crate::error::{MintError, Result};

/// Run-wide checks before any wallet starts: network reachability, contract
/// presence and wallet balances. Low balances only warn.
pub async fn network_preflight(
    config: &Config,
    client: &dyn ChainClient,
    wallets: &[Address],
) -> Result<()> {
    let chain_id = client.chain_id().await?;
    info!(target: "preflight", chain_id, "Connected");

    let code = client.code(config.contract_address).await?;
    if code.is_empty() {
        return Err(MintError::Config(format!(
            "no contract code at {}",
            config.contract_address
        )));
    }

    if config.balance_check {
        let required = config.mint_value();
        let balances = join_all(wallets.iter().map(|&wallet| async move {
            (wallet, client.balance(wallet).await)
        }))
        .await;

        for (wallet, balance) in balances {
            match balance {
                Ok(balance) if balance < required => warn!(
                    target: "preflight",
                    %wallet,
                    balance = %format_ether(balance),
                    required = %format_ether(required),
                    "Low balance"
                ),
                Ok(balance) => info!(target: "preflight", %wallet, balance = %format_ether(balance), "Balance"),
                Err(e) => warn!(target: "preflight", %wallet, error = %e, "Balance check failed"),
            }
        }
    }

    info!(target: "preflight", "Preflight checks completed");
    Ok(())
}

/// Polls until the chain reaches `target`. Returns the block observed.
pub async fn wait_until_block(client: &dyn ChainClient, target: u64) -> Result<u64> {
    loop {
        let current = client.block_number().await?;
        if current >= target {
            info!(target: "preflight", target, current, "Target block reached");
            return Ok(current);
        }
        tokio::time::sleep(BLOCK_POLL_INTERVAL).await;
    }
}

/// Sleeps until the wall clock passes `target_ms` (unix milliseconds).
pub async fn wait_until_timestamp(target_ms: i64) {
    let mut announced = false;
    loop {
        let remaining = target_ms - Utc::now().timestamp_millis();
        if remaining <= 0 {
            break;
        }
        if !announced {
            info!(target: "preflight", target_ms, remaining_ms = remaining, "Waiting for start time");
            announced = true;
        }
        let step = BLOCK_POLL_INTERVAL.min(std::time::Duration::from_millis(remaining as u64));
        tokio::time::sleep(step).await;
    }
    info!(target: "preflight", target_ms, "Start time reached");
}

/// Holds the run until the configured start time and start block.
pub async fn start_gate(config: &Config, client: &dyn ChainClient) -> Result<()> {
    if let Some(target_ms) = config.start_at_timestamp {
        wait_until_timestamp(target_ms).await;
    }
    if let Some(block) = config.start_at_block {
        info!(target: "preflight", block, "Waiting for start block");
        wait_until_block(client, block).await?;
    }
    Ok(())
}
