use std::future::Future;
use std::sync::Arc;

use alloy::primitives::Address;
use anyhow::{Context, bail};
use tracing::{error, info, warn};

use crate::chain::SharedClient;
use crate::config::Config;
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::endpoint_pool::EndpointPool;
use crate::flashbots::RelayConnector;
use crate::gas_station::GasStation;
use crate::mempool::CompetitionMonitor;
use crate::nonce::NonceManager;
use crate::preflight::{network_preflight, start_gate};
use crate::stats::RunStats;
use crate::tx_sender::{TransactionSender, WalletTask};
use crate::wallet::WalletContext;

/// Bootstraps the run from a loaded configuration and drives it to
/// completion or until Ctrl-C.
pub async fn start(config: Config) -> anyhow::Result<()> {
    let pool = EndpointPool::from_config(&config).context("failed to build RPC endpoint pool")?;
    run(Arc::new(config), pool, None, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(target: "ignition", error = %e, "Failed to listen for shutdown");
        std::future::pending::<()>().await;
    }
    info!(target: "ignition", "Ctrl-C detected, shutting down");
}

/// Wires every component and dispatches the wallets. Returns `None` when
/// `shutdown` resolved before the dispatch finished.
///
/// Whatever the outcome, the mempool monitor is stopped and the run
/// statistics are logged before returning.
pub async fn run(
    config: Arc<Config>,
    pool: EndpointPool,
    relays: Option<Arc<dyn RelayConnector>>,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<Option<DispatchReport>> {
    let wallets: Vec<Arc<WalletContext>> = config
        .private_keys
        .iter()
        .cloned()
        .map(|signer| Arc::new(WalletContext::new(signer)))
        .collect();
    if wallets.is_empty() {
        bail!("no private keys configured");
    }
    let addresses: Vec<Address> = wallets.iter().map(|w| w.address()).collect();

    info!(
        target: "ignition",
        mode = ?config.mode,
        submit_mode = ?config.submit_mode,
        wallets = wallets.len(),
        contract = %config.contract_address,
        function = %config.mint_call.signature(),
        dry_run = config.dry_run,
        "Starting mint run"
    );

    let client: SharedClient = Arc::new(pool.clone());
    let gas_station = Arc::new(GasStation::new(&config, client.clone()));
    let nonces = Arc::new(NonceManager::new(&config, client.clone()));
    let monitor = Arc::new(CompetitionMonitor::new(&config, client.clone()));
    let stats = Arc::new(RunStats::new());

    let mut sender = TransactionSender::new(
        config.clone(),
        pool,
        gas_station,
        nonces.clone(),
        monitor.clone(),
        stats.clone(),
    );
    if let Some(relays) = relays {
        sender = sender.with_relay_connector(relays);
    }
    let task: Arc<dyn WalletTask> = Arc::new(sender);
    let dispatcher = Dispatcher::new(&config);

    let work = async {
        // Dry runs stay off the network beyond what the mint preview needs.
        if !config.dry_run {
            network_preflight(&config, client.as_ref(), &addresses)
                .await
                .context("network preflight failed")?;
            monitor.start();
            if config.preload_nonces {
                nonces.preload(&addresses).await;
            }
            start_gate(&config, client.as_ref())
                .await
                .context("failed waiting for start condition")?;
        }
        dispatcher
            .dispatch(task, wallets)
            .await
            .context("mint run failed")
    };

    let outcome = tokio::select! {
        result = work => Some(result),
        _ = shutdown => None,
    };

    monitor.stop();
    stats.log_summary();

    match outcome {
        Some(Ok(report)) => {
            report.log();
            Ok(Some(report))
        }
        Some(Err(e)) => Err(e),
        None => {
            warn!(target: "ignition", "Run interrupted before completion");
            Ok(None)
        }
    }
}
