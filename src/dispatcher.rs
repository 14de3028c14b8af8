use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use alloy::primitives::Address;
use rand::Rng;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{Config, RunMode};
use crate::error::{MintError, Result};
use crate::tx_sender::WalletTask;
use crate::wallet::WalletContext;

/// Outcome of a dispatch over every configured wallet.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<(Address, String)>,
    /// Highest number of wallet tasks in flight at once.
    pub peak_active: usize,
}

impl DispatchReport {
    fn record(&mut self, wallet: Address, result: Result<()>) {
        match result {
            Ok(()) => self.succeeded += 1,
            Err(e) => {
                error!(target: "dispatcher", %wallet, error = %e, "Mint failed");
                self.failed += 1;
                self.errors.push((wallet, e.to_string()));
            }
        }
    }

    pub fn log(&self) {
        info!(
            target: "dispatcher",
            succeeded = self.succeeded,
            failed = self.failed,
            peak_active = self.peak_active,
            "Dispatch finished"
        );
        for (wallet, error) in &self.errors {
            info!(target: "dispatcher", %wallet, %error, "Failed wallet");
        }
    }
}

pub struct Dispatcher {
    mode: RunMode,
    concurrency: usize,
    tx_delay: Duration,
    jitter: Duration,
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

impl Dispatcher {
    pub fn new(config: &Config) -> Self {
        Self {
            mode: config.mode,
            concurrency: config.concurrency.max(1),
            tx_delay: config.tx_delay,
            jitter: config.jitter,
        }
    }

    /// Runs `task` for the wallets according to the run mode. Only single
    /// mode surfaces the wallet's error, the multi modes report it.
    pub async fn dispatch(
        &self,
        task: Arc<dyn WalletTask>,
        wallets: Vec<Arc<WalletContext>>,
    ) -> Result<DispatchReport> {
        match self.mode {
            RunMode::Single => self.single(task, wallets).await,
            RunMode::Multi => Ok(self.sequential(task, wallets).await),
            RunMode::MultiParallel => Ok(self.parallel(task, wallets).await),
        }
    }

    async fn single(
        &self,
        task: Arc<dyn WalletTask>,
        wallets: Vec<Arc<WalletContext>>,
    ) -> Result<DispatchReport> {
        let wallet = wallets
            .into_iter()
            .next()
            .ok_or_else(|| MintError::Config("no wallet configured".into()))?;
        task.run(wallet).await?;
        Ok(DispatchReport {
            succeeded: 1,
            peak_active: 1,
            ..DispatchReport::default()
        })
    }

    async fn sequential(
        &self,
        task: Arc<dyn WalletTask>,
        wallets: Vec<Arc<WalletContext>>,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        let total = wallets.len();

        for (idx, wallet) in wallets.into_iter().enumerate() {
            let address = wallet.address();
            info!(target: "dispatcher", wallet = %address, index = idx + 1, total, "Minting");
            report.peak_active = 1;
            let result = task.run(wallet).await.map(|_| ());
            report.record(address, result);

            if idx + 1 < total {
                tokio::time::sleep(self.tx_delay + random_jitter(self.jitter)).await;
            }
        }
        report
    }

    async fn parallel(
        &self,
        task: Arc<dyn WalletTask>,
        wallets: Vec<Arc<WalletContext>>,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut queue: VecDeque<Arc<WalletContext>> = wallets.into();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut running = JoinSet::new();

        info!(target: "dispatcher", wallets = queue.len(), concurrency = self.concurrency, "Starting parallel dispatch");
        loop {
            while running.len() < self.concurrency {
                let Some(wallet) = queue.pop_front() else {
                    break;
                };
                let task = task.clone();
                let active = active.clone();
                let peak = peak.clone();
                let startup = random_jitter(self.jitter);
                running.spawn(async move {
                    let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now_active, Ordering::SeqCst);
                    tokio::time::sleep(startup).await;
                    let address = wallet.address();
                    let result = task.run(wallet).await.map(|_| ());
                    active.fetch_sub(1, Ordering::SeqCst);
                    (address, result)
                });
            }

            match running.join_next().await {
                Some(Ok((address, result))) => report.record(address, result),
                Some(Err(e)) => {
                    warn!(target: "dispatcher", error = %e, "Wallet task aborted");
                    report.failed += 1;
                }
                None => break,
            }
        }

        report.peak_active = peak.load(Ordering::SeqCst);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TxReceipt;
    use crate::mock::test_config;
    use alloy::signers::local::PrivateKeySigner;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records which wallets ran and how many ran at once.
    #[derive(Default)]
    struct Probe {
        active: AtomicUsize,
        max_active: AtomicUsize,
        seen: Mutex<Vec<Address>>,
        failing: Vec<Address>,
    }

    #[async_trait]
    impl WalletTask for Probe {
        async fn run(&self, wallet: Arc<WalletContext>) -> Result<Option<TxReceipt>> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.seen.lock().unwrap().push(wallet.address());
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.failing.contains(&wallet.address()) {
                return Err(MintError::Broadcast("rejected".into()));
            }
            Ok(None)
        }
    }

    fn wallets(n: usize) -> Vec<Arc<WalletContext>> {
        (0..n)
            .map(|_| Arc::new(WalletContext::new(PrivateKeySigner::random())))
            .collect()
    }

    fn dispatcher(tweak: impl FnOnce(&mut Config)) -> Dispatcher {
        let mut config = test_config();
        tweak(&mut config);
        Dispatcher::new(&config)
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_respects_concurrency_and_runs_each_wallet_once() {
        let wallets = wallets(10);
        let mut expected: Vec<Address> = wallets.iter().map(|w| w.address()).collect();
        let probe = Arc::new(Probe::default());
        let d = dispatcher(|c| {
            c.mode = RunMode::MultiParallel;
            c.concurrency = 3;
            c.jitter = Duration::from_millis(50);
        });

        let report = d.dispatch(probe.clone(), wallets).await.unwrap();

        assert_eq!(report.succeeded, 10);
        assert_eq!(report.failed, 0);
        assert!(report.peak_active <= 3);
        assert!(probe.max_active.load(Ordering::SeqCst) <= 3);

        let mut seen = probe.seen.lock().unwrap().clone();
        seen.sort();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_reports_failures_without_raising() {
        let wallets = wallets(4);
        let probe = Arc::new(Probe {
            failing: vec![wallets[1].address(), wallets[3].address()],
            ..Probe::default()
        });
        let d = dispatcher(|c| {
            c.mode = RunMode::MultiParallel;
            c.concurrency = 2;
        });

        let report = d.dispatch(probe, wallets).await.unwrap();
        assert_eq!((report.succeeded, report.failed), (2, 2));
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.peak_active, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_runs_one_at_a_time_with_delay() {
        let wallets = wallets(3);
        let order: Vec<Address> = wallets.iter().map(|w| w.address()).collect();
        let probe = Arc::new(Probe {
            failing: vec![wallets[0].address()],
            ..Probe::default()
        });
        let d = dispatcher(|c| {
            c.mode = RunMode::Multi;
            c.tx_delay = Duration::from_millis(500);
        });

        let started = tokio::time::Instant::now();
        let report = d.dispatch(probe.clone(), wallets).await.unwrap();
        assert_eq!((report.succeeded, report.failed), (2, 1));
        assert_eq!(probe.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(*probe.seen.lock().unwrap(), order);
        // three runs of 100ms and two gaps of 500ms
        assert!(started.elapsed() >= Duration::from_millis(1_300));
    }

    #[tokio::test(start_paused = true)]
    async fn single_mode_propagates_error() {
        let wallets = wallets(1);
        let probe = Arc::new(Probe {
            failing: vec![wallets[0].address()],
            ..Probe::default()
        });
        let err = dispatcher(|_| {}).dispatch(probe, wallets).await.unwrap_err();
        assert!(matches!(err, MintError::Broadcast(_)));
    }

    #[test]
    fn jitter_stays_in_range() {
        assert_eq!(random_jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(random_jitter(Duration::from_millis(100)) <= Duration::from_millis(100));
        }
    }
}
