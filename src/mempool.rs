//! Mempool competition tracking.
//!
//! A producer task ([`stream_pending_transactions`]) feeds pending hashes into
//! a bounded channel. A consumer task fetches each transaction and keeps an
//! observation for every one addressed to the target contract. The engine
//! only reads the resulting snapshot, it never waits on these tasks.

use std::sync::{Arc, Mutex, PoisonError};

use alloy::primitives::{Address, B256};
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream;
use tokio::sync::mpsc::{self, Receiver};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::chain::SharedClient;
use crate::config::Config;
use crate::constants::{
    COMPETITION_PERCENTILE, COMPETITION_WINDOW, PENDING_CHANNEL_CAPACITY,
    PENDING_FETCH_CONCURRENCY,
};
use crate::stream::stream_pending_transactions;

/// Bid seen on a pending transaction to the target contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompetingObservation {
    pub fee: u128,
    pub at: Instant,
}

enum MonitorState {
    Idle,
    Running(Vec<JoinHandle<()>>),
    Stopped,
}

pub struct CompetitionMonitor {
    client: SharedClient,
    contract: Address,
    enabled: bool,
    observations: Arc<DashMap<B256, CompetingObservation>>,
    state: Mutex<MonitorState>,
}

impl CompetitionMonitor {
    pub fn new(config: &Config, client: SharedClient) -> Self {
        Self {
            client,
            contract: config.contract_address,
            enabled: config.mempool_monitoring,
            observations: Arc::new(DashMap::new()),
            state: Mutex::new(MonitorState::Idle),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Spawns the producer and consumer tasks. Only the first call on an
    /// enabled monitor has any effect.
    pub fn start(&self) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*state, MonitorState::Idle) {
            return;
        }

        let (sender, receiver) = mpsc::channel(PENDING_CHANNEL_CAPACITY);
        let producer = tokio::spawn(stream_pending_transactions(self.client.clone(), sender));
        let consumer = tokio::spawn(consume(
            self.client.clone(),
            self.contract,
            self.observations.clone(),
            receiver,
        ));
        *state = MonitorState::Running(vec![producer, consumer]);
        info!(target: "mempool", contract = %self.contract, "Mempool monitoring started");
    }

    /// Aborts the background tasks. Later calls do nothing.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let MonitorState::Running(tasks) = std::mem::replace(&mut *state, MonitorState::Stopped) {
            for task in tasks {
                task.abort();
            }
            info!(target: "mempool", observed = self.observations.len(), "Mempool monitoring stopped");
        }
    }

    pub fn record(&self, hash: B256, fee: u128, at: Instant) {
        self.observations.insert(hash, CompetingObservation { fee, at });
    }

    /// The 75th percentile bid among observations younger than the window.
    pub fn competing_fee(&self) -> Option<u128> {
        let now = Instant::now();
        let mut fees: Vec<u128> = self
            .observations
            .iter()
            .filter(|entry| now.duration_since(entry.at) < COMPETITION_WINDOW)
            .map(|entry| entry.fee)
            .collect();
        if fees.is_empty() {
            return None;
        }
        fees.sort_unstable();
        let idx = (fees.len() as f64 * COMPETITION_PERCENTILE).floor() as usize;
        fees.get(idx.min(fees.len() - 1)).copied()
    }
}

impl Drop for CompetitionMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn consume(
    client: SharedClient,
    contract: Address,
    observations: Arc<DashMap<B256, CompetingObservation>>,
    receiver: Receiver<B256>,
) {
    let hashes = stream::unfold(receiver, |mut rx| async move {
        rx.recv().await.map(|hash| (hash, rx))
    });

    hashes
        .for_each_concurrent(PENDING_FETCH_CONCURRENCY, |hash| {
            let client = client.clone();
            let observations = observations.clone();
            async move {
                match client.transaction(hash).await {
                    Ok(Some(tx)) if tx.to == Some(contract) => {
                        if let Some(fee) = tx.bid() {
                            debug!(target: "mempool", %hash, fee, "Competing transaction");
                            observations.insert(hash, CompetingObservation { fee, at: Instant::now() });
                        }
                    }
                    Ok(_) => {}
                    Err(e) => debug!(target: "mempool", %hash, error = %e, "Pending transaction fetch failed"),
                }
            }
        })
        .await;
}
