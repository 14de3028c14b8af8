use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use alloy::primitives::U256;
use alloy::primitives::utils::format_ether;
use tokio::time::Instant;
use tracing::info;

use crate::chain::TxReceipt;

/// Counters for one run, shared by every wallet task.
pub struct RunStats {
    started: Instant,
    tx_sent: AtomicU64,
    tx_confirmed: AtomicU64,
    gas_used: AtomicU64,
    confirm_ms_total: AtomicU64,
    total_fees: Mutex<U256>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tx_sent: u64,
    pub tx_confirmed: u64,
    pub gas_used: u64,
    pub total_fees: U256,
    pub avg_confirm_time: Option<Duration>,
    pub runtime: Duration,
}

impl StatsSnapshot {
    /// Confirmed over sent, as a percentage.
    pub fn success_rate(&self) -> Option<f64> {
        (self.tx_sent > 0).then(|| self.tx_confirmed as f64 * 100.0 / self.tx_sent as f64)
    }

    fn success_rate_display(&self) -> String {
        self.success_rate()
            .map(|rate| format!("{rate:.1}%"))
            .unwrap_or_else(|| "n/a".into())
    }
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            tx_sent: AtomicU64::new(0),
            tx_confirmed: AtomicU64::new(0),
            gas_used: AtomicU64::new(0),
            confirm_ms_total: AtomicU64::new(0),
            total_fees: Mutex::new(U256::ZERO),
        }
    }

    pub fn record_sent(&self) {
        self.tx_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a confirmed transaction. `confirm_time` is `None` for bundle
    /// inclusions, which have no broadcast-to-receipt latency of their own.
    pub fn record_confirmed(&self, receipt: &TxReceipt, confirm_time: Option<Duration>) {
        self.tx_confirmed.fetch_add(1, Ordering::Relaxed);
        self.gas_used.fetch_add(receipt.gas_used, Ordering::Relaxed);
        if let Some(elapsed) = confirm_time {
            self.confirm_ms_total
                .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        }
        let fee = U256::from(receipt.gas_used) * U256::from(receipt.effective_gas_price);
        let mut total = self.total_fees.lock().unwrap_or_else(PoisonError::into_inner);
        *total = total.saturating_add(fee);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let tx_confirmed = self.tx_confirmed.load(Ordering::Relaxed);
        let confirm_ms_total = self.confirm_ms_total.load(Ordering::Relaxed);
        StatsSnapshot {
            tx_sent: self.tx_sent.load(Ordering::Relaxed),
            tx_confirmed,
            gas_used: self.gas_used.load(Ordering::Relaxed),
            total_fees: *self.total_fees.lock().unwrap_or_else(PoisonError::into_inner),
            avg_confirm_time: (tx_confirmed > 0 && confirm_ms_total > 0)
                .then(|| Duration::from_millis(confirm_ms_total / tx_confirmed)),
            runtime: self.started.elapsed(),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            target: "stats",
            runtime = ?s.runtime,
            tx_sent = s.tx_sent,
            tx_confirmed = s.tx_confirmed,
            gas_used = s.gas_used,
            total_fees_eth = %format_ether(s.total_fees),
            success_rate = %s.success_rate_display(),
            avg_confirm_time = ?s.avg_confirm_time,
            "Run statistics"
        );
    }
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}
