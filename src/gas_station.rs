use std::fmt;

use alloy::primitives::U256;
use alloy::primitives::utils::format_units;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::chain::{FeeHistory, SharedClient};
use crate::config::Config;
use crate::constants::{
    DEFAULT_GAS_PRICE, FEE_HISTORY_BLOCKS, FEE_HISTORY_PERCENTILES, FEE_HISTORY_TTL,
};
use crate::error::Result;

/// Fee fields for one transaction, in wei.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeQuote {
    Legacy {
        gas_price: u128,
    },
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
}

impl FeeQuote {
    /// The value compared against competing bids: gas price or max fee.
    pub fn headline(&self) -> u128 {
        match *self {
            FeeQuote::Legacy { gas_price } => gas_price,
            FeeQuote::Eip1559 { max_fee_per_gas, .. } => max_fee_per_gas,
        }
    }

    /// True when every field of `self` is at least the matching field of `other`.
    pub fn dominates(&self, other: &FeeQuote) -> bool {
        match (*self, *other) {
            (FeeQuote::Legacy { gas_price: a }, FeeQuote::Legacy { gas_price: b }) => a >= b,
            (
                FeeQuote::Eip1559 {
                    max_fee_per_gas: a_max,
                    max_priority_fee_per_gas: a_tip,
                },
                FeeQuote::Eip1559 {
                    max_fee_per_gas: b_max,
                    max_priority_fee_per_gas: b_tip,
                },
            ) => a_max >= b_max && a_tip >= b_tip,
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FeeQuote::Legacy { .. } => "legacy",
            FeeQuote::Eip1559 { .. } => "eip1559",
        }
    }
}

fn gwei(wei: u128) -> String {
    format_units(U256::from(wei), "gwei").unwrap_or_else(|_| wei.to_string())
}

impl fmt::Display for FeeQuote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FeeQuote::Legacy { gas_price } => write!(f, "{} gwei", gwei(gas_price)),
            FeeQuote::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => write!(
                f,
                "{}/{} gwei",
                gwei(max_fee_per_gas),
                gwei(max_priority_fee_per_gas)
            ),
        }
    }
}

/// Raises every fee field by `floor(base_percent * multiplier)` percent.
///
/// Results are clamped to `cap` but never drop below the input, and the
/// priority fee never exceeds the max fee.
pub fn bump_fees(quote: FeeQuote, base_percent: u64, multiplier: f64, cap: u128) -> FeeQuote {
    let percent = (base_percent as f64 * multiplier).floor().max(0.0) as u128;
    raise_fees(quote, percent, cap)
}

/// Raises every fee field by `percent`, with the same clamping as [`bump_fees`].
pub fn raise_fees(quote: FeeQuote, percent: u128, cap: u128) -> FeeQuote {
    let raise = |value: u128| {
        let bumped = value.saturating_mul(100 + percent) / 100;
        bumped.min(cap).max(value)
    };

    match quote {
        FeeQuote::Legacy { gas_price } => FeeQuote::Legacy {
            gas_price: raise(gas_price),
        },
        FeeQuote::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => {
            let max_fee = raise(max_fee_per_gas);
            let tip = raise(max_priority_fee_per_gas);
            FeeQuote::Eip1559 {
                max_fee_per_gas: max_fee,
                max_priority_fee_per_gas: tip.min(max_fee).max(max_priority_fee_per_gas),
            }
        }
    }
}

/// Cached `eth_feeHistory` window.
#[derive(Debug, Clone)]
pub struct FeeHistorySnapshot {
    pub fetched_at: Instant,
    pub history: FeeHistory,
}

impl FeeHistorySnapshot {
    pub fn latest_base_fee(&self) -> Option<u128> {
        self.history.base_fee_per_gas.last().copied()
    }

    /// Median of the per-block 50th percentile rewards.
    pub fn median_reward(&self) -> Option<u128> {
        let mut rewards: Vec<u128> = self
            .history
            .reward
            .iter()
            .filter_map(|r| r.get(1).copied())
            .collect();
        if rewards.is_empty() {
            return None;
        }
        rewards.sort_unstable();
        Some(rewards[rewards.len() / 2])
    }
}

/// Fee oracle: turns network fee data into quotes and escalates them.
pub struct GasStation {
    client: SharedClient,
    fee_override: Option<FeeQuote>,
    multiplier_pct: u128,
    max_fee_cap: u128,
    bump_percent: u64,
    history: RwLock<Option<FeeHistorySnapshot>>,
}

impl GasStation {
    pub fn new(config: &Config, client: SharedClient) -> Self {
        Self {
            client,
            fee_override: config.fee_override,
            multiplier_pct: (config.dynamic_fee_multiplier * 100.0).floor().max(0.0) as u128,
            max_fee_cap: config.max_fee_cap,
            bump_percent: config.gas_bump_percent,
            history: RwLock::new(None),
        }
    }

    /// Fixed fees from configuration, when present. Needs no network access.
    pub fn fee_override(&self) -> Option<FeeQuote> {
        self.fee_override
    }

    pub fn max_fee_cap(&self) -> u128 {
        self.max_fee_cap
    }

    pub async fn optimal_fees(&self) -> Result<FeeQuote> {
        self.refresh_history().await;

        if let Some(quote) = self.fee_override {
            return Ok(quote);
        }

        let fee_data = self.client.fee_data().await?;
        let scale = |value: u128| value.saturating_mul(self.multiplier_pct) / 100;

        let quote = match (fee_data.max_fee_per_gas, fee_data.max_priority_fee_per_gas) {
            (Some(max_fee), Some(tip)) => {
                let mut max_fee = scale(max_fee);
                let mut tip = scale(tip);
                if max_fee > self.max_fee_cap {
                    max_fee = self.max_fee_cap;
                    tip = max_fee / 4;
                }
                FeeQuote::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: tip.min(max_fee),
                }
            }
            _ => FeeQuote::Legacy {
                gas_price: scale(fee_data.gas_price.unwrap_or(DEFAULT_GAS_PRICE)),
            },
        };

        if let Some(snapshot) = self.history().await {
            debug!(
                target: "gas_station",
                base_fee = ?snapshot.latest_base_fee(),
                median_reward = ?snapshot.median_reward(),
                quote = %quote,
                "Computed dynamic fee quote"
            );
        }
        Ok(quote)
    }

    pub fn bump_fees(&self, quote: FeeQuote, multiplier: f64) -> FeeQuote {
        bump_fees(quote, self.bump_percent, multiplier, self.max_fee_cap)
    }

    /// Flat raise independent of the configured bump percent.
    pub fn raise_fees(&self, quote: FeeQuote, percent: u128) -> FeeQuote {
        raise_fees(quote, percent, self.max_fee_cap)
    }

    /// Refreshes the fee-history cache when it is older than the TTL.
    /// Failures keep the previous snapshot.
    pub async fn refresh_history(&self) {
        {
            let cached = self.history.read().await;
            if cached
                .as_ref()
                .is_some_and(|s| s.fetched_at.elapsed() < FEE_HISTORY_TTL)
            {
                return;
            }
        }

        match self
            .client
            .fee_history(FEE_HISTORY_BLOCKS, &FEE_HISTORY_PERCENTILES)
            .await
        {
            Ok(history) => {
                *self.history.write().await = Some(FeeHistorySnapshot {
                    fetched_at: Instant::now(),
                    history,
                });
            }
            Err(e) => warn!(target: "gas_station", error = %e, "Failed to update fee history"),
        }
    }

    pub async fn history(&self) -> Option<FeeHistorySnapshot> {
        self.history.read().await.clone()
    }
}
