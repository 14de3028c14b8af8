use std::time::Duration;

pub const GWEI: u128 = 1_000_000_000;

/// Legacy gas price assumed when the node reports none.
pub const DEFAULT_GAS_PRICE: u128 = 20 * GWEI;

pub const FEE_HISTORY_TTL: Duration = Duration::from_secs(5);
pub const FEE_HISTORY_BLOCKS: u64 = 20;
pub const FEE_HISTORY_PERCENTILES: [f64; 3] = [25.0, 50.0, 75.0];

pub const COMPETITION_WINDOW: Duration = Duration::from_secs(30);
pub const COMPETITION_PERCENTILE: f64 = 0.75;
pub const PENDING_CHANNEL_CAPACITY: usize = 1024;
pub const PENDING_FETCH_CONCURRENCY: usize = 16;

/// Raise, in percent, applied to the starting quote when the mempool shows a
/// higher bid.
pub const COMPETITION_PREBUMP_PERCENT: u128 = 30;

pub const BUNDLE_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(15);
pub const BUNDLE_RETRY_BUMP: f64 = 1.2;
pub const BUNDLE_RETRY_BUMP_CONTESTED: f64 = 1.8;

pub const ENDPOINT_BACKOFF_STEP: Duration = Duration::from_millis(500);
pub const BLOCK_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const RESOLUTION_POLL_INTERVAL: Duration = Duration::from_secs(1);
