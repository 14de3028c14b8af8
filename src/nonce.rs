use alloy::primitives::Address;
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::chain::{NonceTag, SharedClient};
use crate::config::{Config, NonceStrategy};
use crate::error::Result;

/// Hands out per-wallet nonces from a local cache seeded by the node.
///
/// The cache is bumped every time a nonce is handed out, whether or not the
/// transaction that uses it lands. Replacement attempts keep the nonce they
/// were built with instead of asking for a new one.
pub struct NonceManager {
    client: SharedClient,
    strategy: NonceStrategy,
    offset: u64,
    dry_run: bool,
    preload_enabled: bool,
    next: DashMap<Address, u64>,
    in_flight: DashMap<Address, u64>,
}

impl NonceManager {
    pub fn new(config: &Config, client: SharedClient) -> Self {
        Self {
            client,
            strategy: config.nonce_strategy,
            offset: config.nonce_offset,
            dry_run: config.dry_run,
            preload_enabled: config.preload_nonces,
            next: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    pub async fn nonce(&self, address: Address) -> Result<u64> {
        if self.dry_run {
            return Ok(0);
        }

        let tag = match self.strategy {
            NonceStrategy::Manual(value) => return Ok(value + self.offset),
            NonceStrategy::Pending => NonceTag::Pending,
            NonceStrategy::Latest => NonceTag::Latest,
        };

        if let Some(mut cached) = self.next.get_mut(&address) {
            let nonce = *cached;
            *cached += 1;
            return Ok(nonce);
        }

        let fetched = self.client.transaction_count(address, tag).await?;
        // a concurrent call may have seeded the cache while we were fetching
        let mut next = self.next.entry(address).or_insert(fetched + self.offset);
        let nonce = *next;
        *next += 1;
        Ok(nonce)
    }

    /// Seeds the cache for every wallet concurrently. A failed fetch is logged
    /// and leaves that wallet to be fetched lazily.
    pub async fn preload(&self, addresses: &[Address]) {
        if !self.preload_enabled || self.dry_run {
            return;
        }

        let results = join_all(addresses.iter().map(|&address| async move {
            (address, self.nonce(address).await)
        }))
        .await;

        for (address, result) in results {
            match result {
                Ok(nonce) => {
                    self.next.insert(address, nonce);
                    self.in_flight.insert(address, nonce);
                    debug!(target: "nonce", %address, nonce, "Preloaded nonce");
                }
                Err(e) => warn!(target: "nonce", %address, error = %e, "Failed to preload nonce"),
            }
        }
    }

    /// Raises the in-flight floor for `address` to `nonce + 1`.
    pub fn mark_used(&self, address: Address, nonce: u64) {
        let mut floor = self.in_flight.entry(address).or_insert(0);
        *floor = (*floor).max(nonce + 1);
    }

    pub fn in_flight(&self, address: Address) -> Option<u64> {
        self.in_flight.get(&address).map(|floor| *floor)
    }
}
