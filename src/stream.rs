use alloy::primitives::B256;
use futures::StreamExt;
use tokio::sync::mpsc::Sender;
use tracing::{debug, warn};

use crate::chain::SharedClient;

/// Subscribes to pending transaction hashes and forwards them into `sender`.
/// Returns when the subscription ends or the receiver is dropped.
pub async fn stream_pending_transactions(client: SharedClient, sender: Sender<B256>) {
    let mut stream = match client.pending_transactions().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(target: "stream", error = %e, "Failed to subscribe to pending transactions");
            return;
        }
    };

    while let Some(hash) = stream.next().await {
        if sender.send(hash).await.is_err() {
            debug!(target: "stream", "Pending transaction receiver dropped");
            return;
        }
    }
    debug!(target: "stream", "Pending transaction subscription ended");
}
