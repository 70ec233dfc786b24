use crate::bundler::BundlerClient;
use crate::error::{UserOperationError, UserOperationErrorRecord};
use crate::events::TrackerEvent;
use crate::network::NetworkClient;
use crate::types::{UserOperationMetadata, UserOperationStatus};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const USER_OPERATION_FAILED: &str = "UserOperationFailed";
const DEFAULT_FAILURE_MESSAGE: &str = "User operation failed on chain";

/// Produces deep copies of the controller's records.
pub type MetadataSnapshot = Arc<dyn Fn() -> Vec<UserOperationMetadata> + Send + Sync>;

/// Polls the bundler for receipts of submitted operations on one chain.
pub struct PendingUserOperationTracker {
    chain_id: u64,
    network: Arc<dyn NetworkClient>,
    snapshot: MetadataSnapshot,
    events: mpsc::UnboundedSender<TrackerEvent>,
    poll_interval: Duration,
}

impl PendingUserOperationTracker {
    pub fn new(
        chain_id: u64,
        network: Arc<dyn NetworkClient>,
        snapshot: MetadataSnapshot,
        events: mpsc::UnboundedSender<TrackerEvent>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            chain_id,
            network,
            snapshot,
            events,
            poll_interval,
        }
    }

    /// Polls until the receiving side of the event channel is gone.
    pub async fn run(self) {
        tracing::info!(
            chain_id = self.chain_id,
            poll_interval_s = self.poll_interval.as_secs_f64(),
            "pending user operation tracker starting"
        );
        loop {
            if self.events.is_closed() {
                break;
            }
            self.poll_once().await;
            tokio::time::sleep(self.poll_interval).await;
        }
        tracing::info!(chain_id = self.chain_id, "pending user operation tracker stopped");
    }

    /// One pass over every pending operation. Errors are logged and the
    /// operation is retried on the next pass.
    pub async fn poll_once(&self) {
        let pending: Vec<_> = (self.snapshot)()
            .into_iter()
            .filter(|md| {
                md.status == UserOperationStatus::Submitted
                    && md.chain_id == self.chain_id
                    && md.hash.is_some()
                    && md.bundler_url.is_some()
            })
            .collect();

        if pending.is_empty() {
            return;
        }
        tracing::debug!(
            chain_id = self.chain_id,
            count = pending.len(),
            "checking pending user operations"
        );

        for metadata in pending {
            let id = metadata.id.clone();
            match self.check(metadata).await {
                Ok(Some(event)) => {
                    if self.events.send(event).is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        id = %id,
                        error = %format!("{err:#}"),
                        "failed to check user operation receipt; will retry"
                    );
                }
            }
        }
    }

    /// Looks up the receipt for one submitted operation. `None` while it is
    /// still pending.
    pub async fn check(&self, mut metadata: UserOperationMetadata) -> Result<Option<TrackerEvent>> {
        let (Some(hash), Some(bundler_url)) = (metadata.hash, metadata.bundler_url.clone()) else {
            return Ok(None);
        };

        let bundler = BundlerClient::new(bundler_url);
        let Some(receipt) = bundler.get_user_operation_receipt(hash).await? else {
            tracing::debug!(id = %metadata.id, %hash, "user operation not yet included");
            return Ok(None);
        };

        metadata.transaction_hash = Some(receipt.receipt.transaction_hash);
        metadata.actual_gas_cost = receipt.actual_gas_cost;
        metadata.actual_gas_used = receipt.actual_gas_used;

        if let Some(block_hash) = receipt.receipt.block_hash {
            match self.network.base_fee_per_gas(block_hash).await {
                Ok(base_fee) => metadata.base_fee_per_gas = base_fee,
                Err(err) => {
                    tracing::debug!(
                        id = %metadata.id,
                        error = %format!("{err:#}"),
                        "could not read block base fee"
                    );
                }
            }
        }

        if receipt.success {
            tracing::info!(
                id = %metadata.id,
                %hash,
                tx = ?metadata.transaction_hash,
                "user operation confirmed"
            );
            metadata.status = UserOperationStatus::Confirmed;
            return Ok(Some(TrackerEvent::Confirmed(metadata)));
        }

        let record = UserOperationErrorRecord::new(
            USER_OPERATION_FAILED,
            receipt
                .reason
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string()),
        );
        tracing::warn!(
            id = %metadata.id,
            %hash,
            reason = %record.message,
            "user operation failed on chain"
        );
        metadata.status = UserOperationStatus::Failed;
        metadata.error = Some(record.clone());
        Ok(Some(TrackerEvent::Failed {
            metadata,
            error: UserOperationError::Failed(record),
        }))
    }
}
