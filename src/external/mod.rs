pub mod relay;
pub mod traits;

pub use relay::RelayExecutor;
pub use traits::*;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::types::{ReservationGrant, SignalMessage};

/// Executor that logs the reservation without submitting anything. Every
/// nonce it receives ends up abandoned downstream, so it is meant for dry runs
/// against a partition whose counter is not shared with a live account.
#[derive(Debug, Default, Clone)]
pub struct DryRunExecutor;

#[async_trait]
impl ActionExecutor for DryRunExecutor {
    async fn execute(&self, grant: &ReservationGrant, signal: &SignalMessage) -> Result<ActionOutcome> {
        info!(
            "Dry run: would act on {:?} signal for partition {} with nonce {}",
            signal.kind, grant.partition_key, grant.nonce
        );
        Ok(ActionOutcome::Skipped {
            reason: "dry run".to_string(),
        })
    }
}
