use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{
    error::WorkerError,
    types::{PartitionKey, ReservationGrant, SignalKind, SignalMessage},
};

/// One qualifying event observed on the external feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEvent {
    pub kind: SignalKind,
    pub partition_key: PartitionKey,
    pub payload: serde_json::Value,
}

impl FeedEvent {
    pub fn into_signal(self) -> SignalMessage {
        SignalMessage::new(self.kind, self.partition_key, self.payload)
    }
}

pub type FeedStream = BoxStream<'static, std::result::Result<FeedEvent, WorkerError>>;

#[async_trait]
pub trait EventFeed: Send + Sync {
    async fn connect(&self, partition: &PartitionKey) -> std::result::Result<FeedStream, WorkerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Submitted { reference: String },
    Skipped { reason: String },
}

/// Decides whether a reserved slot is worth using and submits the action.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, grant: &ReservationGrant, signal: &SignalMessage) -> Result<ActionOutcome>;

    /// Periodic refresh of whatever market context the executor keeps.
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

/// Authoritative starting value for a partition's sequence counter.
#[async_trait]
pub trait NonceSource: Send + Sync {
    async fn baseline(&self, partition: &PartitionKey) -> Result<u64>;
}

/// Builds the signed, encoded payload for a reserved nonce.
#[async_trait]
pub trait PayloadBuilder: Send + Sync {
    async fn build(&self, grant: &ReservationGrant, signal: &SignalMessage) -> Result<Option<Vec<u8>>>;
}
