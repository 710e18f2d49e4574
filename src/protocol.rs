//! Controller ⇄ worker message protocol.
//!
//! Messages travel as one JSON object per line, adjacently tagged as
//! `{"kind": "SEQUENCE_REQUEST", "body": {...}}`. The same enums are passed
//! unencoded over tokio channels when the worker runs in-process.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::types::{
    CorrelationId, PartitionKey, ReservationGrant, ReservationRequest, Role, SignalMessage,
    WorkerState,
};

/// Environment variable carrying the ordinal of a worker process.
pub const WORKER_ORDINAL_ENV: &str = "FLEET_WORKER_ORDINAL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    SequenceRequest(ReservationRequest),
    Signal(SignalMessage),
    StateChanged(StateReport),
    SequenceAbandoned(ReservationGrant),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerMessage {
    SequenceGrant(ReservationGrant),
    SequenceRejected(Rejection),
    Signal(SignalMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateReport {
    pub state: WorkerState,
    pub role: Role,
    pub partition_key: PartitionKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub partition_key: PartitionKey,
    pub correlation_id: CorrelationId,
    pub reason: String,
}

pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)
        .map_err(|e| anyhow!("Failed to encode message: {}", e))?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| anyhow!("Failed to decode message '{}': {}", line.trim_end(), e))
}
