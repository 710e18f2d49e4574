use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type Ordinal = u64;
pub type CorrelationId = Uuid;

/// Identifier under which a sequence counter and a slice of workload are tracked
/// (a chain id, a target system, a shard name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(pub String);

impl PartitionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Listener,
    Analyst,
    Striker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Role::Listener => "LISTENER",
            Role::Analyst => "ANALYST",
            Role::Striker => "STRIKER",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Spawning,
    Connecting,
    Online,
    Backoff,
    Dead,
}

impl WorkerState {
    pub fn is_live(&self) -> bool {
        matches!(self, WorkerState::Online)
    }
}

/// Controller-side record of a spawned worker. Role and partition stay unknown
/// until the worker reports them with its first state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub ordinal: Ordinal,
    pub role: Option<Role>,
    pub partition: Option<PartitionKey>,
    pub state: WorkerState,
    pub spawned_at: DateTime<Utc>,
}

impl WorkerDescriptor {
    pub fn new(ordinal: Ordinal) -> Self {
        Self {
            ordinal,
            role: None,
            partition: None,
            state: WorkerState::Spawning,
            spawned_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    NewBlock,
    Activity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub kind: SignalKind,
    pub partition_key: PartitionKey,
    pub payload: serde_json::Value,
    pub correlation_id: CorrelationId,
}

impl SignalMessage {
    pub fn new(kind: SignalKind, partition_key: PartitionKey, payload: serde_json::Value) -> Self {
        Self {
            kind,
            partition_key,
            payload,
            correlation_id: Uuid::new_v4(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub partition_key: PartitionKey,
    pub correlation_id: CorrelationId,
    /// Starting value used only if the controller has never seen this key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<u64>,
}

impl ReservationRequest {
    pub fn new(partition_key: PartitionKey) -> Self {
        Self {
            partition_key,
            correlation_id: Uuid::new_v4(),
            baseline: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationGrant {
    pub nonce: u64,
    pub partition_key: PartitionKey,
    pub correlation_id: CorrelationId,
}

/// Liveness probe payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub ordinal: Ordinal,
    pub state: WorkerState,
    pub role: Role,
    pub partition_key: PartitionKey,
}
