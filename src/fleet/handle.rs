use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::Instant,
};

use crate::{
    fleet::metrics::FleetMetrics,
    types::{Ordinal, PartitionKey, WorkerDescriptor, WorkerState},
};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
pub enum FleetCommand {
    Snapshot(oneshot::Sender<FleetSnapshot>),
    Terminate(Ordinal),
    Resync { key: PartitionKey, next: u64 },
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum FleetEvent {
    WorkerSpawned { ordinal: Ordinal, at: Instant },
    WorkerExited { ordinal: Ordinal, reason: String, at: Instant },
    StateChanged { ordinal: Ordinal, state: WorkerState },
    SequenceGranted { ordinal: Ordinal, partition_key: PartitionKey, nonce: u64 },
    SequenceRejected { ordinal: Ordinal, partition_key: PartitionKey, reason: String },
    SignalRelayed { origin: Ordinal, recipients: Vec<Ordinal> },
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionSnapshot {
    pub partition_key: PartitionKey,
    pub next: u64,
    pub abandoned: Vec<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetSnapshot {
    pub workers: Vec<WorkerDescriptor>,
    pub partitions: Vec<PartitionSnapshot>,
    pub metrics: FleetMetrics,
}

impl FleetSnapshot {
    pub fn live_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.state.is_live()).count()
    }
}

/// Cloneable control surface for a running controller.
#[derive(Clone)]
pub struct FleetHandle {
    command_sender: mpsc::UnboundedSender<FleetCommand>,
    event_sender: broadcast::Sender<FleetEvent>,
}

impl FleetHandle {
    pub(crate) fn channel() -> (
        Self,
        mpsc::UnboundedReceiver<FleetCommand>,
        broadcast::Sender<FleetEvent>,
    ) {
        let (command_sender, command_receiver) = mpsc::unbounded_channel();
        let (event_sender, _) = broadcast::channel(EVENT_CAPACITY);
        let handle = Self {
            command_sender,
            event_sender: event_sender.clone(),
        };
        (handle, command_receiver, event_sender)
    }

    pub fn send_command(&self, command: FleetCommand) -> Result<()> {
        self.command_sender
            .send(command)
            .map_err(|e| anyhow!("Failed to send command: {:?}", e.0))
    }

    pub fn subscribe(&self) -> FleetEvents {
        FleetEvents {
            receiver: self.event_sender.subscribe(),
        }
    }

    pub async fn snapshot(&self) -> Result<FleetSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send_command(FleetCommand::Snapshot(tx))?;
        rx.await
            .map_err(|_| anyhow!("Controller stopped before answering snapshot"))
    }

    pub fn terminate(&self, ordinal: Ordinal) -> Result<()> {
        self.send_command(FleetCommand::Terminate(ordinal))
    }

    pub fn resync(&self, key: PartitionKey, next: u64) -> Result<()> {
        self.send_command(FleetCommand::Resync { key, next })
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send_command(FleetCommand::Shutdown)
    }
}

pub struct FleetEvents {
    receiver: broadcast::Receiver<FleetEvent>,
}

impl FleetEvents {
    pub async fn next_event(&mut self) -> Result<FleetEvent> {
        self.receiver
            .recv()
            .await
            .map_err(|e| anyhow!("Failed to receive event: {}", e))
    }
}
