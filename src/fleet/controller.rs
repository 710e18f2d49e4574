use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc},
    time::{sleep, sleep_until, timeout, timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::FleetConfig,
    external::NonceSource,
    fleet::{
        allocator::SequenceAllocator,
        handle::{FleetCommand, FleetEvent, FleetHandle, FleetSnapshot, PartitionSnapshot},
        launcher::{Inbound, Launcher},
        metrics::FleetMetrics,
        signal_bus::{Peer, SignalBus},
    },
    protocol::{ControllerMessage, Rejection, StateReport, WorkerMessage},
    types::{
        Ordinal, PartitionKey, ReservationGrant, ReservationRequest, SignalMessage,
        WorkerDescriptor,
    },
};

const BASELINE_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct WorkerSlot {
    descriptor: WorkerDescriptor,
    tx: mpsc::UnboundedSender<ControllerMessage>,
    kill: CancellationToken,
}

/// Owns the fleet: spawns workers on a stagger, replaces the ones that exit,
/// hands out sequence numbers and relays signals between peers.
///
/// Everything runs on one task. Worker messages are handled strictly in
/// arrival order, which is what makes the allocator safe without a lock.
pub struct FleetController<L: Launcher> {
    config: FleetConfig,
    launcher: L,
    allocator: SequenceAllocator,
    bus: SignalBus,
    metrics: FleetMetrics,
    nonce_source: Option<Arc<dyn NonceSource>>,
    workers: BTreeMap<Ordinal, WorkerSlot>,
    next_ordinal: Ordinal,
    spawn_backlog: usize,
    stagger: Duration,
    last_spawn: Option<Instant>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    commands: mpsc::UnboundedReceiver<FleetCommand>,
    events: broadcast::Sender<FleetEvent>,
    cancel: CancellationToken,
}

impl<L: Launcher> FleetController<L> {
    pub fn new(config: FleetConfig, launcher: L) -> (Self, FleetHandle) {
        let (handle, commands, events) = FleetHandle::channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let stagger = config.stagger_delay();

        let controller = Self {
            config,
            launcher,
            allocator: SequenceAllocator::new(),
            bus: SignalBus::new(),
            metrics: FleetMetrics::new(),
            nonce_source: None,
            workers: BTreeMap::new(),
            next_ordinal: 0,
            spawn_backlog: 0,
            stagger,
            last_spawn: None,
            inbound_tx,
            inbound_rx,
            commands,
            events,
            cancel: CancellationToken::new(),
        };
        (controller, handle)
    }

    /// Lets the controller look up the starting nonce for partitions that no
    /// worker supplied a baseline for.
    pub fn with_nonce_source(mut self, source: Arc<dyn NonceSource>) -> Self {
        self.nonce_source = Some(source);
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queues `size` workers to be started `stagger` apart once [`run`] is
    /// polled. The first one starts immediately.
    ///
    /// [`run`]: FleetController::run
    pub fn spawn_fleet(&mut self, size: usize, stagger: Duration) {
        info!(
            "Scheduling fleet of {} workers, {:?} apart (max {})",
            size, stagger, self.config.max_size
        );
        self.spawn_backlog += size;
        self.stagger = stagger;
    }

    pub async fn run(mut self) -> FleetMetrics {
        info!("Fleet controller started");

        loop {
            let spawn_at = self.next_spawn_at();

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(inbound) = self.inbound_rx.recv() => self.on_inbound(inbound).await,
                Some(command) = self.commands.recv() => self.on_command(command),
                _ = sleep_until(spawn_at.unwrap_or_else(Instant::now)), if spawn_at.is_some() => {
                    self.spawn_backlog -= 1;
                    self.spawn_worker();
                }
            }
        }

        self.shutdown().await;
        self.metrics
    }

    fn next_spawn_at(&self) -> Option<Instant> {
        if self.spawn_backlog == 0 {
            return None;
        }
        Some(match self.last_spawn {
            Some(last) => last + self.stagger,
            None => Instant::now(),
        })
    }

    fn spawn_worker(&mut self) {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;

        let kill = self.cancel.child_token();
        let now = Instant::now();
        self.last_spawn = Some(now);

        match self.launcher.launch(ordinal, kill.clone(), self.inbound_tx.clone()) {
            Ok(launched) => {
                info!("Worker {} spawned", ordinal);
                self.workers.insert(
                    ordinal,
                    WorkerSlot {
                        descriptor: WorkerDescriptor::new(ordinal),
                        tx: launched.tx,
                        kill,
                    },
                );
                self.metrics.record_spawn();
                let _ = self.events.send(FleetEvent::WorkerSpawned { ordinal, at: now });
            }
            Err(e) => {
                error!("Failed to launch worker {}: {}", ordinal, e);
                self.on_exit(ordinal, format!("launch failed: {}", e));
            }
        }
    }

    async fn on_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Message { ordinal, message } => self.handle(ordinal, message).await,
            Inbound::Exited { ordinal, reason } => self.on_exit(ordinal, reason),
            Inbound::RespawnDue { replacing } => {
                info!("Respawning replacement for worker {}", replacing);
                self.spawn_worker();
            }
        }
    }

    /// Processes one message from worker `ordinal`.
    pub async fn handle(&mut self, ordinal: Ordinal, message: WorkerMessage) {
        match message {
            WorkerMessage::SequenceRequest(request) => self.grant_sequence(ordinal, request).await,
            WorkerMessage::Signal(signal) => self.relay_signal(ordinal, signal),
            WorkerMessage::StateChanged(report) => self.update_state(ordinal, report),
            WorkerMessage::SequenceAbandoned(grant) => self.record_abandoned(ordinal, grant),
        }
    }

    async fn grant_sequence(&mut self, ordinal: Ordinal, request: ReservationRequest) {
        let Some(tx) = self.workers.get(&ordinal).map(|slot| slot.tx.clone()) else {
            warn!("Dropping sequence request from unknown worker {}", ordinal);
            return;
        };

        let key = request.partition_key;
        let baseline = if self.allocator.is_initialized(&key) {
            None
        } else {
            match request.baseline {
                Some(baseline) => Some(baseline),
                None => fetch_baseline(self.nonce_source.clone(), &key).await,
            }
        };

        let reply = match self.allocator.request(&key, baseline) {
            Ok(nonce) => {
                self.metrics.record_grant(&key, nonce);
                let _ = self.events.send(FleetEvent::SequenceGranted {
                    ordinal,
                    partition_key: key.clone(),
                    nonce,
                });
                ControllerMessage::SequenceGrant(ReservationGrant {
                    nonce,
                    partition_key: key,
                    correlation_id: request.correlation_id,
                })
            }
            Err(e) => {
                warn!("Rejecting sequence request from worker {}: {}", ordinal, e);
                self.metrics.record_rejection(&key);
                let _ = self.events.send(FleetEvent::SequenceRejected {
                    ordinal,
                    partition_key: key.clone(),
                    reason: e.to_string(),
                });
                ControllerMessage::SequenceRejected(Rejection {
                    partition_key: key,
                    correlation_id: request.correlation_id,
                    reason: e.to_string(),
                })
            }
        };

        if let Err(e) = tx.send(reply) {
            if let ControllerMessage::SequenceGrant(grant) = e.0 {
                warn!(
                    "Worker {} went away before receiving nonce {}",
                    ordinal, grant.nonce
                );
                self.record_abandoned(ordinal, grant);
            }
        }
    }

    fn relay_signal(&mut self, origin: Ordinal, signal: SignalMessage) {
        let peers = self.workers.values().map(|slot| Peer {
            ordinal: slot.descriptor.ordinal,
            state: slot.descriptor.state,
            tx: &slot.tx,
        });
        let recipients = self.bus.publish(origin, &signal, peers);

        self.metrics.record_signal(recipients.len());
        let _ = self.events.send(FleetEvent::SignalRelayed { origin, recipients });
    }

    fn update_state(&mut self, ordinal: Ordinal, report: StateReport) {
        let Some(slot) = self.workers.get_mut(&ordinal) else {
            debug!("State report from departed worker {}", ordinal);
            return;
        };

        debug!(
            "Worker {} ({} on {}) -> {:?}",
            ordinal, report.role, report.partition_key, report.state
        );
        slot.descriptor.state = report.state;
        slot.descriptor.role = Some(report.role);
        slot.descriptor.partition = Some(report.partition_key);
        let _ = self.events.send(FleetEvent::StateChanged {
            ordinal,
            state: report.state,
        });
    }

    fn record_abandoned(&mut self, ordinal: Ordinal, grant: ReservationGrant) {
        if self.allocator.record_abandoned(&grant.partition_key, grant.nonce) {
            self.metrics.record_abandoned(&grant.partition_key);
            warn!(
                "Nonce {} on partition {} abandoned by worker {}; later nonces stay blocked until resync",
                grant.nonce, grant.partition_key, ordinal
            );
        }
    }

    /// Forgets worker `ordinal` and, unless the fleet is stopping, schedules a
    /// replacement after the respawn cooldown.
    pub fn on_exit(&mut self, ordinal: Ordinal, reason: String) {
        let respawn = !self.cancel.is_cancelled();
        if let Some(slot) = self.workers.remove(&ordinal) {
            slot.kill.cancel();
        }

        warn!("Worker {} exited: {}", ordinal, reason);
        self.metrics
            .record_exit(format!("worker {}: {}", ordinal, reason), respawn);
        let _ = self.events.send(FleetEvent::WorkerExited {
            ordinal,
            reason,
            at: Instant::now(),
        });

        if respawn {
            let cooldown = self.config.respawn_cooldown();
            let inbound = self.inbound_tx.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = sleep(cooldown) => {
                        let _ = inbound.send(Inbound::RespawnDue { replacing: ordinal });
                    }
                }
            });
        }
    }

    fn on_command(&mut self, command: FleetCommand) {
        match command {
            FleetCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            FleetCommand::Terminate(ordinal) => match self.workers.get(&ordinal) {
                Some(slot) => {
                    info!("Terminating worker {}", ordinal);
                    slot.kill.cancel();
                }
                None => warn!("Cannot terminate unknown worker {}", ordinal),
            },
            FleetCommand::Resync { key, next } => self.allocator.resync(&key, next),
            FleetCommand::Shutdown => {
                info!("Shutdown requested");
                self.cancel.cancel();
            }
        }
    }

    fn snapshot(&self) -> FleetSnapshot {
        FleetSnapshot {
            workers: self
                .workers
                .values()
                .map(|slot| slot.descriptor.clone())
                .collect(),
            partitions: self
                .allocator
                .partitions()
                .into_iter()
                .map(|key| PartitionSnapshot {
                    next: self.allocator.peek(&key).unwrap_or_default(),
                    abandoned: self.allocator.abandoned(&key),
                    partition_key: key,
                })
                .collect(),
            metrics: self.metrics.clone(),
        }
    }

    async fn shutdown(&mut self) {
        info!("Stopping {} workers", self.workers.len());
        for slot in self.workers.values() {
            slot.kill.cancel();
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.workers.is_empty() {
            match timeout_at(deadline, self.inbound_rx.recv()).await {
                Ok(Some(Inbound::Exited { ordinal, reason })) => self.on_exit(ordinal, reason),
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }

        if !self.workers.is_empty() {
            warn!("{} workers did not exit within {:?}", self.workers.len(), SHUTDOWN_GRACE);
        }

        info!("{}", self.metrics.generate_report());
        let _ = self.events.send(FleetEvent::Stopped);
    }
}

async fn fetch_baseline(source: Option<Arc<dyn NonceSource>>, key: &PartitionKey) -> Option<u64> {
    let source = source?;
    match timeout(BASELINE_TIMEOUT, source.baseline(key)).await {
        Ok(Ok(baseline)) => Some(baseline),
        Ok(Err(e)) => {
            warn!("Failed to fetch baseline for partition {}: {}", key, e);
            None
        }
        Err(_) => {
            warn!("Baseline lookup for partition {} timed out", key);
            None
        }
    }
}
