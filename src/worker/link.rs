//! Worker-side end of the controller channel.
//!
//! A router task demultiplexes inbound controller messages: grants and
//! rejections resolve the pending reservation with the same correlation id,
//! signals are queued for the worker loop. A delivered grant stays held by
//! the link until it is settled or abandoned, so a worker that stops mid
//! action can still hand its reserved nonces back.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    error::WorkerError,
    protocol::{ControllerMessage, Rejection, StateReport, WorkerMessage},
    types::{CorrelationId, PartitionKey, ReservationGrant, ReservationRequest, SignalMessage},
};

/// Channel pair connecting one worker to the controller.
pub struct WorkerChannels {
    pub outbound: mpsc::UnboundedSender<WorkerMessage>,
    pub inbound: mpsc::UnboundedReceiver<ControllerMessage>,
}

type Reply = Result<ReservationGrant, Rejection>;

#[derive(Default)]
struct Reservations {
    pending: HashMap<CorrelationId, oneshot::Sender<Reply>>,
    held: HashMap<CorrelationId, ReservationGrant>,
}

#[derive(Clone)]
pub struct ControllerLink {
    outbound: mpsc::UnboundedSender<WorkerMessage>,
    reservations: Arc<Mutex<Reservations>>,
}

impl ControllerLink {
    pub fn start(
        channels: WorkerChannels,
    ) -> (Self, mpsc::UnboundedReceiver<SignalMessage>, JoinHandle<()>) {
        let link = Self {
            outbound: channels.outbound,
            reservations: Arc::new(Mutex::new(Reservations::default())),
        };
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        let router = tokio::spawn(Self::route(link.clone(), channels.inbound, signals_tx));
        (link, signals_rx, router)
    }

    async fn route(
        link: ControllerLink,
        mut inbound: mpsc::UnboundedReceiver<ControllerMessage>,
        signals_tx: mpsc::UnboundedSender<SignalMessage>,
    ) {
        while let Some(message) = inbound.recv().await {
            match message {
                ControllerMessage::SequenceGrant(grant) => link.deliver(grant),
                ControllerMessage::SequenceRejected(rejection) => {
                    let waiter = link.reservations().pending.remove(&rejection.correlation_id);
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Err(rejection));
                    }
                }
                ControllerMessage::Signal(signal) => {
                    if signals_tx.send(signal).is_err() {
                        break;
                    }
                }
            }
        }

        debug!("Controller link closed");
    }

    fn reservations(&self) -> MutexGuard<'_, Reservations> {
        self.reservations.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(&self, grant: ReservationGrant) {
        let mut reservations = self.reservations();
        let Some(waiter) = reservations.pending.remove(&grant.correlation_id) else {
            drop(reservations);
            return self.abandon_late(grant);
        };

        reservations.held.insert(grant.correlation_id, grant.clone());
        if let Err(Ok(grant)) = waiter.send(Ok(grant)) {
            reservations.held.remove(&grant.correlation_id);
            drop(reservations);
            self.abandon_late(grant);
        }
    }

    fn send(&self, message: WorkerMessage) -> Result<(), WorkerError> {
        self.outbound
            .send(message)
            .map_err(|_| WorkerError::FatalConfig("controller link closed".to_string()))
    }

    // A grant that arrives after its requester gave up can never be used.
    fn abandon_late(&self, grant: ReservationGrant) {
        warn!(
            "Late grant for partition {}: nonce {} is abandoned",
            grant.partition_key, grant.nonce
        );
        let _ = self.send(WorkerMessage::SequenceAbandoned(grant));
    }

    fn report_abandoned(&self, grant: ReservationGrant) {
        warn!(
            "Nonce {} on partition {} reserved but not submitted",
            grant.nonce, grant.partition_key
        );
        if let Err(e) = self.send(WorkerMessage::SequenceAbandoned(grant)) {
            debug!("Could not report abandoned nonce: {}", e);
        }
    }

    pub fn publish_signal(&self, signal: SignalMessage) -> Result<(), WorkerError> {
        self.send(WorkerMessage::Signal(signal))
    }

    pub fn report_state(&self, report: StateReport) -> Result<(), WorkerError> {
        self.send(WorkerMessage::StateChanged(report))
    }

    /// Reserves the next sequence value for `partition_key`, giving up after
    /// `wait` with a transient error.
    ///
    /// The returned grant is held until passed to [`settle`](Self::settle) or
    /// [`abandon`](Self::abandon).
    pub async fn request_sequence(
        &self,
        partition_key: PartitionKey,
        wait: Duration,
    ) -> Result<ReservationGrant, WorkerError> {
        let request = ReservationRequest::new(partition_key);
        let correlation_id = request.correlation_id;
        let (reply_tx, reply_rx) = oneshot::channel();

        self.reservations().pending.insert(correlation_id, reply_tx);
        if let Err(e) = self.send(WorkerMessage::SequenceRequest(request)) {
            self.reservations().pending.remove(&correlation_id);
            return Err(e);
        }

        match timeout(wait, reply_rx).await {
            Ok(Ok(Ok(grant))) => Ok(grant),
            Ok(Ok(Err(rejection))) => Err(WorkerError::TransientNetwork(format!(
                "sequence request rejected: {}",
                rejection.reason
            ))),
            Ok(Err(_)) => Err(WorkerError::FatalConfig(
                "controller link closed".to_string(),
            )),
            Err(_) => {
                let late = {
                    let mut reservations = self.reservations();
                    reservations.pending.remove(&correlation_id);
                    reservations.held.remove(&correlation_id)
                };
                if let Some(grant) = late {
                    self.abandon_late(grant);
                }
                Err(WorkerError::TransientNetwork(format!(
                    "sequence request timed out after {:?}",
                    wait
                )))
            }
        }
    }

    /// Releases a held grant whose action was submitted.
    pub fn settle(&self, grant: &ReservationGrant) {
        self.reservations().held.remove(&grant.correlation_id);
    }

    /// Releases a held grant whose action was not submitted and reports the
    /// nonce back to the controller.
    pub fn abandon(&self, grant: &ReservationGrant) {
        let held = self.reservations().held.remove(&grant.correlation_id);
        if let Some(grant) = held {
            self.report_abandoned(grant);
        }
    }

    /// Reports every still-held grant as abandoned. Returns how many there were.
    pub fn abandon_outstanding(&self) -> usize {
        let held: Vec<ReservationGrant> = self.reservations().held.drain().map(|(_, g)| g).collect();
        let count = held.len();
        for grant in held {
            self.report_abandoned(grant);
        }
        count
    }

    pub fn pending_requests(&self) -> usize {
        self.reservations().pending.len()
    }

    pub fn held_grants(&self) -> usize {
        self.reservations().held.len()
    }
}
