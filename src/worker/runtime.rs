use futures::StreamExt;
use rand::Rng;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::{JoinError, JoinSet},
    time::{interval, sleep, timeout, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::WorkerConfig,
    error::{ErrorTier, WorkerError},
    external::{ActionExecutor, ActionOutcome, EventFeed, FeedEvent, FeedStream},
    protocol::StateReport,
    types::{CorrelationId, Ordinal, Role, SignalMessage, WorkerState, WorkerStatus},
    worker::{
        backoff::{sleep_or_cancel, BackoffDecision, BackoffPolicy, BackoffScheduler},
        guard::ExecutionGuard,
        link::{ControllerLink, WorkerChannels},
        sharder::{Assignment, SampleFilter},
        status::{bind_status, serve_status, StatusProbe},
    },
};

pub struct WorkerParams<F, E> {
    pub ordinal: Ordinal,
    pub config: WorkerConfig,
    pub backoff: BackoffPolicy,
    pub feed: Arc<F>,
    pub executor: Arc<E>,
    pub channels: WorkerChannels,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Shutdown,
    Terminated { reason: String },
}

#[derive(Debug)]
struct ActionReport {
    correlation_id: CorrelationId,
    nonce: Option<u64>,
    result: Result<ActionOutcome, WorkerError>,
}

pub struct Worker<F: EventFeed, E: ActionExecutor> {
    ordinal: Ordinal,
    config: WorkerConfig,
    assignment: Assignment,
    feed: Arc<F>,
    executor: Arc<E>,
    link: ControllerLink,
    signals: mpsc::UnboundedReceiver<SignalMessage>,
    guard: ExecutionGuard,
    backoff: BackoffScheduler,
    sampler: SampleFilter,
    status_tx: watch::Sender<WorkerStatus>,
    probe: StatusProbe,
    actions: JoinSet<ActionReport>,
    refreshes: JoinSet<anyhow::Result<()>>,
    cancel: CancellationToken,
}

impl<F, E> Worker<F, E>
where
    F: EventFeed + 'static,
    E: ActionExecutor + 'static,
{
    /// Builds a worker. Must be called inside a tokio runtime because the
    /// controller link router is spawned here.
    pub fn new(params: WorkerParams<F, E>) -> Result<Self, WorkerError> {
        let assignment = Assignment::for_ordinal(
            params.ordinal,
            &params.config.role_table,
            &params.config.partition_keys(),
        )
        .map_err(|e| WorkerError::FatalConfig(e.to_string()))?;

        let (link, signals, _router) = ControllerLink::start(params.channels);
        let (status_tx, probe) = StatusProbe::channel(WorkerStatus {
            ordinal: params.ordinal,
            state: WorkerState::Spawning,
            role: assignment.role,
            partition_key: assignment.partition_key.clone(),
        });

        Ok(Self {
            ordinal: params.ordinal,
            sampler: SampleFilter::new(params.config.sample_probability),
            config: params.config,
            assignment,
            feed: params.feed,
            executor: params.executor,
            link,
            signals,
            guard: ExecutionGuard::new(),
            backoff: BackoffScheduler::new(params.backoff),
            status_tx,
            probe,
            actions: JoinSet::new(),
            refreshes: JoinSet::new(),
            cancel: params.cancel,
        })
    }

    pub fn probe(&self) -> StatusProbe {
        self.probe.clone()
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    pub async fn run(mut self) -> WorkerExit {
        info!(
            "Worker {} starting as {} on partition {}",
            self.ordinal, self.assignment.role, self.assignment.partition_key
        );
        if let Some(port) = status_port(self.config.status_port_base, self.ordinal) {
            tokio::spawn(run_status_listener(
                self.ordinal,
                port,
                self.probe(),
                self.cancel.child_token(),
            ));
        }

        loop {
            self.set_state(WorkerState::Connecting);

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => return self.finish(WorkerExit::Shutdown),
                connected = self.feed.connect(&self.assignment.partition_key) => connected,
            };

            let outcome = match connected {
                Ok(stream) => {
                    self.set_state(WorkerState::Online);
                    self.backoff.on_connected();
                    self.drop_stale_signals();
                    self.run_online(stream).await
                }
                Err(e) => Err(e),
            };

            let error = match outcome {
                Ok(()) => return self.finish(WorkerExit::Shutdown),
                Err(e) => e,
            };

            match self.backoff.on_failure(&error) {
                BackoffDecision::Retry { delay, tier } => {
                    warn!(
                        "Worker {} backing off for {:?} ({:?}, retry {}): {}",
                        self.ordinal,
                        delay,
                        tier,
                        self.backoff.retry_count(),
                        error
                    );
                    self.set_state(WorkerState::Backoff);
                    if !sleep_or_cancel(delay, &self.cancel).await {
                        return self.finish(WorkerExit::Shutdown);
                    }
                }
                BackoffDecision::Terminate { reason } => {
                    error!("Worker {} terminating: {}", self.ordinal, reason);
                    return self.finish(WorkerExit::Terminated { reason });
                }
            }
        }
    }

    async fn run_online(&mut self, mut stream: FeedStream) -> Result<(), WorkerError> {
        let mut refresh = interval(self.config.analyst_refresh().max(Duration::from_millis(1)));
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let is_analyst = self.assignment.role == Role::Analyst;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                event = stream.next() => match event {
                    Some(Ok(event)) => self.on_feed_event(event)?,
                    Some(Err(e)) => return Err(e),
                    None => return Err(WorkerError::TransientNetwork("feed closed".to_string())),
                },
                signal = self.signals.recv() => match signal {
                    Some(signal) => self.on_signal(signal),
                    None => return Err(WorkerError::FatalConfig("controller link closed".to_string())),
                },
                Some(joined) = self.actions.join_next(), if !self.actions.is_empty() => {
                    self.on_action_finished(joined)?;
                }
                Some(joined) = self.refreshes.join_next(), if !self.refreshes.is_empty() => {
                    match joined {
                        Ok(Ok(())) => debug!("Worker {} refreshed", self.ordinal),
                        Ok(Err(e)) => warn!("Worker {} refresh failed: {}", self.ordinal, e),
                        Err(e) => warn!("Worker {} refresh task failed: {}", self.ordinal, e),
                    }
                }
                _ = refresh.tick(), if is_analyst => self.start_refresh(),
            }
        }
    }

    // At most one refresh runs at a time, bounded by the refresh period.
    fn start_refresh(&mut self) {
        if !self.refreshes.is_empty() {
            debug!("Worker {} refresh still running, skipping tick", self.ordinal);
            return;
        }

        let executor = self.executor.clone();
        let limit = self.config.analyst_refresh().max(Duration::from_millis(1));
        self.refreshes.spawn(async move {
            match timeout(limit, executor.refresh()).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("timed out after {:?}", limit)),
            }
        });
    }

    fn on_feed_event(&mut self, event: FeedEvent) -> Result<(), WorkerError> {
        if self.assignment.role != Role::Listener {
            return Ok(());
        }
        if !self.sampler.retain() {
            debug!("Worker {} sampled out {:?} event", self.ordinal, event.kind);
            return Ok(());
        }

        let signal = event.into_signal();
        debug!(
            "Worker {} publishing {:?} signal {}",
            self.ordinal, signal.kind, signal.correlation_id
        );
        self.link.publish_signal(signal)
    }

    fn on_signal(&mut self, signal: SignalMessage) {
        if self.assignment.role != Role::Striker {
            return;
        }
        if !self.guard.try_enter() {
            debug!(
                "Worker {} busy, skipping signal {}",
                self.ordinal, signal.correlation_id
            );
            return;
        }

        let jitter = random_jitter(self.config.strike_jitter());
        let wait = self.config.reservation_timeout();
        self.actions.spawn(strike(
            self.link.clone(),
            self.executor.clone(),
            signal,
            jitter,
            wait,
        ));
    }

    fn on_action_finished(&mut self, joined: Result<ActionReport, JoinError>) -> Result<(), WorkerError> {
        self.guard.release(self.config.action_cooldown());

        let report = match joined {
            Ok(report) => report,
            Err(e) => {
                let abandoned = self.link.abandon_outstanding();
                warn!(
                    "Worker {} action task failed ({} nonces abandoned): {}",
                    self.ordinal, abandoned, e
                );
                return Ok(());
            }
        };

        match report.result {
            Ok(ActionOutcome::Submitted { reference }) => {
                info!(
                    "Worker {} submitted action {} with nonce {:?}: {}",
                    self.ordinal, report.correlation_id, report.nonce, reference
                );
                Ok(())
            }
            Ok(ActionOutcome::Skipped { reason }) => {
                debug!(
                    "Worker {} skipped action {}: {}",
                    self.ordinal, report.correlation_id, reason
                );
                Ok(())
            }
            Err(e) if e.tier() == ErrorTier::Transient => {
                warn!("Worker {} action {} failed: {}", self.ordinal, report.correlation_id, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn drop_stale_signals(&mut self) {
        let mut dropped = 0usize;
        while self.signals.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Worker {} dropped {} stale signals", self.ordinal, dropped);
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.status_tx.send_modify(|status| status.state = state);
        let report = StateReport {
            state,
            role: self.assignment.role,
            partition_key: self.assignment.partition_key.clone(),
        };
        if let Err(e) = self.link.report_state(report) {
            debug!("Worker {} could not report {:?}: {}", self.ordinal, state, e);
        }
    }

    fn finish(&mut self, exit: WorkerExit) -> WorkerExit {
        self.actions.abort_all();
        self.refreshes.abort_all();
        let abandoned = self.link.abandon_outstanding();
        if abandoned > 0 {
            info!("Worker {} abandoned {} in-flight nonces", self.ordinal, abandoned);
        }
        self.set_state(WorkerState::Dead);
        info!("Worker {} stopped: {:?}", self.ordinal, exit);
        exit
    }
}

async fn strike<E: ActionExecutor>(
    link: ControllerLink,
    executor: Arc<E>,
    signal: SignalMessage,
    jitter: Duration,
    wait: Duration,
) -> ActionReport {
    let correlation_id = signal.correlation_id;
    if !jitter.is_zero() {
        sleep(jitter).await;
    }

    let grant = match link.request_sequence(signal.partition_key.clone(), wait).await {
        Ok(grant) => grant,
        Err(e) => {
            return ActionReport {
                correlation_id,
                nonce: None,
                result: Err(e),
            }
        }
    };
    let nonce = Some(grant.nonce);

    let result = match executor.execute(&grant, &signal).await {
        Ok(ActionOutcome::Submitted { reference }) => {
            link.settle(&grant);
            Ok(ActionOutcome::Submitted { reference })
        }
        Ok(skipped) => {
            link.abandon(&grant);
            Ok(skipped)
        }
        Err(e) => {
            link.abandon(&grant);
            Err(WorkerError::classify(&e))
        }
    };

    ActionReport {
        correlation_id,
        nonce,
        result,
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

fn status_port(base: Option<u16>, ordinal: Ordinal) -> Option<u16> {
    let base = base?;
    u16::try_from(ordinal)
        .ok()
        .and_then(|ordinal| base.checked_add(ordinal))
}

async fn run_status_listener(
    ordinal: Ordinal,
    port: u16,
    probe: StatusProbe,
    cancel: CancellationToken,
) {
    match bind_status(port).await {
        Ok(listener) => {
            info!("Worker {} status probe on port {}", ordinal, port);
            if let Err(e) = serve_status(listener, probe, cancel).await {
                warn!("Worker {} status probe failed: {}", ordinal, e);
            }
        }
        Err(e) => warn!("Worker {} status probe disabled: {}", ordinal, e),
    }
}
