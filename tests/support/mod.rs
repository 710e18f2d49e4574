#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use fleet_coordinator::{
    config::{BackoffConfig, FleetConfig, WorkerConfig},
    error::WorkerError,
    external::{ActionExecutor, ActionOutcome, EventFeed, FeedEvent, FeedStream, NonceSource},
    fleet::{FleetEvent, FleetEvents, InProcessLauncher},
    types::{PartitionKey, ReservationGrant, Role, SignalKind, SignalMessage},
    worker::{BackoffPolicy, Worker, WorkerExit, WorkerParams},
};
use futures::{FutureExt, StreamExt};
use once_cell::sync::Lazy;
use tokio::{
    sync::{broadcast, Mutex},
    time::timeout,
};
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

pub const PARTITION: &str = "8453";

pub fn fleet_config(stagger_ms: u64, cooldown_ms: u64) -> FleetConfig {
    FleetConfig {
        size: Some(4),
        max_size: 16,
        stagger_delay_ms: stagger_ms,
        respawn_cooldown_ms: cooldown_ms,
    }
}

pub fn worker_config() -> WorkerConfig {
    WorkerConfig {
        role_table: vec![Role::Listener, Role::Striker, Role::Striker, Role::Analyst],
        partitions: vec![PARTITION.to_string()],
        sample_probability: 1.0,
        action_cooldown_ms: 1000,
        strike_jitter_ms: 25,
        reservation_timeout_ms: 5000,
        analyst_refresh_ms: 20000,
        status_port_base: None,
    }
}

pub fn backoff_policy() -> BackoffPolicy {
    BackoffPolicy::from(&BackoffConfig {
        transient_base_ms: 10_000,
        rate_limited_sleep_ms: 120_000,
        max_retries: Some(3),
    })
}

pub fn activity_event() -> FeedEvent {
    FeedEvent {
        kind: SignalKind::Activity,
        partition_key: PartitionKey::new(PARTITION),
        payload: serde_json::json!({ "tx_hash": "0xabc", "value_wei": "200000000000000000" }),
    }
}

/// Feed whose every connection replays whatever the test pushes after it
/// connected.
#[derive(Clone)]
pub struct BroadcastFeed {
    tx: broadcast::Sender<FeedEvent>,
    connects: Arc<AtomicUsize>,
}

impl BroadcastFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            tx,
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn push(&self, event: FeedEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventFeed for BroadcastFeed {
    async fn connect(&self, _partition: &PartitionKey) -> Result<FeedStream, WorkerError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let rx = self.tx.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Feed that fails every connection attempt with the configured error.
pub struct FailingFeed {
    error: WorkerError,
    attempts: AtomicUsize,
}

impl FailingFeed {
    pub fn new(error: WorkerError) -> Self {
        Self {
            error,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventFeed for FailingFeed {
    async fn connect(&self, _partition: &PartitionKey) -> Result<FeedStream, WorkerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Executor that records every grant it is handed.
#[derive(Default)]
pub struct RecordingExecutor {
    grants: Mutex<Vec<ReservationGrant>>,
    submit: bool,
}

impl RecordingExecutor {
    pub fn submitting() -> Self {
        Self {
            grants: Mutex::new(Vec::new()),
            submit: true,
        }
    }

    pub fn skipping() -> Self {
        Self::default()
    }

    pub async fn grants(&self) -> Vec<ReservationGrant> {
        self.grants.lock().await.clone()
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(&self, grant: &ReservationGrant, _signal: &SignalMessage) -> Result<ActionOutcome> {
        self.grants.lock().await.push(grant.clone());
        if self.submit {
            Ok(ActionOutcome::Submitted {
                reference: format!("0x{:064x}", grant.nonce),
            })
        } else {
            Ok(ActionOutcome::Skipped {
                reason: "not profitable".to_string(),
            })
        }
    }
}

/// Executor whose actions and refreshes never complete.
#[derive(Default)]
pub struct StalledExecutor {
    executions: AtomicUsize,
    refreshes: AtomicUsize,
}

impl StalledExecutor {
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionExecutor for StalledExecutor {
    async fn execute(&self, _grant: &ReservationGrant, _signal: &SignalMessage) -> Result<ActionOutcome> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        futures::future::pending().await
    }

    async fn refresh(&self) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        futures::future::pending().await
    }
}

/// Executor that panics while holding a grant.
pub struct PanickingExecutor;

#[async_trait]
impl ActionExecutor for PanickingExecutor {
    async fn execute(&self, grant: &ReservationGrant, _signal: &SignalMessage) -> Result<ActionOutcome> {
        panic!("executor crashed holding nonce {}", grant.nonce);
    }
}

pub struct FixedNonceSource(pub u64);

#[async_trait]
impl NonceSource for FixedNonceSource {
    async fn baseline(&self, _partition: &PartitionKey) -> Result<u64> {
        Ok(self.0)
    }
}

/// Launcher that runs real workers on the given feed and executor.
pub fn worker_launcher<F, E>(feed: Arc<F>, executor: Arc<E>) -> InProcessLauncher
where
    F: EventFeed + 'static,
    E: ActionExecutor + 'static,
{
    InProcessLauncher::new(move |ordinal, channels, cancel| {
        let params = WorkerParams {
            ordinal,
            config: worker_config(),
            backoff: backoff_policy(),
            feed: feed.clone(),
            executor: executor.clone(),
            channels,
            cancel,
        };
        async move {
            match Worker::new(params) {
                Ok(worker) => worker.run().await,
                Err(e) => WorkerExit::Terminated {
                    reason: e.to_string(),
                },
            }
        }
        .boxed()
    })
}

/// Launcher whose workers idle until killed.
pub fn idle_launcher() -> InProcessLauncher {
    InProcessLauncher::new(|_ordinal, _channels, cancel| {
        async move {
            cancel.cancelled().await;
            WorkerExit::Shutdown
        }
        .boxed()
    })
}

pub async fn wait_for_event<P>(events: &mut FleetEvents, mut predicate: P) -> FleetEvent
where
    P: FnMut(&FleetEvent) -> bool,
{
    timeout(Duration::from_secs(600), async {
        loop {
            let event = events.next_event().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for fleet event")
}
