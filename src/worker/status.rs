use anyhow::{anyhow, Result};
use axum::{extract::State, routing::get, Json, Router};
use tokio::{net::TcpListener, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::types::WorkerStatus;

/// Read-only handle on a worker's current status.
#[derive(Clone)]
pub struct StatusProbe {
    rx: watch::Receiver<WorkerStatus>,
}

impl StatusProbe {
    pub fn channel(initial: WorkerStatus) -> (watch::Sender<WorkerStatus>, Self) {
        let (tx, rx) = watch::channel(initial);
        (tx, Self { rx })
    }

    pub fn current(&self) -> WorkerStatus {
        self.rx.borrow().clone()
    }

    /// Waits until the status satisfies `predicate`, returning that status.
    pub async fn wait_for(&mut self, predicate: impl FnMut(&WorkerStatus) -> bool) -> Result<WorkerStatus> {
        self.rx
            .wait_for(predicate)
            .await
            .map(|status| status.clone())
            .map_err(|_| anyhow!("Worker status channel closed"))
    }
}

/// Router exposing the current status as JSON on `GET /status`.
pub fn status_router(probe: StatusProbe) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .with_state(probe)
}

async fn status_handler(State(probe): State<StatusProbe>) -> Json<WorkerStatus> {
    Json(probe.current())
}

/// Serves the status router until `cancel` fires.
pub async fn serve_status(
    listener: TcpListener,
    probe: StatusProbe,
    cancel: CancellationToken,
) -> Result<()> {
    axum::serve(listener, status_router(probe))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| anyhow!("Status server error: {}", e))?;

    info!("Status listener stopped");
    Ok(())
}

pub async fn bind_status(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| anyhow!("Failed to bind status port {}: {}", port, e))
}
