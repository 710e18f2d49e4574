//! Turning "spawn worker N" into a running worker.
//!
//! Both launchers hand the controller the same thing: a sender for
//! [`ControllerMessage`]s, a kill token, and a stream of [`Inbound`] events
//! (tagged worker messages followed by exactly one `Exited`).

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use std::{path::PathBuf, process::Stdio};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    protocol::{decode_line, encode_line, ControllerMessage, WorkerMessage, WORKER_ORDINAL_ENV},
    types::Ordinal,
    worker::{WorkerChannels, WorkerExit},
};

/// Events flowing into the controller's single inbound queue.
#[derive(Debug)]
pub enum Inbound {
    Message { ordinal: Ordinal, message: WorkerMessage },
    Exited { ordinal: Ordinal, reason: String },
    RespawnDue { replacing: Ordinal },
}

pub struct LaunchedWorker {
    pub tx: mpsc::UnboundedSender<ControllerMessage>,
}

pub trait Launcher: Send {
    /// Starts worker `ordinal`. Cancelling `kill` must eventually produce an
    /// `Inbound::Exited` for it.
    fn launch(
        &mut self,
        ordinal: Ordinal,
        kill: CancellationToken,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Result<LaunchedWorker>;
}

pub type WorkerFactory =
    Box<dyn Fn(Ordinal, WorkerChannels, CancellationToken) -> BoxFuture<'static, WorkerExit> + Send>;

/// Runs each worker as its own tokio task inside the controller's process.
pub struct InProcessLauncher {
    factory: WorkerFactory,
}

impl InProcessLauncher {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(Ordinal, WorkerChannels, CancellationToken) -> BoxFuture<'static, WorkerExit>
            + Send
            + 'static,
    {
        Self {
            factory: Box::new(factory),
        }
    }
}

impl Launcher for InProcessLauncher {
    fn launch(
        &mut self,
        ordinal: Ordinal,
        kill: CancellationToken,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Result<LaunchedWorker> {
        let (to_worker_tx, to_worker_rx) = mpsc::unbounded_channel();
        let (from_worker_tx, mut from_worker_rx) = mpsc::unbounded_channel();

        let channels = WorkerChannels {
            outbound: from_worker_tx,
            inbound: to_worker_rx,
        };
        let mut handle = tokio::spawn((self.factory)(ordinal, channels, kill));

        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    Some(message) = from_worker_rx.recv() => {
                        let _ = inbound.send(Inbound::Message { ordinal, message });
                    }
                    joined = &mut handle => break match joined {
                        Ok(exit) => format!("{:?}", exit),
                        Err(e) => format!("worker task failed: {}", e),
                    },
                }
            };

            while let Ok(message) = from_worker_rx.try_recv() {
                let _ = inbound.send(Inbound::Message { ordinal, message });
            }
            let _ = inbound.send(Inbound::Exited { ordinal, reason });
        });

        Ok(LaunchedWorker { tx: to_worker_tx })
    }
}

/// Runs each worker as a child process of `program`, speaking the line
/// protocol over its stdin/stdout.
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Re-executes the current binary in worker mode.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| anyhow!("Failed to resolve current executable: {}", e))?;
        Ok(Self::new(program, Vec::new()))
    }
}

impl Launcher for ProcessLauncher {
    fn launch(
        &mut self,
        ordinal: Ordinal,
        kill: CancellationToken,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Result<LaunchedWorker> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_ORDINAL_ENV, ordinal.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn worker {}: {}", ordinal, e))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Worker {} has no stdin pipe", ordinal))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Worker {} has no stdout pipe", ordinal))?;

        info!("Spawned worker process {} (pid {:?})", ordinal, child.id());

        let (tx, mut rx) = mpsc::unbounded_channel::<ControllerMessage>();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let line = match encode_line(&message) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("{}", e);
                        continue;
                    }
                };
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    debug!("Worker {} stdin closed: {}", ordinal, e);
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let killed = loop {
                tokio::select! {
                    _ = kill.cancelled() => break true,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) if line.trim().is_empty() => {}
                        Ok(Some(line)) => match decode_line::<WorkerMessage>(&line) {
                            Ok(message) => {
                                let _ = inbound.send(Inbound::Message { ordinal, message });
                            }
                            Err(e) => warn!("Worker {} sent malformed line: {}", ordinal, e),
                        },
                        Ok(None) => break false,
                        Err(e) => {
                            warn!("Worker {} stdout read failed: {}", ordinal, e);
                            break false;
                        }
                    },
                }
            };

            if killed {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill worker {}: {}", ordinal, e);
                }
            }

            let reason = match child.wait().await {
                Ok(status) => format!("process exited with {}", status),
                Err(e) => format!("process wait failed: {}", e),
            };
            let _ = inbound.send(Inbound::Exited { ordinal, reason });
        });

        Ok(LaunchedWorker { tx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::StateReport,
        types::{PartitionKey, Role, WorkerState},
    };
    use futures::FutureExt;

    #[tokio::test]
    async fn test_in_process_messages_precede_exit() {
        let mut launcher = InProcessLauncher::new(|_ordinal, channels, _kill| {
            async move {
                let report = StateReport {
                    state: WorkerState::Online,
                    role: Role::Listener,
                    partition_key: PartitionKey::new("1"),
                };
                channels
                    .outbound
                    .send(WorkerMessage::StateChanged(report))
                    .unwrap();
                WorkerExit::Terminated {
                    reason: "done".to_string(),
                }
            }
            .boxed()
        });

        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        launcher
            .launch(9, CancellationToken::new(), inbound_tx)
            .unwrap();

        assert!(matches!(
            inbound_rx.recv().await.unwrap(),
            Inbound::Message { ordinal: 9, .. }
        ));
        match inbound_rx.recv().await.unwrap() {
            Inbound::Exited { ordinal, reason } => {
                assert_eq!(ordinal, 9);
                assert!(reason.contains("done"));
            }
            other => panic!("expected exit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_kill_token_ends_in_process_worker() {
        let mut launcher = InProcessLauncher::new(|_ordinal, _channels, kill| {
            async move {
                kill.cancelled().await;
                WorkerExit::Shutdown
            }
            .boxed()
        });

        let kill = CancellationToken::new();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        launcher.launch(1, kill.clone(), inbound_tx).unwrap();
        kill.cancel();

        assert!(matches!(
            inbound_rx.recv().await.unwrap(),
            Inbound::Exited { ordinal: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_process_launch_failure_is_reported() {
        let mut launcher = ProcessLauncher::new(PathBuf::from("/nonexistent/fleet-worker"), Vec::new());
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        assert!(launcher
            .launch(0, CancellationToken::new(), inbound_tx)
            .is_err());
    }

    #[cfg(unix)]
    fn shell_launcher(script: &str) -> ProcessLauncher {
        ProcessLauncher::new(
            PathBuf::from("/bin/sh"),
            vec!["-c".to_string(), script.to_string()],
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_worker_speaks_line_protocol() {
        // Skips a malformed line, answers a grant with a state report, then idles.
        let mut launcher = shell_launcher(
            r#"echo 'not json'
read line
case "$line" in
  *SEQUENCE_GRANT*) echo '{"kind":"STATE_CHANGED","body":{"state":"ONLINE","role":"listener","partition_key":"8453"}}' ;;
esac
exec sleep 30"#,
        );

        let kill = CancellationToken::new();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let worker = launcher.launch(4, kill.clone(), inbound_tx).unwrap();
        worker
            .tx
            .send(ControllerMessage::SequenceGrant(crate::types::ReservationGrant {
                nonce: 3,
                partition_key: PartitionKey::new("8453"),
                correlation_id: uuid::Uuid::new_v4(),
            }))
            .unwrap();

        let within = std::time::Duration::from_secs(10);
        match tokio::time::timeout(within, inbound_rx.recv()).await.unwrap() {
            Some(Inbound::Message {
                ordinal: 4,
                message: WorkerMessage::StateChanged(report),
            }) => {
                assert_eq!(report.state, WorkerState::Online);
                assert_eq!(report.role, Role::Listener);
                assert_eq!(report.partition_key, PartitionKey::new("8453"));
            }
            other => panic!("expected state report, got {:?}", other),
        }

        kill.cancel();
        match tokio::time::timeout(within, inbound_rx.recv()).await.unwrap() {
            Some(Inbound::Exited { ordinal, reason }) => {
                assert_eq!(ordinal, 4);
                assert!(reason.starts_with("process exited"));
            }
            other => panic!("expected exit, got {:?}", other),
        }
        // Exactly one exit notice per process.
        assert!(tokio::time::timeout(within, inbound_rx.recv()).await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_status_is_reported() {
        let mut launcher = shell_launcher("exit 3");
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        launcher
            .launch(2, CancellationToken::new(), inbound_tx)
            .unwrap();

        let exit = tokio::time::timeout(std::time::Duration::from_secs(10), inbound_rx.recv())
            .await
            .unwrap();
        match exit {
            Some(Inbound::Exited { ordinal, reason }) => {
                assert_eq!(ordinal, 2);
                assert!(reason.contains("exit status: 3"), "{}", reason);
            }
            other => panic!("expected exit, got {:?}", other),
        }
    }
}
