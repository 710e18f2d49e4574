pub mod backoff;
pub mod guard;
pub mod link;
pub mod runtime;
pub mod sharder;
pub mod status;

pub use backoff::{BackoffDecision, BackoffPolicy, BackoffScheduler};
pub use guard::ExecutionGuard;
pub use link::{ControllerLink, WorkerChannels};
pub use runtime::{Worker, WorkerExit, WorkerParams};
pub use sharder::{assign_partition, assign_role, fleet_detection_probability, Assignment, SampleFilter};
pub use status::StatusProbe;

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc,
};
use tracing::{debug, warn};

use crate::protocol::{decode_line, encode_line, ControllerMessage, WorkerMessage};

/// Bridges the process's stdin/stdout to a [`WorkerChannels`] pair. Stdout
/// carries only protocol lines; logs must go to stderr.
pub fn stdio_channels() -> WorkerChannels {
    pipe_channels(tokio::io::stdin(), tokio::io::stdout())
}

/// Runs the worker side of the line protocol over any reader/writer pair.
pub fn pipe_channels<R, W>(reader: R, mut writer: W) -> WorkerChannels
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ControllerMessage>();

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match decode_line::<ControllerMessage>(&line) {
                    Ok(message) => {
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping malformed controller message: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Controller pipe read failed: {}", e);
                    break;
                }
            }
        }
        debug!("Controller pipe closed");
    });

    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let line = match encode_line(&message) {
                Ok(line) => line,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };
            if writer.write_all(line.as_bytes()).await.is_err() || writer.flush().await.is_err() {
                break;
            }
        }
    });

    WorkerChannels {
        outbound: outbound_tx,
        inbound: inbound_rx,
    }
}
