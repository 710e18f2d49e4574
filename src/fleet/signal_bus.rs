use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    protocol::ControllerMessage,
    types::{Ordinal, SignalMessage, WorkerState},
};

/// A fan-out target as seen by the bus.
pub struct Peer<'a> {
    pub ordinal: Ordinal,
    pub state: WorkerState,
    pub tx: &'a mpsc::UnboundedSender<ControllerMessage>,
}

/// Relays signals from one worker to every other live worker.
///
/// Delivery is fire-and-forget: a peer that is not online, or whose channel
/// has closed, simply misses the signal. Per-origin order is preserved because
/// the controller relays messages in the order it receives them and each peer
/// channel is FIFO.
#[derive(Debug, Default)]
pub struct SignalBus {
    published: u64,
    delivered: u64,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the ordinals the signal was handed to.
    pub fn publish<'a>(
        &mut self,
        origin: Ordinal,
        signal: &SignalMessage,
        peers: impl IntoIterator<Item = Peer<'a>>,
    ) -> Vec<Ordinal> {
        self.published += 1;

        let mut recipients = Vec::new();
        for peer in peers {
            if peer.ordinal == origin || !peer.state.is_live() {
                continue;
            }
            if peer
                .tx
                .send(ControllerMessage::Signal(signal.clone()))
                .is_ok()
            {
                recipients.push(peer.ordinal);
            }
        }

        self.delivered += recipients.len() as u64;
        debug!(
            "Signal {} from worker {} delivered to {} peers",
            signal.correlation_id,
            origin,
            recipients.len()
        );
        recipients
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PartitionKey, SignalKind};

    fn create_test_signal() -> SignalMessage {
        SignalMessage::new(
            SignalKind::Activity,
            PartitionKey::new("8453"),
            serde_json::json!({ "value_wei": "1" }),
        )
    }

    #[test]
    fn test_fan_out_skips_origin() {
        let mut bus = SignalBus::new();
        let channels: Vec<_> = (0..4).map(|_| mpsc::unbounded_channel()).collect();
        let peers = channels.iter().enumerate().map(|(i, (tx, _))| Peer {
            ordinal: i as Ordinal,
            state: WorkerState::Online,
            tx,
        });

        let signal = create_test_signal();
        let recipients = bus.publish(0, &signal, peers);
        assert_eq!(recipients, vec![1, 2, 3]);

        let mut channels = channels;
        assert!(channels[0].1.try_recv().is_err());
        for (_, rx) in channels.iter_mut().skip(1) {
            assert_eq!(rx.try_recv().unwrap(), ControllerMessage::Signal(signal.clone()));
            assert!(rx.try_recv().is_err());
        }
        assert_eq!(bus.delivered(), 3);
    }

    #[test]
    fn test_peers_not_online_miss_the_signal() {
        let mut bus = SignalBus::new();
        let (online_tx, mut online_rx) = mpsc::unbounded_channel();
        let (backoff_tx, mut backoff_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        drop(closed_rx);

        let peers = vec![
            Peer { ordinal: 1, state: WorkerState::Online, tx: &online_tx },
            Peer { ordinal: 2, state: WorkerState::Backoff, tx: &backoff_tx },
            Peer { ordinal: 3, state: WorkerState::Online, tx: &closed_tx },
        ];

        let recipients = bus.publish(0, &create_test_signal(), peers);
        assert_eq!(recipients, vec![1]);
        assert!(online_rx.try_recv().is_ok());
        assert!(backoff_rx.try_recv().is_err());
        assert_eq!(bus.published(), 1);
    }

    #[test]
    fn test_per_origin_order_is_preserved() {
        let mut bus = SignalBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let signals: Vec<SignalMessage> = (0..5).map(|_| create_test_signal()).collect();

        for signal in &signals {
            bus.publish(
                0,
                signal,
                [Peer { ordinal: 1, state: WorkerState::Online, tx: &tx }],
            );
        }

        for signal in &signals {
            assert_eq!(rx.try_recv().unwrap(), ControllerMessage::Signal(signal.clone()));
        }
    }
}
