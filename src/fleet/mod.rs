pub mod allocator;
pub mod controller;
pub mod handle;
pub mod launcher;
pub mod metrics;
pub mod signal_bus;

pub use allocator::SequenceAllocator;
pub use controller::FleetController;
pub use handle::{FleetCommand, FleetEvent, FleetEvents, FleetHandle, FleetSnapshot, PartitionSnapshot};
pub use launcher::{InProcessLauncher, Inbound, LaunchedWorker, Launcher, ProcessLauncher};
pub use metrics::{FleetMetrics, PartitionMetrics};
pub use signal_bus::{Peer, SignalBus};
