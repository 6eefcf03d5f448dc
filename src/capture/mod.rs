//! Capture pipeline: session lifecycle, flow handling, statistics and events

pub mod flow;
pub mod notifier;
pub mod session;
pub mod stats;

pub use notifier::{CaptureObserver, Notifier, ObserverId};
pub use session::{CaptureHandle, CaptureSession, IngestVerdict};
pub use stats::{CounterSet, StatsAggregator};
