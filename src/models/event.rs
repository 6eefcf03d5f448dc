//! Lifecycle states and the events published to observers

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DumpMode, VpnStats};

/// Capture lifecycle
///
/// `Starting` and `Stopping` only exist while a transition is in flight;
/// observers are notified of `Ready` and `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureState {
    Ready,
    Starting,
    Running,
    Stopping,
}

/// Why a running session returned to `Ready`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// `stop()` was called
    User,
    /// The backend lost a resource it cannot recover from
    Forced(String),
}

/// Message delivered on the notification channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureEvent {
    StateChanged {
        state: CaptureState,
        session_id: Option<Uuid>,
        reason: Option<StopReason>,
    },
    Stats(VpnStats),
    DumpModeChanged(DumpMode),
}
