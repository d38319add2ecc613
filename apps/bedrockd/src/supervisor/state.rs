use crate::backup::BackupKind;

/// Where the save-negotiation state machine currently sits. `AwaitingManifest`
/// is the tail of the readiness transition: the server printed the readiness
/// phrase on its own line and the manifest follows on the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    HoldRequested,
    AwaitingManifest,
    BackingUp,
}

/// The only cross-cutting mutable state of the supervisor. Owned by the
/// control loop and passed by reference to collaborators; nothing else
/// reads or writes it.
#[derive(Debug)]
pub struct SupervisorState {
    pub phase: Phase,
    pub stop_requested: bool,
    pub current_kind: Option<BackupKind>,
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisorState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            stop_requested: false,
            current_kind: None,
        }
    }

    /// Only one snapshot/archive cycle may be in flight at a time.
    pub fn is_currently_backing_up(&self) -> bool {
        self.phase != Phase::Idle
    }

    /// A new pause is issued only when nothing is in flight and no stop is
    /// pending; the shutdown's own pause is the exception that always
    /// proceeds (guarded by the caller setting `stop_requested` first).
    pub fn can_request_hold(&self, kind: BackupKind) -> bool {
        if self.is_currently_backing_up() {
            return false;
        }
        !self.stop_requested || kind == BackupKind::OnStop
    }
}
