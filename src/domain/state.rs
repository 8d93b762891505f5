//! Domain lifecycle state types.

use serde::{Deserialize, Serialize};

/// Domain lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    /// No state reported yet.
    #[default]
    NoState,

    /// Guest is running.
    Running,

    /// Guest is blocked on a resource.
    Blocked,

    /// Guest is paused.
    Paused,

    /// Guest is shutting down.
    Shutdown,

    /// VMM is not running.
    Shutoff,

    /// Guest crashed.
    Crashed,

    /// Guest is suspended by power management.
    PmSuspended,
}

impl DomainState {
    /// Check if a VMM process backs this state.
    pub fn is_active(&self) -> bool {
        !matches!(self, DomainState::Shutoff | DomainState::NoState)
    }

    /// Shutdown is allowed from running or paused.
    pub fn can_shutdown(&self) -> bool {
        matches!(self, DomainState::Running | DomainState::Paused)
    }

    /// Reboot is allowed from running or paused.
    pub fn can_reboot(&self) -> bool {
        matches!(self, DomainState::Running | DomainState::Paused)
    }

    /// Suspend is allowed from running only.
    pub fn can_suspend(&self) -> bool {
        matches!(self, DomainState::Running)
    }

    /// Resume is allowed from paused only.
    pub fn can_resume(&self) -> bool {
        matches!(self, DomainState::Paused)
    }

    /// Get the state name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            DomainState::NoState => "nostate",
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "shutdown",
            DomainState::Shutoff => "shutoff",
            DomainState::Crashed => "crashed",
            DomainState::PmSuspended => "pmsuspended",
        }
    }

    /// Map the `state` string reported by `vm.info`.
    pub fn from_vmm(state: &str) -> Option<Self> {
        match state {
            "Created" => Some(DomainState::NoState),
            "Running" => Some(DomainState::Running),
            "Shutdown" => Some(DomainState::Shutdown),
            "Paused" => Some(DomainState::Paused),
            _ => None,
        }
    }
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a domain entered its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateReason {
    /// Unknown or not applicable.
    #[default]
    Unknown,
    /// Running: normal boot.
    Booted,
    /// Running: resumed from pause.
    Unpaused,
    /// Running: restored from a snapshot.
    Restored,
    /// Paused or shut down by user request.
    User,
    /// Paused while shutting down.
    ShuttingDown,
    /// Shutoff: guest shut down normally.
    Shutdown,
    /// Shutoff: forcibly destroyed.
    Destroyed,
    /// Shutoff: VMM died unexpectedly.
    Crashed,
    /// Shutoff: start failed.
    Failed,
    /// Shutoff: the driver stopped it while reconnecting.
    Daemon,
}

impl StateReason {
    /// Get the reason name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            StateReason::Unknown => "unknown",
            StateReason::Booted => "booted",
            StateReason::Unpaused => "unpaused",
            StateReason::Restored => "restored",
            StateReason::User => "user",
            StateReason::ShuttingDown => "shutting-down",
            StateReason::Shutdown => "shutdown",
            StateReason::Destroyed => "destroyed",
            StateReason::Crashed => "crashed",
            StateReason::Failed => "failed",
            StateReason::Daemon => "daemon",
        }
    }
}

impl std::fmt::Display for StateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
