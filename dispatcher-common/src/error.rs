//! Closed error vocabulary for the dispatcher (`spec.md` §7).
//!
//! Every tick-level failure in the reconciler turns into one of these
//! variants rather than a panic: a skipped tick, a refused command, or a
//! rate-limited log line. Only [`DispatchError::StorageFatal`] is fatal, and
//! only at startup.

use thiserror::Error;

use crate::types::{CommandKind, DetectorId};

/// Errors the reconciler can observe while trying to drive the system
/// toward a goal state.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A required goal directive was absent for a configured detector; the
    /// tick is skipped entirely.
    #[error("missing goal directive for detector {detector}")]
    MissingGoal { detector: DetectorId },

    /// Arming was attempted against an undefined run mode.
    #[error("run mode {mode:?} is not defined for detector {detector}")]
    ModeUnknown { detector: DetectorId, mode: String },

    /// A run mode's `includes` reference a subconfig that does not exist.
    #[error("run mode {mode:?} is missing a subconfig")]
    SubconfigMissing { mode: String },

    /// The previous `stop` for this detector has not yet been fully
    /// acknowledged; benign, logged at DEBUG only.
    #[error("stop to {detector} still has unacknowledged hosts")]
    AckPending { detector: DetectorId },

    /// The command gate's per-command cool-down has not elapsed.
    #[error("{command} to {detector} is within its cooldown window")]
    Cooldown {
        detector: DetectorId,
        command: CommandKind,
    },

    /// `arm` was refused because another detector is already arming.
    #[error("cannot arm {detector}: another detector is already arming")]
    ArmBusy { detector: DetectorId },

    /// The supervisor observed an `arm` that never acknowledged in time.
    #[error("{detector} took too long to arm")]
    ArmTimeout { detector: DetectorId },

    /// The supervisor observed a `start` that never acknowledged in time.
    #[error("{detector} took too long to start")]
    StartTimeout { detector: DetectorId },

    /// The supervisor observed a `stop` that never acknowledged in time.
    #[error("{detector} took too long to stop")]
    StopTimeout { detector: DetectorId },

    /// A controller-disagreement was detected while aggregating status for
    /// `detector` (two controller rows disagree on mode or run number); the
    /// detector is skipped for this tick.
    #[error("controllers for {detector} disagree on mode or run number")]
    ControllerDisagreement { detector: DetectorId },

    /// A read/write against the backing store failed. The affected tick is
    /// aborted; no in-memory state is mutated.
    #[error("transient storage failure: {0}")]
    StorageTransient(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A store failure at startup. The process must exit non-zero.
    #[error("unrecoverable storage failure at startup: {0}")]
    StorageFatal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Priority at which an error is logged, mirroring `spec.md` §6's Logger
/// interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogPriority {
    Debug,
    Message,
    Warning,
    Error,
    Fatal,
}

impl DispatchError {
    /// The priority this error kind should be logged at, per `spec.md` §7's
    /// propagation table.
    pub fn log_priority(&self) -> LogPriority {
        match self {
            Self::MissingGoal { .. } => LogPriority::Debug,
            Self::AckPending { .. } | Self::Cooldown { .. } | Self::ArmBusy { .. } => {
                LogPriority::Debug
            }
            Self::ModeUnknown { .. } | Self::SubconfigMissing { .. } => LogPriority::Warning,
            Self::ArmTimeout { .. }
            | Self::StartTimeout { .. }
            | Self::StopTimeout { .. }
            | Self::ControllerDisagreement { .. }
            | Self::StorageTransient(_) => LogPriority::Error,
            Self::StorageFatal(_) => LogPriority::Fatal,
        }
    }

    /// A stable, short key used to rate-limit this error kind (`spec.md`
    /// §4.F), e.g. `"STOP_TIMEOUT"`.
    pub fn rate_limit_key(&self) -> &'static str {
        match self {
            Self::MissingGoal { .. } => "MISSING_GOAL",
            Self::ModeUnknown { .. } => "MODE_UNKNOWN",
            Self::SubconfigMissing { .. } => "SUBCONFIG_MISSING",
            Self::AckPending { .. } => "ACK_PENDING",
            Self::Cooldown { .. } => "COOLDOWN",
            Self::ArmBusy { .. } => "ARM_BUSY",
            Self::ArmTimeout { .. } => "ARM_TIMEOUT",
            Self::StartTimeout { .. } => "START_TIMEOUT",
            Self::StopTimeout { .. } => "STOP_TIMEOUT",
            Self::ControllerDisagreement { .. } => "CONTROLLER_DISAGREEMENT",
            Self::StorageTransient(_) => "STORAGE_TRANSIENT",
            Self::StorageFatal(_) => "STORAGE_FATAL",
        }
    }
}
