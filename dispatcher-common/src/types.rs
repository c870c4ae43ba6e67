//! Core DAQ data model: the typed records every other crate builds on,
//! decoded from the storage boundary once and passed around as these types,
//! never as bare `serde_json::Value` documents.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A stable short string naming a logical detector (`tpc`, `muon_veto`,
/// `neutron_veto`). The set is fixed at startup from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DetectorId(pub String);

impl fmt::Display for DetectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DetectorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DetectorId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A stable string naming a reader or crate-controller process. Each node
/// is assigned to exactly one logical detector at startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A monotonically increasing integer identifying one acquisition session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunNumber(pub u64);

impl fmt::Display for RunNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl RunNumber {
    /// The run number that would follow this one. Allocation of the *next*
    /// free number is the store's job; this just expresses the monotonic
    /// relationship.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// DAQ status, wire-compatible with integers 0..6 in the declared order.
/// All decisions branch on this variant, never on the raw integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DaqStatus {
    /// Stopped, not acquiring, no run in progress.
    Idle = 0,
    /// Preparatory phase between receiving `arm` and being ready to trigger.
    Arming = 1,
    /// Armed and ready; waiting for `start`.
    Armed = 2,
    /// Actively acquiring data.
    Running = 3,
    /// A node or the aggregate reported an unrecoverable fault.
    Error = 4,
    /// A node stopped heartbeating within `client_timeout`.
    Timeout = 5,
    /// No reliable status could be determined.
    Unknown = 6,
}

impl DaqStatus {
    /// Convert from the raw wire integer. Returns `None` for values outside
    /// the declared `0..=6` range.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Idle),
            1 => Some(Self::Arming),
            2 => Some(Self::Armed),
            3 => Some(Self::Running),
            4 => Some(Self::Error),
            5 => Some(Self::Timeout),
            6 => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Convert to the raw wire integer.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for DaqStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Arming => "ARMING",
            Self::Armed => "ARMED",
            Self::Running => "RUNNING",
            Self::Error => "ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

impl TryFrom<u8> for DaqStatus {
    type Error = InvalidStatusCode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or(InvalidStatusCode(value))
    }
}

impl From<DaqStatus> for u8 {
    fn from(value: DaqStatus) -> Self {
        value.as_u8()
    }
}

/// Raised when a wire integer outside `0..=6` is decoded as a [`DaqStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid DAQ status code: {0}")]
pub struct InvalidStatusCode(pub u8);

/// The three commands the dispatcher ever emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Arm,
    Start,
    Stop,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Arm => "arm",
            Self::Start => "start",
            Self::Stop => "stop",
        };
        write!(f, "{s}")
    }
}

impl CommandKind {
    /// All three kinds, in a stable order — used to seed per-command timer
    /// maps at startup.
    pub const ALL: [CommandKind; 3] = [CommandKind::Arm, CommandKind::Start, CommandKind::Stop];
}

/// The most recent heartbeat a node has written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatusRow {
    pub host: NodeId,
    pub status: DaqStatus,
    pub rate: f64,
    pub buffer_size: i64,
    pub mode: String,
    pub number: i64,
    pub pll_unlocks: Option<i64>,
    /// Extracted from the row identifier at the storage boundary, not
    /// from a self-reported clock.
    pub generated_at: DateTime<Utc>,
}

/// Per-detector desired state, authored by the operator UI and resolved
/// by the goal resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalRecord {
    pub active: bool,
    pub mode: String,
    pub stop_after_minutes: Option<i64>,
    pub user: String,
    pub comment: String,
    /// Only meaningful on the `tpc` detector.
    pub link_mv: bool,
    /// Only meaningful on the `tpc` detector.
    pub link_nv: bool,
    pub softstop: bool,
}

/// One recognised control key in the goal-directive stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKey {
    Active,
    Mode,
    StopAfter,
    LinkMv,
    LinkNv,
    User,
    Comment,
    Softstop,
}

impl ControlKey {
    /// All keys a configured detector must have a directive for.
    pub const REQUIRED: [ControlKey; 8] = [
        ControlKey::Active,
        ControlKey::Mode,
        ControlKey::StopAfter,
        ControlKey::LinkMv,
        ControlKey::LinkNv,
        ControlKey::User,
        ControlKey::Comment,
        ControlKey::Softstop,
    ];
}

impl fmt::Display for ControlKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Mode => "mode",
            Self::StopAfter => "stop_after",
            Self::LinkMv => "link_mv",
            Self::LinkNv => "link_nv",
            Self::User => "user",
            Self::Comment => "comment",
            Self::Softstop => "softstop",
        };
        write!(f, "{s}")
    }
}

/// Per-detector reduced status, published once per tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStatus {
    pub status: DaqStatus,
    pub rate: f64,
    pub buffer: i64,
    pub mode: String,
    /// `None` when no controller has reported a run number this tick.
    pub number: Option<RunNumber>,
    pub pll_unlocks: i64,
    pub updated_at: DateTime<Utc>,
}

/// A directive, pending or outgoing, command the gate emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: CommandKind,
    pub user: String,
    pub detector: DetectorId,
    pub mode: String,
    pub host_list: Vec<NodeId>,
    pub options_override: Option<CommandOptionsOverride>,
    pub created_at: DateTime<Utc>,
    /// `0` (unix-epoch sentinel) means not yet acknowledged, matching the
    /// source system's `acknowledged[h] == 0` convention (§3).
    pub acknowledged: HashMap<NodeId, Option<DateTime<Utc>>>,
}

impl CommandRecord {
    /// True once every recipient host has acknowledged.
    pub fn fully_acknowledged(&self) -> bool {
        self.acknowledged.values().all(Option::is_some)
    }
}

/// Extra fields attached to a command record, currently only used to carry
/// the freshly allocated run number on `arm`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CommandOptionsOverride {
    pub number: Option<RunNumber>,
}

/// A run-metadata document: one row per acquisition session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub number: RunNumber,
    pub detectors: Vec<DetectorId>,
    pub mode: String,
    pub user: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub comments: Option<String>,
    pub tags: Vec<String>,
}

/// A goal directive as written by the operator UI: the append-only record
/// the goal resolver folds down to the latest value per `(detector, field)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalDirective {
    pub detector: DetectorId,
    pub field: ControlKey,
    pub value: String,
    pub user: String,
    pub time: DateTime<Utc>,
}

/// Static per-detector node assignment, read from configuration at startup
/// (the `master_daq_config` block, §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorNodes {
    pub readers: Vec<NodeId>,
    pub controller: Vec<NodeId>,
}

/// `master_daq_config`, preserving the TOML table's declared order so the
/// tie-breaking order described in `spec.md` §9 Open Question (b) is
/// reproducible rather than `HashMap`-arbitrary.
pub type MasterDaqConfig = IndexMap<DetectorId, DetectorNodes>;

/// A named run-mode document: "a named configuration document describing
/// digitizer settings and the board/host list" (GLOSSARY). Only the
/// board-list half is modelled here — digitizer settings themselves are
/// opaque to the dispatcher, which only ever reads the host lists back out
/// to restrict aggregation (§4.A step 4) and to validate an `arm` against
/// an undefined mode (§7 `ModeUnknown`/`SubconfigMissing`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunModeDef {
    /// Per-detector reader board list this mode declares. A detector
    /// absent from this map has no board-list restriction under this mode
    /// (`SubconfigMissing` candidate if the detector was expected to have
    /// one — see `dispatcher-core::gate`).
    pub boards: HashMap<DetectorId, Vec<NodeId>>,
}

/// The full catalogue of known run modes, keyed by mode name. An empty
/// registry means the deployment performs no mode validation at all (an
/// explicit Open Question decision — see DESIGN.md).
pub type RunModeRegistry = HashMap<String, RunModeDef>;
