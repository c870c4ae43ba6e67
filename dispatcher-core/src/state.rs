//! Per-detector controller bookkeeping plus the one process-wide arming
//! flag. Lives entirely on the reconciler's task — never cloned across an
//! `.await` boundary into another task.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dispatcher_common::types::{CommandKind, DetectorId, RunNumber};

/// One detector's in-memory state, created at startup and held for the
/// process lifetime.
#[derive(Debug, Clone)]
pub struct DetectorState {
    /// Last time each command kind was accepted by the gate for this
    /// detector. Absent until the first emission.
    pub last_command_at: HashMap<CommandKind, DateTime<Utc>>,
    pub error_stop_count: u32,
    pub missed_arm_cycles: u32,
    pub can_force_stop: bool,
    /// The run number allocated on the most recent `arm`, carried forward
    /// so the gate can stamp it onto the run record created at `start`.
    pub candidate_run_number: Option<RunNumber>,
}

impl Default for DetectorState {
    fn default() -> Self {
        Self {
            last_command_at: HashMap::new(),
            error_stop_count: 0,
            missed_arm_cycles: 0,
            can_force_stop: true,
            candidate_run_number: None,
        }
    }
}

impl DetectorState {
    /// Time elapsed since `cmd` was last accepted, or `None` if it never
    /// has been — callers treat `None` as "cooldown trivially satisfied".
    pub fn since_last(&self, cmd: CommandKind, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.last_command_at.get(&cmd).map(|&at| now - at)
    }

    /// Apply the reset hooks for an `IDLE` observation: clear the error
    /// backoff counter and re-allow a force stop.
    pub fn reset_on_idle(&mut self) {
        self.can_force_stop = true;
        self.error_stop_count = 0;
    }
}

/// All detector state plus the single cluster-wide arming flag, owned by
/// the reconciler task.
#[derive(Debug, Default)]
pub struct ClusterState {
    pub detectors: HashMap<DetectorId, DetectorState>,
    pub one_detector_arming: bool,
}

impl ClusterState {
    pub fn new(ids: impl IntoIterator<Item = DetectorId>) -> Self {
        let detectors = ids.into_iter().map(|id| (id, DetectorState::default())).collect();
        Self {
            detectors,
            one_detector_arming: false,
        }
    }

    pub fn entry(&mut self, detector: &DetectorId) -> &mut DetectorState {
        self.detectors.entry(detector.clone()).or_default()
    }

    pub fn get(&self, detector: &DetectorId) -> Option<&DetectorState> {
        self.detectors.get(detector)
    }
}
