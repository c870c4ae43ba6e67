//! Super-detector grouping: which physical detectors are fused under
//! which logical head.
//!
//! Linking is declared bilaterally — two detectors are compatibly linked
//! iff they report the same `mode` and each one's goal record lists the
//! other in that mode's linked-detector declaration
//! (`GoalRecord::link_mv`/`link_nv`, only meaningful on `tpc`). A
//! `muon_veto`+`neutron_veto` link without `tpc` in the mix is also
//! possible; the five-case enumeration below carries that case forward
//! explicitly as `MvNv`.

use std::collections::HashMap;

use dispatcher_common::types::{DetectorId, GoalRecord, MasterDaqConfig, NodeId};

/// The fixed well-known detector ids this planner understands linking
/// rules for. Any other configured detector is always its own
/// [`SuperDetector::None`] head.
pub mod well_known {
    pub const TPC: &str = "tpc";
    pub const MUON_VETO: &str = "muon_veto";
    pub const NEUTRON_VETO: &str = "neutron_veto";
}

/// One of the five linking cases this planner enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuperDetector {
    /// No linking in effect; each detector stands alone.
    None,
    Tpc,
    TpcMv,
    TpcNv,
    TpcMvNv,
    /// `muon_veto` + `neutron_veto` linked, `tpc` not part of either link.
    MvNv,
}

/// Resolved grouping for one logical head: which detector ids are fused
/// under it and the union of their reader/controller node lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperDetectorGroup {
    pub head: DetectorId,
    pub kind: SuperDetector,
    pub members: Vec<DetectorId>,
    pub readers: Vec<NodeId>,
    pub controllers: Vec<NodeId>,
}

/// `link_mv`/`link_nv` are only meaningful on the `tpc` detector — there
/// is no corresponding flag on `muon_veto` or `neutron_veto`'s own goal
/// record. `tpc`-headed links are therefore declared solely by `tpc`'s
/// flags plus mode agreement; the `mv`+`nv` (tpc solo) case falls back to
/// mode-name agreement alone once neither veto is already claimed by a
/// `tpc` link (see DESIGN.md).
fn tpc_linked(tpc: &GoalRecord, other: &GoalRecord, declared: bool) -> bool {
    declared && tpc.mode == other.mode
}

/// Compute the super-detector grouping for every configured detector.
///
/// `goals` must contain an entry for every detector named in
/// `master_config`; callers (the reconciler) guarantee this by skipping
/// the tick entirely on `MissingGoal` before reaching the planner.
pub fn plan(
    master_config: &MasterDaqConfig,
    goals: &HashMap<DetectorId, GoalRecord>,
) -> Vec<SuperDetectorGroup> {
    let tpc = DetectorId::from(well_known::TPC);
    let mv = DetectorId::from(well_known::MUON_VETO);
    let nv = DetectorId::from(well_known::NEUTRON_VETO);

    let tpc_mv = match (goals.get(&tpc), goals.get(&mv)) {
        (Some(t), Some(m)) => tpc_linked(t, m, t.link_mv),
        _ => false,
    };
    let tpc_nv = match (goals.get(&tpc), goals.get(&nv)) {
        (Some(t), Some(n)) => tpc_linked(t, n, t.link_nv),
        _ => false,
    };
    let mv_nv = !tpc_mv
        && !tpc_nv
        && match (goals.get(&mv), goals.get(&nv)) {
            (Some(m), Some(n)) => m.mode == n.mode,
            _ => false,
        };

    let mut groups = Vec::new();
    let mut consumed = std::collections::HashSet::new();

    if master_config.contains_key(&tpc) && (tpc_mv || tpc_nv) {
        let mut members = vec![tpc.clone()];
        if tpc_mv {
            members.push(mv.clone());
        }
        if tpc_nv {
            members.push(nv.clone());
        }
        let kind = match (tpc_mv, tpc_nv) {
            (true, true) => SuperDetector::TpcMvNv,
            (true, false) => SuperDetector::TpcMv,
            (false, true) => SuperDetector::TpcNv,
            (false, false) => unreachable!("guarded by outer condition"),
        };
        let (readers, controllers) = union_nodes(master_config, &members);
        for m in &members {
            consumed.insert(m.clone());
        }
        groups.push(SuperDetectorGroup {
            head: tpc.clone(),
            kind,
            members,
            readers,
            controllers,
        });
    } else if mv_nv && master_config.contains_key(&mv) && master_config.contains_key(&nv) {
        let members = vec![mv.clone(), nv.clone()];
        let (readers, controllers) = union_nodes(master_config, &members);
        consumed.insert(mv.clone());
        consumed.insert(nv.clone());
        groups.push(SuperDetectorGroup {
            head: mv.clone(),
            kind: SuperDetector::MvNv,
            members,
            readers,
            controllers,
        });
    }

    for (detector, nodes) in master_config {
        if consumed.contains(detector) {
            continue;
        }
        groups.push(SuperDetectorGroup {
            head: detector.clone(),
            kind: if detector == &tpc {
                SuperDetector::Tpc
            } else {
                SuperDetector::None
            },
            members: vec![detector.clone()],
            readers: nodes.readers.clone(),
            controllers: nodes.controller.clone(),
        });
    }

    groups
}

fn union_nodes(master_config: &MasterDaqConfig, members: &[DetectorId]) -> (Vec<NodeId>, Vec<NodeId>) {
    let mut readers = Vec::new();
    let mut controllers = Vec::new();
    for m in members {
        if let Some(nodes) = master_config.get(m) {
            for r in &nodes.readers {
                if !readers.contains(r) {
                    readers.push(r.clone());
                }
            }
            for c in &nodes.controller {
                if !controllers.contains(c) {
                    controllers.push(c.clone());
                }
            }
        }
    }
    (readers, controllers)
}
