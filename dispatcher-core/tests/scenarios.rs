//! End-to-end scenario tests driving [`Reconciler::tick`] against
//! `MemoryStore` and a `FakeClock` — six scenarios plus a couple of
//! cross-cutting invariants, exercised tick by tick rather than by
//! calling individual solver/gate functions directly.
//!
//! `gate::issue` enqueues a `start`/`stop` as two pending records (one for
//! the reader host list, one — possibly delayed — for the controller host
//! list) whenever both lists are non-empty, but a single merged record for
//! `arm`. Assertions below account for that rather than assuming one
//! pending record per command.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dispatcher_common::clock::test_util::FakeClock;
use dispatcher_common::config::{CommandTimeouts, DispatcherConfig};
use dispatcher_common::types::{
    CommandKind, ControlKey, DaqStatus, DetectorId, DetectorNodes, GoalDirective, MasterDaqConfig,
    NodeId, NodeStatusRow, RunModeDef, RunModeRegistry, RunNumber, RunRecord,
};
use dispatcher_core::scheduler::SchedulerHandle;
use dispatcher_core::Reconciler;
use dispatcher_store::{MemoryStore, PendingCommand, Store};

fn base_config(master: MasterDaqConfig) -> DispatcherConfig {
    DispatcherConfig {
        timeout: CommandTimeouts {
            arm: 30,
            start: 10,
            stop: 10,
        },
        time_between_commands: 2,
        client_timeout: 30,
        timeout_take_action: 60,
        stop_retries: 3,
        max_arm_cycles: 3,
        start_cmd_delay: 0.0,
        stop_cmd_delay: 0.0,
        poll_frequency: 5,
        cc_start_wait: 0.0,
        control_keys: ControlKey::REQUIRED.to_vec(),
        master_daq_config: master,
        modes: RunModeRegistry::new(),
        store_path: "/tmp/scenarios-test".into(),
    }
}

fn single_tpc_config() -> DispatcherConfig {
    let mut master = MasterDaqConfig::new();
    master.insert(
        DetectorId::from("tpc"),
        DetectorNodes {
            readers: vec![NodeId::from("reader0")],
            controller: vec![NodeId::from("cc0")],
        },
    );
    base_config(master)
}

fn seed_goal(
    store: &MemoryStore,
    detector: &DetectorId,
    active: bool,
    mode: &str,
    stop_after: Option<i64>,
    softstop: bool,
    now: chrono::DateTime<Utc>,
) {
    let mut put = |field: ControlKey, value: String| {
        store.seed_goal(GoalDirective {
            detector: detector.clone(),
            field,
            value,
            user: "op".into(),
            time: now,
        });
    };
    put(ControlKey::Active, active.to_string());
    put(ControlKey::Mode, mode.to_string());
    put(ControlKey::StopAfter, stop_after.map(|m| m.to_string()).unwrap_or_default());
    put(ControlKey::User, "op".to_string());
    put(ControlKey::Comment, String::new());
    put(ControlKey::LinkMv, "false".to_string());
    put(ControlKey::LinkNv, "false".to_string());
    put(ControlKey::Softstop, softstop.to_string());
}

fn seed_status(store: &MemoryStore, host: &str, status: DaqStatus, mode: &str, number: i64, now: chrono::DateTime<Utc>) {
    store.seed_node_status(NodeStatusRow {
        host: NodeId::from(host),
        status,
        rate: 1.0,
        buffer_size: 0,
        mode: mode.to_string(),
        number,
        pll_unlocks: Some(0),
        generated_at: now,
    });
}

/// Publish every currently pending command straight to the outgoing
/// stream, so a later tick's "no unacknowledged stop" precondition and
/// empty-pending assertions are not confused by this tick's own output.
async fn drain_pending(store: &MemoryStore) {
    let ids: Vec<_> = store.pending_commands().iter().map(|p| p.id).collect();
    for id in ids {
        store.publish_outgoing(id).await.unwrap();
    }
}

fn new_since(before: usize, store: &MemoryStore) -> Vec<PendingCommand> {
    store.pending_commands().split_off(before.min(store.pending_commands().len()))
}

fn assert_all_kind(records: &[PendingCommand], kind: CommandKind) {
    assert!(!records.is_empty(), "expected at least one new pending command");
    for r in records {
        assert_eq!(r.record.command, kind, "unexpected command kind in {records:?}");
    }
}

/// Scenario 1 — cold arm: idle detector with an active goal arms, then
/// starts, then settles into running with a run record on file.
#[tokio::test]
async fn scenario_cold_arm() {
    let store = Arc::new(MemoryStore::new());
    let cfg = single_tpc_config();
    let clock = FakeClock::new(Utc::now());
    let scheduler = SchedulerHandle::detached();
    let hv = dispatcher_core::NoopHypervisor;
    let tpc = DetectorId::from("tpc");
    let mut reconciler = Reconciler::new([tpc.clone()]);

    seed_goal(&store, &tpc, true, "m1", Some(60), false, clock.now());
    seed_status(&store, "reader0", DaqStatus::Idle, "m1", 0, clock.now());
    seed_status(&store, "cc0", DaqStatus::Idle, "m1", 0, clock.now());

    reconciler.tick(&store, &clock, &cfg, &scheduler, &hv).await.unwrap();
    let armed = new_since(0, &store);
    assert_eq!(armed.len(), 1);
    assert_all_kind(&armed, CommandKind::Arm);
    let run_number = armed[0].record.options_override.as_ref().unwrap().number.unwrap();
    drain_pending(&store).await;

    clock.advance(chrono::Duration::seconds(1));
    seed_status(&store, "reader0", DaqStatus::Armed, "m1", run_number.0 as i64, clock.now());
    seed_status(&store, "cc0", DaqStatus::Armed, "m1", run_number.0 as i64, clock.now());
    reconciler.tick(&store, &clock, &cfg, &scheduler, &hv).await.unwrap();
    let starting = new_since(0, &store);
    assert_eq!(starting.len(), 2, "reader and controller start records");
    assert_all_kind(&starting, CommandKind::Start);
    drain_pending(&store).await;

    clock.advance(chrono::Duration::seconds(1));
    seed_status(&store, "reader0", DaqStatus::Running, "m1", run_number.0 as i64, clock.now());
    seed_status(&store, "cc0", DaqStatus::Running, "m1", run_number.0 as i64, clock.now());
    reconciler.tick(&store, &clock, &cfg, &scheduler, &hv).await.unwrap();
    assert!(store.pending_commands().is_empty());
    assert!(store.run_start(run_number).await.unwrap().is_some());
}

/// Scenario 2 — arm conflict: two unlinked detectors both idle with active
/// goals; only one is armed per tick (declared order). Once the first
/// reaches `ARMED` and its `start` clears the cluster-wide arming flag, the
/// second is free to arm within that same reconciliation pass, since the
/// flag-clear and the second detector's turn both happen inside one tick.
#[tokio::test]
async fn scenario_arm_conflict_is_resolved_by_declaration_order() {
    let mut master = MasterDaqConfig::new();
    master.insert(
        DetectorId::from("alpha"),
        DetectorNodes {
            readers: vec![NodeId::from("alpha_r0")],
            controller: vec![NodeId::from("alpha_cc0")],
        },
    );
    master.insert(
        DetectorId::from("beta"),
        DetectorNodes {
            readers: vec![NodeId::from("beta_r0")],
            controller: vec![NodeId::from("beta_cc0")],
        },
    );
    let cfg = base_config(master);
    let store = Arc::new(MemoryStore::new());
    let clock = FakeClock::new(Utc::now());
    let scheduler = SchedulerHandle::detached();
    let hv = dispatcher_core::NoopHypervisor;
    let alpha = DetectorId::from("alpha");
    let beta = DetectorId::from("beta");
    let mut reconciler = Reconciler::new([alpha.clone(), beta.clone()]);

    seed_goal(&store, &alpha, true, "m1", None, false, clock.now());
    seed_goal(&store, &beta, true, "m1", None, false, clock.now());
    seed_status(&store, "alpha_r0", DaqStatus::Idle, "m1", 0, clock.now());
    seed_status(&store, "alpha_cc0", DaqStatus::Idle, "m1", 0, clock.now());
    seed_status(&store, "beta_r0", DaqStatus::Idle, "m1", 0, clock.now());
    seed_status(&store, "beta_cc0", DaqStatus::Idle, "m1", 0, clock.now());

    reconciler.tick(&store, &clock, &cfg, &scheduler, &hv).await.unwrap();
    let first_tick = new_since(0, &store);
    assert_eq!(first_tick.len(), 1, "only one detector arms per tick (I1)");
    assert_eq!(first_tick[0].record.detector, alpha);
    assert!(!reconciler.cluster.get(&beta).map(|s| s.candidate_run_number.is_some()).unwrap_or(false));
    drain_pending(&store).await;

    clock.advance(chrono::Duration::seconds(1));
    seed_status(&store, "alpha_r0", DaqStatus::Armed, "m1", 0, clock.now());
    seed_status(&store, "alpha_cc0", DaqStatus::Armed, "m1", 0, clock.now());
    reconciler.tick(&store, &clock, &cfg, &scheduler, &hv).await.unwrap();
    let second_tick = new_since(0, &store);
    assert!(
        second_tick.iter().any(|r| r.record.detector == alpha && r.record.command == CommandKind::Start),
        "alpha should receive start once armed"
    );
    assert!(
        second_tick.iter().any(|r| r.record.detector == beta && r.record.command == CommandKind::Arm),
        "beta should arm once the cluster-wide arming flag clears"
    );
}

/// Scenario 3 — stop-timeout escalation: a `stop` that never gets
/// acknowledged re-fires with linear backoff until `stop_retries` is
/// exhausted, at which point the hypervisor's reset fires exactly once and
/// `error_stop_count` resets to zero (I6).
#[tokio::test]
async fn scenario_stop_timeout_escalates_after_exhausting_retries() {
    use dispatcher_core::gate::IssueContext;
    use dispatcher_core::state::ClusterState;
    use dispatcher_core::supervisor::{check_timeout, RateLimitedLogger, TimeoutTarget};

    let store = Arc::new(MemoryStore::new());
    let cfg = single_tpc_config();
    let start = Utc::now();
    let clock = FakeClock::new(start);
    let scheduler = SchedulerHandle::detached();
    let hv = dispatcher_core::NoopHypervisor;
    let mut logger = RateLimitedLogger::new();
    let tpc = DetectorId::from("tpc");
    let mut cluster = ClusterState::new([tpc.clone()]);
    cluster.entry(&tpc).last_command_at.insert(CommandKind::Stop, start);

    let goal = dispatcher_common::types::GoalRecord {
        active: false,
        mode: "m1".into(),
        stop_after_minutes: None,
        user: "op".into(),
        comment: String::new(),
        link_mv: false,
        link_nv: false,
        softstop: false,
    };
    let readers = vec![NodeId::from("reader0")];
    let controllers = vec![NodeId::from("cc0")];
    let run_detectors = [tpc.clone()];
    let ctx = IssueContext {
        goal: &goal,
        readers: &readers,
        controllers: &controllers,
        run_detectors: &run_detectors,
    };

    // Round 1: backoff timeout = stop(10) * (0+1) = 10s.
    clock.advance(chrono::Duration::seconds(11));
    check_timeout(&store, &clock, &cfg, &scheduler, &hv, &mut logger, &mut cluster, &tpc, ctx, TimeoutTarget::Auto)
        .await
        .unwrap();
    assert_eq!(cluster.get(&tpc).unwrap().error_stop_count, 1);
    assert_eq!(store.pending_commands().len(), 2, "reader + controller stop records");
    cluster.entry(&tpc).last_command_at.insert(CommandKind::Stop, clock.now());

    // Round 2: backoff timeout = stop(10) * (1+1) = 20s.
    clock.advance(chrono::Duration::seconds(21));
    check_timeout(&store, &clock, &cfg, &scheduler, &hv, &mut logger, &mut cluster, &tpc, ctx, TimeoutTarget::Auto)
        .await
        .unwrap();
    assert_eq!(cluster.get(&tpc).unwrap().error_stop_count, 2);
    assert_eq!(store.pending_commands().len(), 4);
    cluster.entry(&tpc).last_command_at.insert(CommandKind::Stop, clock.now());

    // Round 3: error_stop_count has reached stop_retries, so this overdue
    // check escalates instead of retrying. The backoff window itself grows
    // with error_stop_count (stop(10) * (3+1) = 40s here), so the clock
    // has to clear that before check_timeout even looks at the threshold.
    cluster.entry(&tpc).error_stop_count = cfg.stop_retries;
    clock.advance(chrono::Duration::seconds(41));
    check_timeout(&store, &clock, &cfg, &scheduler, &hv, &mut logger, &mut cluster, &tpc, ctx, TimeoutTarget::Auto)
        .await
        .unwrap();

    assert_eq!(cluster.get(&tpc).unwrap().error_stop_count, 0);
    assert_eq!(store.pending_commands().len(), 4, "no new stop enqueued on the escalation round");
}

/// Scenario 4 — run turnover: no `stop` before the turnover threshold, one
/// `stop` exactly once it's crossed (I8).
#[tokio::test]
async fn scenario_run_turnover_emits_stop_once_threshold_crossed() {
    let store = Arc::new(MemoryStore::new());
    let cfg = single_tpc_config();
    let t0 = Utc::now();
    let clock = FakeClock::new(t0);
    let scheduler = SchedulerHandle::detached();
    let hv = dispatcher_core::NoopHypervisor;
    let tpc = DetectorId::from("tpc");
    let mut reconciler = Reconciler::new([tpc.clone()]);

    let run_number = RunNumber(1);
    store
        .insert_run_record(RunRecord {
            number: run_number,
            detectors: vec![tpc.clone()],
            mode: "m1".into(),
            user: "op".into(),
            start: t0,
            end: None,
            comments: None,
            tags: Vec::new(),
        })
        .await
        .unwrap();

    seed_goal(&store, &tpc, true, "m1", Some(1), false, t0);

    clock.advance(chrono::Duration::seconds(59));
    seed_status(&store, "reader0", DaqStatus::Running, "m1", 1, clock.now());
    seed_status(&store, "cc0", DaqStatus::Running, "m1", 1, clock.now());
    reconciler.tick(&store, &clock, &cfg, &scheduler, &hv).await.unwrap();
    assert!(store.pending_commands().is_empty(), "must not stop before the turnover threshold");

    clock.advance(chrono::Duration::seconds(2));
    seed_status(&store, "reader0", DaqStatus::Running, "m1", 1, clock.now());
    seed_status(&store, "cc0", DaqStatus::Running, "m1", 1, clock.now());
    reconciler.tick(&store, &clock, &cfg, &scheduler, &hv).await.unwrap();
    let stopped = new_since(0, &store);
    assert_eq!(stopped.len(), 2);
    assert_all_kind(&stopped, CommandKind::Stop);
}

/// Scenario 5 — soft stop: a `RUNNING` detector with `active=false,
/// softstop=true` rides out to its turnover point instead of stopping
/// immediately.
#[tokio::test]
async fn scenario_soft_stop_waits_for_turnover() {
    let store = Arc::new(MemoryStore::new());
    let cfg = single_tpc_config();
    let t0 = Utc::now();
    let clock = FakeClock::new(t0);
    let scheduler = SchedulerHandle::detached();
    let hv = dispatcher_core::NoopHypervisor;
    let tpc = DetectorId::from("tpc");
    let mut reconciler = Reconciler::new([tpc.clone()]);

    let run_number = RunNumber(1);
    store
        .insert_run_record(RunRecord {
            number: run_number,
            detectors: vec![tpc.clone()],
            mode: "m1".into(),
            user: "op".into(),
            start: t0,
            end: None,
            comments: None,
            tags: Vec::new(),
        })
        .await
        .unwrap();

    seed_goal(&store, &tpc, false, "m1", Some(5), true, t0);

    clock.advance(chrono::Duration::minutes(3));
    seed_status(&store, "reader0", DaqStatus::Running, "m1", 1, clock.now());
    seed_status(&store, "cc0", DaqStatus::Running, "m1", 1, clock.now());
    reconciler.tick(&store, &clock, &cfg, &scheduler, &hv).await.unwrap();
    assert!(store.pending_commands().is_empty(), "must not stop before turnover while soft-stopping");

    clock.advance(chrono::Duration::seconds(121));
    seed_status(&store, "reader0", DaqStatus::Running, "m1", 1, clock.now());
    seed_status(&store, "cc0", DaqStatus::Running, "m1", 1, clock.now());
    reconciler.tick(&store, &clock, &cfg, &scheduler, &hv).await.unwrap();
    let stopped = new_since(0, &store);
    assert_eq!(stopped.len(), 2);
    assert_all_kind(&stopped, CommandKind::Stop);
}

/// Scenario 6 — linked mode: `tpc`+`muon_veto` agreeing on a linked mode
/// are armed together, against the union of their node lists, and share
/// one run record naming both detectors (I7, link consistency).
#[tokio::test]
async fn scenario_linked_mode_arms_the_union_and_shares_a_run_record() {
    let mut master = MasterDaqConfig::new();
    master.insert(
        DetectorId::from("tpc"),
        DetectorNodes {
            readers: vec![NodeId::from("tpc_r0")],
            controller: vec![NodeId::from("tpc_cc0")],
        },
    );
    master.insert(
        DetectorId::from("muon_veto"),
        DetectorNodes {
            readers: vec![NodeId::from("mv_r0")],
            controller: vec![NodeId::from("mv_cc0")],
        },
    );
    let cfg = base_config(master);
    let store = Arc::new(MemoryStore::new());
    let clock = FakeClock::new(Utc::now());
    let scheduler = SchedulerHandle::detached();
    let hv = dispatcher_core::NoopHypervisor;
    let tpc = DetectorId::from("tpc");
    let mv = DetectorId::from("muon_veto");
    let mut reconciler = Reconciler::new([tpc.clone(), mv.clone()]);

    seed_goal(&store, &tpc, true, "combined", Some(60), false, clock.now());
    seed_goal(&store, &mv, true, "combined", Some(60), false, clock.now());
    store.seed_goal(GoalDirective {
        detector: tpc.clone(),
        field: ControlKey::LinkMv,
        value: "true".to_string(),
        user: "op".into(),
        time: clock.now(),
    });

    seed_status(&store, "tpc_r0", DaqStatus::Idle, "combined", 0, clock.now());
    seed_status(&store, "tpc_cc0", DaqStatus::Idle, "combined", 0, clock.now());
    seed_status(&store, "mv_r0", DaqStatus::Idle, "combined", 0, clock.now());
    seed_status(&store, "mv_cc0", DaqStatus::Idle, "combined", 0, clock.now());

    reconciler.tick(&store, &clock, &cfg, &scheduler, &hv).await.unwrap();
    let armed = new_since(0, &store);
    assert_eq!(armed.len(), 1, "a linked arm is still a single merged command");
    assert_eq!(armed[0].record.command, CommandKind::Arm);
    let hosts: Vec<String> = armed[0].record.host_list.iter().map(|h| h.0.clone()).collect();
    assert!(hosts.contains(&"tpc_r0".to_string()));
    assert!(hosts.contains(&"mv_r0".to_string()));
    let run_number = armed[0].record.options_override.as_ref().unwrap().number.unwrap();
    drain_pending(&store).await;

    clock.advance(chrono::Duration::seconds(1));
    for host in ["tpc_r0", "tpc_cc0", "mv_r0", "mv_cc0"] {
        seed_status(&store, host, DaqStatus::Armed, "combined", run_number.0 as i64, clock.now());
    }
    reconciler.tick(&store, &clock, &cfg, &scheduler, &hv).await.unwrap();
    let starting = new_since(0, &store);
    assert_eq!(starting.len(), 2);
    assert_all_kind(&starting, CommandKind::Start);
    drain_pending(&store).await;

    clock.advance(chrono::Duration::seconds(1));
    for host in ["tpc_r0", "tpc_cc0", "mv_r0", "mv_cc0"] {
        seed_status(&store, host, DaqStatus::Running, "combined", run_number.0 as i64, clock.now());
    }
    reconciler.tick(&store, &clock, &cfg, &scheduler, &hv).await.unwrap();
    assert!(store.pending_commands().is_empty());

    let record = store.run_start(run_number).await.unwrap();
    assert!(record.is_some(), "arming a linked pair must produce one shared run record");
}

/// Mode validation rejects `arm` for an undefined mode even when every
/// other precondition in the gate is satisfied — an operator typo in a
/// mode name fails closed rather than arming against an unknown subconfig.
#[tokio::test]
async fn mode_registry_refuses_arm_for_undefined_mode_end_to_end() {
    let mut master = MasterDaqConfig::new();
    master.insert(
        DetectorId::from("tpc"),
        DetectorNodes {
            readers: vec![NodeId::from("reader0")],
            controller: vec![NodeId::from("cc0")],
        },
    );
    let mut cfg = base_config(master);
    cfg.modes.insert(
        "known".to_string(),
        RunModeDef {
            boards: HashMap::from([(DetectorId::from("tpc"), vec![NodeId::from("reader0")])]),
        },
    );

    let store = Arc::new(MemoryStore::new());
    let clock = FakeClock::new(Utc::now());
    let scheduler = SchedulerHandle::detached();
    let hv = dispatcher_core::NoopHypervisor;
    let tpc = DetectorId::from("tpc");
    let mut reconciler = Reconciler::new([tpc.clone()]);

    seed_goal(&store, &tpc, true, "unknown-mode", None, false, clock.now());
    seed_status(&store, "reader0", DaqStatus::Idle, "unknown-mode", 0, clock.now());
    seed_status(&store, "cc0", DaqStatus::Idle, "unknown-mode", 0, clock.now());

    reconciler.tick(&store, &clock, &cfg, &scheduler, &hv).await.unwrap();

    assert!(store.pending_commands().is_empty());
    assert!(store.logged_errors().iter().any(|(_, _, kind)| kind == "MODE_UNKNOWN"));
}
