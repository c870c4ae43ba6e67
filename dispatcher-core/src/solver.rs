//! Reconciliation solver: the `(goal.active, status)` dispatch table
//! driving each detector toward its declared goal.
//!
//! Laid out as a match on a tuple, one arm per cell of the table, reset
//! hooks applied up front.

use std::sync::Arc;

use dispatcher_common::clock::Clock;
use dispatcher_common::config::DispatcherConfig;
use dispatcher_common::error::DispatchError;
use dispatcher_common::types::{AggregateStatus, CommandKind, DaqStatus, DetectorId, GoalRecord};
use dispatcher_store::Store;

use crate::gate::IssueContext;
use crate::hypervisor::Hypervisor;
use crate::scheduler::SchedulerHandle;
use crate::state::ClusterState;
use crate::supervisor::{check_timeout, issue_logged, RateLimitedLogger, TimeoutTarget};

/// Run the dispatch table for one detector against its already-reduced
/// aggregate status and resolved goal.
///
/// Reset hooks run first, unconditionally: an `IDLE` observation clears
/// `can_force_stop`/`error_stop_count`; an `ARMING`/`ARMED` observation
/// raises the cluster-wide arming flag so the gate's one-armer check sees
/// it even if this tick never calls `issue`.
#[allow(clippy::too_many_arguments)]
pub async fn reconcile_detector<S: Store + 'static, H: Hypervisor>(
    store: &Arc<S>,
    clock: &dyn Clock,
    config: &DispatcherConfig,
    scheduler: &SchedulerHandle,
    hypervisor: &H,
    logger: &mut RateLimitedLogger,
    cluster: &mut ClusterState,
    detector: &DetectorId,
    goal: &GoalRecord,
    aggregate: &AggregateStatus,
    ctx: IssueContext<'_>,
) -> Result<(), DispatchError> {
    let status = aggregate.status;

    if status == DaqStatus::Idle {
        cluster.entry(detector).reset_on_idle();
    }
    if matches!(status, DaqStatus::Arming | DaqStatus::Armed) {
        cluster.one_detector_arming = true;
    }

    match (goal.active, status) {
        (false, DaqStatus::Idle) => {}

        (false, DaqStatus::Arming) | (false, DaqStatus::Armed) | (false, DaqStatus::Running) | (false, DaqStatus::Unknown) => {
            stop_gently(store, clock, config, scheduler, logger, cluster, detector, goal, aggregate, status, ctx).await?;
        }

        (false, DaqStatus::Timeout) => {
            issue_logged(store, clock, config, scheduler, logger, cluster, detector, CommandKind::Stop, ctx, false).await?;
        }

        (false, DaqStatus::Error) | (true, DaqStatus::Error) => {
            let force = cluster.get(detector).map(|s| s.can_force_stop).unwrap_or(true);
            issue_logged(store, clock, config, scheduler, logger, cluster, detector, CommandKind::Stop, ctx, force).await?;
            cluster.entry(detector).can_force_stop = false;
        }

        (true, DaqStatus::Running) => {
            check_turnover(store, clock, scheduler, logger, cluster, detector, config, goal, aggregate, ctx).await?;
            if aggregate.mode != goal.mode {
                issue_logged(store, clock, config, scheduler, logger, cluster, detector, CommandKind::Stop, ctx, false).await?;
            }
        }

        (true, DaqStatus::Armed) => {
            issue_logged(store, clock, config, scheduler, logger, cluster, detector, CommandKind::Start, ctx, false).await?;
        }

        (true, DaqStatus::Idle) => {
            issue_logged(store, clock, config, scheduler, logger, cluster, detector, CommandKind::Arm, ctx, false).await?;
        }

        (true, DaqStatus::Arming) => {
            check_timeout(store, clock, config, scheduler, hypervisor, logger, cluster, detector, ctx, TimeoutTarget::Arm).await?;
        }

        (true, DaqStatus::Unknown) => {
            check_timeout(store, clock, config, scheduler, hypervisor, logger, cluster, detector, ctx, TimeoutTarget::Auto).await?;
        }

        (true, DaqStatus::Timeout) => {
            issue_logged(store, clock, config, scheduler, logger, cluster, detector, CommandKind::Stop, ctx, false).await?;
        }
    }

    Ok(())
}

/// *stop-gently(d)*: a soft-stop goal lets a `RUNNING` detector ride out to
/// its turnover point instead of being cut short; every other non-idle
/// status with `active=false` gets an immediate `stop`.
#[allow(clippy::too_many_arguments)]
async fn stop_gently<S: Store + 'static>(
    store: &Arc<S>,
    clock: &dyn Clock,
    config: &DispatcherConfig,
    scheduler: &SchedulerHandle,
    logger: &mut RateLimitedLogger,
    cluster: &mut ClusterState,
    detector: &DetectorId,
    goal: &GoalRecord,
    aggregate: &AggregateStatus,
    status: DaqStatus,
    ctx: IssueContext<'_>,
) -> Result<(), DispatchError> {
    if status == DaqStatus::Running && goal.softstop {
        check_turnover(store, clock, scheduler, logger, cluster, detector, config, goal, aggregate, ctx).await
    } else {
        issue_logged(store, clock, config, scheduler, logger, cluster, detector, CommandKind::Stop, ctx, false).await
    }
}

/// *check-turnover(d)*: emits `stop` once the run tied to the current
/// aggregate number has been alive longer than `g.stop_after_minutes`.
/// Does nothing if the goal sets no turnover bound or the run's start time
/// is not yet on record.
#[allow(clippy::too_many_arguments)]
async fn check_turnover<S: Store + 'static>(
    store: &Arc<S>,
    clock: &dyn Clock,
    scheduler: &SchedulerHandle,
    logger: &mut RateLimitedLogger,
    cluster: &mut ClusterState,
    detector: &DetectorId,
    config: &DispatcherConfig,
    goal: &GoalRecord,
    aggregate: &AggregateStatus,
    ctx: IssueContext<'_>,
) -> Result<(), DispatchError> {
    let Some(number) = aggregate.number else {
        return Ok(());
    };
    let Some(stop_after_minutes) = goal.stop_after_minutes else {
        return Ok(());
    };
    let Some(t0) = store
        .run_start(number)
        .await
        .map_err(|e| DispatchError::StorageTransient(Box::new(e)))?
    else {
        return Ok(());
    };

    let now = clock.now();
    if now - t0 > chrono::Duration::minutes(stop_after_minutes) {
        issue_logged(store, clock, config, scheduler, logger, cluster, detector, CommandKind::Stop, ctx, false).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dispatcher_common::clock::test_util::FakeClock;
    use dispatcher_common::config::CommandTimeouts;
    use dispatcher_common::types::{ControlKey, MasterDaqConfig, NodeId, RunNumber, RunRecord};
    use dispatcher_store::MemoryStore;

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            timeout: CommandTimeouts {
                arm: 30,
                start: 10,
                stop: 10,
            },
            time_between_commands: 0,
            client_timeout: 10,
            timeout_take_action: 60,
            stop_retries: 3,
            max_arm_cycles: 3,
            start_cmd_delay: 0.0,
            stop_cmd_delay: 0.0,
            poll_frequency: 5,
            cc_start_wait: 0.0,
            control_keys: ControlKey::REQUIRED.to_vec(),
            master_daq_config: MasterDaqConfig::new(),
            modes: Default::default(),
            store_path: "/tmp/solver-test".into(),
        }
    }

    fn goal(active: bool, mode: &str, stop_after: Option<i64>, softstop: bool) -> GoalRecord {
        GoalRecord {
            active,
            mode: mode.to_string(),
            stop_after_minutes: stop_after,
            user: "op".into(),
            comment: String::new(),
            link_mv: false,
            link_nv: false,
            softstop,
        }
    }

    fn aggregate(status: DaqStatus, mode: &str, number: Option<u64>) -> AggregateStatus {
        AggregateStatus {
            status,
            rate: 0.0,
            buffer: 0,
            mode: mode.to_string(),
            number: number.map(RunNumber),
            pll_unlocks: 0,
            updated_at: Utc::now(),
        }
    }

    fn ctx<'a>(g: &'a GoalRecord, readers: &'a [NodeId], controllers: &'a [NodeId], run_detectors: &'a [DetectorId]) -> IssueContext<'a> {
        IssueContext {
            goal: g,
            readers,
            controllers,
            run_detectors,
        }
    }

    #[tokio::test]
    async fn idle_goal_active_issues_arm() {
        let store = Arc::new(MemoryStore::new());
        let cfg = config();
        let clock = FakeClock::new(Utc::now());
        let scheduler = SchedulerHandle::detached();
        let hv = crate::hypervisor::NoopHypervisor;
        let mut logger = RateLimitedLogger::new();
        let tpc = DetectorId::from("tpc");
        let mut cluster = ClusterState::new([tpc.clone()]);
        let g = goal(true, "m1", Some(60), false);
        let agg = aggregate(DaqStatus::Idle, "m1", None);
        let readers = vec![NodeId::from("reader0")];
        let controllers = vec![NodeId::from("cc0")];
        let run_detectors = [tpc.clone()];
        let c = ctx(&g, &readers, &controllers, &run_detectors);

        reconcile_detector(&store, &clock, &cfg, &scheduler, &hv, &mut logger, &mut cluster, &tpc, &g, &agg, c)
            .await
            .unwrap();

        assert_eq!(store.pending_commands().len(), 1);
        assert!(cluster.one_detector_arming);
    }

    #[tokio::test]
    async fn armed_goal_active_issues_start() {
        let store = Arc::new(MemoryStore::new());
        let cfg = config();
        let clock = FakeClock::new(Utc::now());
        let scheduler = SchedulerHandle::detached();
        let hv = crate::hypervisor::NoopHypervisor;
        let mut logger = RateLimitedLogger::new();
        let tpc = DetectorId::from("tpc");
        let mut cluster = ClusterState::new([tpc.clone()]);
        let g = goal(true, "m1", Some(60), false);
        let agg = aggregate(DaqStatus::Armed, "m1", Some(7));
        let readers = vec![NodeId::from("reader0")];
        let controllers = vec![NodeId::from("cc0")];
        let run_detectors = [tpc.clone()];
        let c = ctx(&g, &readers, &controllers, &run_detectors);

        reconcile_detector(&store, &clock, &cfg, &scheduler, &hv, &mut logger, &mut cluster, &tpc, &g, &agg, c)
            .await
            .unwrap();

        assert_eq!(store.pending_commands().len(), 1);
    }

    #[tokio::test]
    async fn idle_observation_resets_error_bookkeeping() {
        let store = Arc::new(MemoryStore::new());
        let cfg = config();
        let clock = FakeClock::new(Utc::now());
        let scheduler = SchedulerHandle::detached();
        let hv = crate::hypervisor::NoopHypervisor;
        let mut logger = RateLimitedLogger::new();
        let tpc = DetectorId::from("tpc");
        let mut cluster = ClusterState::new([tpc.clone()]);
        cluster.entry(&tpc).error_stop_count = 2;
        cluster.entry(&tpc).can_force_stop = false;
        let g = goal(false, "m1", Some(60), false);
        let agg = aggregate(DaqStatus::Idle, "m1", None);
        let readers = vec![NodeId::from("reader0")];
        let controllers = vec![NodeId::from("cc0")];
        let run_detectors = [tpc.clone()];
        let c = ctx(&g, &readers, &controllers, &run_detectors);

        reconcile_detector(&store, &clock, &cfg, &scheduler, &hv, &mut logger, &mut cluster, &tpc, &g, &agg, c)
            .await
            .unwrap();

        assert_eq!(cluster.get(&tpc).unwrap().error_stop_count, 0);
        assert!(cluster.get(&tpc).unwrap().can_force_stop);
        assert_eq!(store.pending_commands().len(), 0);
    }

    #[tokio::test]
    async fn running_past_turnover_threshold_emits_stop() {
        let store = Arc::new(MemoryStore::new());
        let cfg = config();
        let start = Utc::now() - chrono::Duration::minutes(2);
        store
            .insert_run_record(RunRecord {
                number: RunNumber(9),
                detectors: vec![DetectorId::from("tpc")],
                mode: "m1".into(),
                user: "op".into(),
                start,
                end: None,
                comments: None,
                tags: Vec::new(),
            })
            .await
            .unwrap();
        let clock = FakeClock::new(Utc::now());
        let scheduler = SchedulerHandle::detached();
        let hv = crate::hypervisor::NoopHypervisor;
        let mut logger = RateLimitedLogger::new();
        let tpc = DetectorId::from("tpc");
        let mut cluster = ClusterState::new([tpc.clone()]);
        let g = goal(true, "m1", Some(1), false);
        let agg = aggregate(DaqStatus::Running, "m1", Some(9));
        let readers = vec![NodeId::from("reader0")];
        let controllers = vec![NodeId::from("cc0")];
        let run_detectors = [tpc.clone()];
        let c = ctx(&g, &readers, &controllers, &run_detectors);

        reconcile_detector(&store, &clock, &cfg, &scheduler, &hv, &mut logger, &mut cluster, &tpc, &g, &agg, c)
            .await
            .unwrap();

        assert_eq!(store.pending_commands().len(), 1);
    }

    #[tokio::test]
    async fn soft_stop_waits_for_turnover_instead_of_stopping_immediately() {
        let store = Arc::new(MemoryStore::new());
        let cfg = config();
        let start = Utc::now() - chrono::Duration::minutes(3);
        store
            .insert_run_record(RunRecord {
                number: RunNumber(9),
                detectors: vec![DetectorId::from("tpc")],
                mode: "m1".into(),
                user: "op".into(),
                start,
                end: None,
                comments: None,
                tags: Vec::new(),
            })
            .await
            .unwrap();
        let clock = FakeClock::new(Utc::now());
        let scheduler = SchedulerHandle::detached();
        let hv = crate::hypervisor::NoopHypervisor;
        let mut logger = RateLimitedLogger::new();
        let tpc = DetectorId::from("tpc");
        let mut cluster = ClusterState::new([tpc.clone()]);
        let g = goal(false, "m1", Some(5), true);
        let agg = aggregate(DaqStatus::Running, "m1", Some(9));
        let readers = vec![NodeId::from("reader0")];
        let controllers = vec![NodeId::from("cc0")];
        let run_detectors = [tpc.clone()];
        let c = ctx(&g, &readers, &controllers, &run_detectors);

        reconcile_detector(&store, &clock, &cfg, &scheduler, &hv, &mut logger, &mut cluster, &tpc, &g, &agg, c)
            .await
            .unwrap();

        assert_eq!(store.pending_commands().len(), 0);
    }
}
