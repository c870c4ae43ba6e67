//! Command gate: the single entry point through which every outbound
//! `arm`/`start`/`stop` command passes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dispatcher_common::clock::Clock;
use dispatcher_common::config::DispatcherConfig;
use dispatcher_common::error::DispatchError;
use dispatcher_common::types::{CommandKind, CommandOptionsOverride, CommandRecord, DetectorId, GoalRecord, NodeId, RunRecord};
use dispatcher_store::Store;
use tracing::info;

use crate::scheduler::SchedulerHandle;
use crate::state::ClusterState;

/// Context the solver already has in hand when it calls [`issue`] — the
/// recipients this command should go to, and the goal/run metadata needed
/// to populate a run record on `start`.
#[derive(Clone, Copy)]
pub struct IssueContext<'a> {
    pub goal: &'a GoalRecord,
    pub readers: &'a [NodeId],
    pub controllers: &'a [NodeId],
    /// The detector ids that should be stamped on the run record created
    /// at `start` — the super-detector's full member list when linked.
    pub run_detectors: &'a [DetectorId],
}

fn cooldown_elapsed(since: Option<chrono::Duration>, timeout_s: u64) -> bool {
    match since {
        None => true,
        Some(dt) => dt > chrono::Duration::seconds(timeout_s as i64),
    }
}

/// `issue(cmd, detector, force)`.
///
/// Preconditions are checked in a fixed order; the first violated one
/// determines the rejection. On acceptance the command record(s) are
/// handed to the store's pending area — immediate emissions simply use
/// `fire_at = now`, consistent with the delayed scheduler's single entry
/// point for every outbound release.
pub async fn issue<S: Store + 'static>(
    store: &Arc<S>,
    clock: &dyn Clock,
    config: &DispatcherConfig,
    scheduler: &SchedulerHandle,
    cluster: &mut ClusterState,
    detector: &DetectorId,
    cmd: CommandKind,
    ctx: IssueContext<'_>,
    force: bool,
) -> Result<(), DispatchError> {
    let now = clock.now();

    if cmd == CommandKind::Stop
        && !force
        && last_unacked_stop(store, ctx.controllers, ctx.readers).await?.is_some()
    {
        return Err(DispatchError::AckPending {
            detector: detector.clone(),
        });
    }

    let state = cluster.entry(detector);
    let since = state.since_last(cmd, now);
    let timeout_s = match cmd {
        CommandKind::Arm => config.timeout.arm,
        CommandKind::Start => config.timeout.start,
        CommandKind::Stop => config.timeout.stop,
    };
    if !force && !cooldown_elapsed(since, timeout_s) {
        return Err(DispatchError::Cooldown {
            detector: detector.clone(),
            command: cmd,
        });
    }

    match cmd {
        CommandKind::Start => {
            let since_arm = state.since_last(CommandKind::Arm, now);
            if !sequencing_elapsed(since_arm, config.time_between_commands) {
                return Err(DispatchError::Cooldown {
                    detector: detector.clone(),
                    command: cmd,
                });
            }
        }
        CommandKind::Arm => {
            let since_stop = state.since_last(CommandKind::Stop, now);
            if !sequencing_elapsed(since_stop, config.time_between_commands) {
                return Err(DispatchError::Cooldown {
                    detector: detector.clone(),
                    command: cmd,
                });
            }
            if cluster.one_detector_arming {
                return Err(DispatchError::ArmBusy {
                    detector: detector.clone(),
                });
            }
        }
        CommandKind::Stop => {}
    }

    if cmd == CommandKind::Arm {
        validate_mode(config, ctx.goal, ctx.run_detectors)?;
    }

    match cmd {
        CommandKind::Arm => {
            let number = store
                .next_run_number()
                .await
                .map_err(|e| DispatchError::StorageTransient(Box::new(e)))?;
            let mut host_list = ctx.readers.to_vec();
            host_list.extend(ctx.controllers.iter().cloned());
            let record = new_record(cmd, ctx.goal, detector, &host_list, now, Some(number));
            enqueue(store, scheduler, record, now).await?;

            let state = cluster.entry(detector);
            state.candidate_run_number = Some(number);
            cluster.one_detector_arming = true;
        }
        CommandKind::Start => {
            let reader_record = new_record(cmd, ctx.goal, detector, ctx.readers, now, None);
            enqueue(store, scheduler, reader_record, now).await?;

            if !ctx.controllers.is_empty() {
                let controller_record = new_record(cmd, ctx.goal, detector, ctx.controllers, now, None);
                let fire_at = now + chrono::Duration::milliseconds((config.start_cmd_delay * 1000.0) as i64);
                enqueue(store, scheduler, controller_record, fire_at).await?;
            }

            cluster.one_detector_arming = false;

            let state = cluster.entry(detector);
            if let Some(number) = state.candidate_run_number {
                store
                    .insert_run_record(RunRecord {
                        number,
                        detectors: ctx.run_detectors.to_vec(),
                        mode: ctx.goal.mode.clone(),
                        user: ctx.goal.user.clone(),
                        start: now,
                        end: None,
                        comments: Some(ctx.goal.comment.clone()),
                        tags: Vec::new(),
                    })
                    .await
                    .map_err(|e| DispatchError::StorageTransient(Box::new(e)))?;
            }
        }
        CommandKind::Stop => {
            let controller_record = new_record(cmd, ctx.goal, detector, ctx.controllers, now, None);
            let controller_id = if ctx.controllers.is_empty() {
                None
            } else {
                Some(enqueue(store, scheduler, controller_record, now).await?)
            };

            if !ctx.readers.is_empty() {
                let reader_record = new_record(cmd, ctx.goal, detector, ctx.readers, now, None);
                let delay_ms = if force { 0 } else { (config.stop_cmd_delay * 1000.0) as i64 };
                let fire_at = now + chrono::Duration::milliseconds(delay_ms);
                enqueue(store, scheduler, reader_record, fire_at).await?;
            }

            if cluster.one_detector_arming {
                cluster.one_detector_arming = false;
            }

            cluster.entry(detector).last_command_at.insert(cmd, now);
            info!(%detector, command = %cmd, force, "command accepted by gate");
            spawn_run_close(store, config, detector, cluster, now, controller_id, force);
            return Ok(());
        }
    }

    cluster.entry(detector).last_command_at.insert(cmd, now);
    info!(%detector, command = %cmd, force, "command accepted by gate");

    Ok(())
}

/// Refuse `arm` against an undefined or incomplete run mode.
/// An empty `config.modes` registry means the deployment has opted out of
/// mode validation entirely (see DESIGN.md), so every mode is accepted.
fn validate_mode(config: &DispatcherConfig, goal: &GoalRecord, run_detectors: &[DetectorId]) -> Result<(), DispatchError> {
    if config.modes.is_empty() {
        return Ok(());
    }
    let Some(def) = config.modes.get(&goal.mode) else {
        return Err(DispatchError::ModeUnknown {
            detector: run_detectors.first().cloned().unwrap_or_else(|| DetectorId::from("")),
            mode: goal.mode.clone(),
        });
    };
    for d in run_detectors {
        if !def.boards.contains_key(d) {
            return Err(DispatchError::SubconfigMissing { mode: goal.mode.clone() });
        }
    }
    Ok(())
}

fn sequencing_elapsed(since: Option<chrono::Duration>, time_between_commands: u64) -> bool {
    match since {
        None => true,
        Some(dt) => dt > chrono::Duration::seconds(time_between_commands as i64),
    }
}

fn new_record(
    cmd: CommandKind,
    goal: &GoalRecord,
    detector: &DetectorId,
    hosts: &[NodeId],
    now: DateTime<Utc>,
    run_number_override: Option<dispatcher_common::types::RunNumber>,
) -> CommandRecord {
    CommandRecord {
        command: cmd,
        user: goal.user.clone(),
        detector: detector.clone(),
        mode: goal.mode.clone(),
        host_list: hosts.to_vec(),
        options_override: run_number_override.map(|number| CommandOptionsOverride { number: Some(number) }),
        created_at: now,
        acknowledged: hosts.iter().map(|h| (h.clone(), None)).collect(),
    }
}

async fn enqueue<S: Store>(
    store: &Arc<S>,
    scheduler: &SchedulerHandle,
    record: CommandRecord,
    fire_at: DateTime<Utc>,
) -> Result<dispatcher_store::CommandId, DispatchError> {
    let id = store
        .enqueue_pending(record, fire_at)
        .await
        .map_err(|e| DispatchError::StorageTransient(Box::new(e)))?;
    scheduler.notify_enqueued();
    Ok(id)
}

/// A `stop` is refused (absent `force`) while any recipient of the
/// detector's previous `stop` remains unacknowledged. Only `stop` commands
/// count here — an outstanding unacked `arm` or `start` must not block a
/// detector's first `stop`.
async fn last_unacked_stop<S: Store>(
    store: &Arc<S>,
    controllers: &[NodeId],
    readers: &[NodeId],
) -> Result<Option<DateTime<Utc>>, DispatchError> {
    let mut oldest = None;
    for host in controllers.iter().chain(readers.iter()) {
        if let Some(at) = store
            .oldest_unacked_stop_for_host(host)
            .await
            .map_err(|e| DispatchError::StorageTransient(Box::new(e)))?
        {
            oldest = match oldest {
                Some(existing) if existing <= at => Some(existing),
                _ => Some(at),
            };
        }
    }
    Ok(oldest)
}

/// Post-`stop` run-record closing wait: briefly poll for the controller's
/// ack timestamp, then close the run record with that timestamp, falling
/// back to `now - 1s` if no ack shows up within `cc_start_wait` seconds.
fn spawn_run_close<S: Store + 'static>(
    store: &Arc<S>,
    config: &DispatcherConfig,
    detector: &DetectorId,
    cluster: &ClusterState,
    now: DateTime<Utc>,
    controller_id: Option<dispatcher_store::CommandId>,
    forced: bool,
) {
    let Some(number) = cluster.get(detector).and_then(|s| s.candidate_run_number) else {
        return;
    };
    let store = store.clone();
    let detector = detector.clone();
    let bound = std::time::Duration::from_millis((config.cc_start_wait * 1000.0) as u64);
    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + bound;
        let mut ack: Option<DateTime<Utc>> = None;
        if let Some(id) = controller_id {
            loop {
                match store.ack_time(id).await {
                    Ok(Some(at)) => {
                        ack = Some(at);
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(%detector, error = %e, "failed to poll controller ack time");
                        break;
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
        let end = ack.unwrap_or_else(|| now - chrono::Duration::seconds(1));
        if let Err(e) = store.close_run_record(number, end, forced).await {
            tracing::warn!(%detector, error = %e, "failed to close run record after stop");
        }
    });
}
