//! Timeout & retry supervisor: `check-timeout(d, cmd)` plus the
//! rate-limited error log every tick-level failure flows through.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dispatcher_common::clock::Clock;
use dispatcher_common::config::DispatcherConfig;
use dispatcher_common::error::{DispatchError, LogPriority};
use dispatcher_common::types::{CommandKind, DetectorId};
use dispatcher_store::Store;
use tracing::{debug, error, warn};

use crate::gate::{self, IssueContext};
use crate::hypervisor::Hypervisor;
use crate::scheduler::SchedulerHandle;
use crate::state::ClusterState;
use crate::topology::well_known;

/// Minimum re-emit interval, in minutes, per rate-limit key. A key with
/// no entry here is emitted every tick.
pub const RATE_LIMITS: &[(&str, i64)] = &[("STOP_TIMEOUT", 15)];

fn rate_limit_for(key: &str) -> Option<chrono::Duration> {
    RATE_LIMITS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, minutes)| chrono::Duration::minutes(*minutes))
}

/// The command `check-timeout` should act against — `Auto` resolves to the
/// most recently issued command for the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutTarget {
    Arm,
    Start,
    Auto,
}

/// Per-error-kind last-emit bookkeeping, owned by the reconciler for the
/// process lifetime.
#[derive(Debug, Default)]
pub struct RateLimitedLogger {
    last_emitted: HashMap<&'static str, DateTime<Utc>>,
}

impl RateLimitedLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if an error with this `key` should be emitted now; records the
    /// emission if so. A key with no configured minimum interval is always
    /// emitted (the "every tick" case).
    fn should_emit(&mut self, key: &'static str, now: DateTime<Utc>) -> bool {
        let Some(min_interval) = rate_limit_for(key) else {
            return true;
        };
        match self.last_emitted.get(key) {
            Some(&last) if now - last < min_interval => false,
            _ => {
                self.last_emitted.insert(key, now);
                true
            }
        }
    }

    /// Log `err` at its declared priority, subject to rate limiting, and
    /// best-effort mirror it into the store's log collection.
    pub async fn log<S: Store>(&mut self, store: &S, err: &DispatchError, now: DateTime<Utc>) {
        let key = err.rate_limit_key();
        if !self.should_emit(key, now) {
            return;
        }
        match err.log_priority() {
            LogPriority::Debug => debug!(kind = key, "{err}"),
            LogPriority::Message => tracing::info!(kind = key, "{err}"),
            LogPriority::Warning => warn!(kind = key, "{err}"),
            LogPriority::Error | LogPriority::Fatal => error!(kind = key, "{err}"),
        }
        if let Err(e) = store.log_error(&err.to_string(), err.log_priority(), key).await {
            warn!(error = %e, "failed to mirror error into log collection");
        }
    }
}

/// Call [`gate::issue`], folding any benign gate rejection (`Cooldown`,
/// `ArmBusy`, `AckPending`) into the rate-limited log rather than failing
/// the tick — only [`DispatchError::StorageTransient`] propagates.
pub async fn issue_logged<S: Store + 'static>(
    store: &Arc<S>,
    clock: &dyn Clock,
    config: &DispatcherConfig,
    scheduler: &SchedulerHandle,
    logger: &mut RateLimitedLogger,
    cluster: &mut ClusterState,
    detector: &DetectorId,
    cmd: CommandKind,
    ctx: IssueContext<'_>,
    force: bool,
) -> Result<(), DispatchError> {
    match gate::issue(store, clock, config, scheduler, cluster, detector, cmd, ctx, force).await {
        Ok(()) => Ok(()),
        Err(e @ DispatchError::StorageTransient(_)) => Err(e),
        Err(e) => {
            logger.log(store.as_ref(), &e, clock.now()).await;
            Ok(())
        }
    }
}

/// `check-timeout(d, cmd)`.
///
/// For `stop` the local timeout backs off linearly with
/// `error_stop_count[d]`; exhausting `stop_retries` escalates to the
/// hypervisor's full reset instead of retrying again. For `arm`/`start`,
/// exceeding `max_arm_cycles` on `tpc` does the same.
#[allow(clippy::too_many_arguments)]
pub async fn check_timeout<S: Store + 'static, H: Hypervisor>(
    store: &Arc<S>,
    clock: &dyn Clock,
    config: &DispatcherConfig,
    scheduler: &SchedulerHandle,
    hypervisor: &H,
    logger: &mut RateLimitedLogger,
    cluster: &mut ClusterState,
    detector: &DetectorId,
    ctx: IssueContext<'_>,
    target: TimeoutTarget,
) -> Result<(), DispatchError> {
    let now = clock.now();

    let cmd = match target {
        TimeoutTarget::Arm => CommandKind::Arm,
        TimeoutTarget::Start => CommandKind::Start,
        TimeoutTarget::Auto => {
            let Some(cmd) = most_recently_issued(cluster, detector) else {
                return Ok(());
            };
            cmd
        }
    };

    let state = cluster.entry(detector);
    let Some(dt) = state.since_last(cmd, now) else {
        return Ok(());
    };

    let local_timeout = match cmd {
        CommandKind::Arm => chrono::Duration::seconds(config.timeout.arm as i64),
        CommandKind::Start => chrono::Duration::seconds(config.timeout.start as i64),
        CommandKind::Stop => {
            chrono::Duration::seconds(config.timeout.stop as i64 * (state.error_stop_count as i64 + 1))
        }
    };

    if dt < local_timeout {
        return Ok(());
    }

    match cmd {
        CommandKind::Stop => {
            if state.error_stop_count >= config.stop_retries {
                logger
                    .log(
                        store.as_ref(),
                        &DispatchError::StopTimeout {
                            detector: detector.clone(),
                        },
                        now,
                    )
                    .await;
                hypervisor.tactical_nuclear_option().await;
                cluster.entry(detector).error_stop_count = 0;
            } else {
                issue_logged(store, clock, config, scheduler, logger, cluster, detector, CommandKind::Stop, ctx, false).await?;
                cluster.entry(detector).error_stop_count += 1;
            }
        }
        CommandKind::Arm | CommandKind::Start => {
            let err = if cmd == CommandKind::Arm {
                DispatchError::ArmTimeout {
                    detector: detector.clone(),
                }
            } else {
                DispatchError::StartTimeout {
                    detector: detector.clone(),
                }
            };
            logger.log(store.as_ref(), &err, now).await;

            let state = cluster.entry(detector);
            state.missed_arm_cycles += 1;
            let missed = state.missed_arm_cycles;

            issue_logged(store, clock, config, scheduler, logger, cluster, detector, CommandKind::Stop, ctx, false).await?;

            if missed > config.max_arm_cycles && detector.0 == well_known::TPC {
                hypervisor.tactical_nuclear_option().await;
            }
        }
    }

    Ok(())
}

fn most_recently_issued(cluster: &ClusterState, detector: &DetectorId) -> Option<CommandKind> {
    let state = cluster.get(detector)?;
    state
        .last_command_at
        .iter()
        .max_by_key(|(_, &at)| at)
        .map(|(cmd, _)| *cmd)
}
