//! The tick function: wires the goal resolver, topology planner, status
//! aggregator and solver together — goals first, then topology, then
//! aggregation, then the solver — and owns the [`ClusterState`] and
//! [`RateLimitedLogger`] across ticks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dispatcher_common::clock::Clock;
use dispatcher_common::config::DispatcherConfig;
use dispatcher_common::error::DispatchError;
use dispatcher_common::types::{DetectorId, GoalRecord};
use dispatcher_store::Store;
use tracing::debug;

use crate::gate::IssueContext;
use crate::hypervisor::Hypervisor;
use crate::scheduler::SchedulerHandle;
use crate::solver;
use crate::state::ClusterState;
use crate::supervisor::RateLimitedLogger;
use crate::{aggregate, goal, topology};

/// Everything the reconciler needs across its whole lifetime, separate
/// from the per-tick dependencies (`store`, `hypervisor`, `clock`) that a
/// caller may swap between ticks in tests.
pub struct Reconciler {
    pub cluster: ClusterState,
    pub logger: RateLimitedLogger,
}

impl Reconciler {
    pub fn new(detectors: impl IntoIterator<Item = DetectorId>) -> Self {
        Self {
            cluster: ClusterState::new(detectors),
            logger: RateLimitedLogger::new(),
        }
    }

    /// Run one full tick: resolve goals, plan topology, aggregate status,
    /// then drive the solver for every super-detector head. A
    /// `MissingGoal` for any one detector aborts the whole tick — a
    /// partial goal picture is worse than no picture, so nothing in this
    /// tick runs blind.
    pub async fn tick<S: Store + 'static, H: Hypervisor>(
        &mut self,
        store: &Arc<S>,
        clock: &dyn Clock,
        config: &DispatcherConfig,
        scheduler: &SchedulerHandle,
        hypervisor: &H,
    ) -> Result<(), DispatchError> {
        let now = clock.now();
        debug!(tick_at = %now, "reconciler tick starting");

        let mut goals: HashMap<DetectorId, GoalRecord> = HashMap::new();
        for detector in config.master_daq_config.keys() {
            match goal::resolve(store.as_ref(), detector).await {
                Ok(g) => {
                    goals.insert(detector.clone(), g);
                }
                Err(e) => {
                    // A single missing directive skips this whole tick
                    // rather than driving the rest of the cluster blind.
                    self.logger.log(store.as_ref(), &e, now).await;
                    return Ok(());
                }
            }
        }

        let groups = topology::plan(&config.master_daq_config, &goals);
        let mut escalated_this_tick = HashSet::new();

        for group in &groups {
            let Some(g) = goals.get(&group.head) else {
                continue;
            };

            let aggregate = match aggregate::reduce(
                store.as_ref(),
                hypervisor,
                group,
                &config.modes,
                config.client_timeout,
                config.timeout_take_action,
                config.timeout.stop,
                now,
                &mut escalated_this_tick,
            )
            .await
            {
                Ok(Some(agg)) => agg,
                Ok(None) => {
                    self.logger
                        .log(
                            store.as_ref(),
                            &DispatchError::ControllerDisagreement {
                                detector: group.head.clone(),
                            },
                            now,
                        )
                        .await;
                    continue;
                }
                Err(e @ DispatchError::StorageTransient(_)) => return Err(e),
                Err(e) => {
                    self.logger.log(store.as_ref(), &e, now).await;
                    continue;
                }
            };

            let ctx = IssueContext {
                goal: g,
                readers: &group.readers,
                controllers: &group.controllers,
                run_detectors: &group.members,
            };

            solver::reconcile_detector(
                store,
                clock,
                config,
                scheduler,
                hypervisor,
                &mut self.logger,
                &mut self.cluster,
                &group.head,
                g,
                &aggregate,
                ctx,
            )
            .await?;
        }

        Ok(())
    }
}
