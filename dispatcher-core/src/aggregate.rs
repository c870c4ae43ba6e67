//! Status aggregator: reduces per-node heartbeat rows into one
//! [`AggregateStatus`] per super-detector head.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use dispatcher_common::error::DispatchError;
use dispatcher_common::types::{
    AggregateStatus, DaqStatus, DetectorId, NodeId, NodeStatusRow, RunModeRegistry, RunNumber,
};
use dispatcher_store::Store;
use tracing::warn;

use crate::hypervisor::Hypervisor;
use crate::topology::{well_known, SuperDetectorGroup};

/// Precedence order used by the status reduction: the first status
/// present anywhere in the list wins.
const PRIORITY: [DaqStatus; 4] = [
    DaqStatus::Arming,
    DaqStatus::Error,
    DaqStatus::Timeout,
    DaqStatus::Unknown,
];

fn effective_status(row: Option<&NodeStatusRow>, now: DateTime<Utc>, client_timeout_s: u64) -> DaqStatus {
    let Some(row) = row else {
        return DaqStatus::Unknown;
    };
    let age = now - row.generated_at;
    if age > chrono::Duration::seconds(client_timeout_s as i64) {
        return DaqStatus::Timeout;
    }
    row.status
}

/// Pure reduction step (exposed at crate level so benches can exercise it
/// without pulling in a `Store`).
pub fn reduce_statuses(statuses: &[DaqStatus]) -> DaqStatus {
    for candidate in PRIORITY {
        if statuses.iter().any(|s| *s == candidate) {
            return candidate;
        }
    }
    if !statuses.is_empty() && statuses.iter().all(|s| *s == statuses[0]) {
        return statuses[0];
    }
    DaqStatus::Unknown
}

/// Reduce one super-detector group's node rows into an [`AggregateStatus`],
/// writing the aggregate to the bulletin and firing the timeout-action
/// hook (at most once per tick per host) along the way.
///
/// Returns `Ok(None)` when the controllers disagree on `mode`/`number`
/// (the detector is skipped this tick); the caller logs
/// [`DispatchError::ControllerDisagreement`] itself so this function stays
/// pure with respect to logging policy.
#[allow(clippy::too_many_arguments)]
pub async fn reduce<S: Store, H: Hypervisor>(
    store: &S,
    hypervisor: &H,
    group: &SuperDetectorGroup,
    modes: &RunModeRegistry,
    client_timeout_s: u64,
    timeout_take_action_s: u64,
    ack_timeout_s: u64,
    now: DateTime<Utc>,
    escalated_this_tick: &mut HashSet<NodeId>,
) -> Result<Option<AggregateStatus>, DispatchError> {
    let all_nodes: Vec<NodeId> = group
        .readers
        .iter()
        .chain(group.controllers.iter())
        .cloned()
        .collect();
    let rows = store
        .node_status_rows(&all_nodes)
        .await
        .map_err(|e| DispatchError::StorageTransient(Box::new(e)))?;

    let controller_views: Vec<(&NodeId, Option<&NodeStatusRow>)> = group
        .controllers
        .iter()
        .map(|h| (h, rows.get(h).and_then(Option::as_ref)))
        .collect();

    let mut mode: Option<&str> = None;
    let mut number: Option<i64> = None;
    for (_, row) in &controller_views {
        let Some(row) = row else { continue };
        match mode {
            None => mode = Some(row.mode.as_str()),
            Some(m) if m != row.mode => return Ok(None),
            _ => {}
        }
        match number {
            None => number = Some(row.number),
            Some(n) if n != row.number => return Ok(None),
            _ => {}
        }
    }

    let restricted_readers: Vec<&NodeId> = mode
        .and_then(|m| mode_board_list(modes, m, &group.members))
        .map(|declared| group.readers.iter().filter(|r| declared.contains(r)).collect())
        .unwrap_or_else(|| group.readers.iter().collect());

    let mut statuses = Vec::new();
    let mut rate_sum = 0.0;
    let mut buffer_sum: i64 = 0;
    let mut pll_sum: i64 = 0;

    for host in restricted_readers.iter().chain(group.controllers.iter()) {
        let row = rows.get(*host).and_then(Option::as_ref);
        let status = effective_status(row, now, client_timeout_s);
        statuses.push(status);

        if let Some(row) = row {
            if group.readers.contains(host) {
                rate_sum += row.rate;
                buffer_sum += row.buffer_size;
                pll_sum += row.pll_unlocks.unwrap_or(0);
            }
        }

        maybe_escalate(
            hypervisor,
            store,
            host,
            row,
            status,
            now,
            timeout_take_action_s,
            ack_timeout_s,
            escalated_this_tick,
        )
        .await;
    }

    let status = reduce_statuses(&statuses);
    let aggregate = AggregateStatus {
        status,
        rate: rate_sum,
        buffer: buffer_sum,
        mode: mode.unwrap_or_default().to_string(),
        number: number.map(|n| RunNumber(n.max(0) as u64)),
        pll_unlocks: pll_sum,
        updated_at: now,
    };

    if let Err(e) = store.publish_aggregate(&group.head, &aggregate).await {
        warn!(detector = %group.head, error = %e, "failed to publish aggregate bulletin entry");
    }

    Ok(Some(aggregate))
}

/// The union of board lists `mode` declares for the members
/// of a (possibly linked) super-detector group, if `mode` is a known mode
/// that declares at least one of them. `None` means "no restriction" —
/// either `mode` is absent from the registry entirely, or it declares no
/// board list for any member, in which case the fallback ("otherwise
/// aggregate over all configured nodes") applies.
fn mode_board_list(modes: &RunModeRegistry, mode: &str, members: &[DetectorId]) -> Option<Vec<NodeId>> {
    let def = modes.get(mode)?;
    let mut declared: Vec<NodeId> = Vec::new();
    let mut any = false;
    for m in members {
        if let Some(boards) = def.boards.get(m) {
            any = true;
            for n in boards {
                if !declared.contains(n) {
                    declared.push(n.clone());
                }
            }
        }
    }
    any.then_some(declared)
}

/// The timeout-action hook: escalate a `tpc` node timing out for too
/// long, or carrying an unacknowledged command older than `timeout`
/// seconds, to the hypervisor — exactly once per tick per host.
#[allow(clippy::too_many_arguments)]
async fn maybe_escalate<S: Store, H: Hypervisor>(
    hypervisor: &H,
    store: &S,
    host: &NodeId,
    row: Option<&NodeStatusRow>,
    status: DaqStatus,
    now: DateTime<Utc>,
    timeout_take_action_s: u64,
    ack_timeout_s: u64,
    escalated_this_tick: &mut HashSet<NodeId>,
) {
    if escalated_this_tick.contains(host) {
        return;
    }

    let is_tpc_scope = host.0.contains(well_known::TPC);
    if !is_tpc_scope || status != DaqStatus::Timeout {
        return;
    }

    let timing_out_too_long = row
        .map(|r| now - r.generated_at > chrono::Duration::seconds(timeout_take_action_s as i64))
        .unwrap_or(false);

    let stale_unacked = store
        .oldest_unacked_for_host(host)
        .await
        .ok()
        .flatten()
        .map(|at| now - at > chrono::Duration::seconds(ack_timeout_s as i64))
        .unwrap_or(false);

    if timing_out_too_long || stale_unacked {
        hypervisor.handle_timeout(host).await;
        escalated_this_tick.insert(host.clone());
    }
}
