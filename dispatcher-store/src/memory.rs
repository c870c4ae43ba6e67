//! In-process [`Store`] double used by `dispatcher-core`'s test suite.
//!
//! Mirrors `SledStore`'s semantics exactly (same method contracts) but
//! keeps everything behind a single `std::sync::Mutex`-guarded map, so
//! tests can assert on the exact sequence of commands the gate emitted
//! without touching disk.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatcher_common::error::LogPriority;
use dispatcher_common::types::{
    AggregateStatus, CommandRecord, ControlKey, DetectorId, GoalDirective, NodeId, NodeStatusRow,
    RunNumber, RunRecord,
};

use crate::error::{StoreError, StoreResult};
use crate::store::{CommandId, PendingCommand, Store};

#[derive(Default)]
struct Inner {
    node_status: HashMap<NodeId, NodeStatusRow>,
    aggregates: Vec<(DetectorId, AggregateStatus)>,
    directives: Vec<GoalDirective>,
    next_run_number: u64,
    pending: Vec<PendingCommand>,
    outgoing: HashMap<CommandId, CommandRecord>,
    next_command_id: u64,
    run_records: HashMap<RunNumber, RunRecord>,
    log: Vec<(String, LogPriority, String)>,
}

/// An in-memory [`Store`] implementation. Seed it via [`MemoryStore::seed_node_status`]
/// and [`MemoryStore::seed_goal`] before driving the reconciler in a test.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_node_status(&self, row: NodeStatusRow) {
        let mut inner = self.inner.lock().unwrap();
        inner.node_status.insert(row.host.clone(), row);
    }

    pub fn seed_goal(&self, directive: GoalDirective) {
        let mut inner = self.inner.lock().unwrap();
        inner.directives.push(directive);
    }

    pub fn published_aggregates(&self) -> Vec<(DetectorId, AggregateStatus)> {
        self.inner.lock().unwrap().aggregates.clone()
    }

    pub fn outgoing_commands(&self) -> Vec<CommandRecord> {
        self.inner.lock().unwrap().outgoing.values().cloned().collect()
    }

    pub fn pending_commands(&self) -> Vec<PendingCommand> {
        self.inner.lock().unwrap().pending.clone()
    }

    pub fn logged_errors(&self) -> Vec<(String, LogPriority, String)> {
        self.inner.lock().unwrap().log.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn node_status_rows(
        &self,
        hosts: &[NodeId],
    ) -> StoreResult<HashMap<NodeId, Option<NodeStatusRow>>> {
        let inner = self.inner.lock().unwrap();
        Ok(hosts
            .iter()
            .map(|h| (h.clone(), inner.node_status.get(h).cloned()))
            .collect())
    }

    async fn publish_aggregate(
        &self,
        detector: &DetectorId,
        aggregate: &AggregateStatus,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.aggregates.push((detector.clone(), aggregate.clone()));
        Ok(())
    }

    async fn latest_goal_directives(
        &self,
        detector: &DetectorId,
        keys: &[ControlKey],
    ) -> StoreResult<HashMap<ControlKey, GoalDirective>> {
        let inner = self.inner.lock().unwrap();
        let mut out = HashMap::new();
        for key in keys {
            let latest = inner
                .directives
                .iter()
                .filter(|d| &d.detector == detector && d.field == *key)
                .max_by_key(|d| d.time);
            if let Some(d) = latest {
                out.insert(*key, d.clone());
            }
        }
        Ok(out)
    }

    async fn next_run_number(&self) -> StoreResult<RunNumber> {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.next_run_number;
        inner.next_run_number += 1;
        Ok(RunNumber(n))
    }

    async fn enqueue_pending(
        &self,
        record: CommandRecord,
        fire_at: DateTime<Utc>,
    ) -> StoreResult<CommandId> {
        let mut inner = self.inner.lock().unwrap();
        let id = CommandId(inner.next_command_id);
        inner.next_command_id += 1;
        inner.pending.push(PendingCommand { id, fire_at, record });
        Ok(id)
    }

    async fn due_pending(&self, now: DateTime<Utc>) -> StoreResult<Vec<PendingCommand>> {
        let inner = self.inner.lock().unwrap();
        let mut due: Vec<PendingCommand> = inner
            .pending
            .iter()
            .filter(|p| p.fire_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|p| (p.fire_at, p.id));
        Ok(due)
    }

    async fn publish_outgoing(&self, id: CommandId) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner
            .pending
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("pending command {}", id.0)))?;
        let pending = inner.pending.remove(idx);
        inner.outgoing.insert(id, pending.record);
        Ok(())
    }

    async fn acknowledge(&self, id: CommandId, host: &NodeId, at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .outgoing
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("outgoing command {}", id.0)))?;
        record.acknowledged.insert(host.clone(), Some(at));
        Ok(())
    }

    async fn is_fully_acknowledged(&self, id: CommandId) -> StoreResult<bool> {
        let inner = self.inner.lock().unwrap();
        let record = inner
            .outgoing
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("outgoing command {}", id.0)))?;
        Ok(record.fully_acknowledged())
    }

    async fn oldest_unacked_for_host(&self, host: &NodeId) -> StoreResult<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().unwrap();
        let mut oldest: Option<DateTime<Utc>> = None;
        for record in inner.outgoing.values() {
            if record.acknowledged.get(host) == Some(&None) {
                oldest = match oldest {
                    Some(existing) if existing <= record.created_at => Some(existing),
                    _ => Some(record.created_at),
                };
            }
        }
        Ok(oldest)
    }

    async fn oldest_unacked_stop_for_host(&self, host: &NodeId) -> StoreResult<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().unwrap();
        let mut oldest: Option<DateTime<Utc>> = None;
        for record in inner.outgoing.values() {
            if record.command != dispatcher_common::types::CommandKind::Stop {
                continue;
            }
            if record.acknowledged.get(host) == Some(&None) {
                oldest = match oldest {
                    Some(existing) if existing <= record.created_at => Some(existing),
                    _ => Some(record.created_at),
                };
            }
        }
        Ok(oldest)
    }

    async fn earliest_pending_fire_at(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.pending.iter().map(|p| p.fire_at).min())
    }

    async fn ack_time(&self, id: CommandId) -> StoreResult<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().unwrap();
        let record = inner
            .outgoing
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("outgoing command {}", id.0)))?;
        Ok(record.acknowledged.values().filter_map(|v| *v).min())
    }

    async fn insert_run_record(&self, record: RunRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.run_records.insert(record.number, record);
        Ok(())
    }

    async fn close_run_record(
        &self,
        number: RunNumber,
        end: DateTime<Utc>,
        forced: bool,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .run_records
            .get_mut(&number)
            .ok_or_else(|| StoreError::NotFound(format!("run record {number}")))?;
        record.end = Some(end);
        if forced {
            record.tags.push("_messy".to_string());
        }
        Ok(())
    }

    async fn run_start(&self, number: RunNumber) -> StoreResult<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.run_records.get(&number).map(|r| r.start))
    }

    async fn log_error(&self, message: &str, priority: LogPriority, kind: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .log
            .push((message.to_string(), priority, kind.to_string()));
        Ok(())
    }
}
