//! Persistent [`Store`] implementation backed by an embedded `sled`
//! database.
//!
//! `sled` stands in for the document-collection backend this crate's
//! streams are modelled on; see DESIGN.md for why it was chosen over a
//! hand-rolled substitute.
//!
//! One `sled::Tree` per logical collection. Every value is JSON-encoded;
//! `sled`'s own `generate_id()` provides the monotonic counter used both
//! for [`CommandId`] allocation and for run-number allocation, so each
//! allocation happens exactly once even across restarts.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatcher_common::error::LogPriority;
use dispatcher_common::types::{
    AggregateStatus, CommandRecord, ControlKey, DetectorId, GoalDirective, NodeId, NodeStatusRow,
    RunNumber, RunRecord,
};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::store::{CommandId, PendingCommand, Store};

/// A `sled`-backed [`Store`]. Opens (or creates) one database directory
/// holding all logical collections as separate trees.
pub struct SledStore {
    db: sled::Db,
    node_status: sled::Tree,
    aggregates: sled::Tree,
    directives: sled::Tree,
    run_counter: sled::Tree,
    pending: sled::Tree,
    outgoing: sled::Tree,
    run_records: sled::Tree,
    log: sled::Tree,
}

#[derive(Serialize, Deserialize)]
struct StoredPending {
    fire_at: DateTime<Utc>,
    record: CommandRecord,
}

impl SledStore {
    /// Open (creating if necessary) a sled database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            node_status: db.open_tree("node_status")?,
            aggregates: db.open_tree("aggregate_bulletin")?,
            directives: db.open_tree("goal_directives")?,
            run_counter: db.open_tree("run_counter")?,
            pending: db.open_tree("pending_commands")?,
            outgoing: db.open_tree("outgoing_commands")?,
            run_records: db.open_tree("run_records")?,
            log: db.open_tree("error_log")?,
            db,
        })
    }

    fn command_key(id: CommandId) -> [u8; 8] {
        id.0.to_be_bytes()
    }

    fn run_key(number: RunNumber) -> [u8; 8] {
        number.0.to_be_bytes()
    }
}

#[async_trait]
impl Store for SledStore {
    async fn node_status_rows(
        &self,
        hosts: &[NodeId],
    ) -> StoreResult<HashMap<NodeId, Option<NodeStatusRow>>> {
        let mut out = HashMap::new();
        for host in hosts {
            let row = match self.node_status.get(host.0.as_bytes())? {
                Some(bytes) => Some(serde_json::from_slice::<NodeStatusRow>(&bytes)?),
                None => None,
            };
            out.insert(host.clone(), row);
        }
        Ok(out)
    }

    async fn publish_aggregate(
        &self,
        detector: &DetectorId,
        aggregate: &AggregateStatus,
    ) -> StoreResult<()> {
        let id = self.db.generate_id()?;
        let key = id.to_be_bytes();
        let value = serde_json::to_vec(&(detector, aggregate))?;
        self.aggregates.insert(key, value)?;
        Ok(())
    }

    async fn latest_goal_directives(
        &self,
        detector: &DetectorId,
        keys: &[ControlKey],
    ) -> StoreResult<HashMap<ControlKey, GoalDirective>> {
        let mut latest: HashMap<ControlKey, GoalDirective> = HashMap::new();
        for entry in self.directives.iter() {
            let (_, value) = entry?;
            let directive: GoalDirective = serde_json::from_slice(&value)?;
            if &directive.detector != detector || !keys.contains(&directive.field) {
                continue;
            }
            match latest.get(&directive.field) {
                Some(existing) if existing.time >= directive.time => {}
                _ => {
                    latest.insert(directive.field, directive);
                }
            }
        }
        Ok(latest)
    }

    async fn next_run_number(&self) -> StoreResult<RunNumber> {
        let next = self
            .run_counter
            .update_and_fetch("next", |old| {
                let current = old
                    .map(|bytes| u64::from_be_bytes(bytes.try_into().unwrap_or([0; 8])))
                    .unwrap_or(0);
                Some((current + 1).to_be_bytes().to_vec())
            })?
            .ok_or_else(|| StoreError::CounterUnavailable("run_counter".to_string()))?;
        let value = u64::from_be_bytes(next.as_ref().try_into().map_err(|_| {
            StoreError::CounterUnavailable("run_counter encoding corrupt".to_string())
        })?);
        Ok(RunNumber(value - 1))
    }

    async fn enqueue_pending(
        &self,
        record: CommandRecord,
        fire_at: DateTime<Utc>,
    ) -> StoreResult<CommandId> {
        let raw_id = self.db.generate_id()?;
        let id = CommandId(raw_id);
        let stored = StoredPending { fire_at, record };
        self.pending
            .insert(Self::command_key(id), serde_json::to_vec(&stored)?)?;
        Ok(id)
    }

    async fn due_pending(&self, now: DateTime<Utc>) -> StoreResult<Vec<PendingCommand>> {
        let mut due = Vec::new();
        for entry in self.pending.iter() {
            let (key, value) = entry?;
            let id = CommandId(u64::from_be_bytes(
                key.as_ref()
                    .try_into()
                    .map_err(|_| StoreError::NotFound("malformed pending key".to_string()))?,
            ));
            let stored: StoredPending = serde_json::from_slice(&value)?;
            if stored.fire_at <= now {
                due.push(PendingCommand {
                    id,
                    fire_at: stored.fire_at,
                    record: stored.record,
                });
            }
        }
        due.sort_by_key(|p| (p.fire_at, p.id));
        Ok(due)
    }

    async fn publish_outgoing(&self, id: CommandId) -> StoreResult<()> {
        let key = Self::command_key(id);
        let Some(bytes) = self.pending.remove(key)? else {
            // Already published by a previous (possibly retried) call.
            return Ok(());
        };
        let stored: StoredPending = serde_json::from_slice(&bytes)?;
        self.outgoing
            .insert(key, serde_json::to_vec(&stored.record)?)?;
        Ok(())
    }

    async fn acknowledge(&self, id: CommandId, host: &NodeId, at: DateTime<Utc>) -> StoreResult<()> {
        let key = Self::command_key(id);
        let bytes = self
            .outgoing
            .get(key)?
            .ok_or_else(|| StoreError::NotFound(format!("outgoing command {}", id.0)))?;
        let mut record: CommandRecord = serde_json::from_slice(&bytes)?;
        record.acknowledged.insert(host.clone(), Some(at));
        self.outgoing.insert(key, serde_json::to_vec(&record)?)?;
        Ok(())
    }

    async fn is_fully_acknowledged(&self, id: CommandId) -> StoreResult<bool> {
        let key = Self::command_key(id);
        let bytes = self
            .outgoing
            .get(key)?
            .ok_or_else(|| StoreError::NotFound(format!("outgoing command {}", id.0)))?;
        let record: CommandRecord = serde_json::from_slice(&bytes)?;
        Ok(record.fully_acknowledged())
    }

    async fn oldest_unacked_for_host(&self, host: &NodeId) -> StoreResult<Option<DateTime<Utc>>> {
        let mut oldest = None;
        for entry in self.outgoing.iter() {
            let (_, value) = entry?;
            let record: CommandRecord = serde_json::from_slice(&value)?;
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
        let mut oldest = None;
        for entry in self.outgoing.iter() {
            let (_, value) = entry?;
            let record: CommandRecord = serde_json::from_slice(&value)?;
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
        let mut earliest = None;
        for entry in self.pending.iter() {
            let (_, value) = entry?;
            let stored: StoredPending = serde_json::from_slice(&value)?;
            earliest = match earliest {
                Some(existing) if existing <= stored.fire_at => Some(existing),
                _ => Some(stored.fire_at),
            };
        }
        Ok(earliest)
    }

    async fn ack_time(&self, id: CommandId) -> StoreResult<Option<DateTime<Utc>>> {
        let key = Self::command_key(id);
        let bytes = self
            .outgoing
            .get(key)?
            .ok_or_else(|| StoreError::NotFound(format!("outgoing command {}", id.0)))?;
        let record: CommandRecord = serde_json::from_slice(&bytes)?;
        Ok(record.acknowledged.values().filter_map(|v| *v).min())
    }

    async fn insert_run_record(&self, record: RunRecord) -> StoreResult<()> {
        let key = Self::run_key(record.number);
        self.run_records.insert(key, serde_json::to_vec(&record)?)?;
        Ok(())
    }

    async fn close_run_record(
        &self,
        number: RunNumber,
        end: DateTime<Utc>,
        forced: bool,
    ) -> StoreResult<()> {
        let key = Self::run_key(number);
        let bytes = self
            .run_records
            .get(key)?
            .ok_or_else(|| StoreError::NotFound(format!("run record {number}")))?;
        let mut record: RunRecord = serde_json::from_slice(&bytes)?;
        record.end = Some(end);
        if forced {
            record.tags.push("_messy".to_string());
        }
        self.run_records.insert(key, serde_json::to_vec(&record)?)?;
        Ok(())
    }

    async fn run_start(&self, number: RunNumber) -> StoreResult<Option<DateTime<Utc>>> {
        let key = Self::run_key(number);
        match self.run_records.get(key)? {
            Some(bytes) => {
                let record: RunRecord = serde_json::from_slice(&bytes)?;
                Ok(Some(record.start))
            }
            None => Ok(None),
        }
    }

    async fn log_error(&self, message: &str, priority: LogPriority, kind: &str) -> StoreResult<()> {
        let id = self.db.generate_id()?;
        let entry = (message.to_string(), format!("{priority:?}"), kind.to_string());
        self.log.insert(id.to_be_bytes(), serde_json::to_vec(&entry)?)?;
        Ok(())
    }
}
