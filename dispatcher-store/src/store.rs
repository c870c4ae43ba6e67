//! The [`Store`] trait: the dispatcher's only window onto the external
//! world.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatcher_common::error::LogPriority;
use dispatcher_common::types::{
    AggregateStatus, CommandRecord, ControlKey, DetectorId, GoalDirective, NodeId, NodeStatusRow,
    RunNumber, RunRecord,
};

use crate::error::StoreResult;

/// Opaque identifier for a record in the pending/outgoing command areas,
/// analogous to a document store's `ObjectId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

/// A command record together with the time at which the delayed scheduler
/// should release it into the outgoing stream.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub id: CommandId,
    pub fire_at: DateTime<Utc>,
    pub record: CommandRecord,
}

/// Async trait over the dispatcher's four logical external streams.
///
/// Every method returns [`crate::StoreError`] rather than panicking; the
/// caller (`dispatcher-core`) is responsible for turning a failure into a
/// skipped tick or a refused command.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read the most recent heartbeat row for each requested host. A
    /// missing or malformed row is represented as `None` in the returned
    /// map rather than an error — the aggregator folds that into
    /// `DaqStatus::Unknown`.
    async fn node_status_rows(
        &self,
        hosts: &[NodeId],
    ) -> StoreResult<HashMap<NodeId, Option<NodeStatusRow>>>;

    /// Append a timestamped copy of a detector's aggregate status to the
    /// bulletin. Failure here is logged but must not abort the tick —
    /// callers should not `?` this without catching it.
    async fn publish_aggregate(
        &self,
        detector: &DetectorId,
        aggregate: &AggregateStatus,
    ) -> StoreResult<()>;

    /// Read the most recent directive for each of `keys` on `detector`.
    /// Keys absent from the returned map mean no directive has ever been
    /// written for that `(detector, field)` pair — the goal resolver turns
    /// that into `DispatchError::MissingGoal`.
    async fn latest_goal_directives(
        &self,
        detector: &DetectorId,
        keys: &[ControlKey],
    ) -> StoreResult<HashMap<ControlKey, GoalDirective>>;

    /// Atomically allocate the next run number. Implementations must
    /// guarantee this never returns the same value twice.
    async fn next_run_number(&self) -> StoreResult<RunNumber>;

    /// Enqueue a command record into the pending area, to be released by
    /// the delayed scheduler no earlier than `fire_at`.
    async fn enqueue_pending(
        &self,
        record: CommandRecord,
        fire_at: DateTime<Utc>,
    ) -> StoreResult<CommandId>;

    /// Return every pending command whose `fire_at` is at or before `now`,
    /// in `(fire_at, insertion order)` order, without removing them.
    async fn due_pending(&self, now: DateTime<Utc>) -> StoreResult<Vec<PendingCommand>>;

    /// Move a pending command into the outgoing stream and drop it from
    /// the pending area. Must be idempotent if called twice with the same
    /// id (the scheduler may retry after a transient failure).
    async fn publish_outgoing(&self, id: CommandId) -> StoreResult<()>;

    /// Record that `host` has acknowledged the outgoing command `id` at
    /// `at`. Readers/controllers are the only real-world callers of this;
    /// tests call it directly to simulate an ack.
    async fn acknowledge(&self, id: CommandId, host: &NodeId, at: DateTime<Utc>) -> StoreResult<()>;

    /// True iff every recipient of outgoing command `id` has acknowledged.
    async fn is_fully_acknowledged(&self, id: CommandId) -> StoreResult<bool>;

    /// The timestamp of the most recent *unacknowledged* command sent to
    /// `host`, if any — feeds the aggregator's timeout-action hook. Looks
    /// at every outgoing command kind, not just `stop`.
    async fn oldest_unacked_for_host(&self, host: &NodeId) -> StoreResult<Option<DateTime<Utc>>>;

    /// The timestamp of the most recent unacknowledged *`stop`* sent to
    /// `host`, if any — feeds the gate's `AckPending` precondition, which
    /// cares only about a prior `stop` still in flight, not an unrelated
    /// unacked `arm`/`start`.
    async fn oldest_unacked_stop_for_host(&self, host: &NodeId) -> StoreResult<Option<DateTime<Utc>>>;

    /// The earliest `fire_at` among every pending command not yet
    /// released, regardless of whether it is due yet — lets the delayed
    /// scheduler sleep until the next real deadline instead of polling.
    async fn earliest_pending_fire_at(&self) -> StoreResult<Option<DateTime<Utc>>>;

    /// The crate controller's acknowledgement time for outgoing command
    /// `id`, if it has been stamped yet.
    async fn ack_time(&self, id: CommandId) -> StoreResult<Option<DateTime<Utc>>>;

    /// Insert a new run record at `start`, on successful `start`.
    async fn insert_run_record(&self, record: RunRecord) -> StoreResult<()>;

    /// Stamp `end` on the run record for `number`, on `stop` ack. `forced`
    /// tags the record as a forced rather than a clean stop.
    async fn close_run_record(
        &self,
        number: RunNumber,
        end: DateTime<Utc>,
        forced: bool,
    ) -> StoreResult<()>;

    /// The `start` time of run `number`, if the record exists — used by
    /// the solver's turnover check.
    async fn run_start(&self, number: RunNumber) -> StoreResult<Option<DateTime<Utc>>>;

    /// Append a log-collection entry. Rate limiting happens above this
    /// call, in `dispatcher-core::supervisor`; this method always writes.
    async fn log_error(&self, message: &str, priority: LogPriority, kind: &str) -> StoreResult<()>;
}
