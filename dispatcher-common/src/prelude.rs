//! Prelude module for common re-exports.
//!
//! ```rust
//! use dispatcher_common::prelude::*;
//! ```

pub use crate::clock::{Clock, SystemClock};
pub use crate::config::{ConfigError, ConfigLoader, DispatcherConfig};
pub use crate::error::DispatchError;
pub use crate::types::{
    AggregateStatus, CommandKind, CommandRecord, DaqStatus, DetectorId, GoalRecord, NodeId,
    NodeStatusRow, RunNumber,
};
