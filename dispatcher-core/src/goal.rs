//! Goal resolver: folds the append-only directive stream down to one
//! [`GoalRecord`] per configured detector.

use dispatcher_common::error::DispatchError;
use dispatcher_common::types::{ControlKey, DetectorId, GoalDirective, GoalRecord};
use dispatcher_store::Store;

/// Resolve the current goal for `detector` from the most recent directive
/// per `(detector, field)`.
///
/// Returns [`DispatchError::MissingGoal`] if any key in [`ControlKey::REQUIRED`]
/// has never been written for this detector — the caller must skip the
/// entire tick rather than drive the DAQ on a partial picture.
pub async fn resolve<S: Store>(store: &S, detector: &DetectorId) -> Result<GoalRecord, DispatchError> {
    let directives = store
        .latest_goal_directives(detector, &ControlKey::REQUIRED)
        .await
        .map_err(|e| DispatchError::StorageTransient(Box::new(e)))?;

    let missing = || DispatchError::MissingGoal {
        detector: detector.clone(),
    };
    let get = |key: ControlKey| -> Result<&GoalDirective, DispatchError> {
        directives.get(&key).ok_or_else(missing)
    };

    let active = parse_bool(get(ControlKey::Active)?)?;
    let mode = get(ControlKey::Mode)?.value.clone();
    let stop_after_minutes = parse_optional_i64(get(ControlKey::StopAfter)?)?;
    let user = get(ControlKey::User)?.value.clone();
    let comment = get(ControlKey::Comment)?.value.clone();
    let link_mv = parse_bool(get(ControlKey::LinkMv)?)?;
    let link_nv = parse_bool(get(ControlKey::LinkNv)?)?;
    let softstop = parse_bool(get(ControlKey::Softstop)?)?;

    Ok(GoalRecord {
        active,
        mode,
        stop_after_minutes,
        user,
        comment,
        link_mv,
        link_nv,
        softstop,
    })
}

fn parse_bool(directive: &GoalDirective) -> Result<bool, DispatchError> {
    match directive.value.as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        _ => Ok(directive.value.parse().unwrap_or(false)),
    }
}

fn parse_optional_i64(directive: &GoalDirective) -> Result<Option<i64>, DispatchError> {
    if directive.value.is_empty() {
        return Ok(None);
    }
    Ok(directive.value.parse().ok())
}
