use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::timerange;

use super::{ConflictReason, EngineError};

pub(crate) fn validate_span(span: Option<Span>) -> Result<Span, EngineError> {
    let span = span.ok_or(EngineError::Validation("time range is required"))?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::Validation("timestamp out of range"));
    }
    let duration = timerange::duration(&span)
        .ok_or(EngineError::Validation("time range must end after it starts"))?;
    if duration > MAX_SPAN_DURATION_MS {
        return Err(EngineError::Validation("time range longer than a day"));
    }
    Ok(span)
}

pub(crate) fn validate_name(name: Option<&str>) -> Result<String, EngineError> {
    let name = name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or(EngineError::Validation("name is required"))?;
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::Validation("name too long"));
    }
    Ok(name.to_string())
}

pub(crate) fn validate_avatar(avatar: Option<&str>) -> Result<Option<String>, EngineError> {
    match avatar {
        Some(a) if a.len() > MAX_AVATAR_LEN => Err(EngineError::Validation("avatar too long")),
        Some(a) => Ok(Some(a.to_string())),
        None => Ok(None),
    }
}

fn any_overlap(span: &Span, classes: &[Class], exclude: Option<Ulid>) -> bool {
    classes
        .iter()
        .filter(|c| Some(c.id) != exclude)
        .any(|c| timerange::overlaps(&c.span, span))
}

/// Schedule check for one account: the classes it booked as a student are
/// checked first, then the classes it teaches. `exclude` skips the class
/// being edited or booked.
pub(crate) fn check_schedule(
    span: &Span,
    taught: &[Class],
    booked: &[Class],
    exclude: Option<Ulid>,
) -> Result<(), ConflictReason> {
    if any_overlap(span, booked, exclude) {
        return Err(ConflictReason::StudentSchedule);
    }
    if any_overlap(span, taught, exclude) {
        return Err(ConflictReason::TeacherSchedule);
    }
    Ok(())
}

// ── State guards ─────────────────────────────────────────────────
//
// Each guard is re-run on the record the store reports when a conditional
// write loses, so the caller sees the reason that applies now.

pub(crate) fn editable(class: &Class) -> Result<(), EngineError> {
    if class.is_completed {
        return Err(EngineError::Conflict(ConflictReason::AlreadyCompleted));
    }
    Ok(())
}

pub(crate) fn bookable(class: &Class) -> Result<(), EngineError> {
    editable(class)?;
    if class.is_booked() {
        return Err(EngineError::Conflict(ConflictReason::AlreadyBooked));
    }
    Ok(())
}

pub(crate) fn completable(class: &Class) -> Result<(), EngineError> {
    editable(class)?;
    if !class.is_booked() {
        return Err(EngineError::Conflict(ConflictReason::NotBooked));
    }
    Ok(())
}

pub(crate) fn commentable(class: &Class) -> Result<(), EngineError> {
    if !class.is_completed {
        return Err(EngineError::Conflict(ConflictReason::NotCompleted));
    }
    if class.is_commented {
        return Err(EngineError::Conflict(ConflictReason::AlreadyCommented));
    }
    Ok(())
}
