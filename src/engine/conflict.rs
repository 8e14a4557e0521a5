use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(super) fn validation(msg: impl Into<String>) -> EngineError {
    EngineError::Validation(msg.into())
}

pub(crate) fn validate_timestamp_range(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(validation("timestamp out of range"));
    }
    Ok(())
}

/// Boundary checks for a reservation interval: ordered, in range, not in the past.
pub(crate) fn validate_request_span(start: Ms, end: Ms, now: Ms) -> Result<Span, EngineError> {
    let span = Span::checked(start, end).ok_or_else(|| validation("end_ts must be after start_ts"))?;
    validate_timestamp_range(&span)?;
    if span.start < now {
        return Err(validation("start_ts must not be in the past"));
    }
    Ok(span)
}

/// Resolve the defaults of a slot query into a concrete window and limit.
pub(crate) fn resolve_slot_window(query: &SlotQuery, now: Ms) -> Result<(Span, usize), EngineError> {
    if query.service_id <= 0 {
        return Err(validation("service_id must be positive"));
    }
    if let Some(start) = query.start
        && start < now
    {
        return Err(validation("start_ts must not be in the past"));
    }
    let start = query.start.unwrap_or(now);
    let end = query.end.unwrap_or(start + DEFAULT_QUERY_WINDOW_MS);
    let window = Span::checked(start, end).ok_or_else(|| validation("end_ts must be after start_ts"))?;
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(validation("query window must not exceed 90 days"));
    }
    validate_timestamp_range(&window)?;

    let limit = query.limit.unwrap_or(DEFAULT_SLOT_LIMIT);
    if limit == 0 || limit > MAX_SLOT_LIMIT {
        return Err(validation(format!("limit must be between 1 and {MAX_SLOT_LIMIT}")));
    }
    Ok((window, limit))
}

/// The interval must be exactly one service duration long.
pub(crate) fn check_duration(span: &Span, service: &Service) -> Result<(), EngineError> {
    if span.duration_ms() == service.duration_ms() {
        return Ok(());
    }
    let actual_minutes = (span.duration_ms() + MINUTE_MS / 2) / MINUTE_MS;
    Err(validation(format!(
        "duration mismatch: expected {} minutes, got {actual_minutes}",
        service.duration_minutes
    )))
}

/// Half-open overlap against the employee's live reservations.
pub(crate) fn check_no_conflict(span: &Span, live: &[Reservation]) -> Result<(), EngineError> {
    match live
        .iter()
        .find(|r| r.status.is_live() && r.span.overlaps(span))
    {
        Some(r) => Err(EngineError::Conflict(format!(
            "employee already booked by reservation {}",
            r.id
        ))),
        None => Ok(()),
    }
}

/// The interval must fit inside one schedule block. Grid alignment is not required.
pub(crate) fn check_within_schedule(span: &Span, schedules: &[ScheduleRow]) -> Result<(), EngineError> {
    if schedules.iter().any(|row| row.schedule.span.contains_span(span)) {
        Ok(())
    } else {
        Err(validation("employee not available: outside schedule"))
    }
}

/// Who may move a reservation to which status.
///
/// Only `New` reservations change status. The owner or an admin may cancel;
/// completing is reserved to admins.
pub(crate) fn check_transition(
    reservation: &Reservation,
    next: ReservationStatus,
    principal: &Principal,
) -> Result<(), EngineError> {
    if !principal.is_admin && reservation.user_id != principal.user_id {
        return Err(EngineError::Forbidden(format!(
            "reservation {} belongs to another user",
            reservation.id
        )));
    }
    match (reservation.status, next) {
        (ReservationStatus::New, ReservationStatus::Cancelled) => Ok(()),
        (ReservationStatus::New, ReservationStatus::Completed) if principal.is_admin => Ok(()),
        (ReservationStatus::New, ReservationStatus::Completed) => Err(EngineError::Forbidden(
            "only an administrator may complete a reservation".into(),
        )),
        (from, to) => Err(validation(format!("cannot change status from {from} to {to}"))),
    }
}
