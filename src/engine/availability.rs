use std::collections::HashMap;

use crate::model::*;

// ── Slot generation ──────────────────────────────────────────────

/// Tile one schedule block into back-to-back slots of `duration`.
///
/// The first slot starts at `max(block.start, window_start)`; a trailing
/// remainder shorter than `duration` is dropped, so no slot straddles the
/// block's end.
pub fn tile_schedule(block: &Span, window_start: Ms, duration: Ms) -> impl Iterator<Item = Span> {
    let first = block.start.max(window_start);
    let end = block.end;
    let step = duration.max(1);
    (0..)
        .map(move |k: i64| first + k * step)
        .take_while(move |cursor| duration > 0 && cursor + duration <= end)
        .map(move |cursor| Span::new(cursor, cursor + duration))
}

/// Every schedule-anchored candidate, ordered by `(start, employee_id)`.
pub fn candidate_slots(schedules: &[ScheduleRow], window_start: Ms, duration: Ms) -> Vec<AvailableSlot> {
    let mut candidates: Vec<AvailableSlot> = schedules
        .iter()
        .flat_map(|row| {
            tile_schedule(&row.schedule.span, window_start, duration).map(move |span| AvailableSlot {
                span,
                employee_id: row.schedule.employee_id,
                employee_name: row.employee_name.clone(),
            })
        })
        .collect();
    candidates.sort_by_key(|s| (s.span.start, s.employee_id));
    candidates
}

/// Per-employee reservation index: starts sorted ascending, paired with the
/// running maximum end so one binary search answers "does anything overlap".
struct Booked {
    starts: Vec<Ms>,
    max_end: Vec<Ms>,
}

impl Booked {
    fn overlaps(&self, slot: &Span) -> bool {
        // Reservations starting at or after slot.end cannot overlap (half-open).
        let idx = self.starts.partition_point(|&s| s < slot.end);
        idx > 0 && self.max_end[idx - 1] > slot.start
    }
}

fn index_reservations(reservations: &[Reservation]) -> HashMap<EmployeeId, Booked> {
    let mut spans: HashMap<EmployeeId, Vec<Span>> = HashMap::new();
    for r in reservations.iter().filter(|r| r.status.is_live()) {
        spans.entry(r.employee_id).or_default().push(r.span);
    }
    spans
        .into_iter()
        .map(|(employee_id, mut spans)| {
            spans.sort_by_key(|s| s.start);
            let mut running = Ms::MIN;
            let max_end = spans
                .iter()
                .map(|s| {
                    running = running.max(s.end);
                    running
                })
                .collect();
            let starts = spans.iter().map(|s| s.start).collect();
            (employee_id, Booked { starts, max_end })
        })
        .collect()
}

/// Drop candidates overlapping a live reservation of the same employee.
pub fn exclude_reserved(candidates: Vec<AvailableSlot>, reservations: &[Reservation]) -> Vec<AvailableSlot> {
    if reservations.is_empty() {
        return candidates;
    }
    let booked = index_reservations(reservations);
    candidates
        .into_iter()
        .filter(|slot| {
            booked
                .get(&slot.employee_id)
                .is_none_or(|b| !b.overlaps(&slot.span))
        })
        .collect()
}

/// Keep a slot only if it does not overlap an already-kept slot of the same
/// employee. Input must be sorted by start. Exact `(start, employee)`
/// duplicates collapse to one; distinct employees at the same start all stay.
pub fn drop_self_overlaps(sorted: Vec<AvailableSlot>) -> Vec<AvailableSlot> {
    let mut kept_until: HashMap<EmployeeId, Ms> = HashMap::new();
    sorted
        .into_iter()
        .filter(|slot| match kept_until.get(&slot.employee_id) {
            Some(&end) if end > slot.span.start => false,
            _ => {
                kept_until.insert(slot.employee_id, slot.span.end);
                true
            }
        })
        .collect()
}

/// The full pipeline: tile, sort, exclude, dedup, truncate.
pub fn generate_slots(
    schedules: &[ScheduleRow],
    reservations: &[Reservation],
    window_start: Ms,
    duration: Ms,
    limit: usize,
) -> Vec<AvailableSlot> {
    let candidates = candidate_slots(schedules, window_start, duration);
    let mut slots = drop_self_overlaps(exclude_reserved(candidates, reservations));
    slots.truncate(limit);
    slots
}
