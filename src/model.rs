use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use crate::limits::MINUTE_MS;

/// Unix milliseconds. The only time type inside the engine.
pub type Ms = i64;

pub type ServiceId = i64;
pub type EmployeeId = Uuid;
pub type ReservationId = Ulid;
pub type ScheduleId = Ulid;
/// Opaque id handed over by the authentication layer.
pub type UserId = String;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Half-open overlap: touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Closed-bound intersection used for range fetches: touching endpoints count.
    pub fn touches(&self, other: &Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Reference data ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub description: Option<String>,
    /// Single source of truth for slot length.
    pub duration_minutes: u32,
}

impl Service {
    pub fn duration_ms(&self) -> Ms {
        Ms::from(self.duration_minutes) * MINUTE_MS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub id: EmployeeId,
    pub name: String,
}

/// One contiguous work block in which an employee may be booked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployeeSchedule {
    pub id: ScheduleId,
    pub employee_id: EmployeeId,
    pub span: Span,
}

/// Schedule joined with the employee's display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRow {
    pub schedule: EmployeeSchedule,
    pub employee_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub license_plate: String,
    pub user_id: UserId,
    pub brand: String,
    pub model: String,
    pub production_year: i32,
    pub vin: Option<String>,
    pub car_type: Option<String>,
}

/// Plates are compared trimmed and upper-cased.
pub fn normalize_plate(plate: &str) -> String {
    plate.trim().to_uppercase()
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    New,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::New => "New",
            ReservationStatus::Cancelled => "Cancelled",
            ReservationStatus::Completed => "Completed",
        }
    }

    /// Live reservations occupy their employee's time.
    pub fn is_live(&self) -> bool {
        !matches!(self, ReservationStatus::Cancelled)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(ReservationStatus::New),
            "cancelled" | "canceled" => Ok(ReservationStatus::Cancelled),
            "completed" => Ok(ReservationStatus::Completed),
            other => Err(format!("unknown reservation status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    /// The user who created the reservation.
    pub user_id: UserId,
    pub service_id: ServiceId,
    pub vehicle_license_plate: String,
    pub employee_id: EmployeeId,
    pub span: Span,
    pub status: ReservationStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub recommendation_text: String,
}

/// Validated fields handed to the store; id and timestamps are assigned on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub user_id: UserId,
    pub service_id: ServiceId,
    pub vehicle_license_plate: String,
    pub employee_id: EmployeeId,
    pub span: Span,
    pub recommendation_text: String,
}

/// Reservation joined with service and employee columns for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationView {
    pub reservation: Reservation,
    pub service_name: String,
    pub service_duration_minutes: u32,
    pub employee_name: String,
}

impl ReservationView {
    pub fn new(reservation: Reservation, service: &Service, employee: &Employee) -> Self {
        Self {
            reservation,
            service_name: service.name.clone(),
            service_duration_minutes: service.duration_minutes,
            employee_name: employee.name.clone(),
        }
    }
}

/// Derived, never persisted. Identity is `(span.start, employee_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableSlot {
    pub span: Span,
    pub employee_id: EmployeeId,
    pub employee_name: String,
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotQuery {
    pub service_id: ServiceId,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub limit: Option<usize>,
}

impl SlotQuery {
    pub fn for_service(service_id: ServiceId) -> Self {
        Self {
            service_id,
            start: None,
            end: None,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReservationRequest {
    pub service_id: ServiceId,
    pub vehicle_license_plate: String,
    pub employee_id: EmployeeId,
    pub start: Ms,
    pub end: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVehicle {
    pub license_plate: String,
    pub brand: String,
    pub model: String,
    pub production_year: i32,
    pub vin: Option<String>,
    pub car_type: Option<String>,
}

/// Who is asking. Supplied by the authentication layer, trusted as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub is_admin: bool,
}

impl Principal {
    pub fn customer(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin: false,
        }
    }

    pub fn admin(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin: true,
        }
    }
}

// ── Per-employee state ───────────────────────────────────────────

/// Everything the store keeps for one employee: work blocks and reservations,
/// both sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct EmployeeBook {
    pub employee: Employee,
    pub schedules: Vec<EmployeeSchedule>,
    pub reservations: Vec<Reservation>,
}

impl EmployeeBook {
    pub fn new(employee: Employee) -> Self {
        Self {
            employee,
            schedules: Vec::new(),
            reservations: Vec::new(),
        }
    }

    pub fn insert_schedule(&mut self, schedule: EmployeeSchedule) {
        let pos = self
            .schedules
            .partition_point(|s| s.span.start <= schedule.span.start);
        self.schedules.insert(pos, schedule);
    }

    pub fn remove_schedule(&mut self, id: ScheduleId) -> Option<EmployeeSchedule> {
        let pos = self.schedules.iter().position(|s| s.id == id)?;
        Some(self.schedules.remove(pos))
    }

    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation_mut(&mut self, id: ReservationId) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Schedules intersecting `window` with inclusive bounds (superset fetch).
    pub fn schedules_touching(&self, window: &Span) -> impl Iterator<Item = &EmployeeSchedule> {
        let right_bound = self
            .schedules
            .partition_point(|s| s.span.start <= window.end);
        self.schedules[..right_bound]
            .iter()
            .filter(move |s| s.span.end >= window.start)
    }

    /// Non-cancelled reservations intersecting `window` with inclusive bounds.
    pub fn live_reservations_touching(&self, window: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start <= window.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end >= window.start && r.status.is_live())
    }

    /// First non-cancelled reservation overlapping `span` (half-open).
    pub fn live_overlap(&self, span: &Span) -> Option<&Reservation> {
        self.live_reservations_touching(span)
            .find(|r| r.span.overlaps(span))
    }

    /// First own schedule block overlapping `span` (half-open).
    pub fn schedule_overlap(&self, span: &Span) -> Option<&EmployeeSchedule> {
        self.schedules_touching(span).find(|s| s.span.overlaps(span))
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// The WAL record format. Every store mutation is one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceUpserted(Service),
    EmployeeUpserted(Employee),
    ScheduleAdded(EmployeeSchedule),
    ScheduleRemoved {
        id: ScheduleId,
        employee_id: EmployeeId,
    },
    VehicleRegistered(Vehicle),
    ReservationCreated(Reservation),
    ReservationStatusChanged {
        id: ReservationId,
        employee_id: EmployeeId,
        status: ReservationStatus,
        updated_at: Ms,
    },
}

// ── Timestamps ───────────────────────────────────────────────────

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Accepts RFC 3339 / ISO-8601 (`2040-06-04T09:00:00Z`) or integer Unix milliseconds.
pub fn parse_timestamp(s: &str) -> Option<Ms> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<Ms>() {
        return Some(ms);
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}

/// RFC 3339 in UTC with millisecond precision.
pub fn format_timestamp(ms: Ms) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => ms.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn employee() -> Employee {
        Employee {
            id: Uuid::new_v4(),
            name: "Marta".into(),
        }
    }

    fn reservation(book: &EmployeeBook, start: Ms, end: Ms, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            user_id: "u1".into(),
            service_id: 1,
            vehicle_license_plate: "WX1234".into(),
            employee_id: book.employee.id,
            span: Span::new(start, end),
            status,
            created_at: 0,
            updated_at: 0,
            recommendation_text: String::new(),
        }
    }

    fn schedule(book: &EmployeeBook, start: Ms, end: Ms) -> EmployeeSchedule {
        EmployeeSchedule {
            id: Ulid::new(),
            employee_id: book.employee.id,
            span: Span::new(start, end),
        }
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(a.touches(&c)); // but touching for range fetches
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        let inner = Span::new(150, 300);
        let partial = Span::new(50, 200);
        assert!(outer.contains_span(&inner));
        assert!(outer.contains_span(&outer)); // self-containment
        assert!(!outer.contains_span(&partial));
    }

    #[test]
    fn span_checked_rejects_empty() {
        assert!(Span::checked(10, 10).is_none());
        assert!(Span::checked(20, 10).is_none());
        assert_eq!(Span::checked(10, 20), Some(Span::new(10, 20)));
    }

    #[test]
    fn service_duration_in_ms() {
        let s = Service {
            id: 1,
            name: "Oil change".into(),
            description: None,
            duration_minutes: 30,
        };
        assert_eq!(s.duration_ms(), 30 * 60_000);
    }

    #[test]
    fn status_parse_and_display() {
        assert_eq!("cancelled".parse::<ReservationStatus>(), Ok(ReservationStatus::Cancelled));
        assert_eq!("Canceled".parse::<ReservationStatus>(), Ok(ReservationStatus::Cancelled));
        assert_eq!(" Completed ".parse::<ReservationStatus>(), Ok(ReservationStatus::Completed));
        assert!("archived".parse::<ReservationStatus>().is_err());
        assert_eq!(ReservationStatus::New.to_string(), "New");
        assert!(ReservationStatus::Completed.is_live());
        assert!(!ReservationStatus::Cancelled.is_live());
    }

    #[test]
    fn book_keeps_reservations_sorted() {
        let mut book = EmployeeBook::new(employee());
        for (s, e) in [(300, 400), (100, 200), (200, 300)] {
            let r = reservation(&book, s, e, ReservationStatus::New);
            book.insert_reservation(r);
        }
        let starts: Vec<Ms> = book.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn book_live_overlap_ignores_cancelled() {
        let mut book = EmployeeBook::new(employee());
        let cancelled = reservation(&book, 100, 200, ReservationStatus::Cancelled);
        book.insert_reservation(cancelled);
        assert!(book.live_overlap(&Span::new(150, 250)).is_none());

        let live = reservation(&book, 100, 200, ReservationStatus::Completed);
        let live_id = live.id;
        book.insert_reservation(live);
        assert_eq!(book.live_overlap(&Span::new(150, 250)).map(|r| r.id), Some(live_id));
    }

    #[test]
    fn book_live_overlap_adjacent_not_included() {
        let mut book = EmployeeBook::new(employee());
        let r = reservation(&book, 100, 200, ReservationStatus::New);
        book.insert_reservation(r);
        assert!(book.live_overlap(&Span::new(200, 300)).is_none());
        assert!(book.live_overlap(&Span::new(0, 100)).is_none());
        assert!(book.live_overlap(&Span::new(199, 300)).is_some());
    }

    #[test]
    fn book_touching_is_inclusive() {
        let mut book = EmployeeBook::new(employee());
        let s = schedule(&book, 100, 200);
        book.insert_schedule(s);
        let far = schedule(&book, 1000, 1100);
        book.insert_schedule(far);
        assert_eq!(book.schedules_touching(&Span::new(200, 300)).count(), 1);
        assert_eq!(book.schedules_touching(&Span::new(0, 100)).count(), 1);
        assert_eq!(book.schedules_touching(&Span::new(201, 999)).count(), 0);
        assert_eq!(book.schedules_touching(&Span::new(0, 5000)).count(), 2);
    }

    #[test]
    fn book_remove_schedule() {
        let mut book = EmployeeBook::new(employee());
        let s = schedule(&book, 100, 200);
        let id = s.id;
        book.insert_schedule(s);
        assert!(book.remove_schedule(Ulid::new()).is_none());
        assert_eq!(book.remove_schedule(id).map(|s| s.id), Some(id));
        assert!(book.schedules.is_empty());
    }

    #[test]
    fn plate_normalization() {
        assert_eq!(normalize_plate("  wx 1234a "), "WX 1234A");
    }

    #[test]
    fn timestamp_parse_formats() {
        assert_eq!(parse_timestamp("2040-06-04T09:00:00Z"), Some(2_222_413_200_000));
        assert_eq!(parse_timestamp("2040-06-04T11:00:00+02:00"), Some(2_222_413_200_000));
        assert_eq!(parse_timestamp("2222413200000"), Some(2_222_413_200_000));
        assert_eq!(parse_timestamp("next tuesday"), None);
    }

    #[test]
    fn timestamp_format_is_utc_millis() {
        assert_eq!(format_timestamp(2_222_413_200_000), "2040-06-04T09:00:00.000Z");
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::EmployeeUpserted(employee());
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
