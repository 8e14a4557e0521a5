mod commit;
mod memory;

pub use memory::{InMemoryStore, SharedEmployeeBook};

use async_trait::async_trait;

use crate::model::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A live reservation for the same employee already covers part of the interval.
    #[error("overlaps reservation {0}")]
    Overlap(ReservationId),
    #[error("overlaps schedule {0}")]
    ScheduleOverlap(ScheduleId),
    #[error("duplicate {0}")]
    Duplicate(String),
    #[error("{0} not found")]
    NotFound(String),
    /// The reservation's status moved on since the caller looked at it.
    #[error("reservation {id} is {actual}, cannot become {requested}")]
    StatusChanged {
        id: ReservationId,
        actual: ReservationStatus,
        requested: ReservationStatus,
    },
    #[error("journal error: {0}")]
    Journal(String),
}

/// Typed access to the relations the engine reads and writes.
///
/// Range reads use inclusive bounds on both ends (`start <= window.end AND
/// end >= window.start`); callers narrow with the half-open overlap test.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn find_service(&self, id: ServiceId) -> Result<Option<Service>, StoreError>;

    async fn list_services(&self) -> Result<Vec<Service>, StoreError>;

    async fn find_employee(&self, id: EmployeeId) -> Result<Option<Employee>, StoreError>;

    /// The vehicle with this plate, only if it belongs to `user_id`.
    async fn find_vehicle_owned_by(
        &self,
        license_plate: &str,
        user_id: &str,
    ) -> Result<Option<Vehicle>, StoreError>;

    async fn list_vehicles_for_user(&self, user_id: &str) -> Result<Vec<Vehicle>, StoreError>;

    /// Schedules touching `window`, joined with the employee name.
    /// `employee_id` narrows the fetch to one employee.
    async fn list_schedules_in_range(
        &self,
        window: Span,
        employee_id: Option<EmployeeId>,
    ) -> Result<Vec<ScheduleRow>, StoreError>;

    /// Non-cancelled reservations touching `window`.
    async fn list_reservations_in_range(
        &self,
        window: Span,
        employee_id: Option<EmployeeId>,
    ) -> Result<Vec<Reservation>, StoreError>;

    async fn find_reservation(&self, id: ReservationId) -> Result<Option<Reservation>, StoreError>;

    async fn list_reservations_for_user(&self, user_id: &str) -> Result<Vec<Reservation>, StoreError>;

    /// Insert with status `New`. Must fail with [`StoreError::Overlap`] when a live
    /// reservation for the same employee overlaps, checked atomically with the write.
    async fn insert_reservation(&self, new: NewReservation) -> Result<Reservation, StoreError>;

    /// Compare-and-set: applies `status` only while the reservation is still
    /// `expected`, otherwise fails with [`StoreError::StatusChanged`].
    async fn update_reservation_status(
        &self,
        id: ReservationId,
        expected: ReservationStatus,
        status: ReservationStatus,
    ) -> Result<Reservation, StoreError>;

    async fn upsert_service(&self, service: Service) -> Result<(), StoreError>;

    async fn upsert_employee(&self, employee: Employee) -> Result<(), StoreError>;

    /// Fails with [`StoreError::ScheduleOverlap`] if the block overlaps another
    /// block of the same employee.
    async fn insert_schedule(
        &self,
        employee_id: EmployeeId,
        span: Span,
    ) -> Result<EmployeeSchedule, StoreError>;

    async fn delete_schedule(&self, id: ScheduleId) -> Result<EmployeeSchedule, StoreError>;

    /// Fails with [`StoreError::Duplicate`] if the plate is already registered.
    async fn register_vehicle(&self, vehicle: Vehicle) -> Result<(), StoreError>;
}
