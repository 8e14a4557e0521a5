use std::collections::HashMap;

use tracing::debug;

use crate::model::*;
use crate::observability::SLOTS_RETURNED;

use super::availability::generate_slots;
use super::conflict::resolve_slot_window;
use super::{Engine, EngineError};

impl Engine {
    /// Bookable slots for a service, sorted by start time.
    ///
    /// Schedules are fetched with inclusive bounds over the window and
    /// reservations over the blocks they cover; tiling, exclusion and
    /// per-employee dedup narrow them down.
    pub async fn available_slots(&self, query: &SlotQuery) -> Result<Vec<AvailableSlot>, EngineError> {
        let (window, limit) = resolve_slot_window(query, now_ms())?;
        let service = self.service_or_not_found(query.service_id).await?;

        let schedules = self.repo.list_schedules_in_range(window, None).await?;
        // Tiles run to the end of their block, past `window.end` if need be,
        // so reservations are fetched over every block in full.
        let covered_end = schedules
            .iter()
            .map(|row| row.schedule.span.end)
            .fold(window.end, Ms::max);
        let covered = Span::new(window.start, covered_end);
        let reservations = self.repo.list_reservations_in_range(covered, None).await?;
        let slots = generate_slots(
            &schedules,
            &reservations,
            window.start,
            service.duration_ms(),
            limit,
        );

        debug!(
            "service {}: {} schedules, {} reservations -> {} slots",
            service.id,
            schedules.len(),
            reservations.len(),
            slots.len()
        );
        metrics::histogram!(SLOTS_RETURNED).record(slots.len() as f64);
        Ok(slots)
    }

    /// The caller's reservations joined with service and employee, newest first.
    pub async fn reservations_for_user(&self, user_id: &str) -> Result<Vec<ReservationView>, EngineError> {
        let reservations = self.repo.list_reservations_for_user(user_id).await?;
        let mut services: HashMap<ServiceId, Service> = HashMap::new();
        let mut employees: HashMap<EmployeeId, Employee> = HashMap::new();
        let mut views = Vec::with_capacity(reservations.len());
        for reservation in reservations {
            if !services.contains_key(&reservation.service_id) {
                let service = self.service_or_not_found(reservation.service_id).await?;
                services.insert(service.id, service);
            }
            if !employees.contains_key(&reservation.employee_id) {
                let employee = self.employee_or_not_found(reservation.employee_id).await?;
                employees.insert(employee.id, employee);
            }
            let service = &services[&reservation.service_id];
            let employee = &employees[&reservation.employee_id];
            views.push(ReservationView::new(reservation, service, employee));
        }
        Ok(views)
    }

    pub async fn vehicles_for_user(&self, user_id: &str) -> Result<Vec<Vehicle>, EngineError> {
        Ok(self.repo.list_vehicles_for_user(user_id).await?)
    }

    pub async fn list_services(&self) -> Result<Vec<Service>, EngineError> {
        Ok(self.repo.list_services().await?)
    }
}
