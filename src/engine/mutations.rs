use chrono::{Datelike, Utc};
use tracing::{debug, info, warn};

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    RECOMMENDATION_FALLBACKS_TOTAL, RESERVATIONS_CREATED_TOTAL, RESERVATION_REJECTIONS_TOTAL,
};
use crate::recommend::{RecommendError, RecommendationRequest, fallback_text};

use super::conflict::{
    check_duration, check_no_conflict, check_transition, check_within_schedule,
    validate_request_span, validate_timestamp_range, validation,
};
use super::{Engine, EngineError};

/// Trimmed, non-empty, and at most `max` characters.
fn required_text(value: &str, field: &str, max: usize) -> Result<String, EngineError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(validation(format!("{field} must not be empty")));
    }
    if value.chars().count() > max {
        return Err(validation(format!("{field} too long")));
    }
    Ok(value.to_string())
}

fn optional_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl Engine {
    /// Validate a reservation request and insert it with status `New`.
    ///
    /// Every check runs before the single write. The store re-checks overlap
    /// under its own lock, so a concurrent insert that slips past the read-side
    /// conflict check still surfaces as `Conflict`.
    pub async fn create_reservation(
        &self,
        request: &CreateReservationRequest,
        user_id: &str,
    ) -> Result<ReservationView, EngineError> {
        let result = self.try_create_reservation(request, user_id).await;
        match &result {
            Ok(view) => {
                metrics::counter!(RESERVATIONS_CREATED_TOTAL).increment(1);
                info!(
                    "reservation {} created for {} with employee {}",
                    view.reservation.id, user_id, view.reservation.employee_id
                );
            }
            Err(e) => {
                metrics::counter!(RESERVATION_REJECTIONS_TOTAL, "kind" => e.kind()).increment(1);
                debug!("reservation for {user_id} rejected: {e}");
            }
        }
        result
    }

    async fn try_create_reservation(
        &self,
        request: &CreateReservationRequest,
        user_id: &str,
    ) -> Result<ReservationView, EngineError> {
        let span = validate_request_span(request.start, request.end, now_ms())?;

        let vehicle = self
            .repo
            .find_vehicle_owned_by(&request.vehicle_license_plate, user_id)
            .await?
            .ok_or_else(|| {
                EngineError::Forbidden(format!(
                    "vehicle {} not owned by user",
                    normalize_plate(&request.vehicle_license_plate)
                ))
            })?;
        let service = self.service_or_not_found(request.service_id).await?;
        let employee = self.employee_or_not_found(request.employee_id).await?;
        check_duration(&span, &service)?;

        let booked = self
            .repo
            .list_reservations_in_range(span, Some(employee.id))
            .await?;
        check_no_conflict(&span, &booked)?;

        let schedules = self
            .repo
            .list_schedules_in_range(span, Some(employee.id))
            .await?;
        check_within_schedule(&span, &schedules)?;

        let recommendation_text = self.recommendation(&vehicle, &service).await;
        let reservation = self
            .repo
            .insert_reservation(NewReservation {
                user_id: user_id.to_string(),
                service_id: service.id,
                vehicle_license_plate: vehicle.license_plate.clone(),
                employee_id: employee.id,
                span,
                recommendation_text,
            })
            .await?;
        Ok(ReservationView::new(reservation, &service, &employee))
    }

    /// Provider text, or the fallback if the provider fails or is not configured.
    async fn recommendation(&self, vehicle: &Vehicle, service: &Service) -> String {
        let request = RecommendationRequest::new(vehicle, service);
        let text = match self.recommender.recommend(&request).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) | Err(RecommendError::Disabled) => {
                metrics::counter!(RECOMMENDATION_FALLBACKS_TOTAL).increment(1);
                fallback_text(&request)
            }
            Err(e) => {
                warn!("recommendation provider failed, using fallback: {e}");
                metrics::counter!(RECOMMENDATION_FALLBACKS_TOTAL).increment(1);
                fallback_text(&request)
            }
        };
        text.chars().take(MAX_RECOMMENDATION_LEN).collect()
    }

    pub async fn update_reservation_status(
        &self,
        id: ReservationId,
        status: ReservationStatus,
        principal: &Principal,
    ) -> Result<ReservationView, EngineError> {
        let current = self
            .repo
            .find_reservation(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("reservation {id} not found")))?;
        check_transition(&current, status, principal)?;

        // Compare-and-set against the status checked above.
        let updated = self
            .repo
            .update_reservation_status(id, current.status, status)
            .await?;
        let service = self.service_or_not_found(updated.service_id).await?;
        let employee = self.employee_or_not_found(updated.employee_id).await?;
        info!("reservation {id} -> {status} by {}", principal.user_id);
        Ok(ReservationView::new(updated, &service, &employee))
    }

    /// Soft delete: the row stays with status `Cancelled`.
    pub async fn cancel_reservation(
        &self,
        id: ReservationId,
        principal: &Principal,
    ) -> Result<ReservationView, EngineError> {
        self.update_reservation_status(id, ReservationStatus::Cancelled, principal)
            .await
    }

    pub async fn register_vehicle(
        &self,
        new: &NewVehicle,
        principal: &Principal,
    ) -> Result<Vehicle, EngineError> {
        let license_plate = normalize_plate(&new.license_plate);
        if license_plate.is_empty() || license_plate.chars().count() > MAX_PLATE_LEN {
            return Err(validation(format!(
                "license_plate must be 1 to {MAX_PLATE_LEN} characters"
            )));
        }
        let max_year = Utc::now().year() + 1;
        if !(MIN_PRODUCTION_YEAR..=max_year).contains(&new.production_year) {
            return Err(validation(format!(
                "production_year must be between {MIN_PRODUCTION_YEAR} and {max_year}"
            )));
        }
        let vin = optional_text(new.vin.as_deref()).map(|v| v.to_uppercase());
        if let Some(vin) = &vin
            && (vin.len() != VIN_LEN || !vin.chars().all(|c| c.is_ascii_alphanumeric()))
        {
            return Err(validation(format!("vin must be {VIN_LEN} letters or digits")));
        }

        let vehicle = Vehicle {
            license_plate,
            user_id: principal.user_id.clone(),
            brand: required_text(&new.brand, "brand", MAX_NAME_LEN)?,
            model: required_text(&new.model, "model", MAX_NAME_LEN)?,
            production_year: new.production_year,
            vin,
            car_type: optional_text(new.car_type.as_deref()),
        };
        self.repo.register_vehicle(vehicle.clone()).await?;
        info!("vehicle {} registered for {}", vehicle.license_plate, vehicle.user_id);
        Ok(vehicle)
    }

    // ── Reference data (admin) ───────────────────────────────────

    pub async fn upsert_service(
        &self,
        service: &Service,
        principal: &Principal,
    ) -> Result<Service, EngineError> {
        Self::require_admin(principal, "manage services")?;
        if service.id <= 0 {
            return Err(validation("service id must be positive"));
        }
        if service.duration_minutes == 0 || service.duration_minutes > MAX_SERVICE_DURATION_MINUTES {
            return Err(validation(format!(
                "duration_minutes must be between 1 and {MAX_SERVICE_DURATION_MINUTES}"
            )));
        }
        let description = optional_text(service.description.as_deref());
        if description
            .as_ref()
            .is_some_and(|d| d.chars().count() > MAX_DESCRIPTION_LEN)
        {
            return Err(validation("description too long"));
        }
        let service = Service {
            id: service.id,
            name: required_text(&service.name, "name", MAX_NAME_LEN)?,
            description,
            duration_minutes: service.duration_minutes,
        };
        self.repo.upsert_service(service.clone()).await?;
        info!("service {} '{}' saved", service.id, service.name);
        Ok(service)
    }

    pub async fn upsert_employee(
        &self,
        employee: &Employee,
        principal: &Principal,
    ) -> Result<Employee, EngineError> {
        Self::require_admin(principal, "manage employees")?;
        let employee = Employee {
            id: employee.id,
            name: required_text(&employee.name, "name", MAX_NAME_LEN)?,
        };
        self.repo.upsert_employee(employee.clone()).await?;
        info!("employee {} '{}' saved", employee.id, employee.name);
        Ok(employee)
    }

    pub async fn add_schedule(
        &self,
        employee_id: EmployeeId,
        start: Ms,
        end: Ms,
        principal: &Principal,
    ) -> Result<EmployeeSchedule, EngineError> {
        Self::require_admin(principal, "manage schedules")?;
        let span = Span::checked(start, end).ok_or_else(|| validation("end_ts must be after start_ts"))?;
        validate_timestamp_range(&span)?;
        self.employee_or_not_found(employee_id).await?;
        let schedule = self.repo.insert_schedule(employee_id, span).await?;
        info!("schedule {} added for employee {employee_id}", schedule.id);
        Ok(schedule)
    }

    pub async fn remove_schedule(
        &self,
        id: ScheduleId,
        principal: &Principal,
    ) -> Result<EmployeeSchedule, EngineError> {
        Self::require_admin(principal, "manage schedules")?;
        let schedule = self.repo.delete_schedule(id).await?;
        info!("schedule {id} removed");
        Ok(schedule)
    }
}
