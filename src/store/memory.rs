use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use super::commit::Journal;
use super::{Repository, StoreError};

pub type SharedEmployeeBook = Arc<RwLock<EmployeeBook>>;

/// Journaled in-memory store.
///
/// Reservations and schedules live in per-employee books behind a tokio
/// `RwLock`; the overlap re-check and the journal append for a reservation
/// happen under that book's write lock, so two inserts for the same employee
/// can never both commit overlapping intervals.
pub struct InMemoryStore {
    services: DashMap<ServiceId, Service>,
    books: DashMap<EmployeeId, SharedEmployeeBook>,
    /// Keyed by normalized plate.
    vehicles: DashMap<String, Vehicle>,
    /// Reverse lookups: reservation / schedule id → employee id.
    reservation_owner: DashMap<ReservationId, EmployeeId>,
    schedule_owner: DashMap<ScheduleId, EmployeeId>,
    /// Serializes reference-data writes (services, employees, vehicles) and compaction.
    registry: Mutex<()>,
    journal: Journal,
}

/// Apply a book-scoped event. The caller holds the book's write lock.
fn apply_to_book(book: &mut EmployeeBook, event: &Event) {
    match event {
        Event::EmployeeUpserted(employee) => book.employee = employee.clone(),
        Event::ScheduleAdded(schedule) => book.insert_schedule(schedule.clone()),
        Event::ScheduleRemoved { id, .. } => {
            book.remove_schedule(*id);
        }
        Event::ReservationCreated(reservation) => book.insert_reservation(reservation.clone()),
        Event::ReservationStatusChanged {
            id,
            status,
            updated_at,
            ..
        } => {
            if let Some(r) = book.reservation_mut(*id) {
                r.status = *status;
                r.updated_at = *updated_at;
            }
        }
        Event::ServiceUpserted(_) | Event::VehicleRegistered(_) => {}
    }
}

impl InMemoryStore {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let events = Wal::replay(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let store = Self {
            services: DashMap::new(),
            books: DashMap::new(),
            vehicles: DashMap::new(),
            reservation_owner: DashMap::new(),
            schedule_owner: DashMap::new(),
            registry: Mutex::new(()),
            journal: Journal::spawn(wal),
        };
        for event in &events {
            store.replay_event(event);
        }
        info!(
            "store replayed {} events: {} services, {} employees, {} reservations",
            events.len(),
            store.services.len(),
            store.books.len(),
            store.reservation_owner.len()
        );
        Ok(store)
    }

    /// Nobody else holds the books during replay, so `try_write` always succeeds.
    /// `try_write` rather than `blocking_write`: this runs inside the runtime.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::ServiceUpserted(service) => {
                self.services.insert(service.id, service.clone());
            }
            Event::VehicleRegistered(vehicle) => {
                self.vehicles
                    .insert(normalize_plate(&vehicle.license_plate), vehicle.clone());
            }
            Event::EmployeeUpserted(employee) if !self.books.contains_key(&employee.id) => {
                self.books.insert(
                    employee.id,
                    Arc::new(RwLock::new(EmployeeBook::new(employee.clone()))),
                );
            }
            other => {
                let Some(employee_id) = book_of(other) else { return };
                let Some(book) = self.book(&employee_id) else { return };
                if let Ok(mut guard) = book.try_write() {
                    apply_to_book(&mut guard, other);
                }
                self.index(other);
            }
        }
    }

    fn index(&self, event: &Event) {
        match event {
            Event::ScheduleAdded(s) => {
                self.schedule_owner.insert(s.id, s.employee_id);
            }
            Event::ScheduleRemoved { id, .. } => {
                self.schedule_owner.remove(id);
            }
            Event::ReservationCreated(r) => {
                self.reservation_owner.insert(r.id, r.employee_id);
            }
            _ => {}
        }
    }

    pub fn book(&self, employee_id: &EmployeeId) -> Option<SharedEmployeeBook> {
        self.books.get(employee_id).map(|e| e.value().clone())
    }

    fn books_for(&self, employee_id: Option<EmployeeId>) -> Vec<SharedEmployeeBook> {
        match employee_id {
            Some(id) => self.book(&id).into_iter().collect(),
            None => self.books.iter().map(|e| e.value().clone()).collect(),
        }
    }

    /// Journal, apply and index one book-scoped event under the held write lock.
    async fn commit_to_book(&self, book: &mut EmployeeBook, event: &Event) -> Result<(), StoreError> {
        self.journal.append(event).await?;
        apply_to_book(book, event);
        self.index(event);
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        self.journal.appends_since_compact().await
    }

    /// Rewrite the WAL as the minimal event list that recreates current state.
    ///
    /// Holds the registry lock and a read lock on every book until the swap is
    /// done, so no write can land between the snapshot and the rename.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _registry = self.registry.lock().await;
        let mut books: Vec<(EmployeeId, SharedEmployeeBook)> = self
            .books
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        books.sort_by_key(|(id, _)| *id);
        let mut guards = Vec::with_capacity(books.len());
        for (_, book) in &books {
            guards.push(book.read().await);
        }

        let mut services: Vec<Service> = self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        let mut events: Vec<Event> = services.into_iter().map(Event::ServiceUpserted).collect();

        for guard in &guards {
            events.push(Event::EmployeeUpserted(guard.employee.clone()));
            events.extend(guard.schedules.iter().cloned().map(Event::ScheduleAdded));
        }
        let mut vehicles: Vec<Vehicle> = self.vehicles.iter().map(|e| e.value().clone()).collect();
        vehicles.sort_by(|a, b| a.license_plate.cmp(&b.license_plate));
        events.extend(vehicles.into_iter().map(Event::VehicleRegistered));
        for guard in &guards {
            events.extend(guard.reservations.iter().cloned().map(Event::ReservationCreated));
        }

        let count = events.len();
        self.journal.compact(events).await?;
        info!("WAL compacted to {count} events");
        Ok(())
    }
}

/// The employee whose book a non-registry event belongs to.
fn book_of(event: &Event) -> Option<EmployeeId> {
    match event {
        Event::EmployeeUpserted(e) => Some(e.id),
        Event::ScheduleAdded(s) => Some(s.employee_id),
        Event::ScheduleRemoved { employee_id, .. }
        | Event::ReservationStatusChanged { employee_id, .. } => Some(*employee_id),
        Event::ReservationCreated(r) => Some(r.employee_id),
        Event::ServiceUpserted(_) | Event::VehicleRegistered(_) => None,
    }
}

#[async_trait]
impl Repository for InMemoryStore {
    async fn find_service(&self, id: ServiceId) -> Result<Option<Service>, StoreError> {
        Ok(self.services.get(&id).map(|e| e.value().clone()))
    }

    async fn list_services(&self) -> Result<Vec<Service>, StoreError> {
        let mut services: Vec<Service> = self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        Ok(services)
    }

    async fn find_employee(&self, id: EmployeeId) -> Result<Option<Employee>, StoreError> {
        match self.book(&id) {
            Some(book) => Ok(Some(book.read().await.employee.clone())),
            None => Ok(None),
        }
    }

    async fn find_vehicle_owned_by(
        &self,
        license_plate: &str,
        user_id: &str,
    ) -> Result<Option<Vehicle>, StoreError> {
        Ok(self
            .vehicles
            .get(&normalize_plate(license_plate))
            .filter(|v| v.user_id == user_id)
            .map(|v| v.value().clone()))
    }

    async fn list_vehicles_for_user(&self, user_id: &str) -> Result<Vec<Vehicle>, StoreError> {
        let mut vehicles: Vec<Vehicle> = self
            .vehicles
            .iter()
            .filter(|e| e.value().user_id == user_id)
            .map(|e| e.value().clone())
            .collect();
        vehicles.sort_by(|a, b| a.license_plate.cmp(&b.license_plate));
        Ok(vehicles)
    }

    async fn list_schedules_in_range(
        &self,
        window: Span,
        employee_id: Option<EmployeeId>,
    ) -> Result<Vec<ScheduleRow>, StoreError> {
        let mut rows = Vec::new();
        for book in self.books_for(employee_id) {
            let guard = book.read().await;
            rows.extend(guard.schedules_touching(&window).map(|s| ScheduleRow {
                schedule: s.clone(),
                employee_name: guard.employee.name.clone(),
            }));
        }
        rows.sort_by_key(|r| (r.schedule.span.start, r.schedule.employee_id));
        Ok(rows)
    }

    async fn list_reservations_in_range(
        &self,
        window: Span,
        employee_id: Option<EmployeeId>,
    ) -> Result<Vec<Reservation>, StoreError> {
        let mut found = Vec::new();
        for book in self.books_for(employee_id) {
            let guard = book.read().await;
            found.extend(guard.live_reservations_touching(&window).cloned());
        }
        found.sort_by_key(|r| (r.span.start, r.employee_id));
        Ok(found)
    }

    async fn find_reservation(&self, id: ReservationId) -> Result<Option<Reservation>, StoreError> {
        let Some(employee_id) = self.reservation_owner.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(book) = self.book(&employee_id) else {
            return Ok(None);
        };
        let guard = book.read().await;
        Ok(guard.reservations.iter().find(|r| r.id == id).cloned())
    }

    async fn list_reservations_for_user(&self, user_id: &str) -> Result<Vec<Reservation>, StoreError> {
        let mut found = Vec::new();
        for book in self.books_for(None) {
            let guard = book.read().await;
            found.extend(guard.reservations.iter().filter(|r| r.user_id == user_id).cloned());
        }
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(found)
    }

    async fn insert_reservation(&self, new: NewReservation) -> Result<Reservation, StoreError> {
        let book = self
            .book(&new.employee_id)
            .ok_or_else(|| StoreError::NotFound(format!("employee {}", new.employee_id)))?;
        let mut guard = book.write().await;
        if let Some(existing) = guard.live_overlap(&new.span) {
            return Err(StoreError::Overlap(existing.id));
        }

        let now = now_ms();
        let reservation = Reservation {
            id: Ulid::new(),
            user_id: new.user_id,
            service_id: new.service_id,
            vehicle_license_plate: normalize_plate(&new.vehicle_license_plate),
            employee_id: new.employee_id,
            span: new.span,
            status: ReservationStatus::New,
            created_at: now,
            updated_at: now,
            recommendation_text: new.recommendation_text,
        };
        let event = Event::ReservationCreated(reservation.clone());
        self.commit_to_book(&mut guard, &event).await?;
        Ok(reservation)
    }

    async fn update_reservation_status(
        &self,
        id: ReservationId,
        expected: ReservationStatus,
        status: ReservationStatus,
    ) -> Result<Reservation, StoreError> {
        let not_found = || StoreError::NotFound(format!("reservation {id}"));
        let employee_id = self
            .reservation_owner
            .get(&id)
            .map(|e| *e.value())
            .ok_or_else(not_found)?;
        let book = self.book(&employee_id).ok_or_else(not_found)?;
        let mut guard = book.write().await;
        let current = guard
            .reservations
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(not_found)?;
        if current.status != expected {
            return Err(StoreError::StatusChanged {
                id,
                actual: current.status,
                requested: status,
            });
        }

        // Reviving a cancelled reservation must not double-book its slot.
        if status.is_live() && !current.status.is_live() {
            let clash = guard
                .live_reservations_touching(&current.span)
                .find(|r| r.id != id && r.span.overlaps(&current.span));
            if let Some(other) = clash {
                return Err(StoreError::Overlap(other.id));
            }
        }

        let updated_at = now_ms();
        let event = Event::ReservationStatusChanged {
            id,
            employee_id,
            status,
            updated_at,
        };
        self.commit_to_book(&mut guard, &event).await?;
        Ok(Reservation {
            status,
            updated_at,
            ..current
        })
    }

    async fn upsert_service(&self, service: Service) -> Result<(), StoreError> {
        let _registry = self.registry.lock().await;
        self.journal
            .append(&Event::ServiceUpserted(service.clone()))
            .await?;
        self.services.insert(service.id, service);
        Ok(())
    }

    async fn upsert_employee(&self, employee: Employee) -> Result<(), StoreError> {
        let _registry = self.registry.lock().await;
        let event = Event::EmployeeUpserted(employee.clone());
        match self.book(&employee.id) {
            Some(book) => {
                let mut guard = book.write().await;
                self.commit_to_book(&mut guard, &event).await
            }
            None => {
                self.journal.append(&event).await?;
                self.books
                    .insert(employee.id, Arc::new(RwLock::new(EmployeeBook::new(employee))));
                Ok(())
            }
        }
    }

    async fn insert_schedule(
        &self,
        employee_id: EmployeeId,
        span: Span,
    ) -> Result<EmployeeSchedule, StoreError> {
        let book = self
            .book(&employee_id)
            .ok_or_else(|| StoreError::NotFound(format!("employee {employee_id}")))?;
        let mut guard = book.write().await;
        if let Some(existing) = guard.schedule_overlap(&span) {
            return Err(StoreError::ScheduleOverlap(existing.id));
        }
        let schedule = EmployeeSchedule {
            id: Ulid::new(),
            employee_id,
            span,
        };
        self.commit_to_book(&mut guard, &Event::ScheduleAdded(schedule.clone()))
            .await?;
        Ok(schedule)
    }

    async fn delete_schedule(&self, id: ScheduleId) -> Result<EmployeeSchedule, StoreError> {
        let not_found = || StoreError::NotFound(format!("schedule {id}"));
        let employee_id = self
            .schedule_owner
            .get(&id)
            .map(|e| *e.value())
            .ok_or_else(not_found)?;
        let book = self.book(&employee_id).ok_or_else(not_found)?;
        let mut guard = book.write().await;
        let schedule = guard
            .schedules
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(not_found)?;
        self.commit_to_book(&mut guard, &Event::ScheduleRemoved { id, employee_id })
            .await?;
        Ok(schedule)
    }

    async fn register_vehicle(&self, vehicle: Vehicle) -> Result<(), StoreError> {
        let _registry = self.registry.lock().await;
        let plate = normalize_plate(&vehicle.license_plate);
        if self.vehicles.contains_key(&plate) {
            return Err(StoreError::Duplicate(format!("vehicle {plate}")));
        }
        let vehicle = Vehicle {
            license_plate: plate.clone(),
            ..vehicle
        };
        self.journal
            .append(&Event::VehicleRegistered(vehicle.clone()))
            .await?;
        self.vehicles.insert(plate, vehicle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use uuid::Uuid;

    const H: Ms = 3_600_000;
    const DAY: Ms = 2_222_380_800_000; // 2040-06-04T00:00:00Z

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("pitstop_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn seeded(name: &str) -> (InMemoryStore, Employee, PathBuf) {
        let path = test_wal_path(name);
        let store = InMemoryStore::open(&path).unwrap();
        let employee = Employee {
            id: Uuid::new_v4(),
            name: "Bartek".into(),
        };
        store.upsert_employee(employee.clone()).await.unwrap();
        (store, employee, path)
    }

    fn new_reservation(employee_id: EmployeeId, start: Ms, end: Ms) -> NewReservation {
        NewReservation {
            user_id: "alice".into(),
            service_id: 1,
            vehicle_license_plate: "kr 12345".into(),
            employee_id,
            span: Span::new(start, end),
            recommendation_text: "check brakes".into(),
        }
    }

    #[tokio::test]
    async fn insert_rejects_overlap_for_same_employee() {
        let (store, employee, _) = seeded("overlap.wal").await;
        let first = store
            .insert_reservation(new_reservation(employee.id, DAY + 10 * H, DAY + 11 * H))
            .await
            .unwrap();
        assert_eq!(first.status, ReservationStatus::New);
        assert_eq!(first.vehicle_license_plate, "KR 12345");

        let clash = store
            .insert_reservation(new_reservation(employee.id, DAY + 10 * H + 30 * 60_000, DAY + 12 * H))
            .await;
        assert!(matches!(clash, Err(StoreError::Overlap(id)) if id == first.id));

        // Adjacent is fine.
        store
            .insert_reservation(new_reservation(employee.id, DAY + 11 * H, DAY + 12 * H))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn insert_for_unknown_employee_fails() {
        let (store, _, _) = seeded("unknown_employee.wal").await;
        let result = store
            .insert_reservation(new_reservation(Uuid::new_v4(), DAY, DAY + H))
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn cancelled_reservation_frees_time() {
        let (store, employee, _) = seeded("cancel_frees.wal").await;
        let first = store
            .insert_reservation(new_reservation(employee.id, DAY + 9 * H, DAY + 10 * H))
            .await
            .unwrap();
        store
            .update_reservation_status(first.id, ReservationStatus::New, ReservationStatus::Cancelled)
            .await
            .unwrap();
        let second = store
            .insert_reservation(new_reservation(employee.id, DAY + 9 * H, DAY + 10 * H))
            .await
            .unwrap();

        // Reviving the cancelled one would double-book.
        let revive = store
            .update_reservation_status(first.id, ReservationStatus::Cancelled, ReservationStatus::New)
            .await;
        assert!(matches!(revive, Err(StoreError::Overlap(id)) if id == second.id));

        // A stale expectation is refused without touching the row.
        let stale = store
            .update_reservation_status(second.id, ReservationStatus::Completed, ReservationStatus::Cancelled)
            .await;
        assert!(matches!(
            stale,
            Err(StoreError::StatusChanged { actual: ReservationStatus::New, .. })
        ));

        let live = store
            .list_reservations_in_range(Span::new(DAY, DAY + 24 * H), None)
            .await
            .unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, second.id);
    }

    #[tokio::test]
    async fn schedules_of_one_employee_cannot_overlap() {
        let (store, employee, _) = seeded("schedule_overlap.wal").await;
        let first = store
            .insert_schedule(employee.id, Span::new(DAY + 8 * H, DAY + 12 * H))
            .await
            .unwrap();
        let clash = store
            .insert_schedule(employee.id, Span::new(DAY + 11 * H, DAY + 15 * H))
            .await;
        assert!(matches!(clash, Err(StoreError::ScheduleOverlap(id)) if id == first.id));
        store
            .insert_schedule(employee.id, Span::new(DAY + 12 * H, DAY + 16 * H))
            .await
            .unwrap();

        let rows = store
            .list_schedules_in_range(Span::new(DAY, DAY + 24 * H), Some(employee.id))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.employee_name == "Bartek"));
    }

    #[tokio::test]
    async fn delete_schedule_by_id() {
        let (store, employee, _) = seeded("delete_schedule.wal").await;
        let schedule = store
            .insert_schedule(employee.id, Span::new(DAY + 8 * H, DAY + 12 * H))
            .await
            .unwrap();
        let removed = store.delete_schedule(schedule.id).await.unwrap();
        assert_eq!(removed, schedule);
        assert!(matches!(
            store.delete_schedule(schedule.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn vehicle_ownership_and_duplicates() {
        let (store, _, _) = seeded("vehicles.wal").await;
        let vehicle = Vehicle {
            license_plate: " wa 9876 ".into(),
            user_id: "alice".into(),
            brand: "Skoda".into(),
            model: "Octavia".into(),
            production_year: 2019,
            vin: None,
            car_type: Some("estate".into()),
        };
        store.register_vehicle(vehicle.clone()).await.unwrap();
        assert!(matches!(
            store.register_vehicle(vehicle).await,
            Err(StoreError::Duplicate(_))
        ));

        assert!(store.find_vehicle_owned_by("WA 9876", "alice").await.unwrap().is_some());
        assert!(store.find_vehicle_owned_by("wa 9876", "bob").await.unwrap().is_none());
        assert_eq!(store.list_vehicles_for_user("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replay_restores_state() {
        let path = test_wal_path("replay.wal");
        let employee = Employee {
            id: Uuid::new_v4(),
            name: "Iga".into(),
        };
        let reservation_id;
        {
            let store = InMemoryStore::open(&path).unwrap();
            store
                .upsert_service(Service {
                    id: 4,
                    name: "Brake check".into(),
                    description: Some("pads and discs".into()),
                    duration_minutes: 60,
                })
                .await
                .unwrap();
            store.upsert_employee(employee.clone()).await.unwrap();
            store
                .insert_schedule(employee.id, Span::new(DAY + 8 * H, DAY + 16 * H))
                .await
                .unwrap();
            let r = store
                .insert_reservation(new_reservation(employee.id, DAY + 9 * H, DAY + 10 * H))
                .await
                .unwrap();
            store
                .update_reservation_status(r.id, ReservationStatus::New, ReservationStatus::Completed)
                .await
                .unwrap();
            reservation_id = r.id;
        }

        let store = InMemoryStore::open(&path).unwrap();
        assert_eq!(store.find_service(4).await.unwrap().map(|s| s.duration_minutes), Some(60));
        assert_eq!(store.find_employee(employee.id).await.unwrap(), Some(employee.clone()));
        let r = store.find_reservation(reservation_id).await.unwrap().unwrap();
        assert_eq!(r.status, ReservationStatus::Completed);
        assert_eq!(
            store
                .list_schedules_in_range(Span::new(DAY, DAY + 24 * H), None)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let path = test_wal_path("compaction.wal");
        let (employee_id, kept_id) = {
            let store = InMemoryStore::open(&path).unwrap();
            let employee = Employee {
                id: Uuid::new_v4(),
                name: "Ola".into(),
            };
            store.upsert_employee(employee.clone()).await.unwrap();
            // Churn: rename the employee a few times.
            for i in 0..10 {
                store
                    .upsert_employee(Employee {
                        id: employee.id,
                        name: format!("Ola {i}"),
                    })
                    .await
                    .unwrap();
            }
            let kept = store
                .insert_reservation(new_reservation(employee.id, DAY + 9 * H, DAY + 10 * H))
                .await
                .unwrap();
            assert_eq!(store.appends_since_compact().await, 12);

            let before = std::fs::metadata(&path).unwrap().len();
            store.compact().await.unwrap();
            let after = std::fs::metadata(&path).unwrap().len();
            assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
            assert_eq!(store.appends_since_compact().await, 0);
            (employee.id, kept.id)
        };

        let store = InMemoryStore::open(&path).unwrap();
        let employee = store.find_employee(employee_id).await.unwrap().unwrap();
        assert_eq!(employee.name, "Ola 9");
        assert!(store.find_reservation(kept_id).await.unwrap().is_some());
    }
}
