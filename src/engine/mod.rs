mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{
    candidate_slots, drop_self_overlaps, exclude_reserved, generate_slots, tile_schedule,
};
pub use error::EngineError;

use std::sync::Arc;

use crate::model::*;
use crate::recommend::Recommender;
use crate::store::Repository;

/// The booking core: slot generation and reservation validation over a
/// [`Repository`].
///
/// Holds no mutable state of its own; every call reads what it needs from
/// the store, so one `Engine` can be shared across all connections.
pub struct Engine {
    repo: Arc<dyn Repository>,
    recommender: Arc<dyn Recommender>,
}

impl Engine {
    pub fn new(repo: Arc<dyn Repository>, recommender: Arc<dyn Recommender>) -> Self {
        Self { repo, recommender }
    }

    fn require_admin(principal: &Principal, action: &str) -> Result<(), EngineError> {
        if principal.is_admin {
            Ok(())
        } else {
            Err(EngineError::Forbidden(format!("only an administrator may {action}")))
        }
    }

    async fn service_or_not_found(&self, id: ServiceId) -> Result<Service, EngineError> {
        self.repo
            .find_service(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("service {id} not found")))
    }

    async fn employee_or_not_found(&self, id: EmployeeId) -> Result<Employee, EngineError> {
        self.repo
            .find_employee(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("employee {id} not found")))
    }
}
