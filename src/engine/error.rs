use crate::store::StoreError;

/// Everything the booking core can fail with. Each kind carries a message
/// meant for the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// HTTP status for an HTTP-style boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::NotFound(_) => 404,
            EngineError::Forbidden(_) => 403,
            EngineError::Validation(_) => 400,
            EngineError::Conflict(_) => 409,
            EngineError::Storage(_) => 500,
        }
    }

    /// SQLSTATE reported on the wire.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "P0002",
            EngineError::Forbidden(_) => "42501",
            EngineError::Validation(_) => "22023",
            EngineError::Conflict(_) => "23P01",
            EngineError::Storage(_) => "58000",
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::Validation(_) => "validation",
            EngineError::Conflict(_) => "conflict",
            EngineError::Storage(_) => "storage",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Overlap(id) => {
                EngineError::Conflict(format!("overlaps existing reservation {id}"))
            }
            StoreError::ScheduleOverlap(id) => {
                EngineError::Conflict(format!("overlaps existing schedule block {id}"))
            }
            StoreError::Duplicate(what) => EngineError::Conflict(format!("{what} already exists")),
            StoreError::NotFound(what) => EngineError::NotFound(what),
            StoreError::StatusChanged {
                actual, requested, ..
            } => EngineError::Validation(format!(
                "cannot change status from {actual} to {requested}"
            )),
            StoreError::Journal(msg) => EngineError::Storage(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReservationStatus;
    use ulid::Ulid;

    #[test]
    fn status_codes() {
        assert_eq!(EngineError::NotFound("x".into()).status_code(), 404);
        assert_eq!(EngineError::Forbidden("x".into()).status_code(), 403);
        assert_eq!(EngineError::Validation("x".into()).status_code(), 400);
        assert_eq!(EngineError::Conflict("x".into()).status_code(), 409);
        assert_eq!(EngineError::Storage("x".into()).status_code(), 500);
    }

    #[test]
    fn store_errors_map_to_kinds() {
        assert!(matches!(
            EngineError::from(StoreError::Overlap(Ulid::new())),
            EngineError::Conflict(_)
        ));
        assert!(matches!(
            EngineError::from(StoreError::Duplicate("vehicle AB1".into())),
            EngineError::Conflict(_)
        ));
        assert_eq!(
            EngineError::from(StoreError::NotFound("schedule 1".into())),
            EngineError::NotFound("schedule 1".into())
        );
        assert_eq!(
            EngineError::from(StoreError::StatusChanged {
                id: Ulid::new(),
                actual: ReservationStatus::Completed,
                requested: ReservationStatus::Cancelled,
            }),
            EngineError::Validation("cannot change status from Completed to Cancelled".into())
        );
        assert_eq!(
            EngineError::from(StoreError::Journal("disk full".into())).sqlstate(),
            "58000"
        );
    }
}
