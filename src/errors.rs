use sea_orm::error::DbErr;
use serde::Serialize;
use uuid::Uuid;

/// Coarse classification used by callers to decide how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum ErrorCategory {
    /// Expected outcome of a business rule; caller-actionable.
    Business,
    /// Lost update on an order; the caller may retry.
    Conflict,
    /// A prior bug left persisted state inconsistent.
    Integrity,
    /// Storage or runtime failure outside the domain.
    Infrastructure,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Insufficient stock for {sku_id}: requested {requested}, available {available}")]
    InsufficientStock {
        sku_id: String,
        requested: i32,
        available: i32,
    },

    #[error("Order {order_id} cannot {event} while {from}")]
    InvalidStateTransition {
        order_id: Uuid,
        from: String,
        event: String,
    },

    #[error("Reservation missing for {sku_id}: requested {requested}, reserved {reserved}")]
    ReservationMissing {
        sku_id: String,
        requested: i32,
        reserved: i32,
    },

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Installment plan already exists for order {0}")]
    DuplicatePlan(Uuid),

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the failure category for this error.
    /// This is the single source of truth for error classification.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound(_)
            | Self::ValidationError(_)
            | Self::InvalidOperation(_)
            | Self::InsufficientStock { .. }
            | Self::InvalidStateTransition { .. }
            | Self::DuplicatePlan(_) => ErrorCategory::Business,
            Self::ConcurrentModification(_) => ErrorCategory::Conflict,
            Self::ReservationMissing { .. } | Self::IntegrityViolation(_) => {
                ErrorCategory::Integrity
            }
            Self::DatabaseError(_) | Self::InternalError(_) | Self::Other(_) => {
                ErrorCategory::Infrastructure
            }
        }
    }

    /// Only lost updates are worth retrying; everything else fails the same way twice.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Conflict
    }

    /// Message suitable for operators and callers outside the crate.
    /// Integrity and infrastructure failures are collapsed to a generic message.
    pub fn public_message(&self) -> String {
        match self.category() {
            ErrorCategory::Integrity | ErrorCategory::Infrastructure => {
                "Internal error".to_string()
            }
            _ => self.to_string(),
        }
    }
}

/// True when the database rejected a write because of a unique index.
pub fn is_unique_violation(err: &DbErr) -> bool {
    matches!(
        err.sql_err(),
        Some(sea_orm::SqlErr::UniqueConstraintViolation(_))
    )
}
