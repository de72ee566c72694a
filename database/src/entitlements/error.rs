//! Entitlement Error Types

use chrono::{DateTime, TimeDelta, Utc};

#[derive(Debug, thiserror::Error)]
pub enum EntitlementError {
    #[error("Entitlement must be scoped to a guild, a user, or both")]
    ScopeViolation,

    #[error("Expiry out of range: {duration} added to {base}")]
    ExpiryOutOfRange {
        base: DateTime<Utc>,
        duration: TimeDelta,
    },

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl EntitlementError {
    /// Whether the underlying storage rejected a duplicate key.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(e)) => e.is_unique_violation(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_violation_is_not_unique_violation() {
        assert!(!EntitlementError::ScopeViolation.is_unique_violation());
    }

    #[test]
    fn test_expiry_out_of_range_names_its_inputs() {
        let err = EntitlementError::ExpiryOutOfRange {
            base: DateTime::UNIX_EPOCH,
            duration: TimeDelta::days(1),
        };
        let message = err.to_string();
        assert!(message.starts_with("Expiry out of range"), "{message}");
        assert!(message.contains("1970-01-01"), "{message}");
        assert!(!err.is_unique_violation());
    }

    #[test]
    fn test_database_errors_convert() {
        let err: EntitlementError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, EntitlementError::Database(_)));
        assert!(!err.is_unique_violation());
    }
}
