//! Application-wide error taxonomy.
//!
//! Every component boundary translates its internal failures into one of these
//! variants before the error crosses an API seam — no underlying library exception
//! (sqlx, serde) is allowed to leak past the component that produced it.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type. Variant names track the abstract error kinds of
/// spec.md §7 so a caller can match on `kind()` without parsing messages.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid state transition: cannot transition {entity} from {from} to {to}")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("{entity_type} '{id}' not found")]
    NotFound {
        entity_type: &'static str,
        id: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Transport auth error: {0}")]
    TransportAuthError(String),

    #[error("Transient transport error: {0}")]
    TransportTransient(String),

    #[error("Persistent transport error: {0}")]
    TransportPersistent(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Rate limited, retry after {reset_after_ms}ms")]
    RateLimited { reset_after_ms: u64 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(entity_type: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type,
            id: id.into(),
        }
    }

    pub fn invalid_transition(
        entity: &'static str,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::InvalidStateTransition {
            entity,
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_url() -> Self {
        Self::Validation("invalid_url".to_string())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn queue_full() -> Self {
        Self::Conflict("queue_full".to_string())
    }

    pub fn has_items() -> Self {
        Self::Conflict("has_items".to_string())
    }

    pub fn session_unavailable() -> Self {
        Self::Conflict("session_unavailable".to_string())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn decode_failure(what: impl Into<String>) -> Self {
        Self::DecodeError(what.into())
    }

    /// The abstract error-kind name used in logs and `system_alert` codes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DatabaseSqlx(_) | Self::StorageUnavailable(_) => "storage_unavailable",
            Self::Serialization(_) | Self::Io(_) | Self::Internal(_) => "internal",
            Self::InvalidStateTransition { .. } | Self::Conflict(_) => "conflict",
            Self::NotFound { .. } => "not_found",
            Self::Validation(_) => "validation_error",
            Self::TransportAuthError(_) => "transport_auth_error",
            Self::TransportTransient(_) => "transport_transient",
            Self::TransportPersistent(_) => "transport_persistent",
            Self::DecodeError(_) => "decode_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::Configuration(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_to_taxonomy() {
        assert_eq!(Error::queue_full().kind(), "conflict");
        assert_eq!(Error::invalid_url().kind(), "validation_error");
        assert_eq!(Error::RateLimited { reset_after_ms: 10 }.kind(), "rate_limited");
    }
}
