//! Facade-level error shaping (grounded on the teacher's `api/error.rs`): the
//! facade itself never hands an HTTP status out — per spec.md §1 the router lives
//! outside this crate — but it gives every external caller the same stable
//! `{code, message}` shape `Error::kind()` already defines, plus the one facade-only
//! addition, `forbidden`, for authorization denials that aren't in the core
//! taxonomy.

use serde::Serialize;

use crate::error::Error;

/// Stable, externally-facing error shape. `code` is `Error::kind()` verbatim for
/// anything that reached the facade from a component; `forbidden` is the one code
/// the facade mints itself.
#[derive(Debug, Clone, Serialize)]
pub struct FacadeError {
    pub code: String,
    pub message: String,
}

impl FacadeError {
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self { code: "forbidden".to_string(), message: message.into() }
    }
}

impl From<Error> for FacadeError {
    fn from(err: Error) -> Self {
        Self { code: err.kind().to_string(), message: err.to_string() }
    }
}

impl std::fmt::Display for FacadeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for FacadeError {}

pub type FacadeResult<T> = Result<T, FacadeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_carries_its_own_code() {
        let err = FacadeError::forbidden("operator does not own this channel");
        assert_eq!(err.code, "forbidden");
    }

    #[test]
    fn wraps_core_error_kind_verbatim() {
        let err: FacadeError = Error::queue_full().into();
        assert_eq!(err.code, "conflict");
    }
}
