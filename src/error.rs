//! Application-wide error types.

use thiserror::Error;

/// Infrastructure errors: configuration, logging, process setup.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage-layer errors surfaced by [`crate::store::Store`] implementations.
///
/// Transient backend failures (a busy database file, a dropped connection)
/// are retried inside the store and never reach this type; `Backend` covers
/// only the non-recoverable remainder.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such canary {0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Domain errors raised by the canary lifecycle layer.
///
/// The HTTP layer maps these onto status codes: `NotFound` becomes 404,
/// everything else a 400 with the display string as the error payload.
#[derive(Debug, Error)]
pub enum CanaryError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("canary is already paused")]
    AlreadyPaused,

    #[error("canary is already unpaused")]
    AlreadyUnpaused,

    #[error("canary not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for CanaryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(ident) => CanaryError::NotFound(ident),
            StoreError::Conflict(msg) => CanaryError::AlreadyExists(msg),
            other => CanaryError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn config_error_display() {
        let e = AppError::Config("missing field".into());
        assert!(e.to_string().contains("missing field"));
    }

    #[test]
    fn store_not_found_maps_to_canary_not_found() {
        let e: CanaryError = StoreError::NotFound("abcdefgh".into()).into();
        assert!(matches!(e, CanaryError::NotFound(_)));
        assert!(e.to_string().contains("abcdefgh"));
    }

    #[test]
    fn store_conflict_maps_to_already_exists() {
        let e: CanaryError = StoreError::Conflict("slug taken".into()).into();
        assert!(matches!(e, CanaryError::AlreadyExists(_)));
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let e: AppError = io_err.into();
        assert!(e.to_string().contains("io error"));
        let _: &dyn Error = &e;
    }
}
