//! Error types for the probe driver

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Core(#[from] cohost_core::Error),
}

/// Map a reqwest failure onto the shared error categories
pub fn classify_http_error(err: reqwest::Error) -> cohost_core::Error {
    if err.is_timeout() {
        cohost_core::Error::timeout(err.to_string())
    } else if err.is_connect() {
        cohost_core::Error::network(err.to_string())
    } else if err.is_decode() {
        cohost_core::Error::invalid_response(err.to_string())
    } else {
        cohost_core::Error::transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_pass_through() {
        let err = DriverError::from(cohost_core::Error::timeout("probe"));
        assert_eq!(err.to_string(), "Operation timed out: probe");
        assert!(matches!(err, DriverError::Core(cohost_core::Error::Timeout(_))));
    }
}
