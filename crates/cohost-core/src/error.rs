//! Error handling for cohost
//!
//! Provides the error type and result alias shared by the driver, the agent
//! and the simulation harness.

/// Result type alias for cohost operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for cohost
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Network-related errors (connection refused, DNS failure)
    #[error("Network error: {0}")]
    Network(String),

    /// Transport errors (non-success status, broken response stream)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Instance or resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Instance temporarily unavailable
    #[error("Resource unavailable: {0}")]
    Unavailable(String),

    /// Invalid request or parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A remote answered with something we could not interpret
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Contention generator setup failed on the instance
    #[error("Contention setup failed: {0}")]
    ContentionSetup(String),

    /// Timing probe setup failed on the instance
    #[error("Probe setup failed: {0}")]
    ProbeSetup(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration parsing errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an invalid response error
    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Create a contention setup error
    pub fn contention_setup(msg: impl Into<String>) -> Self {
        Self::ContentionSetup(msg.into())
    }

    /// Create a probe setup error
    pub fn probe_setup(msg: impl Into<String>) -> Self {
        Self::ProbeSetup(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is worth retrying in a later round.
    ///
    /// Setup failures on the instance count as retryable: the contention or
    /// probe was simply not applied this time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::Transport(_)
                | Error::Timeout(_)
                | Error::Unavailable(_)
                | Error::ContentionSetup(_)
                | Error::ProbeSetup(_)
                | Error::Internal(_)
        )
    }

    /// Check if this error indicates an operator-side problem
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfiguration(_)
                | Error::InvalidRequest(_)
                | Error::NotFound(_)
                | Error::Config(_)
                | Error::Url(_)
        )
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration(_) => "configuration",
            Error::Network(_) => "network",
            Error::Transport(_) => "transport",
            Error::Timeout(_) => "timeout",
            Error::NotFound(_) => "not_found",
            Error::Unavailable(_) => "unavailable",
            Error::InvalidRequest(_) => "invalid_request",
            Error::InvalidResponse(_) => "invalid_response",
            Error::ContentionSetup(_) => "contention_setup",
            Error::ProbeSetup(_) => "probe_setup",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Config(_) => "config",
            Error::Url(_) => "url",
            Error::Other(_) => "other",
        }
    }
}

/// Extension trait for adding context to Results
pub trait ErrorContext<T> {
    /// Add context to an error
    fn with_context(self, context: impl Into<String>) -> Result<T>;

    /// Add context to an error using a closure
    fn with_context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn with_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let original_error = e.into();
            Error::Other(anyhow::anyhow!("{}: {}", context.into(), original_error))
        })
    }

    fn with_context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let original_error = e.into();
            Error::Other(anyhow::anyhow!("{}: {}", f(), original_error))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::config("threshold missing");
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert_eq!(err.to_string(), "Configuration error: threshold missing");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::config("x").category(), "configuration");
        assert_eq!(Error::timeout("x").category(), "timeout");
        assert_eq!(Error::contention_setup("x").category(), "contention_setup");
    }

    #[test]
    fn test_error_classification() {
        let transport = Error::timeout("probe took too long");
        assert!(transport.is_retryable());
        assert!(!transport.is_client_error());

        let setup = Error::contention_setup("allocation failed");
        assert!(setup.is_retryable());
        assert!(!setup.is_client_error());

        let missing = Error::not_found("no /stop route");
        assert!(missing.is_client_error());
        assert!(!missing.is_retryable());

        let operator = Error::invalid_request("no instances");
        assert!(operator.is_client_error());
        assert!(!operator.is_retryable());
    }

    #[test]
    fn test_error_context() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));

        let err = result.with_context("failed to read instance list").unwrap_err();
        assert!(matches!(err, Error::Other(_)));
        assert!(err.to_string().contains("failed to read instance list"));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_context_fn() {
        let result: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "original error"));

        let err = result
            .with_context_fn(|| format!("probe of {} failed", "http://a"))
            .unwrap_err();

        assert!(err.to_string().contains("probe of http://a failed"));
        assert!(err.to_string().contains("original error"));
    }
}
