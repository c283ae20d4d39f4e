//! Error types for the on-instance primitives

use std::path::PathBuf;

/// Failure to set up or run the contention generator
#[derive(Debug, thiserror::Error)]
pub enum ContentionError {
    #[error("Invalid contention configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to allocate {bytes} bytes for contention buffer")]
    Allocation { bytes: usize },

    #[error("Failed to spawn contention worker {worker}: {source}")]
    Spawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Contention worker panicked")]
    WorkerPanicked,
}

/// Failure to set up the timing probe
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Failed to open probe target {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to map probe target: {0}")]
    Map(#[source] std::io::Error),

    #[error("Probe target {0} is empty")]
    EmptyTarget(PathBuf),

    #[error("Invalid probe configuration: {0}")]
    InvalidConfiguration(String),
}

impl From<ContentionError> for cohost_core::Error {
    fn from(err: ContentionError) -> Self {
        match err {
            ContentionError::InvalidConfiguration(msg) => cohost_core::Error::invalid_request(msg),
            other => cohost_core::Error::contention_setup(other.to_string()),
        }
    }
}

impl From<ProbeError> for cohost_core::Error {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::InvalidConfiguration(msg) => cohost_core::Error::config(msg),
            other => cohost_core::Error::probe_setup(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_to_core() {
        let err: cohost_core::Error = ContentionError::Allocation { bytes: 1024 }.into();
        assert!(matches!(err, cohost_core::Error::ContentionSetup(_)));
        assert!(err.is_retryable());

        let err: cohost_core::Error =
            ContentionError::InvalidConfiguration("workers must be > 0".into()).into();
        assert!(err.is_client_error());

        let err: cohost_core::Error = ProbeError::EmptyTarget("/tmp/x".into()).into();
        assert_eq!(err.category(), "probe_setup");
    }
}
