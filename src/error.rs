/// Unified error handling for the puente registry core
///
/// Covers the failure modes this crate owns: contradictory configuration,
/// on-disk serialization of server parameters, and registry lookups. Pool
/// exhaustion and stale pooled connections are deliberately not errors;
/// `fetch` returns `None` and sweeps recover silently.
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub use crate::config::ConfigError;

/// Main error type for registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Contradictory or over-long configuration, rejected before any mutation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Writing a server's configuration fragment to disk failed
    #[error("Failed to serialize server '{server}' to {path:?}: {source}")]
    Serialization {
        server: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Lookup of a server name that is not in the registry
    #[error("Unknown server '{0}'")]
    UnknownServer(String),

    /// Configuration file errors from the typed-parameter layer
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

impl RegistryError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        RegistryError::Validation(message.into())
    }

    /// Create a serialization error for a server and target path
    pub fn serialization<S: Into<String>, P: Into<PathBuf>>(
        server: S,
        path: P,
        source: io::Error,
    ) -> Self {
        RegistryError::Serialization {
            server: server.into(),
            path: path.into(),
            source,
        }
    }

    /// Check if this error leaves in-memory state untouched
    pub fn is_local(&self) -> bool {
        match self {
            RegistryError::Validation(_) => true,
            RegistryError::Serialization { .. } => true,
            RegistryError::UnknownServer(_) => true,
            RegistryError::Config(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let error = RegistryError::validation("monitoruser requires monitorpw");
        assert!(matches!(error, RegistryError::Validation(_)));
        assert_eq!(
            error.to_string(),
            "Validation error: monitoruser requires monitorpw"
        );
    }

    #[test]
    fn test_serialization_error_carries_path() {
        let source = io::Error::new(io::ErrorKind::AlreadyExists, "exists");
        let error = RegistryError::serialization("db-1", "/tmp/db-1.cnf", source);
        let text = error.to_string();
        assert!(text.contains("db-1"));
        assert!(text.contains("/tmp/db-1.cnf"));
    }

    #[test]
    fn test_errors_are_local() {
        assert!(RegistryError::validation("x").is_local());
        assert!(RegistryError::UnknownServer("y".to_string()).is_local());
    }
}
