//! Failures that stop the grader before or while it serves requests.
//!
//! Request-level failures never reach this type; handlers map them to HTTP statuses.

use crate::config::ConfigError;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Could not reach the database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Could not reach the container engine: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Staging directories for submissions live under this path.
    #[error("Cannot create the submissions directory {}: {source}", path.display())]
    SubmissionsDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot listen on {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server terminated: {0}")]
    Serve(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn io_failures_name_what_was_being_set_up() {
        let err = StartupError::SubmissionsDir {
            path: PathBuf::from("/srv/submissions"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(err.to_string().starts_with("Cannot create the submissions directory /srv/submissions"));
        assert!(err.source().is_some());

        let err = StartupError::Bind {
            address: "127.0.0.1:3000".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().starts_with("Cannot listen on 127.0.0.1:3000"));
    }
}
