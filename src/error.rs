use std::io;

use thiserror::Error;

/// Everything that can go wrong while tailing files or serving sessions.
///
/// Variants carrying a `String` hold the client-facing path that caused the
/// failure, so the `Display` output can be sent back to a viewer as-is.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid path: {0:?}")]
    InvalidPath(String),
    #[error("Path is outside of the root directory: {0}")]
    OutsideRoot(String),
    #[error("Not a regular file: {0}")]
    NotAFile(String),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Access denied: {0}")]
    AccessDenied(String),
    #[error("Failed to read {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("Malformed command: {0}")]
    Protocol(String),
    #[error("Session outbox is full")]
    Backpressure,
    #[error("Session is closed")]
    SessionClosed,
    #[error("Session is already registered")]
    DuplicateSession,
    #[error("Session is not registered")]
    UnknownSession,
    #[error("Hub is shutting down")]
    ShuttingDown,
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to watch path: {0}")]
    Watch(#[from] notify::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Maps an I/O error for a client-facing path onto the variants viewers
    /// understand. Anything unexpected still names the path.
    pub(crate) fn from_io(err: io::Error, name: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound(name.to_string()),
            io::ErrorKind::PermissionDenied => Error::AccessDenied(name.to_string()),
            _ => Error::Read {
                name: name.to_string(),
                source: err,
            },
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_names_the_path() {
        let err = Error::from_io(io::Error::from(io::ErrorKind::NotFound), "app.log");
        assert_eq!(err.to_string(), "File not found: app.log");

        let err = Error::from_io(
            io::Error::from(io::ErrorKind::PermissionDenied),
            "secret.log",
        );
        assert!(matches!(&err, Error::AccessDenied(name) if name == "secret.log"));
        assert_eq!(err.to_string(), "Access denied: secret.log");

        let err = Error::from_io(io::Error::new(io::ErrorKind::Other, "disk on fire"), "app.log");
        assert!(matches!(err, Error::Read { .. }));
        assert_eq!(err.to_string(), "Failed to read app.log: disk on fire");
    }
}
