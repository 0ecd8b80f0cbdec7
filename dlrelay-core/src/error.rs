//! Error types for dlrelay-core
//!
//! Nothing on the push path returns these. They surface from configuration
//! loading, log directory setup, script loading and the delivery worker.

use thiserror::Error;

/// Main error type for the dlrelay-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Network or protocol failure talking to the transport endpoint
    #[error("transport error: {0}")]
    Transport(String),

    /// Endpoint answered with a non-success status
    #[error("transport endpoint returned {status}: {body}")]
    TransportStatus { status: u16, body: String },
}

impl Error {
    /// Whether retrying the same request may succeed.
    ///
    /// Server errors, timeouts and connection failures are transient;
    /// everything else fails the same way on every attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransportStatus { status, .. } => *status >= 500,
            Error::Transport(msg) => {
                msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("connection")
                    || msg.contains("request failed")
            }
            _ => false,
        }
    }
}

/// Result type alias for dlrelay-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(Error::TransportStatus {
            status: 503,
            body: "unavailable".to_string()
        }
        .is_transient());
        assert!(Error::Transport("request failed: connection refused".to_string()).is_transient());
        assert!(!Error::TransportStatus {
            status: 400,
            body: "bad request".to_string()
        }
        .is_transient());
        assert!(!Error::Config("bad".to_string()).is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(!Error::from(io).is_transient());
    }
}
