//! Error types for rprox.

use thiserror::Error;

/// Process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Normal exit
    Success = 0,
    /// Failure while relaying
    Runtime = 1,
    /// Invalid configuration (bad flags, missing or unreadable cert files)
    ConfigInvalid = 2,
    /// Could not bind the listening socket
    ListenFailed = 10,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

/// Main error type for rprox.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Tls(#[from] crate::tls::TlsError),

    #[error("TLS error: {0}")]
    Handshake(#[from] rustls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the exit code for this error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::Config(_) => ExitCode::ConfigInvalid,
            Error::Tls(_) => ExitCode::ConfigInvalid,
            Error::Handshake(_) => ExitCode::Runtime,
            Error::Io(_) => ExitCode::ListenFailed,
        }
    }
}

/// Result type alias for rprox operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_exits_nonzero() {
        let err = Error::Config("specify a TLS certificate".to_string());
        assert_eq!(err.exit_code(), ExitCode::ConfigInvalid);
        assert_ne!(i32::from(err.exit_code()), 0);
    }

    #[test]
    fn bind_failure_maps_to_listen_failed() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err = Error::from(io);
        assert_eq!(err.exit_code(), ExitCode::ListenFailed);
    }

    #[test]
    fn config_display_includes_reason() {
        let reason = "cert file missing.pem doesn't exist";
        let err = Error::Config(reason.to_string());
        assert!(err.to_string().contains(reason));
    }
}
