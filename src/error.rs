//! Error types for redis fixtures.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for fixture operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort `RedisServer::start`.
///
/// Every variant is raised before `start` returns; teardown problems are
/// logged instead and never show up here.
#[derive(Debug, Error)]
pub enum Error {
    /// No usable redis-server executable.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// The configuration could not be built.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The OS refused to start the process or the server could not bind.
    #[error("redis-server failed to start on port {port}: {reason}")]
    BindOrStart {
        /// Port the server was asked to listen on.
        port: u16,
        /// Reason for failure.
        reason: String,
    },

    /// The ready marker never showed up.
    #[error("redis-server on port {port} not ready within {timeout:?}")]
    StartupTimeout {
        /// Port the server was asked to listen on.
        port: u16,
        /// Configured startup timeout.
        timeout: Duration,
    },

    /// The process exited on its own before it became ready.
    #[error("redis-server on port {port} exited before becoming ready ({status})")]
    ProcessExited {
        /// Port the server was asked to listen on.
        port: u16,
        /// Exit status as reported by the OS.
        status: String,
        /// Last lines the process wrote before exiting.
        output: Vec<String>,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for failures where retrying on another port may help.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            Error::BindOrStart { .. } | Error::StartupTimeout { .. } | Error::ProcessExited { .. }
        )
    }
}

/// Errors locating or materializing the server executable.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// The bundle has no entry for this platform.
    #[error("no bundled executable named '{name}'")]
    MissingResource {
        /// Resource key that was requested.
        name: String,
    },

    /// The platform lookup tool found nothing.
    #[error("'{program}' was not found on PATH")]
    NotOnPath {
        /// Program name passed to the lookup tool.
        program: String,
    },

    /// A path was reported or configured but does not exist.
    #[error("executable path does not exist: {}", path.display())]
    NotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// The path exists but cannot be used.
    #[error("executable '{}' is not readable: {reason}", path.display())]
    Unreadable {
        /// The offending path.
        path: PathBuf,
        /// Reason for failure.
        reason: String,
    },

    /// Copying the bundled executable to disk failed.
    #[error("failed to extract bundled executable: {reason}")]
    Extract {
        /// Reason for failure.
        reason: String,
    },

    /// No redis-server build exists for this OS.
    #[error("unsupported platform: {os}")]
    UnsupportedPlatform {
        /// Value of `std::env::consts::OS`.
        os: String,
    },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is out of range or failed to parse.
    #[error("invalid value for {key}: {message}")]
    InvalidValue {
        /// Setting or environment variable name.
        key: String,
        /// What was wrong with it.
        message: String,
    },
}
