//! Error types for chvirt.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using chvirt's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification reported to the calling daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unsupported hardware or option requested.
    ConfigUnsupported,
    /// Malformed input.
    InvalidArgument,
    /// Illegal state transition.
    OperationInvalid,
    /// Feature not available in this mode.
    OperationUnsupported,
    /// Job acquisition exceeded its budget.
    OperationTimeout,
    /// Lookup miss.
    NoDomain,
    /// VMM protocol failure, I/O error.
    Internal,
}

impl ErrorKind {
    /// Get the kind name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::ConfigUnsupported => "config-unsupported",
            ErrorKind::InvalidArgument => "invalid-argument",
            ErrorKind::OperationInvalid => "operation-invalid",
            ErrorKind::OperationUnsupported => "operation-unsupported",
            ErrorKind::OperationTimeout => "operation-timeout",
            ErrorKind::NoDomain => "no-domain",
            ErrorKind::Internal => "internal-error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors that can occur in chvirt operations.
#[derive(Error, Debug)]
pub enum Error {
    // Request errors
    /// Unsupported configuration requested.
    #[error("unsupported configuration: {0}")]
    ConfigUnsupported(String),

    /// Malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation is not valid in the current state.
    #[error("operation invalid: {0}")]
    OperationInvalid(String),

    /// Operation is not supported.
    #[error("operation unsupported: {0}")]
    OperationUnsupported(String),

    /// Timed out waiting for the domain job.
    #[error("timeout: cannot acquire state change lock (held by {owner})")]
    JobTimeout {
        /// Description of the current job holder.
        owner: String,
    },

    // Lookup errors
    /// No domain matched the lookup key.
    #[error("no domain with matching {key} '{value}'")]
    NoDomain {
        /// Lookup key (name, uuid, id).
        key: &'static str,
        /// Lookup value.
        value: String,
    },

    // VMM errors
    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// VMM API call returned a non-success status.
    #[error("vmm api {endpoint} failed with status {status}")]
    Api {
        /// Endpoint name, e.g. `vm.boot`.
        endpoint: String,
        /// HTTP status code.
        status: u16,
    },

    /// Failure talking to the VMM API socket.
    #[error("vmm connection error on {}: {message}", path.display())]
    Connection {
        /// API socket path.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    // Host errors
    /// Cgroup operation failed.
    #[error("cgroup error: {0}")]
    Cgroup(String),

    /// External command failed.
    #[error("command failed: {command}: {message}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message.
        message: String,
    },

    // Configuration errors
    /// Failed to load configuration.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// Failed to save configuration.
    #[error("failed to save config: {0}")]
    ConfigSave(String),

    // Wrappers
    /// JSON encoding or decoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConfigUnsupported(_) => ErrorKind::ConfigUnsupported,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::OperationInvalid(_) => ErrorKind::OperationInvalid,
            Error::OperationUnsupported(_) => ErrorKind::OperationUnsupported,
            Error::JobTimeout { .. } => ErrorKind::OperationTimeout,
            Error::NoDomain { .. } => ErrorKind::NoDomain,
            _ => ErrorKind::Internal,
        }
    }

    /// Create an unsupported configuration error.
    pub fn config_unsupported(msg: impl Into<String>) -> Self {
        Self::ConfigUnsupported(msg.into())
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an invalid operation error.
    pub fn operation_invalid(msg: impl Into<String>) -> Self {
        Self::OperationInvalid(msg.into())
    }

    /// Create an unsupported operation error.
    pub fn operation_unsupported(msg: impl Into<String>) -> Self {
        Self::OperationUnsupported(msg.into())
    }

    /// Create an internal error with a message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a cgroup error with a message.
    pub fn cgroup(msg: impl Into<String>) -> Self {
        Self::Cgroup(msg.into())
    }

    /// Create a no-domain error for a name lookup.
    pub fn no_domain_name(name: impl Into<String>) -> Self {
        Self::NoDomain {
            key: "name",
            value: name.into(),
        }
    }

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a connection error for an API socket.
    pub fn connection(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        Self::Connection {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::Io(std::io::Error::from(err))
    }
}
