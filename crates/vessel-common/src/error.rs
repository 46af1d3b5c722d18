//! Common error types for the Vessel engine.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`VesselError`].
pub type VesselResult<T> = Result<T, VesselError>;

/// Common errors across the Vessel engine.
#[derive(Error, Diagnostic, Debug)]
pub enum VesselError {
    /// Malformed or unauthorized configuration, detected before any mount.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(vessel::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// The privileged operation channel is broken or replied garbage.
    #[error("Privileged channel transport error: {message}")]
    #[diagnostic(
        code(vessel::transport),
        help("The privileged helper process has died or the socket was closed")
    )]
    Transport {
        /// The error message.
        message: String,
    },

    /// The privileged helper executed the syscall and it failed.
    #[error("{operation} failed on {}: errno {errno}", path.display())]
    #[diagnostic(code(vessel::remote))]
    Remote {
        /// The operation that failed.
        operation: String,
        /// The path the operation targeted.
        path: PathBuf,
        /// The raw errno returned by the helper.
        errno: i32,
    },

    /// Duplicate mount destination submitted to the registry.
    #[error("Duplicate mount destination: {}", destination.display())]
    #[diagnostic(code(vessel::mount::duplicate))]
    DuplicateMount {
        /// The destination that was already registered.
        destination: PathBuf,
    },

    /// An image or loop attachment failed.
    #[error("Image attachment failed: {message}")]
    #[diagnostic(code(vessel::attach))]
    Attach {
        /// The error message.
        message: String,
    },

    /// All loop device slots are in use.
    #[error("No loop device available: all {max} slots in use")]
    #[diagnostic(
        code(vessel::attach::capacity),
        help("Raise 'max loop devices' in the engine configuration")
    )]
    LoopCapacity {
        /// The configured device limit.
        max: u32,
    },

    /// A capability or identity check failed. Never downgraded to a warning.
    #[error("Not authorized: {message}")]
    #[diagnostic(code(vessel::privilege))]
    Privilege {
        /// The error message.
        message: String,
    },

    /// Feature not supported on this platform or kernel.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(vessel::unsupported))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(vessel::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(vessel::serialization))]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(vessel::internal),
        help("This is a bug, please report it at https://github.com/vessel-runtime/vessel/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl VesselError {
    /// Whether the error is fatal regardless of where it surfaced.
    ///
    /// Transport and privilege errors can never be downgraded to warnings
    /// by the lifecycle controller.
    #[must_use]
    pub fn is_always_fatal(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Privilege { .. })
    }

    /// The errno carried by a remote failure, if any.
    #[must_use]
    pub fn remote_errno(&self) -> Option<i32> {
        match self {
            Self::Remote { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for VesselError {
    fn from(err: serde_json::Error) -> Self {
        VesselError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = VesselError::DuplicateMount {
            destination: PathBuf::from("/etc/hosts"),
        };
        assert_eq!(err.to_string(), "Duplicate mount destination: /etc/hosts");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: VesselError = io_err.into();
        assert!(matches!(err, VesselError::Io(_)));
    }

    #[test]
    fn transport_is_always_fatal() {
        let err = VesselError::Transport {
            message: "socket closed".to_string(),
        };
        assert!(err.is_always_fatal());

        let err = VesselError::Remote {
            operation: "mount".to_string(),
            path: PathBuf::from("/proc"),
            errno: 16,
        };
        assert!(!err.is_always_fatal());
    }

    #[test]
    fn remote_errno_accessor() {
        let err = VesselError::Remote {
            operation: "mount".to_string(),
            path: PathBuf::from("/mnt"),
            errno: 16,
        };
        assert_eq!(err.remote_errno(), Some(16));
    }
}
