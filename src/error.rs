//! Error types for the container engine.
//!
//! Every fallible operation returns [`Result`]. An [`Error`] is a kind
//! plus an optional OS errno and a context message; kinds map one-to-one
//! onto the wire-level error codes reported to clients, except
//! [`ErrorKind::Queued`] which never leaves the daemon.

use std::fmt;
use std::io;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced to clients (and one internal sentinel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorKind {
    /// Anything without a more precise classification.
    Unknown = 1,
    /// A property value or request argument failed validation.
    InvalidValue = 2,
    /// The operation is not allowed in the container's current state.
    InvalidState = 3,
    /// No such property.
    InvalidProperty = 4,
    /// Container lookup failed.
    ContainerDoesNotExist = 5,
    /// Create on a name that is already taken.
    ContainerAlreadyExists = 6,
    /// Caller lacks the rights for the operation.
    Permission = 7,
    /// A try-lock found the container held.
    Busy = 8,
    /// The filesystem ran out of space.
    NoSpace = 9,
    /// A kernel resource (ids, memory for clone) was exhausted.
    ResourceNotAvailable = 10,
    /// The host cannot provide the feature (missing controller etc.).
    NotSupported = 11,
    /// Internal: a non-blocking read needs more bytes. Never sent to
    /// clients.
    Queued = 12,
}

impl ErrorKind {
    /// Decodes a kind from its wire representation.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            2 => Self::InvalidValue,
            3 => Self::InvalidState,
            4 => Self::InvalidProperty,
            5 => Self::ContainerDoesNotExist,
            6 => Self::ContainerAlreadyExists,
            7 => Self::Permission,
            8 => Self::Busy,
            9 => Self::NoSpace,
            10 => Self::ResourceNotAvailable,
            11 => Self::NotSupported,
            12 => Self::Queued,
            _ => Self::Unknown,
        }
    }

    /// Short name used in log lines and wire messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::InvalidValue => "InvalidValue",
            Self::InvalidState => "InvalidState",
            Self::InvalidProperty => "InvalidProperty",
            Self::ContainerDoesNotExist => "ContainerDoesNotExist",
            Self::ContainerAlreadyExists => "ContainerAlreadyExists",
            Self::Permission => "Permission",
            Self::Busy => "Busy",
            Self::NoSpace => "NoSpace",
            Self::ResourceNotAvailable => "ResourceNotAvailable",
            Self::NotSupported => "NotSupported",
            Self::Queued => "Queued",
        }
    }
}

/// A typed engine error: kind, optional errno, context message.
///
/// Errors are cheap to clone so they can cross the launcher's
/// synchronization socket and be stored in wait records.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", self.render())]
pub struct Error {
    kind: ErrorKind,
    errno: i32,
    msg: String,
}

impl Error {
    /// Creates an error without an errno.
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            errno: 0,
            msg: msg.into(),
        }
    }

    /// Creates an error carrying an OS errno.
    pub fn with_errno(kind: ErrorKind, errno: i32, msg: impl Into<String>) -> Self {
        Self {
            kind,
            errno,
            msg: msg.into(),
        }
    }

    /// Captures the calling thread's last OS error as `Unknown`.
    pub fn sys(msg: impl Into<String>) -> Self {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Self::with_errno(ErrorKind::Unknown, errno, msg)
    }

    /// The internal "need more bytes" sentinel.
    pub fn queued() -> Self {
        Self::new(ErrorKind::Queued, "queued")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn errno(&self) -> i32 {
        self.errno
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Wraps this error with additional context, keeping kind and errno.
    pub fn context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            errno: self.errno,
            msg: format!("{}: {}", ctx, self.msg),
        }
    }

    fn render(&self) -> String {
        if self.errno != 0 {
            format!(
                "{}: {} ({})",
                self.kind.as_str(),
                self.msg,
                io::Error::from_raw_os_error(self.errno)
            )
        } else {
            format!("{}: {}", self.kind.as_str(), self.msg)
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let kind = match err.raw_os_error() {
            Some(e) if e == libc::ENOSPC => ErrorKind::NoSpace,
            _ => ErrorKind::Unknown,
        };
        Self::with_errno(kind, err.raw_os_error().unwrap_or(0), err.to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        let kind = match err {
            nix::Error::ENOSPC => ErrorKind::NoSpace,
            _ => ErrorKind::Unknown,
        };
        Self::with_errno(kind, err as i32, err.desc().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for raw in 1..=12 {
            let kind = ErrorKind::from_raw(raw);
            assert_eq!(kind as u32, raw);
        }
        assert_eq!(ErrorKind::from_raw(0), ErrorKind::Unknown);
        assert_eq!(ErrorKind::from_raw(999), ErrorKind::Unknown);
    }

    #[test]
    fn test_display_with_errno() {
        let err = Error::with_errno(ErrorKind::Unknown, libc::ENOENT, "open(/nowhere)");
        let text = err.to_string();
        assert!(text.contains("open(/nowhere)"));
        assert!(text.starts_with("Unknown"));
    }

    #[test]
    fn test_io_enospc_classified() {
        let err: Error = io::Error::from_raw_os_error(libc::ENOSPC).into();
        assert_eq!(err.kind(), ErrorKind::NoSpace);
    }

    #[test]
    fn test_context_preserves_kind() {
        let err = Error::new(ErrorKind::Permission, "no write access").context("set command");
        assert_eq!(err.kind(), ErrorKind::Permission);
        assert!(err.message().starts_with("set command:"));
    }
}
