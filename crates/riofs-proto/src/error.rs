//! Error taxonomy shared between the VFS layer and the wire protocol.
//!
//! Backend errors are surfaced verbatim to the wire reply; the dispatcher
//! never retries. Each kind has a stable wire code so a reply envelope can
//! carry the failure across a channel and reconstruct it on the other side.

use thiserror::Error;

/// Result alias used throughout riofs.
pub type VfsResult<T> = Result<T, VfsError>;

/// The error kinds a VFS operation can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VfsError {
    /// Malformed path, wrong-sized buffer, bad seek, bad ioctl shape, or a
    /// token whose association was erased.
    #[error("invalid argument")]
    InvalidArgument,
    /// A path segment exceeds the maximum name length.
    #[error("name too long")]
    NameTooLong,
    /// Lookup miss, or unmount of a node that is not mounted.
    #[error("not found")]
    NotFound,
    /// Exclusive creation hit an existing entry.
    #[error("already exists")]
    AlreadyExists,
    /// A remote is already attached to the node (double mount).
    #[error("already bound")]
    AlreadyBound,
    /// Unhandled opcode, or the backend does not implement the operation.
    #[error("not supported")]
    NotSupported,
    /// Remote not ready, peer closed during hand-off, or a mount target that
    /// cannot be resolved.
    #[error("unavailable")]
    Unavailable,
    /// Operation aimed at a node the caller cannot name.
    #[error("access denied")]
    AccessDenied,
    /// Directory intent aimed at a non-directory (trailing separator on a
    /// file, link to a directory).
    #[error("not a directory")]
    NotADirectory,
    /// Malformed wire message or handle-count mismatch.
    #[error("i/o error")]
    Io,
    /// A bounded wait (unmount handshake) expired.
    #[error("timed out")]
    TimedOut,
}

impl VfsError {
    /// Stable wire code for this error kind.
    pub fn code(self) -> u32 {
        match self {
            VfsError::InvalidArgument => 1,
            VfsError::NameTooLong => 2,
            VfsError::NotFound => 3,
            VfsError::AlreadyExists => 4,
            VfsError::AlreadyBound => 5,
            VfsError::NotSupported => 6,
            VfsError::Unavailable => 7,
            VfsError::AccessDenied => 8,
            VfsError::NotADirectory => 9,
            VfsError::Io => 10,
            VfsError::TimedOut => 11,
        }
    }

    /// Reconstruct an error kind from its wire code.
    ///
    /// Unknown codes collapse to [`VfsError::Io`]: a peer speaking a newer
    /// revision must not be able to smuggle an unrepresentable status.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => VfsError::InvalidArgument,
            2 => VfsError::NameTooLong,
            3 => VfsError::NotFound,
            4 => VfsError::AlreadyExists,
            5 => VfsError::AlreadyBound,
            6 => VfsError::NotSupported,
            7 => VfsError::Unavailable,
            8 => VfsError::AccessDenied,
            9 => VfsError::NotADirectory,
            11 => VfsError::TimedOut,
            _ => VfsError::Io,
        }
    }
}
