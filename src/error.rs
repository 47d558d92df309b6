// src/error.rs

//! Error types for monitoring sessions.
//!
//! [`MonitorError`] is returned by every [`Session`](crate::session::Session) operation.
//! Backends report failures through [`BackendError`], which the session wraps into the
//! variant that matches the operation that failed.

use crate::request::{RequestId, RequestKind, RequestState};
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = MonitorError> = std::result::Result<T, E>;

/// Errors surfaced to the caller of a session or event loop operation.
///
/// # Error Recovery Strategy
///
/// - [`MonitorError::Connection`]: fatal to the session, not the process.
/// - [`MonitorError::Subscribe`]: caller decides whether to retry or skip the path.
/// - [`MonitorError::UnsupportedOperation`]: recoverable, fall back to cancel + resubscribe.
/// - [`MonitorError::UnknownRequest`], [`MonitorError::InvalidTransition`] and
///   [`MonitorError::NoEventAvailable`]: caller programming errors.
/// - [`MonitorError::Backend`]: the control call failed, local state is unchanged.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Subscribe(#[from] SubscribeError),

    #[error("unknown monitor request {id}")]
    UnknownRequest { id: RequestId },

    #[error("cannot {operation} request {id}: request is {state}")]
    InvalidTransition {
        id: RequestId,
        operation: Operation,
        state: RequestState,
    },

    #[error("{operation} is not supported by the {backend} backend")]
    UnsupportedOperation {
        operation: Operation,
        backend: &'static str,
    },

    #[error("no event available; check pending() before calling next_event()")]
    NoEventAvailable,

    #[error("backend failed to {operation} request {id}: {source}")]
    Backend {
        id: RequestId,
        operation: Operation,
        #[source]
        source: BackendError,
    },
}

impl MonitorError {
    /// Returns `true` if the session stays usable and the caller can branch on the error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedOperation { .. } | Self::Subscribe(_) | Self::Backend { .. }
        )
    }

    /// Returns `true` if the error stems from misuse of the API rather than the backend.
    #[must_use]
    pub const fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownRequest { .. } | Self::InvalidTransition { .. } | Self::NoEventAvailable
        )
    }

    /// Returns the request identifier associated with this error, if any.
    #[must_use]
    pub const fn request(&self) -> Option<RequestId> {
        match self {
            Self::UnknownRequest { id }
            | Self::InvalidTransition { id, .. }
            | Self::Backend { id, .. } => Some(*id),
            Self::Connection(_)
            | Self::Subscribe(_)
            | Self::UnsupportedOperation { .. }
            | Self::NoEventAvailable => None,
        }
    }
}

/// The backend session could not be used.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("couldn't open monitor connection for '{identity}': {source}")]
    Open {
        identity: String,
        #[source]
        source: BackendError,
    },

    #[error("monitor connection is closed")]
    Closed,

    #[error("monitor connection lost: {0}")]
    Lost(#[source] BackendError),
}

/// A subscription was rejected.
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("couldn't monitor {kind} \"{}\": path does not exist", path.display())]
    NotFound { kind: RequestKind, path: PathBuf },

    #[error("couldn't monitor {kind} \"{}\": path is not a {kind}", path.display())]
    WrongType { kind: RequestKind, path: PathBuf },

    #[error("couldn't monitor {kind} \"{}\": already monitored by request {existing}", path.display())]
    Duplicate {
        kind: RequestKind,
        path: PathBuf,
        existing: RequestId,
    },

    #[error("couldn't monitor {kind} \"{}\": {source}", path.display())]
    Refused {
        kind: RequestKind,
        path: PathBuf,
        #[source]
        source: BackendError,
    },
}

impl SubscribeError {
    /// Returns the path the failed subscription named.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        match self {
            Self::NotFound { path, .. }
            | Self::WrongType { path, .. }
            | Self::Duplicate { path, .. }
            | Self::Refused { path, .. } => path,
        }
    }
}

/// Failures reported by a [`Backend`](crate::backend::Backend) implementation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("operation not supported: {0}")]
    Unsupported(Operation),

    #[error("unknown backend request {0}")]
    UnknownRequest(u64),

    #[error("request refused: {0}")]
    Refused(String),

    #[error("backend disconnected")]
    Disconnected,

    #[error("notify watcher error: {0}")]
    Notify(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The request-level operations, used to label errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Subscribe,
    Suspend,
    Resume,
    Cancel,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Subscribe => "subscribe",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
        })
    }
}
