// src/request.rs

//! Monitor requests and their lifecycle state machine.
//!
//! ```text
//!            suspend            cancel
//!   Active ───────────▶ Suspended ──────▶ Cancelled
//!     ▲  │   resume        │
//!     │  └───────◀─────────┘
//!     │
//!     └──────────── cancel ─────────────▶ Cancelled
//! ```

use crate::error::{MonitorError, Operation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Session-unique identifier of a monitor request.
///
/// Identifiers are allocated monotonically and never reused, even after cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Wraps a raw request number.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw request number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier the backend assigned to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendRequestId(pub u64);

/// What a request monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    File,
    Directory,
    Collection,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::Collection => "collection",
        })
    }
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Active,
    Suspended,
    Cancelled,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Cancelled => "cancelled",
        })
    }
}

impl RequestState {
    /// Computes the state reached by applying `operation`, or `None` if the transition is invalid.
    ///
    /// Cancelling a cancelled request is handled by the registry as a no-op and is not a
    /// transition.
    #[must_use]
    pub const fn after(self, operation: Operation) -> Option<Self> {
        match (self, operation) {
            (Self::Active, Operation::Suspend) => Some(Self::Suspended),
            (Self::Suspended, Operation::Resume) => Some(Self::Active),
            (Self::Active | Self::Suspended, Operation::Cancel) => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Depth and filename mask of a collection subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    /// How many directory levels below the root are monitored. `0` means the root's
    /// immediate members only.
    pub depth: u32,
    /// Glob matched against member file names, e.g. `*.jpg`.
    pub mask: String,
}

/// One subscription and its current lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorRequest {
    id: RequestId,
    kind: RequestKind,
    path: PathBuf,
    collection: Option<CollectionSpec>,
    state: RequestState,
    #[serde(skip)]
    backend_id: BackendRequestId,
}

impl MonitorRequest {
    pub(crate) fn new(
        id: RequestId,
        kind: RequestKind,
        path: PathBuf,
        collection: Option<CollectionSpec>,
        backend_id: BackendRequestId,
    ) -> Self {
        Self {
            id,
            kind,
            path,
            collection,
            state: RequestState::Active,
            backend_id,
        }
    }

    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        self.kind
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn collection(&self) -> Option<&CollectionSpec> {
        self.collection.as_ref()
    }

    #[must_use]
    pub const fn state(&self) -> RequestState {
        self.state
    }

    /// Returns `true` while the request is receiving notifications.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == RequestState::Active
    }

    pub(crate) const fn backend_id(&self) -> BackendRequestId {
        self.backend_id
    }

    /// Checks that `operation` is valid from the current state without applying it.
    pub(crate) fn check(&self, operation: Operation) -> Result<RequestState, MonitorError> {
        self.state
            .after(operation)
            .ok_or(MonitorError::InvalidTransition {
                id: self.id,
                operation,
                state: self.state,
            })
    }

    pub(crate) fn set_state(&mut self, state: RequestState) {
        self.state = state;
    }
}
