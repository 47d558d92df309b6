// src/backend/mod.rs

//! The notification backend a [`Session`](crate::session::Session) talks to.
//!
//! A backend detects changes and hands out raw notifications tagged with its own request
//! identifiers. Two implementations ship with the crate:
//!
//! - [`NotifyBackend`]: watches the real filesystem through the `notify` crate.
//! - [`MemoryBackend`]: a scripted backend driven through a [`MemoryHandle`].

pub mod memory;
pub mod watcher;

pub use self::memory::{MemoryBackend, MemoryHandle};
pub use self::watcher::NotifyBackend;

use crate::error::BackendError;
use crate::event::EventCode;
use crate::request::{BackendRequestId, CollectionSpec, RequestKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;

/// What a backend can do beyond the mandatory primitives.
///
/// Used by the session to report missing features as a named, recoverable error
/// instead of forwarding a backend-specific failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub suspend_resume: bool,
    pub collections: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            suspend_resume: true,
            collections: true,
        }
    }
}

/// Verbosity of backend diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugLevel {
    #[default]
    Off,
    On,
    Verbose,
}

/// An undecoded notification as delivered by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub code: EventCode,
    pub path: PathBuf,
    pub request: BackendRequestId,
}

impl RawNotification {
    pub fn new(code: EventCode, path: impl Into<PathBuf>, request: BackendRequestId) -> Self {
        Self {
            code,
            path: path.into(),
            request,
        }
    }
}

/// The primitives a change-notification service must provide.
///
/// `pending` and `next_raw` must never block. Control calls may fail, in which case the
/// session leaves its own bookkeeping untouched.
pub trait Backend {
    /// Short name used in error messages and logs.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Subscribes `path` and returns the backend's identifier for the subscription.
    ///
    /// Directory and collection subscriptions queue an existence scan: one `Exists`
    /// notification per member followed by `EndExist`.
    fn subscribe(
        &mut self,
        kind: RequestKind,
        path: &Path,
        collection: Option<&CollectionSpec>,
    ) -> Result<BackendRequestId, BackendError>;

    fn suspend(&mut self, request: BackendRequestId) -> Result<(), BackendError>;

    fn resume(&mut self, request: BackendRequestId) -> Result<(), BackendError>;

    fn cancel(&mut self, request: BackendRequestId) -> Result<(), BackendError>;

    /// Returns `true` if [`next_raw`](Self::next_raw) would yield a notification.
    fn pending(&mut self) -> Result<bool, BackendError>;

    /// Returns the next notification in delivery order, or `None` if none is queued.
    fn next_raw(&mut self) -> Result<Option<RawNotification>, BackendError>;

    /// Sets the diagnostic verbosity. Backends without diagnostics ignore it.
    fn set_debug_level(&mut self, level: DebugLevel) {
        let _ = level;
    }

    /// A signal notified whenever new notifications may be pending.
    ///
    /// Wakes may be spurious; `pending` stays the source of truth.
    fn readiness(&self) -> Option<Arc<Notify>> {
        None
    }

    /// Releases the connection. Must be idempotent.
    fn close(&mut self) -> Result<(), BackendError>;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn subscribe(
        &mut self,
        kind: RequestKind,
        path: &Path,
        collection: Option<&CollectionSpec>,
    ) -> Result<BackendRequestId, BackendError> {
        (**self).subscribe(kind, path, collection)
    }

    fn suspend(&mut self, request: BackendRequestId) -> Result<(), BackendError> {
        (**self).suspend(request)
    }

    fn resume(&mut self, request: BackendRequestId) -> Result<(), BackendError> {
        (**self).resume(request)
    }

    fn cancel(&mut self, request: BackendRequestId) -> Result<(), BackendError> {
        (**self).cancel(request)
    }

    fn pending(&mut self) -> Result<bool, BackendError> {
        (**self).pending()
    }

    fn next_raw(&mut self) -> Result<Option<RawNotification>, BackendError> {
        (**self).next_raw()
    }

    fn set_debug_level(&mut self, level: DebugLevel) {
        (**self).set_debug_level(level);
    }

    fn readiness(&self) -> Option<Arc<Notify>> {
        (**self).readiness()
    }

    fn close(&mut self) -> Result<(), BackendError> {
        (**self).close()
    }
}
