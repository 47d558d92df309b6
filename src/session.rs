// src/session.rs

//! Monitoring sessions.
//!
//! A [`Session`] owns one backend connection and the registry of requests made through
//! it. Change notifications are consumed with the non-blocking pair
//! [`Session::pending`] / [`Session::next_event`], which lets a caller interleave event
//! draining with other input in a single cooperative loop (see
//! [`EventLoop`](crate::event_loop::EventLoop)).
//!
//! # Cancellation and queued events
//!
//! Cancelling a request only affects notifications the backend produces afterwards.
//! Before the backend is told to cancel, every notification it already holds is decoded
//! into the session's local queue, and those events are still returned by
//! [`Session::next_event`].

use crate::backend::{Backend, Capabilities, DebugLevel, NotifyBackend, RawNotification};
use crate::config::MonitorConfig;
use crate::error::{BackendError, ConnectionError, MonitorError, Operation, Result, SubscribeError};
use crate::event::Event;
use crate::registry::{CancelTarget, RequestRegistry};
use crate::request::{CollectionSpec, MonitorRequest, RequestId, RequestKind, RequestState};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// How a subscription to an already-monitored path is treated.
///
/// Backends disagree here: some hand out a fresh request, others refuse the duplicate.
/// A cancelled request never counts as a duplicate under either policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Every subscribe creates a new request with a new identifier.
    #[default]
    Allow,
    /// Subscribing a kind and path that a live request already covers fails with
    /// [`SubscribeError::Duplicate`].
    Reject,
}

/// A connection to a change-notification backend and the requests made through it.
pub struct Session<B: Backend = NotifyBackend> {
    identity: String,
    backend: B,
    open: bool,
    registry: RequestRegistry,
    queue: VecDeque<Event>,
    duplicate_policy: DuplicatePolicy,
}

impl Session<NotifyBackend> {
    /// Opens a filesystem session with default settings.
    ///
    /// `identity` labels the client in diagnostics and has no protocol meaning.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Open`] if the watcher cannot be started.
    pub fn open(identity: &str) -> Result<Self> {
        Self::open_with(identity, &MonitorConfig::default())
    }

    /// Opens a filesystem session using the debounce and duplicate policy from `config`.
    pub fn open_with(identity: &str, config: &MonitorConfig) -> Result<Self> {
        let backend = NotifyBackend::open(identity, config.debounce()).map_err(|source| {
            ConnectionError::Open {
                identity: identity.to_string(),
                source,
            }
        })?;
        Ok(Self::with_backend(identity, backend).with_duplicate_policy(config.duplicate_policy))
    }
}

impl<B: Backend> Session<B> {
    /// Wraps an already connected backend.
    pub fn with_backend(identity: impl Into<String>, backend: B) -> Self {
        let identity = identity.into();
        debug!("Session '{}' using {} backend", identity, backend.name());
        Self {
            identity,
            backend,
            open: true,
            registry: RequestRegistry::new(),
            queue: VecDeque::new(),
            duplicate_policy: DuplicatePolicy::default(),
        }
    }

    #[must_use]
    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Sets the backend's diagnostic verbosity.
    pub fn set_debug_level(&mut self, level: DebugLevel) {
        self.backend.set_debug_level(level);
    }

    /// Monitors a single file.
    pub fn monitor_file(&mut self, path: impl AsRef<Path>) -> Result<MonitorRequest> {
        self.subscribe_with(RequestKind::File, path.as_ref(), None)
    }

    /// Monitors a directory and its immediate members.
    pub fn monitor_directory(&mut self, path: impl AsRef<Path>) -> Result<MonitorRequest> {
        self.subscribe_with(RequestKind::Directory, path.as_ref(), None)
    }

    /// Monitors the members of `path` up to `depth` levels down whose names match `mask`.
    pub fn monitor_collection(
        &mut self,
        path: impl AsRef<Path>,
        depth: u32,
        mask: &str,
    ) -> Result<MonitorRequest> {
        let spec = CollectionSpec {
            depth,
            mask: mask.to_string(),
        };
        self.subscribe_with(RequestKind::Collection, path.as_ref(), Some(spec))
    }

    /// Subscribes `path` as `kind`. Collections use depth 0 and match every name.
    ///
    /// The returned [`MonitorRequest`] is a snapshot; use [`Session::request`] for the
    /// live state.
    pub fn subscribe(&mut self, kind: RequestKind, path: impl AsRef<Path>) -> Result<MonitorRequest> {
        let spec = (kind == RequestKind::Collection).then(|| CollectionSpec {
            depth: 0,
            mask: "*".to_string(),
        });
        self.subscribe_with(kind, path.as_ref(), spec)
    }

    fn subscribe_with(
        &mut self,
        kind: RequestKind,
        path: &Path,
        collection: Option<CollectionSpec>,
    ) -> Result<MonitorRequest> {
        self.ensure_open()?;
        validate_path(kind, path)?;
        if kind == RequestKind::Collection && !self.backend.capabilities().collections {
            return Err(MonitorError::UnsupportedOperation {
                operation: Operation::Subscribe,
                backend: self.backend.name(),
            });
        }
        if self.duplicate_policy == DuplicatePolicy::Reject {
            if let Some(existing) = self.registry.find_live(kind, path) {
                return Err(SubscribeError::Duplicate {
                    kind,
                    path: path.to_path_buf(),
                    existing: existing.id(),
                }
                .into());
            }
        }

        let backend_id = self
            .backend
            .subscribe(kind, path, collection.as_ref())
            .map_err(|source| SubscribeError::Refused {
                kind,
                path: path.to_path_buf(),
                source,
            })?;
        let id = self.registry.allocate();
        let request = self
            .registry
            .insert(id, kind, path.to_path_buf(), collection, backend_id)
            .clone();
        info!(
            "Session '{}' monitoring {} {} as request {}",
            self.identity,
            kind,
            path.display(),
            id
        );
        Ok(request)
    }

    /// Returns the live view of a request.
    pub fn request(&self, id: RequestId) -> Result<&MonitorRequest> {
        self.registry.lookup(id)
    }

    /// Iterates the active and suspended requests in identifier order.
    pub fn requests(&self) -> impl Iterator<Item = &MonitorRequest> {
        self.registry.iter()
    }

    /// Stops delivery for a request until it is resumed.
    ///
    /// # Errors
    ///
    /// - [`MonitorError::InvalidTransition`] unless the request is active.
    /// - [`MonitorError::UnsupportedOperation`] if the backend cannot suspend; the request
    ///   stays active.
    pub fn suspend(&mut self, id: RequestId) -> Result<()> {
        self.transition(id, Operation::Suspend)
    }

    /// Restarts delivery for a suspended request.
    pub fn resume(&mut self, id: RequestId) -> Result<()> {
        self.transition(id, Operation::Resume)
    }

    fn transition(&mut self, id: RequestId, operation: Operation) -> Result<()> {
        self.ensure_open()?;
        let (backend_id, next) = self.registry.prepare(id, operation)?;
        let backend = self.backend.name();
        if !self.backend.capabilities().suspend_resume {
            return Err(MonitorError::UnsupportedOperation { operation, backend });
        }
        let issued = match operation {
            Operation::Suspend => self.backend.suspend(backend_id),
            _ => self.backend.resume(backend_id),
        };
        issued.map_err(|e| control_error(backend, id, operation, e))?;
        self.registry.commit(id, next)?;
        debug!("Request {} is now {}", id, next);
        Ok(())
    }

    /// Cancels a request. Cancelling an already cancelled request does nothing.
    ///
    /// Events decoded before the cancellation, including everything the backend had
    /// already queued, are still delivered.
    pub fn cancel(&mut self, id: RequestId) -> Result<()> {
        self.ensure_open()?;
        let backend_id = match self.registry.prepare_cancel(id)? {
            CancelTarget::AlreadyCancelled => {
                debug!("Request {} already cancelled", id);
                return Ok(());
            }
            CancelTarget::Live(backend_id) => backend_id,
        };
        self.drain_backend()?;
        let backend = self.backend.name();
        self.backend
            .cancel(backend_id)
            .map_err(|e| control_error(backend, id, Operation::Cancel, e))?;
        self.registry.commit(id, RequestState::Cancelled)?;
        info!("Session '{}' cancelled request {}", self.identity, id);
        Ok(())
    }

    /// Returns `true` if [`next_event`](Self::next_event) has an event to return.
    ///
    /// Never blocks. Notifications for requests the session no longer knows are
    /// discarded here.
    pub fn pending(&mut self) -> Result<bool> {
        self.ensure_open()?;
        while self.queue.is_empty() {
            match self.backend.next_raw().map_err(ConnectionError::Lost)? {
                Some(raw) => self.decode(raw),
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Decodes everything the backend holds right now and returns how many events
    /// [`next_event`](Self::next_event) can return without another decode.
    ///
    /// Notifications the backend produces after this call are left for the next one, so
    /// a caller can bound a drain to the events that were pending when it started.
    pub fn decode_pending(&mut self) -> Result<usize> {
        self.ensure_open()?;
        self.drain_backend()?;
        Ok(self.queue.len())
    }

    /// Signal raised by the backend whenever new notifications may be available.
    ///
    /// This plays the role of the descriptor a FAM client adds to its `select` set.
    /// `None` if the backend has no such signal and must be polled.
    #[must_use]
    pub fn readiness(&self) -> Option<Arc<Notify>> {
        self.backend.readiness()
    }

    /// Returns the next decoded event in delivery order.
    ///
    /// # Errors
    ///
    /// [`MonitorError::NoEventAvailable`] if nothing has been decoded, i.e. when
    /// [`pending`](Self::pending) would have returned `false`.
    pub fn next_event(&mut self) -> Result<Event> {
        self.ensure_open()?;
        self.queue.pop_front().ok_or(MonitorError::NoEventAvailable)
    }

    /// Cancels all outstanding requests and releases the backend. Safe to call twice.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        for id in self.registry.live_ids() {
            let Ok(target) = self.registry.prepare_cancel(id) else {
                continue;
            };
            if let CancelTarget::Live(backend_id) = target {
                if let Err(e) = self.backend.cancel(backend_id) {
                    warn!("Failed to cancel request {} while closing: {}", id, e);
                }
            }
            self.registry.commit(id, RequestState::Cancelled)?;
        }
        self.open = false;
        self.queue.clear();
        self.backend.close().map_err(ConnectionError::Lost)?;
        info!("Session '{}' closed", self.identity);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(ConnectionError::Closed.into())
        }
    }

    /// Decodes every notification the backend currently holds.
    fn drain_backend(&mut self) -> Result<()> {
        while let Some(raw) = self.backend.next_raw().map_err(ConnectionError::Lost)? {
            self.decode(raw);
        }
        Ok(())
    }

    fn decode(&mut self, raw: RawNotification) {
        match self.registry.by_backend_id(raw.request) {
            Some(request) => {
                let event = Event::new(raw.code, raw.path, request.id());
                debug!("Decoded {}", event);
                self.queue.push_back(event);
            }
            None => debug!(
                "Dropping {:?} for unknown backend request {}",
                raw.code, raw.request.0
            ),
        }
    }
}

impl<B: Backend> Drop for Session<B> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing session '{}': {}", self.identity, e);
        }
    }
}

impl<B: Backend> std::fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("backend", &self.backend.name())
            .field("open", &self.open)
            .field("requests", &self.registry.len())
            .field("queued", &self.queue.len())
            .finish()
    }
}

fn control_error(
    backend: &'static str,
    id: RequestId,
    operation: Operation,
    source: BackendError,
) -> MonitorError {
    match source {
        BackendError::Unsupported(_) => MonitorError::UnsupportedOperation { operation, backend },
        source => MonitorError::Backend {
            id,
            operation,
            source,
        },
    }
}

/// Checks that a file or directory subscription names an existing path of the right type.
/// Collections are left to the backend.
fn validate_path(kind: RequestKind, path: &Path) -> Result<(), SubscribeError> {
    if kind == RequestKind::Collection {
        return Ok(());
    }
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SubscribeError::NotFound {
                kind,
                path: path.to_path_buf(),
            })
        }
        Err(e) => {
            return Err(SubscribeError::Refused {
                kind,
                path: path.to_path_buf(),
                source: BackendError::Io(e),
            })
        }
    };
    let matches = match kind {
        RequestKind::Directory => metadata.is_dir(),
        _ => !metadata.is_dir(),
    };
    if matches {
        Ok(())
    } else {
        Err(SubscribeError::WrongType {
            kind,
            path: path.to_path_buf(),
        })
    }
}
