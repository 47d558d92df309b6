// src/backend/memory.rs

//! A deterministic in-process backend.
//!
//! [`MemoryBackend`] performs no I/O. Notifications are injected through a
//! [`MemoryHandle`], which also lets callers change the advertised capabilities, make the
//! next control call fail, and inspect the control calls the session issued.

use super::{Backend, Capabilities, DebugLevel, RawNotification};
use crate::error::{BackendError, Operation};
use crate::event::EventCode;
use crate::request::{BackendRequestId, CollectionSpec, RequestKind};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// A control call observed by the backend, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCall {
    Subscribe(RequestKind, PathBuf),
    Suspend(BackendRequestId),
    Resume(BackendRequestId),
    Cancel(BackendRequestId),
    Close,
}

#[derive(Debug)]
struct Subscription {
    path: PathBuf,
    suspended: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    capabilities: Capabilities,
    subscriptions: BTreeMap<u64, Subscription>,
    members: HashMap<PathBuf, Vec<PathBuf>>,
    queue: VecDeque<RawNotification>,
    calls: Vec<ControlCall>,
    fail_next: Option<Operation>,
    last_id: u64,
    disconnected: bool,
    closed: bool,
    debug_level: DebugLevel,
    signal: Arc<Notify>,
}

impl MemoryState {
    fn take_failure(&mut self, operation: Operation) -> Result<(), BackendError> {
        if self.fail_next == Some(operation) {
            self.fail_next = None;
            return Err(BackendError::Refused(format!("injected {operation} failure")));
        }
        Ok(())
    }

    fn check_open(&self) -> Result<(), BackendError> {
        if self.closed || self.disconnected {
            return Err(BackendError::Disconnected);
        }
        Ok(())
    }

    fn subscription(&mut self, request: BackendRequestId) -> Result<&mut Subscription, BackendError> {
        self.subscriptions
            .get_mut(&request.0)
            .ok_or(BackendError::UnknownRequest(request.0))
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    // A panic while holding the lock only happens inside a failing test.
    state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Scripted backend for tests and capability probing.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that rejects suspend and resume, like Gamin-style daemons.
    #[must_use]
    pub fn without_suspend() -> Self {
        let backend = Self::new();
        backend.handle().set_capabilities(Capabilities {
            suspend_resume: false,
            collections: true,
        });
        backend
    }

    /// Returns a handle sharing this backend's state.
    #[must_use]
    pub fn handle(&self) -> MemoryHandle {
        MemoryHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        lock(&self.state).capabilities
    }

    fn subscribe(
        &mut self,
        kind: RequestKind,
        path: &Path,
        collection: Option<&CollectionSpec>,
    ) -> Result<BackendRequestId, BackendError> {
        let mut state = lock(&self.state);
        state.check_open()?;
        state.calls.push(ControlCall::Subscribe(kind, path.to_path_buf()));
        state.take_failure(Operation::Subscribe)?;
        if kind == RequestKind::Collection && !state.capabilities.collections {
            return Err(BackendError::Unsupported(Operation::Subscribe));
        }

        state.last_id += 1;
        let id = BackendRequestId(state.last_id);
        state.subscriptions.insert(
            id.0,
            Subscription {
                path: path.to_path_buf(),
                suspended: false,
            },
        );

        if kind != RequestKind::File {
            let members = state.members.get(path).cloned().unwrap_or_default();
            for member in members {
                state
                    .queue
                    .push_back(RawNotification::new(EventCode::Exists, path.join(member), id));
            }
            state
                .queue
                .push_back(RawNotification::new(EventCode::EndExist, path, id));
        }
        debug!(
            "memory backend subscribed {} {} as {} (collection: {:?})",
            kind,
            path.display(),
            id.0,
            collection
        );
        Ok(id)
    }

    fn suspend(&mut self, request: BackendRequestId) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        state.check_open()?;
        state.calls.push(ControlCall::Suspend(request));
        if !state.capabilities.suspend_resume {
            return Err(BackendError::Unsupported(Operation::Suspend));
        }
        state.take_failure(Operation::Suspend)?;
        state.subscription(request)?.suspended = true;
        Ok(())
    }

    fn resume(&mut self, request: BackendRequestId) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        state.check_open()?;
        state.calls.push(ControlCall::Resume(request));
        if !state.capabilities.suspend_resume {
            return Err(BackendError::Unsupported(Operation::Resume));
        }
        state.take_failure(Operation::Resume)?;
        state.subscription(request)?.suspended = false;
        Ok(())
    }

    fn cancel(&mut self, request: BackendRequestId) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        state.check_open()?;
        state.calls.push(ControlCall::Cancel(request));
        state.take_failure(Operation::Cancel)?;
        state
            .subscriptions
            .remove(&request.0)
            .ok_or(BackendError::UnknownRequest(request.0))?;
        Ok(())
    }

    fn pending(&mut self) -> Result<bool, BackendError> {
        let state = lock(&self.state);
        state.check_open()?;
        Ok(!state.queue.is_empty())
    }

    fn next_raw(&mut self) -> Result<Option<RawNotification>, BackendError> {
        let mut state = lock(&self.state);
        state.check_open()?;
        let raw = state.queue.pop_front();
        if state.debug_level == DebugLevel::Verbose {
            trace!("memory backend delivering {:?}", raw);
        }
        Ok(raw)
    }

    fn set_debug_level(&mut self, level: DebugLevel) {
        lock(&self.state).debug_level = level;
    }

    fn readiness(&self) -> Option<Arc<Notify>> {
        Some(Arc::clone(&lock(&self.state).signal))
    }

    fn close(&mut self) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Ok(());
        }
        state.calls.push(ControlCall::Close);
        state.closed = true;
        state.subscriptions.clear();
        state.queue.clear();
        Ok(())
    }
}

/// Test-side handle onto a [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct MemoryHandle {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryHandle {
    pub fn set_capabilities(&self, capabilities: Capabilities) {
        lock(&self.state).capabilities = capabilities;
    }

    /// Sets the members reported by the existence scan of `dir`.
    pub fn set_members<I, P>(&self, dir: impl Into<PathBuf>, members: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        lock(&self.state)
            .members
            .insert(dir.into(), members.into_iter().map(Into::into).collect());
    }

    /// Queues `code` for `path` on every non-suspended subscription of `subscribed`.
    ///
    /// Returns the number of notifications queued.
    pub fn emit(&self, subscribed: impl AsRef<Path>, code: EventCode, path: impl AsRef<Path>) -> usize {
        let mut state = lock(&self.state);
        let targets: Vec<u64> = state
            .subscriptions
            .iter()
            .filter(|(_, sub)| !sub.suspended && sub.path == subscribed.as_ref())
            .map(|(id, _)| *id)
            .collect();
        for id in &targets {
            state.queue.push_back(RawNotification::new(
                code,
                path.as_ref(),
                BackendRequestId(*id),
            ));
        }
        if !targets.is_empty() {
            state.signal.notify_one();
        }
        targets.len()
    }

    /// Queues a notification carrying an arbitrary backend identifier.
    pub fn push_raw(&self, raw: RawNotification) {
        let mut state = lock(&self.state);
        state.queue.push_back(raw);
        state.signal.notify_one();
    }

    /// Makes the next control call of `operation` fail with [`BackendError::Refused`].
    pub fn fail_next(&self, operation: Operation) {
        lock(&self.state).fail_next = Some(operation);
    }

    /// Simulates the daemon going away.
    pub fn disconnect(&self) {
        lock(&self.state).disconnected = true;
    }

    #[must_use]
    pub fn calls(&self) -> Vec<ControlCall> {
        lock(&self.state).calls.clone()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        lock(&self.state).subscriptions.len()
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        lock(&self.state).queue.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    #[must_use]
    pub fn debug_level(&self) -> DebugLevel {
        lock(&self.state).debug_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_subscription_queues_scan() {
        let mut backend = MemoryBackend::new();
        let handle = backend.handle();
        handle.set_members("/d", ["a", "b"]);

        let id = backend
            .subscribe(RequestKind::Directory, Path::new("/d"), None)
            .unwrap();
        let mut codes = Vec::new();
        while let Some(raw) = backend.next_raw().unwrap() {
            assert_eq!(raw.request, id);
            codes.push((raw.code, raw.path));
        }
        assert_eq!(
            codes,
            vec![
                (EventCode::Exists, PathBuf::from("/d/a")),
                (EventCode::Exists, PathBuf::from("/d/b")),
                (EventCode::EndExist, PathBuf::from("/d")),
            ]
        );
    }

    #[test]
    fn suspended_subscriptions_receive_nothing() {
        let mut backend = MemoryBackend::new();
        let handle = backend.handle();
        let id = backend
            .subscribe(RequestKind::File, Path::new("/f"), None)
            .unwrap();
        backend.suspend(id).unwrap();
        assert_eq!(handle.emit("/f", EventCode::Changed, "/f"), 0);
        backend.resume(id).unwrap();
        assert_eq!(handle.emit("/f", EventCode::Changed, "/f"), 1);
        assert!(backend.pending().unwrap());
    }

    #[test]
    fn injected_failure_fires_once() {
        let mut backend = MemoryBackend::new();
        let handle = backend.handle();
        let id = backend
            .subscribe(RequestKind::File, Path::new("/f"), None)
            .unwrap();
        handle.fail_next(Operation::Cancel);
        assert!(matches!(backend.cancel(id), Err(BackendError::Refused(_))));
        backend.cancel(id).unwrap();
        assert_eq!(handle.subscription_count(), 0);
    }

    #[test]
    fn close_is_idempotent() {
        let mut backend = MemoryBackend::new();
        let handle = backend.handle();
        backend.close().unwrap();
        backend.close().unwrap();
        assert!(handle.is_closed());
        assert_eq!(handle.calls(), vec![ControlCall::Close]);
        assert!(matches!(backend.pending(), Err(BackendError::Disconnected)));
    }
}
