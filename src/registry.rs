// src/registry.rs

//! The per-session table of monitor requests.
//!
//! The registry is the single source of truth for request identifiers. It allocates ids
//! monotonically, so an id that was handed out but is no longer live has been cancelled.
//! Lookups of stale or foreign identifiers are rejected.

use crate::error::{MonitorError, Operation};
use crate::request::{
    BackendRequestId, CollectionSpec, MonitorRequest, RequestId, RequestKind, RequestState,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Outcome of a cancel lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelTarget {
    /// The request is live and its backend subscription must be cancelled.
    Live(BackendRequestId),
    /// The request was already cancelled; nothing to do.
    AlreadyCancelled,
}

#[derive(Debug, Default)]
pub struct RequestRegistry {
    live: HashMap<RequestId, MonitorRequest>,
    by_backend: HashMap<BackendRequestId, RequestId>,
    last_id: u64,
}

impl RequestRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next identifier. Identifiers start at 1 and only grow.
    pub fn allocate(&mut self) -> RequestId {
        self.last_id += 1;
        RequestId::new(self.last_id)
    }

    /// Registers a freshly subscribed request in the `Active` state.
    pub fn insert(
        &mut self,
        id: RequestId,
        kind: RequestKind,
        path: PathBuf,
        collection: Option<CollectionSpec>,
        backend_id: BackendRequestId,
    ) -> &MonitorRequest {
        debug_assert!(id.get() <= self.last_id, "identifier was not allocated");
        self.by_backend.insert(backend_id, id);
        self.live
            .entry(id)
            .or_insert_with(|| MonitorRequest::new(id, kind, path, collection, backend_id))
    }

    /// Looks up a live (active or suspended) request.
    pub fn lookup(&self, id: RequestId) -> Result<&MonitorRequest, MonitorError> {
        self.live.get(&id).ok_or(MonitorError::UnknownRequest { id })
    }

    /// Resolves a backend identifier carried by a raw notification.
    #[must_use]
    pub fn by_backend_id(&self, backend_id: BackendRequestId) -> Option<&MonitorRequest> {
        self.by_backend
            .get(&backend_id)
            .and_then(|id| self.live.get(id))
    }

    /// Validates `operation` against the request's current state.
    ///
    /// Returns the backend id to issue the control call against and the state to apply
    /// once that call succeeds.
    pub fn prepare(
        &self,
        id: RequestId,
        operation: Operation,
    ) -> Result<(BackendRequestId, RequestState), MonitorError> {
        let request = self.lookup(id)?;
        let next = request.check(operation)?;
        Ok((request.backend_id(), next))
    }

    /// Like [`prepare`](Self::prepare) for cancellation, where a retired id is a no-op.
    pub fn prepare_cancel(&self, id: RequestId) -> Result<CancelTarget, MonitorError> {
        if self.is_retired(id) {
            return Ok(CancelTarget::AlreadyCancelled);
        }
        let (backend_id, _) = self.prepare(id, Operation::Cancel)?;
        Ok(CancelTarget::Live(backend_id))
    }

    /// Applies a validated state change. Cancellation retires the identifier.
    pub fn commit(&mut self, id: RequestId, state: RequestState) -> Result<(), MonitorError> {
        if state == RequestState::Cancelled {
            let mut request = self
                .live
                .remove(&id)
                .ok_or(MonitorError::UnknownRequest { id })?;
            request.set_state(RequestState::Cancelled);
            self.by_backend.remove(&request.backend_id());
            return Ok(());
        }
        let request = self
            .live
            .get_mut(&id)
            .ok_or(MonitorError::UnknownRequest { id })?;
        request.set_state(state);
        Ok(())
    }

    /// Returns `true` if `id` was cancelled in this registry.
    #[must_use]
    pub fn is_retired(&self, id: RequestId) -> bool {
        (1..=self.last_id).contains(&id.get()) && !self.live.contains_key(&id)
    }

    /// Finds a live request of `kind` on `path`.
    #[must_use]
    pub fn find_live(&self, kind: RequestKind, path: &Path) -> Option<&MonitorRequest> {
        self.live
            .values()
            .find(|request| request.kind() == kind && request.path() == path)
    }

    /// Iterates live requests in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = &MonitorRequest> {
        let mut requests: Vec<_> = self.live.values().collect();
        requests.sort_by_key(|request| request.id());
        requests.into_iter()
    }

    /// Identifiers of every live request.
    #[must_use]
    pub fn live_ids(&self) -> Vec<RequestId> {
        self.iter().map(MonitorRequest::id).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_one() -> (RequestRegistry, RequestId) {
        let mut registry = RequestRegistry::new();
        let id = registry.allocate();
        registry.insert(
            id,
            RequestKind::Directory,
            PathBuf::from("/tmp/d"),
            None,
            BackendRequestId(100),
        );
        (registry, id)
    }

    #[test]
    fn ids_are_monotonic() {
        let mut registry = RequestRegistry::new();
        let a = registry.allocate();
        let b = registry.allocate();
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 2);
    }

    #[test]
    fn lookup_and_backend_resolution() {
        let (registry, id) = registry_with_one();
        assert_eq!(registry.lookup(id).unwrap().path(), Path::new("/tmp/d"));
        assert_eq!(
            registry.by_backend_id(BackendRequestId(100)).map(MonitorRequest::id),
            Some(id)
        );
        assert!(registry.by_backend_id(BackendRequestId(5)).is_none());
        assert!(matches!(
            registry.lookup(RequestId::new(42)),
            Err(MonitorError::UnknownRequest { .. })
        ));
    }

    #[test]
    fn cancel_retires_identifier() {
        let (mut registry, id) = registry_with_one();
        assert_eq!(
            registry.prepare_cancel(id).unwrap(),
            CancelTarget::Live(BackendRequestId(100))
        );
        registry.commit(id, RequestState::Cancelled).unwrap();

        assert!(registry.is_retired(id));
        assert!(registry.is_empty());
        assert_eq!(
            registry.prepare_cancel(id).unwrap(),
            CancelTarget::AlreadyCancelled
        );
        assert!(matches!(
            registry.prepare(id, Operation::Suspend),
            Err(MonitorError::UnknownRequest { .. })
        ));
        assert!(registry.by_backend_id(BackendRequestId(100)).is_none());

        let next = registry.allocate();
        assert!(next > id);
    }

    #[test]
    fn only_allocated_ids_count_as_retired() {
        let (mut registry, id) = registry_with_one();
        assert!(!registry.is_retired(id));
        assert!(!registry.is_retired(RequestId::new(0)));
        assert!(!registry.is_retired(RequestId::new(2)));

        for _ in 0..1000 {
            let next = registry.allocate();
            registry.insert(
                next,
                RequestKind::File,
                PathBuf::from("/tmp/f"),
                None,
                BackendRequestId(next.get() + 100),
            );
            registry.commit(next, RequestState::Cancelled).unwrap();
            assert!(registry.is_retired(next));
        }
        assert!(!registry.is_retired(id));
        assert_eq!(registry.len(), 1);
        assert!(matches!(
            registry.prepare_cancel(RequestId::new(5000)),
            Err(MonitorError::UnknownRequest { .. })
        ));
    }

    #[test]
    fn invalid_transition_leaves_state() {
        let (mut registry, id) = registry_with_one();
        assert!(matches!(
            registry.prepare(id, Operation::Resume),
            Err(MonitorError::InvalidTransition { .. })
        ));
        let (_, next) = registry.prepare(id, Operation::Suspend).unwrap();
        registry.commit(id, next).unwrap();
        assert_eq!(registry.lookup(id).unwrap().state(), RequestState::Suspended);
        assert!(matches!(
            registry.prepare(id, Operation::Suspend),
            Err(MonitorError::InvalidTransition {
                state: RequestState::Suspended,
                ..
            })
        ));
    }

    #[test]
    fn find_live_matches_kind_and_path() {
        let (registry, id) = registry_with_one();
        assert_eq!(
            registry
                .find_live(RequestKind::Directory, Path::new("/tmp/d"))
                .map(MonitorRequest::id),
            Some(id)
        );
        assert!(registry
            .find_live(RequestKind::File, Path::new("/tmp/d"))
            .is_none());
    }
}
