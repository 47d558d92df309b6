//! # Protocol Tests for famon
//!
//! Deterministic tests of the session protocol against the in-memory backend: request
//! lifecycle, the registry's identifier rules, the non-blocking event queue, and
//! capability reporting.

use famon::backend::memory::ControlCall;
use famon::backend::{
    Backend, Capabilities, DebugLevel, MemoryBackend, MemoryHandle, RawNotification,
};
use famon::error::{ConnectionError, MonitorError, Operation, SubscribeError};
use famon::event::EventCode;
use famon::request::{BackendRequestId, RequestKind, RequestState};
use famon::session::{DuplicatePolicy, Session};
use std::fs;
use tempfile::TempDir;

/// Creates a session over a fresh memory backend and a temporary directory to subscribe.
fn memory_session() -> (Session<MemoryBackend>, MemoryHandle, TempDir) {
    let backend = MemoryBackend::new();
    let handle = backend.handle();
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    (Session::with_backend("protocol-test", backend), handle, dir)
}

/// Drains every pending event as `(code, path)` pairs.
fn drain<B: Backend>(session: &mut Session<B>) -> Vec<(EventCode, String)> {
    let mut events = Vec::new();
    while session.pending().expect("pending failed") {
        let event = session.next_event().expect("next_event failed after pending");
        events.push((event.code, event.path.to_string_lossy().to_string()));
    }
    events
}

#[test]
fn test_lifecycle_follows_state_machine() {
    let (mut session, _handle, dir) = memory_session();
    let request = session.monitor_directory(dir.path()).unwrap();
    let id = request.id();
    assert_eq!(request.state(), RequestState::Active);
    assert_eq!(request.kind(), RequestKind::Directory);

    session.suspend(id).unwrap();
    assert_eq!(session.request(id).unwrap().state(), RequestState::Suspended);

    session.resume(id).unwrap();
    assert_eq!(session.request(id).unwrap().state(), RequestState::Active);

    session.suspend(id).unwrap();
    session.cancel(id).unwrap();
    assert!(matches!(
        session.request(id),
        Err(MonitorError::UnknownRequest { .. })
    ));
}

#[test]
fn test_invalid_transitions_leave_state_unchanged() {
    let (mut session, handle, dir) = memory_session();
    let id = session.monitor_directory(dir.path()).unwrap().id();

    match session.resume(id) {
        Err(MonitorError::InvalidTransition {
            operation, state, ..
        }) => {
            assert_eq!(operation, Operation::Resume);
            assert_eq!(state, RequestState::Active);
        }
        other => panic!("expected InvalidTransition, got {other:?}"),
    }
    assert_eq!(session.request(id).unwrap().state(), RequestState::Active);

    session.suspend(id).unwrap();
    assert!(matches!(
        session.suspend(id),
        Err(MonitorError::InvalidTransition {
            state: RequestState::Suspended,
            ..
        })
    ));
    assert_eq!(session.request(id).unwrap().state(), RequestState::Suspended);

    // Rejected transitions never reach the backend.
    let suspends = handle
        .calls()
        .iter()
        .filter(|call| matches!(call, ControlCall::Suspend(_)))
        .count();
    assert_eq!(suspends, 1);
}

#[test]
fn test_double_cancel_is_noop_and_other_operations_fail() {
    let (mut session, handle, dir) = memory_session();
    let id = session.monitor_directory(dir.path()).unwrap().id();

    session.cancel(id).unwrap();
    session.cancel(id).unwrap();

    let cancels = handle
        .calls()
        .iter()
        .filter(|call| matches!(call, ControlCall::Cancel(_)))
        .count();
    assert_eq!(cancels, 1, "second cancel must not reach the backend");

    for result in [session.suspend(id), session.resume(id)] {
        match result {
            Err(e @ MonitorError::UnknownRequest { .. }) => assert!(e.is_caller_error()),
            other => panic!("expected UnknownRequest, got {other:?}"),
        }
    }
}

#[test]
fn test_next_event_never_returns_when_nothing_pending() {
    let (mut session, handle, dir) = memory_session();
    let file = dir.path().join("watched.txt");
    fs::write(&file, b"x").unwrap();
    session.monitor_file(&file).unwrap();

    assert!(!session.pending().unwrap());
    assert!(matches!(
        session.next_event(),
        Err(MonitorError::NoEventAvailable)
    ));

    // A notification arriving after pending() said false is not returned until
    // pending() is asked again.
    assert_eq!(handle.emit(&file, EventCode::Changed, &file), 1);
    assert!(matches!(
        session.next_event(),
        Err(MonitorError::NoEventAvailable)
    ));

    assert!(session.pending().unwrap());
    let event = session.next_event().unwrap();
    assert_eq!(event.code, EventCode::Changed);
    assert_eq!(event.path, file);
    assert!(!session.pending().unwrap());
}

#[test]
fn test_events_queued_before_cancel_are_still_delivered() {
    let (mut session, handle, dir) = memory_session();
    let file = dir.path().join("log.txt");
    fs::write(&file, b"").unwrap();
    let id = session.monitor_file(&file).unwrap().id();

    handle.emit(&file, EventCode::Changed, &file);
    handle.emit(&file, EventCode::Deleted, &file);
    session.cancel(id).unwrap();

    // The backend no longer routes anything to the cancelled subscription.
    assert_eq!(handle.emit(&file, EventCode::Created, &file), 0);

    let mut delivered = Vec::new();
    while session.pending().unwrap() {
        let event = session.next_event().unwrap();
        assert_eq!(event.source, id);
        delivered.push(event.code);
    }
    assert_eq!(delivered, vec![EventCode::Changed, EventCode::Deleted]);
}

#[test]
fn test_directory_scan_precedes_live_events() {
    let (mut session, handle, dir) = memory_session();
    handle.set_members(dir.path(), ["a", "b"]);
    session.monitor_directory(dir.path()).unwrap();
    handle.emit(dir.path(), EventCode::Created, dir.path().join("c"));

    let root = dir.path().to_string_lossy().to_string();
    let events = drain(&mut session);
    assert_eq!(
        events,
        vec![
            (EventCode::Exists, format!("{root}/a")),
            (EventCode::Exists, format!("{root}/b")),
            (EventCode::EndExist, root.clone()),
            (EventCode::Created, format!("{root}/c")),
        ]
    );
}

#[test]
fn test_unsupported_suspend_is_recoverable() {
    let backend = MemoryBackend::without_suspend();
    let handle = backend.handle();
    let dir = tempfile::tempdir().unwrap();
    let mut session = Session::with_backend("gamin-like", backend);
    let id = session.monitor_directory(dir.path()).unwrap().id();

    match session.suspend(id) {
        Err(e @ MonitorError::UnsupportedOperation { .. }) => {
            assert!(e.is_recoverable());
            assert!(e.to_string().contains("memory"));
        }
        other => panic!("expected UnsupportedOperation, got {other:?}"),
    }
    assert_eq!(session.request(id).unwrap().state(), RequestState::Active);
    assert!(!session.capabilities().suspend_resume);
    assert!(!handle
        .calls()
        .iter()
        .any(|call| matches!(call, ControlCall::Suspend(_))));

    // The fallback path: cancel and subscribe again.
    session.cancel(id).unwrap();
    let again = session.monitor_directory(dir.path()).unwrap();
    assert!(again.id() > id);
}

#[test]
fn test_failed_backend_call_leaves_state_unchanged() {
    let (mut session, handle, dir) = memory_session();
    let id = session.monitor_directory(dir.path()).unwrap().id();

    handle.fail_next(Operation::Suspend);
    match session.suspend(id) {
        Err(MonitorError::Backend { operation, .. }) => assert_eq!(operation, Operation::Suspend),
        other => panic!("expected Backend error, got {other:?}"),
    }
    assert_eq!(session.request(id).unwrap().state(), RequestState::Active);

    handle.fail_next(Operation::Cancel);
    assert!(matches!(
        session.cancel(id),
        Err(MonitorError::Backend { .. })
    ));
    assert_eq!(session.request(id).unwrap().state(), RequestState::Active);

    session.cancel(id).unwrap();
    assert_eq!(handle.subscription_count(), 0);
}

#[test]
fn test_close_cancels_everything_and_is_idempotent() {
    let (mut session, handle, dir) = memory_session();
    let first = session.monitor_directory(dir.path()).unwrap().id();
    let second = session.subscribe(RequestKind::Directory, dir.path()).unwrap().id();
    session.suspend(second).unwrap();

    session.close().unwrap();
    session.close().unwrap();

    assert!(!session.is_open());
    assert!(handle.is_closed());
    assert_eq!(session.requests().count(), 0);
    let calls = handle.calls();
    assert_eq!(calls.last(), Some(&ControlCall::Close));
    assert_eq!(
        calls
            .iter()
            .filter(|call| matches!(call, ControlCall::Cancel(_)))
            .count(),
        2
    );

    assert!(matches!(
        session.pending(),
        Err(MonitorError::Connection(ConnectionError::Closed))
    ));
    // Everything but close itself now reports the closed connection.
    for result in [session.cancel(first), session.suspend(first)] {
        assert!(matches!(
            result,
            Err(MonitorError::Connection(ConnectionError::Closed))
        ));
    }
}

#[test]
fn test_identifiers_are_never_reused() {
    let (mut session, _handle, dir) = memory_session();
    let mut previous = session.monitor_directory(dir.path()).unwrap().id();
    for _ in 0..5 {
        session.cancel(previous).unwrap();
        let next = session.monitor_directory(dir.path()).unwrap().id();
        assert!(next > previous);
        previous = next;
    }
}

#[test]
fn test_duplicate_policy() {
    let (session, _handle, dir) = memory_session();
    let mut session = session.with_duplicate_policy(DuplicatePolicy::Reject);
    let id = session.monitor_directory(dir.path()).unwrap().id();

    match session.monitor_directory(dir.path()) {
        Err(MonitorError::Subscribe(SubscribeError::Duplicate { existing, .. })) => {
            assert_eq!(existing, id)
        }
        other => panic!("expected Duplicate, got {other:?}"),
    }
    // A different kind on the same path is not a duplicate.
    session
        .monitor_collection(dir.path(), 0, "*")
        .expect("collection on same path");

    session.cancel(id).unwrap();
    session.monitor_directory(dir.path()).unwrap();

    // Under the default policy both requests receive the event.
    let (mut allowing, allow_handle, allow_dir) = memory_session();
    let a = allowing.monitor_directory(allow_dir.path()).unwrap().id();
    let b = allowing.monitor_directory(allow_dir.path()).unwrap().id();
    drain(&mut allowing);
    assert_eq!(
        allow_handle.emit(allow_dir.path(), EventCode::Changed, allow_dir.path()),
        2
    );
    let mut sources = Vec::new();
    while allowing.pending().unwrap() {
        sources.push(allowing.next_event().unwrap().source);
    }
    assert_eq!(sources, vec![a, b]);
}

#[test]
fn test_subscribe_validates_paths() {
    let (mut session, handle, dir) = memory_session();
    let missing = dir.path().join("missing");

    assert!(matches!(
        session.monitor_directory(&missing),
        Err(MonitorError::Subscribe(SubscribeError::NotFound { .. }))
    ));
    let file = dir.path().join("plain.txt");
    fs::write(&file, b"").unwrap();
    assert!(matches!(
        session.monitor_directory(&file),
        Err(MonitorError::Subscribe(SubscribeError::WrongType { .. }))
    ));
    assert!(matches!(
        session.monitor_file(dir.path()),
        Err(MonitorError::Subscribe(SubscribeError::WrongType { .. }))
    ));
    assert_eq!(handle.subscription_count(), 0);

    // Collections leave existence checks to the backend.
    let collection = session.monitor_collection(&missing, 2, "*.jpg").unwrap();
    assert_eq!(collection.kind(), RequestKind::Collection);
    assert_eq!(collection.collection().map(|spec| spec.depth), Some(2));
}

#[test]
fn test_backend_refusal_and_capabilities() {
    let (mut session, handle, dir) = memory_session();
    handle.fail_next(Operation::Subscribe);
    assert!(matches!(
        session.monitor_directory(dir.path()),
        Err(MonitorError::Subscribe(SubscribeError::Refused { .. }))
    ));

    handle.set_capabilities(Capabilities {
        suspend_resume: true,
        collections: false,
    });
    assert!(matches!(
        session.monitor_collection(dir.path(), 0, "*"),
        Err(MonitorError::UnsupportedOperation {
            operation: Operation::Subscribe,
            ..
        })
    ));
    assert_eq!(session.requests().count(), 0);
}

#[test]
fn test_notifications_for_unknown_requests_are_dropped() {
    let (mut session, handle, _dir) = memory_session();
    handle.push_raw(RawNotification::new(
        EventCode::Changed,
        "/elsewhere",
        BackendRequestId(999),
    ));
    assert!(!session.pending().unwrap());
    assert_eq!(handle.queued(), 0);
}

#[test]
fn test_lost_backend_is_a_connection_error() {
    let (mut session, handle, dir) = memory_session();
    session.monitor_directory(dir.path()).unwrap();
    drain(&mut session);

    handle.disconnect();
    match session.pending() {
        Err(e @ MonitorError::Connection(ConnectionError::Lost(_))) => {
            assert!(!e.is_recoverable())
        }
        other => panic!("expected lost connection, got {other:?}"),
    }
}

#[test]
fn test_debug_level_reaches_backend() {
    let (mut session, handle, _dir) = memory_session();
    session.set_debug_level(DebugLevel::Verbose);
    assert_eq!(handle.debug_level(), DebugLevel::Verbose);
}
