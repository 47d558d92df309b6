// src/event_loop.rs

//! Cooperative multiplexing of session events with auxiliary input.
//!
//! [`EventLoop`] runs on a single task. Each cycle it:
//!
//! 1. stops if the stop signal was raised, the deadline passed, or the caller's predicate
//!    says so;
//! 2. drains the session events pending at that moment into the event handler;
//! 3. if there were no events, waits for auxiliary input for at most the poll interval;
//! 4. gives every ready auxiliary source one item.
//!
//! Events that arrive while step 2 runs, including ones a handler causes itself, wait
//! for the next cycle, so sources are serviced even under a steady stream of events.
//!
//! The bounded wait in step 3 is the only suspension point. It ends early when a
//! [`SourceSender`] delivers input, the backend raises its
//! [`readiness`](crate::session::Session::readiness) signal, or a [`StopHandle`] fires.
//! It never waits longer than the poll interval.
//!
//! Handler failures go to the error sink and the loop carries on.
//!
//! The loop borrows the session mutably for the whole run, so handlers cannot suspend,
//! resume or cancel requests. Forward such commands to the caller (for example through a
//! [`StopHandle`] and [`run_until`](EventLoop::run_until)) and apply them through
//! [`EventLoop::session`] between runs.

use crate::backend::{Backend, NotifyBackend};
use crate::error::{ConnectionError, MonitorError};
use crate::event::Event;
use crate::session::Session;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendError, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info};

/// Default bound of the auxiliary-input wait.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A non-blocking source of input polled by the loop.
pub trait InputSource {
    type Item;

    /// Returns `true` if [`read_one`](Self::read_one) would return an item. Must not block.
    fn ready(&mut self) -> bool;

    /// Takes one item, if any. Must not block.
    fn read_one(&mut self) -> Option<Self::Item>;
}

/// Receiving half of a loop-aware channel. See [`EventLoop::source_channel`].
#[derive(Debug)]
pub struct ChannelSource<T> {
    rx: UnboundedReceiver<T>,
    peeked: Option<T>,
}

impl<T> InputSource for ChannelSource<T> {
    type Item = T;

    fn ready(&mut self) -> bool {
        if self.peeked.is_none() {
            self.peeked = self.rx.try_recv().ok();
        }
        self.peeked.is_some()
    }

    fn read_one(&mut self) -> Option<T> {
        self.peeked.take().or_else(|| self.rx.try_recv().ok())
    }
}

/// Sending half of a loop-aware channel. Every send wakes the loop's bounded wait.
#[derive(Debug)]
pub struct SourceSender<T> {
    tx: UnboundedSender<T>,
    wake: Arc<Notify>,
}

impl<T> Clone for SourceSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            wake: Arc::clone(&self.wake),
        }
    }
}

impl<T> SourceSender<T> {
    /// Queues `item` and wakes the loop.
    ///
    /// # Errors
    ///
    /// Returns the item back if the loop (and with it the receiving source) is gone.
    pub fn send(&self, item: T) -> Result<(), SendError<T>> {
        self.tx.send(item)?;
        self.wake.notify_one();
        Ok(())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Requests that a running loop stop at the start of its next cycle.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A failure observed by the loop and routed to its error sink.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error("event handler failed for {event}: {error:#}")]
    EventHandler { event: Event, error: anyhow::Error },

    #[error("handler for input source '{name}' failed: {error:#}")]
    SourceHandler { name: String, error: anyhow::Error },

    #[error("polling session failed: {0}")]
    Session(#[from] MonitorError),
}

/// Counters describing one [`EventLoop::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub cycles: u64,
    pub events: u64,
    pub inputs: u64,
    pub errors: u64,
}

/// A registered source with its handler, with the item type erased.
trait PolledSource {
    fn name(&self) -> &str;
    fn ready(&mut self) -> bool;
    fn service(&mut self) -> Option<anyhow::Result<()>>;
}

struct Registered<S, F> {
    name: String,
    source: S,
    handler: F,
}

impl<S, F> PolledSource for Registered<S, F>
where
    S: InputSource,
    F: FnMut(S::Item) -> anyhow::Result<()>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn ready(&mut self) -> bool {
        self.source.ready()
    }

    fn service(&mut self) -> Option<anyhow::Result<()>> {
        self.source.read_one().map(&mut self.handler)
    }
}

type EventHandler<'a> = Box<dyn FnMut(Event) -> anyhow::Result<()> + 'a>;
type ErrorSink<'a> = Box<dyn FnMut(LoopError) + 'a>;

/// Drives a [`Session`] and any number of auxiliary input sources on one task.
pub struct EventLoop<'a, B: Backend = NotifyBackend> {
    session: &'a mut Session<B>,
    session_lost: bool,
    sources: Vec<Box<dyn PolledSource + 'a>>,
    on_event: EventHandler<'a>,
    on_error: ErrorSink<'a>,
    poll_interval: Duration,
    deadline: Option<Instant>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    wake: Arc<Notify>,
}

impl<'a, B: Backend> EventLoop<'a, B> {
    pub fn new(session: &'a mut Session<B>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        // Sources and the backend share one wake signal.
        let wake = session
            .readiness()
            .unwrap_or_else(|| Arc::new(Notify::new()));
        Self {
            session,
            session_lost: false,
            sources: Vec::new(),
            on_event: Box::new(|event: Event| {
                debug!("Unhandled event: {}", event);
                Ok(())
            }),
            on_error: Box::new(|e: LoopError| error!("Event loop error: {}", e)),
            poll_interval: DEFAULT_POLL_INTERVAL,
            deadline: None,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            wake,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Stops the loop once `deadline` has passed.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the handler every session event is dispatched to.
    pub fn on_event<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(Event) -> anyhow::Result<()> + 'a,
    {
        self.on_event = Box::new(handler);
        self
    }

    /// Replaces the default error sink, which logs through `tracing`.
    pub fn on_error<F>(&mut self, sink: F) -> &mut Self
    where
        F: FnMut(LoopError) + 'a,
    {
        self.on_error = Box::new(sink);
        self
    }

    /// Registers an auxiliary source. Sources are polled in registration order.
    pub fn add_source<S, F>(&mut self, name: &str, source: S, handler: F) -> &mut Self
    where
        S: InputSource + 'a,
        F: FnMut(S::Item) -> anyhow::Result<()> + 'a,
    {
        self.sources.push(Box::new(Registered {
            name: name.to_string(),
            source,
            handler,
        }));
        self
    }

    /// Creates a channel whose sends wake this loop. Register the returned source with
    /// [`add_source`](Self::add_source).
    pub fn source_channel<T>(&self) -> (SourceSender<T>, ChannelSource<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SourceSender {
                tx,
                wake: Arc::clone(&self.wake),
            },
            ChannelSource { rx, peeked: None },
        )
    }

    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    /// Returns the session being polled.
    pub fn session(&mut self) -> &mut Session<B> {
        &mut *self.session
    }

    /// Runs until stopped or the deadline passes.
    pub async fn run(&mut self) -> LoopStats {
        self.run_until(|| false).await
    }

    /// Runs until `done` returns `true`, the loop is stopped, or the deadline passes.
    ///
    /// `done` is checked at the start of every cycle.
    pub async fn run_until<P>(&mut self, mut done: P) -> LoopStats
    where
        P: FnMut() -> bool,
    {
        let mut stats = LoopStats::default();
        info!(
            "Event loop started for session '{}' with {} auxiliary source(s)",
            self.session.identity(),
            self.sources.len()
        );
        while !self.should_stop() && !done() {
            stats.cycles += 1;
            if self.drain_events(&mut stats) == 0 {
                self.wait_for_input().await;
            }
            self.service_sources(&mut stats);
        }
        info!("Event loop finished: {:?}", stats);
        stats
    }

    fn should_stop(&self) -> bool {
        *self.stop_rx.borrow() || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Dispatches the events pending when the drain starts. Returns how many were
    /// dispatched.
    fn drain_events(&mut self, stats: &mut LoopStats) -> u64 {
        if self.session_lost {
            return 0;
        }
        let pending = match self.session.decode_pending() {
            Ok(pending) => pending,
            Err(e) => {
                self.report_session(e, stats);
                return 0;
            }
        };
        let mut dispatched = 0;
        for _ in 0..pending {
            let event = match self.session.next_event() {
                Ok(event) => event,
                Err(e) => {
                    self.report_session(e, stats);
                    break;
                }
            };
            dispatched += 1;
            stats.events += 1;
            debug!("Dispatching {}", event);
            if let Err(error) = (self.on_event)(event.clone()) {
                stats.errors += 1;
                (self.on_error)(LoopError::EventHandler { event, error });
            }
        }
        dispatched
    }

    fn report_session(&mut self, e: MonitorError, stats: &mut LoopStats) {
        if matches!(
            e,
            MonitorError::Connection(ConnectionError::Closed | ConnectionError::Lost(_))
        ) {
            // Keep servicing auxiliary sources; stop polling a session that cannot recover.
            self.session_lost = true;
        }
        stats.errors += 1;
        (self.on_error)(LoopError::Session(e));
    }

    /// Waits up to one poll interval (or until the deadline) for auxiliary input.
    async fn wait_for_input(&mut self) {
        if self.sources.iter_mut().any(|source| source.ready()) {
            // Input is already waiting; still give other tasks a turn.
            tokio::task::yield_now().await;
            return;
        }
        let mut budget = self.poll_interval;
        if let Some(deadline) = self.deadline {
            budget = budget.min(deadline.saturating_duration_since(Instant::now()));
        }
        let wake = Arc::clone(&self.wake);
        let stop_rx = &mut self.stop_rx;
        let _ = tokio::time::timeout(budget, async {
            tokio::select! {
                _ = wake.notified() => {},
                _ = stop_rx.changed() => {},
            }
        })
        .await;
    }

    /// Gives each ready source one item, in registration order.
    fn service_sources(&mut self, stats: &mut LoopStats) {
        for source in &mut self.sources {
            if !source.ready() {
                continue;
            }
            match source.service() {
                Some(Ok(())) => stats.inputs += 1,
                Some(Err(error)) => {
                    stats.inputs += 1;
                    stats.errors += 1;
                    (self.on_error)(LoopError::SourceHandler {
                        name: source.name().to_string(),
                        error,
                    });
                }
                None => {}
            }
        }
    }
}
