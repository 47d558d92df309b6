// src/backend/watcher.rs
use super::{Backend, Capabilities, DebugLevel, RawNotification};
use crate::error::BackendError;
use crate::event::EventCode;
use crate::request::{BackendRequestId, CollectionSpec, RequestKind};
use globset::{Glob, GlobMatcher};
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcherTrait};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, FileIdMap};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

/// A subscription as the watcher sees it.
#[derive(Debug)]
struct Watch {
    kind: RequestKind,
    /// The path as the caller subscribed it. Event paths are reported under it.
    root: PathBuf,
    /// The resolved path `notify` reports events under.
    canonical: PathBuf,
    filter: Option<CollectionFilter>,
    suspended: bool,
}

#[derive(Debug)]
struct CollectionFilter {
    depth: u32,
    mask: GlobMatcher,
}

impl Watch {
    /// Maps a path reported by `notify` to the path this watch reports, if it covers it.
    fn resolve(&self, path: &Path) -> Option<PathBuf> {
        if path == self.canonical {
            return Some(self.root.clone());
        }
        match self.kind {
            RequestKind::File => None,
            RequestKind::Directory => {
                if path.parent() == Some(self.canonical.as_path()) {
                    path.file_name().map(|name| self.root.join(name))
                } else {
                    None
                }
            }
            RequestKind::Collection => {
                let relative = path.strip_prefix(&self.canonical).ok()?;
                let filter = self.filter.as_ref()?;
                let depth = relative.components().count().saturating_sub(1);
                if depth > filter.depth as usize {
                    return None;
                }
                let name = path.file_name()?;
                filter
                    .mask
                    .is_match(Path::new(name))
                    .then(|| self.root.join(relative))
            }
        }
    }

    fn mode(&self) -> RecursiveMode {
        match &self.filter {
            Some(filter) if filter.depth > 0 => RecursiveMode::Recursive,
            _ => RecursiveMode::NonRecursive,
        }
    }
}

/// Reference count of one OS-level watch shared by several subscriptions.
#[derive(Debug)]
struct SharedWatch {
    count: usize,
    recursive: bool,
}

/// What a debounced `notify` event means for the subscriptions covering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Code(EventCode),
    /// A rename with both ends known: `Moved` for watches seeing the source, `Created`
    /// for watches that only see the destination.
    Rename,
}

/// Maps a `notify` event kind to a change, or `None` for kinds that are not reported.
fn change_for(kind: &EventKind) -> Option<Change> {
    let code = match kind {
        EventKind::Create(_) => EventCode::Created,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => EventCode::Created, // Renamed into place
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => EventCode::Deleted, // Renamed away
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => return Some(Change::Rename),
        EventKind::Modify(ModifyKind::Name(_)) => EventCode::Moved,
        EventKind::Modify(_) => EventCode::Changed,
        EventKind::Remove(_) => EventCode::Deleted,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return None,
    };
    Some(Change::Code(code))
}

/// Filesystem backend built on `notify` and `notify-debouncer-full`.
///
/// The debouncer runs on its own thread and hands batches over a standard channel; the
/// backend only ever drains that channel with `try_recv`, so [`Backend::pending`] and
/// [`Backend::next_raw`] never block. Every batch also notifies the
/// [`readiness`](Backend::readiness) signal.
pub struct NotifyBackend {
    identity: String,
    debouncer: Option<Debouncer<RecommendedWatcher, FileIdMap>>,
    debouncer_rx: Receiver<DebounceEventResult>,
    watches: BTreeMap<u64, Watch>,
    shared: HashMap<PathBuf, SharedWatch>,
    ready: VecDeque<RawNotification>,
    last_id: u64,
    debug_level: DebugLevel,
    signal: Arc<Notify>,
}

impl std::fmt::Debug for NotifyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyBackend")
            .field("identity", &self.identity)
            .field("open", &self.debouncer.is_some())
            .field("watches", &self.watches)
            .field("ready", &self.ready.len())
            .finish()
    }
}

impl NotifyBackend {
    /// Starts the watcher and its debouncer.
    ///
    /// # Arguments
    ///
    /// * `identity` - Client label, used in logs only.
    /// * `debounce` - How long the debouncer coalesces events for one path.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform watcher cannot be created.
    pub fn open(identity: &str, debounce: Duration) -> Result<Self, BackendError> {
        let (debouncer_tx, debouncer_rx) = std::sync::mpsc::channel();
        let signal = Arc::new(Notify::new());
        let debouncer_signal = Arc::clone(&signal);
        let debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            if debouncer_tx.send(result).is_ok() {
                debouncer_signal.notify_one();
            }
        })?;
        info!(
            "Opened notify backend for '{}' (debounce {:?})",
            identity, debounce
        );
        Ok(Self {
            identity: identity.to_string(),
            debouncer: Some(debouncer),
            debouncer_rx,
            watches: BTreeMap::new(),
            shared: HashMap::new(),
            ready: VecDeque::new(),
            last_id: 0,
            debug_level: DebugLevel::Off,
            signal,
        })
    }

    fn debouncer(
        &mut self,
    ) -> Result<&mut Debouncer<RecommendedWatcher, FileIdMap>, BackendError> {
        self.debouncer.as_mut().ok_or(BackendError::Disconnected)
    }

    /// Adds an OS watch for `path`, or shares the existing one.
    fn acquire_watch(&mut self, path: &Path, mode: RecursiveMode) -> Result<(), BackendError> {
        let recursive = matches!(mode, RecursiveMode::Recursive);
        let needs_watch = match self.shared.get(path) {
            None => true,
            Some(shared) => recursive && !shared.recursive,
        };
        if needs_watch {
            let debouncer = self.debouncer()?;
            debouncer.watcher().watch(path, mode)?;
            debouncer.cache().add_root(path, mode);
            debug!("Watching {} ({:?})", path.display(), mode);
        }
        let shared = self.shared.entry(path.to_path_buf()).or_insert(SharedWatch {
            count: 0,
            recursive,
        });
        shared.count += 1;
        shared.recursive |= recursive;
        Ok(())
    }

    /// Drops one reference to the OS watch for `path`.
    ///
    /// The OS may already have removed the watch (the file was deleted), so unwatch
    /// failures are logged and not returned.
    fn release_watch(&mut self, path: &Path) {
        let Some(shared) = self.shared.get_mut(path) else {
            return;
        };
        shared.count -= 1;
        if shared.count > 0 {
            return;
        }
        self.shared.remove(path);
        if let Some(debouncer) = self.debouncer.as_mut() {
            if let Err(e) = debouncer.watcher().unwatch(path) {
                warn!("Failed to unwatch {}: {}", path.display(), e);
            }
            debouncer.cache().remove_root(path);
        }
    }

    /// Queues the existence scan of a directory or collection subscription.
    fn queue_scan(&mut self, id: BackendRequestId, watch: &Watch) -> Result<(), BackendError> {
        match (&watch.kind, &watch.filter) {
            (RequestKind::File, _) => return Ok(()),
            (RequestKind::Collection, Some(filter)) => {
                let walker = walkdir::WalkDir::new(&watch.canonical)
                    .min_depth(1)
                    .max_depth(filter.depth as usize + 1)
                    .sort_by_file_name();
                for entry in walker {
                    let entry = entry.map_err(|e| {
                        BackendError::Io(e.into_io_error().unwrap_or_else(|| {
                            std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop")
                        }))
                    })?;
                    if let Some(path) = watch.resolve(entry.path()) {
                        self.ready
                            .push_back(RawNotification::new(EventCode::Exists, path, id));
                    }
                }
            }
            (_, _) => {
                let mut names = std::fs::read_dir(&watch.canonical)?
                    .map(|entry| entry.map(|e| e.file_name()))
                    .collect::<Result<Vec<_>, _>>()?;
                names.sort();
                for name in names {
                    self.ready.push_back(RawNotification::new(
                        EventCode::Exists,
                        watch.root.join(name),
                        id,
                    ));
                }
            }
        }
        self.ready.push_back(RawNotification::new(
            EventCode::EndExist,
            watch.root.clone(),
            id,
        ));
        Ok(())
    }

    /// Moves everything the debouncer has produced so far into the ready queue.
    fn drain_debouncer(&mut self) -> Result<(), BackendError> {
        loop {
            match self.debouncer_rx.try_recv() {
                Ok(Ok(events)) => {
                    for event in &events {
                        self.translate(event);
                    }
                }
                Ok(Err(errors)) => {
                    for error in errors {
                        warn!("Debouncer reported error: {:?}", error);
                    }
                }
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(BackendError::Disconnected),
            }
        }
    }

    fn translate(&mut self, event: &notify::Event) {
        let Some(change) = change_for(&event.kind) else {
            trace!("Ignoring event kind {:?} for {:?}", event.kind, event.paths);
            return;
        };
        let Some(first) = event.paths.first() else {
            debug!("Received event with no paths: {:?}", event);
            return;
        };
        let second = event.paths.get(1);

        for (id, watch) in &self.watches {
            if watch.suspended {
                continue;
            }
            let raw = match change {
                Change::Code(code) => watch.resolve(first).map(|path| (code, path)),
                Change::Rename => watch
                    .resolve(first)
                    .map(|path| (EventCode::Moved, path))
                    .or_else(|| {
                        second
                            .and_then(|to| watch.resolve(to))
                            .map(|path| (EventCode::Created, path))
                    }),
            };
            if let Some((code, path)) = raw {
                let raw = RawNotification::new(code, path, BackendRequestId(*id));
                if self.debug_level != DebugLevel::Off {
                    debug!("[{}] produced {:?}", self.identity, raw);
                }
                self.ready.push_back(raw);
            }
        }
    }

    fn watch_mut(&mut self, request: BackendRequestId) -> Result<&mut Watch, BackendError> {
        self.watches
            .get_mut(&request.0)
            .ok_or(BackendError::UnknownRequest(request.0))
    }
}

impl Backend for NotifyBackend {
    fn name(&self) -> &'static str {
        "notify"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            suspend_resume: true,
            collections: true,
        }
    }

    fn subscribe(
        &mut self,
        kind: RequestKind,
        path: &Path,
        collection: Option<&CollectionSpec>,
    ) -> Result<BackendRequestId, BackendError> {
        self.debouncer()?;
        let canonical = std::fs::canonicalize(path)?;
        let filter = match kind {
            RequestKind::Collection => {
                let spec = collection.cloned().unwrap_or(CollectionSpec {
                    depth: 0,
                    mask: "*".to_string(),
                });
                let mask = Glob::new(&spec.mask)
                    .map_err(|e| BackendError::Refused(format!("invalid mask '{}': {e}", spec.mask)))?
                    .compile_matcher();
                Some(CollectionFilter {
                    depth: spec.depth,
                    mask,
                })
            }
            RequestKind::File | RequestKind::Directory => None,
        };
        let watch = Watch {
            kind,
            root: path.to_path_buf(),
            canonical,
            filter,
            suspended: false,
        };

        self.acquire_watch(&watch.canonical, watch.mode())?;
        self.last_id += 1;
        let id = BackendRequestId(self.last_id);
        if let Err(e) = self.queue_scan(id, &watch) {
            self.release_watch(&watch.canonical);
            return Err(e);
        }
        info!("Monitoring {} {} as request {}", kind, path.display(), id.0);
        self.watches.insert(id.0, watch);
        Ok(id)
    }

    fn suspend(&mut self, request: BackendRequestId) -> Result<(), BackendError> {
        self.watch_mut(request)?.suspended = true;
        Ok(())
    }

    fn resume(&mut self, request: BackendRequestId) -> Result<(), BackendError> {
        self.watch_mut(request)?.suspended = false;
        Ok(())
    }

    fn cancel(&mut self, request: BackendRequestId) -> Result<(), BackendError> {
        let watch = self
            .watches
            .remove(&request.0)
            .ok_or(BackendError::UnknownRequest(request.0))?;
        self.release_watch(&watch.canonical);
        debug!("Cancelled request {} on {}", request.0, watch.root.display());
        Ok(())
    }

    fn pending(&mut self) -> Result<bool, BackendError> {
        if !self.ready.is_empty() {
            return Ok(true);
        }
        self.debouncer()?;
        self.drain_debouncer()?;
        Ok(!self.ready.is_empty())
    }

    fn next_raw(&mut self) -> Result<Option<RawNotification>, BackendError> {
        if self.ready.is_empty() {
            self.pending()?;
        }
        let raw = self.ready.pop_front();
        if self.debug_level == DebugLevel::Verbose {
            trace!("[{}] delivering {:?}", self.identity, raw);
        }
        Ok(raw)
    }

    fn set_debug_level(&mut self, level: DebugLevel) {
        self.debug_level = level;
    }

    fn readiness(&self) -> Option<Arc<Notify>> {
        Some(Arc::clone(&self.signal))
    }

    fn close(&mut self) -> Result<(), BackendError> {
        if let Some(debouncer) = self.debouncer.take() {
            // Dropping the debouncer stops its thread and removes every OS watch.
            drop(debouncer);
            self.watches.clear();
            self.shared.clear();
            self.ready.clear();
            info!("Closed notify backend for '{}'", self.identity);
        }
        Ok(())
    }
}
