//! Spool directory transport
//!
//! Reporters drop one JSON file per interaction into the spool directory.
//! The monitor thread watches the directory and queues new files, with a
//! periodic full rescan for events the watcher drops. `fetch` takes the
//! next queued file, parses it and deletes it.
//!
//! File names start with a UTC timestamp, so the startup scan picks up a
//! backlog oldest first. Files that cannot be parsed are moved to
//! `<spool>/failed/` so they are not retried forever.

use super::Transport;
use crate::collector::CollectorHandle;
use crate::error::TransportError;
use crate::types::Interaction;
use chrono::Utc;
use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::de::Error as _;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const SPOOL_EXTENSION: &str = "json";
const FAILED_DIR: &str = "failed";
/// Poll intervals between full rescans while watching
const RESCAN_INTERVALS: u32 = 20;

/// Filesystem spool [`Transport`].
pub struct LocalFilesystem {
    spool: PathBuf,
    poll_interval: Duration,
    queue: SpoolQueue,
    queue_rx: Receiver<PathBuf>,
    monitor: Option<Monitor>,
    closed: bool,
}

struct Monitor {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl LocalFilesystem {
    /// Create the transport, creating the spool directory if needed.
    pub fn new(spool: &Path, poll_interval: Duration) -> Result<Self, TransportError> {
        if poll_interval.is_zero() {
            return Err(TransportError::Config(
                "spool poll interval must be greater than 0".to_string(),
            ));
        }
        fs::create_dir_all(spool)?;

        let (queue, queue_rx) = SpoolQueue::new();
        Ok(Self {
            spool: spool.to_path_buf(),
            poll_interval,
            queue,
            queue_rx,
            monitor: None,
            closed: false,
        })
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool
    }

    /// Write an interaction into the spool directory, returning its path.
    ///
    /// The file is written under a hidden temporary name and renamed into
    /// place, so the monitor never sees a partial file.
    pub fn spool_interaction(&self, interaction: &Interaction) -> Result<PathBuf, TransportError> {
        let name = format!(
            "{}-{}-{}.{}",
            Utc::now().format("%Y%m%dT%H%M%S%.6fZ"),
            sanitize_host(interaction.label()),
            uuid::Uuid::new_v4().simple(),
            SPOOL_EXTENSION
        );
        let path = self.spool.join(&name);
        let tmp = self.spool.join(format!(".{}.tmp", name));

        fs::write(&tmp, serde_json::to_vec(interaction)?)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        tracing::debug!(host = interaction.label(), path = %path.display(), "Spooled interaction");
        Ok(path)
    }

    fn read_spooled(&self, path: &Path) -> Result<Option<Interaction>, TransportError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            // Already consumed (queued twice) or removed by an operator
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let interaction = match parse_interaction(&data) {
            Ok(interaction) => interaction,
            Err(e) => {
                self.quarantine(path);
                return Err(e);
            }
        };

        if let Err(e) = fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove spooled interaction");
            }
        }

        Ok(Some(interaction))
    }

    fn quarantine(&self, path: &Path) {
        let failed = self.spool.join(FAILED_DIR);
        let Some(name) = path.file_name() else { return };

        let moved = fs::create_dir_all(&failed).and_then(|_| fs::rename(path, failed.join(name)));
        match moved {
            Ok(()) => tracing::warn!(
                path = %path.display(),
                "Moved unreadable interaction to {}",
                failed.display()
            ),
            Err(e) => tracing::error!(
                path = %path.display(),
                error = %e,
                "Failed to move unreadable interaction aside"
            ),
        }
    }
}

fn parse_interaction(data: &[u8]) -> Result<Interaction, TransportError> {
    let value: serde_json::Value = serde_json::from_slice(data)?;
    Interaction::try_from(value).map_err(|msg| TransportError::Json(serde_json::Error::custom(msg)))
}

/// Keep host names safe for use in a file name
fn sanitize_host(host: &str) -> String {
    host.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Visible `*.json` files directly inside the spool
fn is_spool_file(path: &Path) -> bool {
    let visible = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| !n.starts_with('.'));
    visible && path.extension().and_then(|e| e.to_str()) == Some(SPOOL_EXTENSION)
}

/// Spool files currently on disk, oldest name first
fn scan_spool(spool: &Path) -> Vec<PathBuf> {
    let pattern = spool.join(format!("*.{}", SPOOL_EXTENSION));
    let Some(pattern) = pattern.to_str() else {
        tracing::warn!(spool = %spool.display(), "Spool path is not valid UTF-8, cannot scan");
        return Vec::new();
    };

    let mut files: Vec<PathBuf> = match glob::glob(pattern) {
        Ok(paths) => paths
            .filter_map(|entry| entry.ok())
            .filter(|p| is_spool_file(p))
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "Invalid spool glob pattern");
            Vec::new()
        }
    };
    files.sort();
    files
}

/// Whether a watch event means a spool file is complete and ready to read
fn is_ready_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

/// Paths waiting to be fetched. A path is queued at most once until fetched.
#[derive(Clone)]
struct SpoolQueue {
    tx: Sender<PathBuf>,
    pending: Arc<Mutex<HashSet<PathBuf>>>,
}

impl SpoolQueue {
    fn new() -> (Self, Receiver<PathBuf>) {
        let (tx, rx) = mpsc::channel();
        let queue = Self {
            tx,
            pending: Arc::new(Mutex::new(HashSet::new())),
        };
        (queue, rx)
    }

    /// Queue a path unless it is already waiting. False once the receiver is gone.
    fn push(&self, path: PathBuf) -> bool {
        if !self.pending().insert(path.clone()) {
            return true;
        }
        self.tx.send(path).is_ok()
    }

    /// Mark a received path as no longer waiting
    fn taken(&self, path: &Path) {
        self.pending().remove(path);
    }

    fn pending(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Queue every spool file on disk. False once the receiver is gone.
fn rescan(spool: &Path, queue: &SpoolQueue) -> bool {
    scan_spool(spool).into_iter().all(|path| queue.push(path))
}

/// Queue the files a watch result points at. False once the receiver is gone.
fn handle_event(spool: &Path, queue: &SpoolQueue, result: notify::Result<Event>) -> bool {
    match result {
        Ok(event) if event.need_rescan() => {
            tracing::warn!(spool = %spool.display(), "Spool watcher dropped events, rescanning");
            rescan(spool, queue)
        }
        Ok(event) if is_ready_event(&event.kind) => event
            .paths
            .into_iter()
            .filter(|p| is_spool_file(p) && p.exists())
            .all(|p| queue.push(p)),
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Spool watch error, rescanning");
            rescan(spool, queue)
        }
    }
}

type WatchEvents = Receiver<notify::Result<Event>>;

fn watch_spool(spool: &Path) -> Result<(RecommendedWatcher, WatchEvents), TransportError> {
    let (event_tx, event_rx) = mpsc::channel::<notify::Result<Event>>();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = event_tx.send(res);
    })?;
    watcher.watch(spool, RecursiveMode::NonRecursive)?;
    Ok((watcher, event_rx))
}

fn run_monitor(
    watch: Option<(RecommendedWatcher, WatchEvents)>,
    spool: PathBuf,
    queue: SpoolQueue,
    stop: Arc<AtomicBool>,
    collector: CollectorHandle,
    interval: Duration,
) {
    let stopped = || stop.load(Ordering::SeqCst) || collector.is_terminated();

    let Some((_watcher, events)) = watch else {
        poll_spool(&spool, &queue, interval, stopped);
        return;
    };

    let rescan_every = interval * RESCAN_INTERVALS;
    let mut last_scan = Instant::now();

    while !stopped() {
        let alive = match events.recv_timeout(interval) {
            Ok(result) => handle_event(&spool, &queue, result),
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => {
                tracing::error!("Spool watcher stopped unexpectedly");
                collector.request_shutdown();
                return;
            }
        };
        if !alive {
            return;
        }

        // Catch files whose events never arrived
        if last_scan.elapsed() >= rescan_every {
            last_scan = Instant::now();
            if !rescan(&spool, &queue) {
                return;
            }
        }
    }
}

/// Fallback when the platform watcher is unavailable: rescan every interval.
fn poll_spool(spool: &Path, queue: &SpoolQueue, interval: Duration, stopped: impl Fn() -> bool) {
    while !stopped() {
        thread::sleep(interval);
        if !rescan(spool, queue) {
            return;
        }
    }
}

impl Transport for LocalFilesystem {
    fn name(&self) -> &'static str {
        "local_filesystem"
    }

    fn start_monitor(&mut self, collector: CollectorHandle) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.monitor.is_some() {
            tracing::debug!("Spool monitor already running");
            return Ok(());
        }

        // Watch first, so a file spooled during the backlog scan is seen by one or the other.
        let watch = match watch_spool(&self.spool) {
            Ok(watch) => {
                tracing::debug!(spool = %self.spool.display(), "Watching spool directory");
                Some(watch)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    spool = %self.spool.display(),
                    "Cannot watch spool, falling back to polling"
                );
                None
            }
        };

        let backlog = scan_spool(&self.spool);
        if !backlog.is_empty() {
            tracing::info!(count = backlog.len(), "Queued spooled interactions");
        }
        for path in backlog {
            // The receiver lives in self, so this cannot fail.
            self.queue.push(path);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new()
            .name("spool-monitor".to_string())
            .spawn({
                let spool = self.spool.clone();
                let queue = self.queue.clone();
                let stop = stop.clone();
                let interval = self.poll_interval;
                move || run_monitor(watch, spool, queue, stop, collector, interval)
            })?;

        self.monitor = Some(Monitor { stop, thread });
        Ok(())
    }

    fn fetch(&mut self) -> Result<Option<Interaction>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        match self.queue_rx.recv_timeout(self.poll_interval) {
            Ok(path) => {
                self.queue.taken(&path);
                self.read_spooled(&path)
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn store(&mut self, interaction: Interaction) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.spool_interaction(&interaction).map(|_| ())
    }

    fn shutdown(&mut self) -> Result<(), TransportError> {
        self.closed = true;

        if let Some(monitor) = self.monitor.take() {
            monitor.stop.store(true, Ordering::SeqCst);
            monitor
                .thread
                .join()
                .map_err(|_| io::Error::other("spool monitor thread panicked"))?;
            tracing::debug!("Spool monitor stopped");
        }
        Ok(())
    }
}

impl Drop for LocalFilesystem {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
