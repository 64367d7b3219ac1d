//! Integration tests for the collector loop
//!
//! The collector runs against a scripted transport and a recording storage
//! backend so the order, count and outcome of every call can be checked.

use reportd_core::collector::{Collector, CollectorHandle, CollectorSettings};
use reportd_core::config::Config;
use reportd_core::error::{PidFileError, ReportingError, StorageError, TransportError};
use reportd_core::lifecycle::{DaemonSettings, PidLock};
use reportd_core::storage::{SqliteStorage, Storage};
use reportd_core::transport::{LocalFilesystem, Transport};
use reportd_core::types::Interaction;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ============================================
// Fakes
// ============================================

fn host(name: &str) -> Interaction {
    Interaction::new().with_hostname(name)
}

fn labels(interactions: &[Interaction]) -> Vec<&str> {
    interactions.iter().map(|i| i.label()).collect()
}

enum Step {
    Item(Interaction),
    Fail(TransportError),
}

#[derive(Default)]
struct TransportLog {
    script: VecDeque<Step>,
    fetches: usize,
    monitors: usize,
    shutdowns: usize,
}

/// Transport that replays a script, then reports nothing ready forever
#[derive(Clone, Default)]
struct FakeTransport {
    log: Arc<Mutex<TransportLog>>,
    direct: bool,
    fail_monitor: bool,
}

impl FakeTransport {
    fn with_items(hosts: &[&str]) -> Self {
        let transport = Self::default();
        for name in hosts {
            transport.push(Step::Item(host(name)));
        }
        transport
    }

    fn push(&self, step: Step) {
        self.log().script.push_back(step);
    }

    fn log(&self) -> MutexGuard<'_, TransportLog> {
        self.log.lock().unwrap()
    }
}

impl Transport for FakeTransport {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn is_direct(&self) -> bool {
        self.direct
    }

    fn start_monitor(&mut self, _collector: CollectorHandle) -> Result<(), TransportError> {
        if self.fail_monitor {
            return Err(TransportError::Config("monitor unavailable".to_string()));
        }
        self.log().monitors += 1;
        Ok(())
    }

    fn fetch(&mut self) -> Result<Option<Interaction>, TransportError> {
        let step = {
            let mut log = self.log();
            log.fetches += 1;
            log.script.pop_front()
        };
        match step {
            Some(Step::Item(interaction)) => Ok(Some(interaction)),
            Some(Step::Fail(e)) => Err(e),
            None => {
                thread::sleep(Duration::from_millis(1));
                Ok(None)
            }
        }
    }

    fn store(&mut self, interaction: Interaction) -> Result<(), TransportError> {
        self.push(Step::Item(interaction));
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), TransportError> {
        self.log().shutdowns += 1;
        Ok(())
    }
}

#[derive(Default)]
struct StorageLog {
    attempts: usize,
    imported: Vec<Interaction>,
    validations: usize,
    reopens: usize,
    shutdowns: usize,
}

/// Storage that records imports and rejects chosen attempts (1-based)
#[derive(Clone, Default)]
struct RecordingStorage {
    log: Arc<Mutex<StorageLog>>,
    fail_attempts: Vec<usize>,
    fail_validation: bool,
    fail_reopen: bool,
}

impl RecordingStorage {
    fn failing_on(attempts: &[usize]) -> Self {
        Self {
            fail_attempts: attempts.to_vec(),
            ..Self::default()
        }
    }

    fn log(&self) -> MutexGuard<'_, StorageLog> {
        self.log.lock().unwrap()
    }
}

impl Storage for RecordingStorage {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn validate(&mut self) -> Result<(), StorageError> {
        self.log().validations += 1;
        if self.fail_validation {
            return Err(StorageError::Validation("schema missing".to_string()));
        }
        Ok(())
    }

    fn after_fork(&mut self) -> Result<(), StorageError> {
        self.log().reopens += 1;
        if self.fail_reopen {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn import_interaction(&mut self, interaction: &Interaction) -> Result<(), StorageError> {
        let mut log = self.log();
        log.attempts += 1;
        if self.fail_attempts.contains(&log.attempts) {
            return Err(StorageError::Io(io::Error::other("disk full")));
        }
        log.imported.push(interaction.clone());
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), StorageError> {
        self.log().shutdowns += 1;
        Ok(())
    }
}

// ============================================
// Helpers
// ============================================

fn collector(
    transport: &FakeTransport,
    storage: &RecordingStorage,
    settings: CollectorSettings,
) -> Result<Collector, ReportingError> {
    Collector::with_backends(
        Box::new(transport.clone()),
        Box::new(storage.clone()),
        settings,
    )
}

struct Running {
    handle: CollectorHandle,
    thread: JoinHandle<(Collector, Result<(), ReportingError>)>,
}

fn spawn(mut collector: Collector) -> Running {
    let handle = collector.handle();
    let thread = thread::spawn(move || {
        let result = collector.run();
        (collector, result)
    });
    Running { handle, thread }
}

impl Running {
    /// Request shutdown and check the loop exits promptly
    fn stop(self) -> (Collector, Result<(), ReportingError>) {
        let requested = Instant::now();
        self.handle.request_shutdown();
        let outcome = self.thread.join().unwrap();
        assert!(
            requested.elapsed() < Duration::from_secs(2),
            "collector did not exit promptly"
        );
        outcome
    }
}

fn wait_for(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for collector");
        thread::sleep(Duration::from_millis(2));
    }
}

// ============================================
// Main loop
// ============================================

#[test]
fn test_imports_in_fetch_order_exactly_once() {
    let transport = FakeTransport::with_items(&["a", "b", "c", "d"]);
    let storage = RecordingStorage::default();
    let running = spawn(collector(&transport, &storage, CollectorSettings::default()).unwrap());

    wait_for(|| storage.log().imported.len() == 4);
    wait_for(|| transport.log().fetches > 6);
    let (collector, result) = running.stop();

    result.unwrap();
    assert_eq!(labels(&storage.log().imported), vec!["a", "b", "c", "d"]);
    assert_eq!(storage.log().attempts, 4);
    assert_eq!(collector.stats().fetched, 4);
    assert_eq!(collector.stats().imported, 4);
}

#[test]
fn test_two_items_then_shutdown() {
    let transport = FakeTransport::with_items(&["a", "b"]);
    let storage = RecordingStorage::default();
    let running = spawn(collector(&transport, &storage, CollectorSettings::default()).unwrap());

    wait_for(|| transport.log().fetches >= 2);
    wait_for(|| storage.log().imported.len() == 2);
    let (_, result) = running.stop();

    result.unwrap();
    let expected = vec![host("a"), host("b")];
    assert_eq!(storage.log().imported, expected);
    assert_eq!(transport.log().shutdowns, 1);
    assert_eq!(storage.log().shutdowns, 1);
}

#[test]
fn test_empty_fetch_imports_nothing() {
    let transport = FakeTransport::default();
    let storage = RecordingStorage::default();
    let running = spawn(collector(&transport, &storage, CollectorSettings::default()).unwrap());

    wait_for(|| transport.log().fetches >= 10);
    let (collector, result) = running.stop();

    result.unwrap();
    assert_eq!(storage.log().attempts, 0);
    assert_eq!(collector.stats().fetched, 0);
}

#[test]
fn test_failed_import_does_not_halt_pipeline() {
    let transport = FakeTransport::with_items(&["a", "b"]);
    let storage = RecordingStorage::failing_on(&[1]);
    let running = spawn(collector(&transport, &storage, CollectorSettings::default()).unwrap());

    wait_for(|| storage.log().imported.len() == 1);
    let (collector, result) = running.stop();

    result.unwrap();
    assert_eq!(storage.log().attempts, 2);
    assert_eq!(labels(&storage.log().imported), vec!["b"]);
    assert_eq!(collector.stats().failed, 1);
    assert_eq!(collector.stats().imported, 1);
    assert_eq!(collector.stats().dead_lettered, 0);
}

#[test]
fn test_second_import_fails_then_later_item_imported() {
    let transport = FakeTransport::with_items(&["a", "b"]);
    let storage = RecordingStorage::failing_on(&[2]);
    let running = spawn(collector(&transport, &storage, CollectorSettings::default()).unwrap());

    wait_for(|| storage.log().attempts == 2);
    let mut producer = transport.clone();
    producer.store(host("c")).unwrap();
    wait_for(|| storage.log().imported.len() == 2);
    let (_, result) = running.stop();

    result.unwrap();
    assert_eq!(storage.log().attempts, 3);
    assert_eq!(labels(&storage.log().imported), vec!["a", "c"]);
}

#[test]
fn test_transport_error_is_logged_and_loop_continues() {
    let transport = FakeTransport::default();
    transport.push(Step::Fail(TransportError::Io(io::Error::other("read failed"))));
    transport.push(Step::Item(host("a")));
    let storage = RecordingStorage::default();
    let running = spawn(collector(&transport, &storage, CollectorSettings::default()).unwrap());

    wait_for(|| storage.log().imported.len() == 1);
    let (_, result) = running.stop();
    result.unwrap();
}

#[test]
fn test_closed_transport_shuts_collector_down() {
    let transport = FakeTransport::with_items(&["a"]);
    transport.push(Step::Fail(TransportError::Closed));
    transport.push(Step::Item(host("never")));
    let storage = RecordingStorage::default();
    let mut collector = collector(&transport, &storage, CollectorSettings::default()).unwrap();

    collector.run().unwrap();

    assert!(collector.is_terminated());
    assert_eq!(labels(&storage.log().imported), vec!["a"]);
    assert_eq!(transport.log().shutdowns, 1);
    assert_eq!(storage.log().shutdowns, 1);
}

#[test]
fn test_handle_stops_collector_from_monitor_thread() {
    let transport = FakeTransport::default();
    let storage = RecordingStorage::default();
    let mut collector = collector(&transport, &storage, CollectorSettings::default()).unwrap();

    let handle = collector.handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        handle.request_shutdown();
    });

    collector.run().unwrap();
    stopper.join().unwrap();
    assert_eq!(storage.log().shutdowns, 1);
}

#[test]
fn test_monitor_start_failure_is_fatal() {
    let transport = FakeTransport {
        fail_monitor: true,
        ..FakeTransport::default()
    };
    let storage = RecordingStorage::default();
    let mut collector = collector(&transport, &storage, CollectorSettings::default()).unwrap();

    let err = collector.run().unwrap_err();
    assert!(matches!(err, ReportingError::Monitor(_)));
    assert!(err.to_string().starts_with("failed to start transport monitor"));
    assert_eq!(transport.log().fetches, 0);
    assert_eq!(storage.log().shutdowns, 1);
}

// ============================================
// Shutdown
// ============================================

#[test]
fn test_shutdown_is_idempotent() {
    let transport = FakeTransport::default();
    let storage = RecordingStorage::default();
    let mut collector = collector(&transport, &storage, CollectorSettings::default()).unwrap();

    for _ in 0..5 {
        collector.shutdown().unwrap();
    }
    collector.run().unwrap();
    drop(collector);

    assert_eq!(transport.log().shutdowns, 1);
    assert_eq!(storage.log().shutdowns, 1);
    assert_eq!(transport.log().monitors, 0);
}

#[test]
fn test_drop_releases_backends() {
    let transport = FakeTransport::default();
    let storage = RecordingStorage::default();
    let collector = collector(&transport, &storage, CollectorSettings::default()).unwrap();

    drop(collector);

    assert_eq!(transport.log().shutdowns, 1);
    assert_eq!(storage.log().shutdowns, 1);
}

// ============================================
// Construction
// ============================================

#[test]
fn test_direct_transport_rejected_and_released() {
    let transport = FakeTransport {
        direct: true,
        ..FakeTransport::default()
    };
    let storage = RecordingStorage::default();

    let err = collector(&transport, &storage, CollectorSettings::default())
        .err()
        .unwrap();

    assert!(matches!(
        err,
        ReportingError::IncompatibleTransport { ref transport } if transport == "fake"
    ));
    assert_eq!(transport.log().shutdowns, 1);
    assert_eq!(storage.log().shutdowns, 1);
    assert_eq!(storage.log().validations, 0);
}

#[test]
fn test_failed_validation_still_runs() {
    let transport = FakeTransport::with_items(&["a"]);
    let storage = RecordingStorage {
        fail_validation: true,
        ..RecordingStorage::default()
    };
    let running = spawn(collector(&transport, &storage, CollectorSettings::default()).unwrap());

    wait_for(|| storage.log().imported.len() == 1);
    let (_, result) = running.stop();

    result.unwrap();
    assert_eq!(storage.log().validations, 1);
}

#[test]
fn test_strict_validation_is_fatal() {
    let transport = FakeTransport::default();
    let storage = RecordingStorage {
        fail_validation: true,
        ..RecordingStorage::default()
    };
    let settings = CollectorSettings {
        strict_validation: true,
        ..CollectorSettings::default()
    };

    let err = collector(&transport, &storage, settings).err().unwrap();

    assert!(matches!(
        err,
        ReportingError::Validation { ref storage, .. } if storage == "recording"
    ));
    assert_eq!(transport.log().shutdowns, 1);
    assert_eq!(storage.log().shutdowns, 1);
}

// ============================================
// Daemon mode
// ============================================

#[test]
fn test_locked_pidfile_fails_fast() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("collector.pid");
    let _held = PidLock::acquire(&pidfile).unwrap();

    let transport = FakeTransport::with_items(&["a"]);
    let storage = RecordingStorage::default();
    let settings = CollectorSettings {
        daemon: Some(DaemonSettings {
            pidfile: pidfile.clone(),
            detach: false,
        }),
        ..CollectorSettings::default()
    };
    let mut collector = collector(&transport, &storage, settings).unwrap();

    let started = Instant::now();
    let err = collector.run().unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(
        err,
        ReportingError::PidFile(PidFileError::Locked { owner: Some(pid), .. })
            if pid == std::process::id()
    ));
    assert_eq!(transport.log().monitors, 0);
    assert_eq!(transport.log().fetches, 0);
    assert_eq!(storage.log().attempts, 0);
    assert_eq!(storage.log().reopens, 0);
    assert_eq!(storage.log().shutdowns, 1);
    assert!(pidfile.exists(), "the other holder keeps its pidfile");
}

#[test]
fn test_foreground_daemon_holds_pidfile_while_running() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("run/collector.pid");

    let transport = FakeTransport::default();
    let storage = RecordingStorage::default();
    let settings = CollectorSettings {
        daemon: Some(DaemonSettings {
            pidfile: pidfile.clone(),
            detach: false,
        }),
        ..CollectorSettings::default()
    };
    let running = spawn(collector(&transport, &storage, settings).unwrap());

    wait_for(|| transport.log().monitors == 1);
    let recorded = std::fs::read_to_string(&pidfile).unwrap();
    assert_eq!(recorded.trim(), std::process::id().to_string());

    let (_, result) = running.stop();
    result.unwrap();
    assert!(!pidfile.exists());
    assert_eq!(storage.log().reopens, 1);
}

#[test]
fn test_storage_reopen_failure_is_fatal() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("collector.pid");

    let transport = FakeTransport::with_items(&["a"]);
    let storage = RecordingStorage {
        fail_reopen: true,
        ..RecordingStorage::default()
    };
    let settings = CollectorSettings {
        daemon: Some(DaemonSettings {
            pidfile: pidfile.clone(),
            detach: false,
        }),
        ..CollectorSettings::default()
    };
    let mut collector = collector(&transport, &storage, settings).unwrap();

    let err = collector.run().unwrap_err();

    assert!(matches!(err, ReportingError::Reopen(StorageError::Closed)));
    assert_eq!(transport.log().monitors, 0);
    assert_eq!(storage.log().attempts, 0);
    assert_eq!(storage.log().shutdowns, 1);
    assert!(!pidfile.exists(), "the pid file is released");
}

#[test]
fn test_storage_not_reopened_without_daemon() {
    let transport = FakeTransport::with_items(&["a"]);
    let storage = RecordingStorage::default();
    let running = spawn(collector(&transport, &storage, CollectorSettings::default()).unwrap());

    wait_for(|| storage.log().imported.len() == 1);
    let (_, result) = running.stop();

    result.unwrap();
    assert_eq!(storage.log().reopens, 0);
}

// ============================================
// Dead letters
// ============================================

#[test]
fn test_failed_interactions_kept_when_dead_letter_configured() {
    let dir = TempDir::new().unwrap();
    let dead = dir.path().join("dead");

    let transport = FakeTransport::with_items(&["a", "b"]);
    let storage = RecordingStorage::failing_on(&[1]);
    let settings = CollectorSettings {
        dead_letter_dir: Some(dead.clone()),
        ..CollectorSettings::default()
    };
    let running = spawn(collector(&transport, &storage, settings).unwrap());

    wait_for(|| storage.log().attempts == 2);
    let (collector, result) = running.stop();

    result.unwrap();
    assert_eq!(collector.stats().dead_lettered, 1);

    let kept: Vec<_> = std::fs::read_dir(&dead).unwrap().collect();
    assert_eq!(kept.len(), 1);
    let path = kept[0].as_ref().unwrap().path();
    let record: serde_json::Value =
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
    assert_eq!(record["interaction"]["hostname"], "a");
    assert!(record["error"].as_str().unwrap().contains("disk full"));
}

// ============================================
// End to end
// ============================================

#[test]
fn test_spool_to_sqlite() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.spool.path = dir.path().join("spool");
    config.spool.poll_interval_ms = 20;
    config.sqlite.path = dir.path().join("reports.db");

    let mut reporter =
        LocalFilesystem::new(&config.spool.path, Duration::from_millis(20)).unwrap();
    let run = |name: &str, n: u64| {
        let mut interaction = host(name);
        interaction.insert("run", serde_json::json!(n));
        interaction
    };
    reporter.store(run("web01", 1)).unwrap();
    reporter.store(run("web02", 1)).unwrap();

    let running = spawn(Collector::from_config(&config).unwrap());

    // Reported after the collector started: picked up by the monitor
    reporter.store(run("web01", 2)).unwrap();

    let db = SqliteStorage::open(&config.sqlite.path).unwrap();
    wait_for(|| db.count_interactions().unwrap() == 3);
    let (collector, result) = running.stop();

    result.unwrap();
    assert_eq!(collector.stats().imported, 3);
    assert_eq!(db.get_host("web01").unwrap().unwrap().interaction_count, 2);
    assert_eq!(db.hosts().unwrap().len(), 2);

    let leftover: Vec<_> = glob::glob(&format!("{}/*.json", config.spool.path.display()))
        .unwrap()
        .collect();
    assert!(leftover.is_empty(), "imported spool files are removed");
}
