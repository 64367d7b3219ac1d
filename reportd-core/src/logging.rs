//! Logging infrastructure for reportd
//!
//! Every sink is optional and selected by [`LoggingConfig`]:
//! - Console output on stderr
//! - Rolling log file (daily rotation, `max_files` retained)
//! - Local syslog via `openlog(3)`/`syslog(3)`
//!
//! The level comes from the configured verbosity unless `RUST_LOG` is set.

use crate::config::LoggingConfig;
use crate::error::{Error, Result};
use std::ffi::{CStr, CString};
use std::io;
use std::path::PathBuf;
use std::sync::Once;
use tracing::{Level, Metadata};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Program name reported to syslog
const SYSLOG_IDENT: &CStr = c"reportd-collector";

/// Initialize the logging system
///
/// `detaching` must be true when the process will fork into the background
/// after this call: the non-blocking file writer runs on a worker thread that
/// does not exist in the forked child, so a blocking writer is used instead.
pub fn init(config: &LoggingConfig, detaching: bool) -> Result<LoggingGuard> {
    let verbosity = config.verbosity();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.as_filter()));

    let console_layer = config.console.then(|| {
        fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
    });

    let mut worker_guard = None;
    let file_layer = if config.file {
        let appender = file_appender(config)?;
        let layer = fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);

        if detaching {
            Some(layer.with_writer(appender).boxed())
        } else {
            // Non-blocking writer for better performance
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            worker_guard = Some(guard);
            Some(layer.with_writer(non_blocking).boxed())
        }
    } else {
        None
    };

    let syslog_layer = config.syslog.then(|| {
        fmt::layer()
            .with_writer(SyslogWriter::open())
            .with_ansi(false)
            .without_time()
            .with_target(false)
            .with_level(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .with(syslog_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install logger: {}", e)))?;

    tracing::debug!(
        level = verbosity.as_filter(),
        console = config.console,
        syslog = config.syslog,
        file = %file_sink_description(config),
        "Logging initialized"
    );

    Ok(LoggingGuard {
        _guard: worker_guard,
    })
}

fn file_appender(config: &LoggingConfig) -> Result<RollingFileAppender> {
    let log_dir = config
        .file_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let prefix = config
        .file_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            Error::Config(format!(
                "logging.file_path must name a file, got {:?}",
                config.file_path
            ))
        })?;

    // Create log directory if it doesn't exist
    std::fs::create_dir_all(&log_dir)?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(config.max_files)
        .build(&log_dir)
        .map_err(|e| Error::Config(format!("failed to open log file: {}", e)))
}

fn file_sink_description(config: &LoggingConfig) -> String {
    if config.file {
        config.file_path.display().to_string()
    } else {
        "disabled".to_string()
    }
}

/// Guard that keeps the logging system alive
///
/// When dropped, flushes any pending log writes.
pub struct LoggingGuard {
    _guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Map a tracing level onto a syslog priority
fn syslog_priority(level: &Level) -> libc::c_int {
    match *level {
        Level::ERROR => libc::LOG_ERR,
        Level::WARN => libc::LOG_WARNING,
        Level::INFO => libc::LOG_INFO,
        Level::DEBUG | Level::TRACE => libc::LOG_DEBUG,
    }
}

/// `MakeWriter` that forwards each formatted event to syslog.
#[derive(Clone, Copy)]
struct SyslogWriter;

impl SyslogWriter {
    fn open() -> Self {
        static OPEN: Once = Once::new();
        OPEN.call_once(|| {
            // SAFETY: the ident is a 'static C string, as openlog requires.
            unsafe { libc::openlog(SYSLOG_IDENT.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON) };
        });
        SyslogWriter
    }
}

impl<'a> MakeWriter<'a> for SyslogWriter {
    type Writer = SyslogRecord;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogRecord::new(libc::LOG_INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogRecord::new(syslog_priority(meta.level()))
    }
}

/// Buffers one formatted event and submits it to syslog when dropped.
struct SyslogRecord {
    priority: libc::c_int,
    buf: Vec<u8>,
}

impl SyslogRecord {
    fn new(priority: libc::c_int) -> Self {
        Self {
            priority,
            buf: Vec::with_capacity(256),
        }
    }
}

impl io::Write for SyslogRecord {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogRecord {
    fn drop(&mut self) {
        let text = String::from_utf8_lossy(&self.buf);
        let line = text.trim_end().replace('\0', " ");
        if line.is_empty() {
            return;
        }
        if let Ok(message) = CString::new(line) {
            // SAFETY: both pointers are valid NUL-terminated strings and the
            // format string consumes exactly one string argument.
            unsafe { libc::syslog(self.priority, c"%s".as_ptr(), message.as_ptr()) };
        }
    }
}
