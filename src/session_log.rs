//! Session log: console + append-only file logging, and the begin/end
//! markers an external notification bridge scans for.
//!
//! File lines look like `2025-03-14 09:26:53,120 - INFO - message`. Write
//! failures on the file are remembered by the [`LogSink`] and surfaced by the
//! next [`SessionLog`] call, so losing the log is fatal to a run.

use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Local};
use tracing::{Event, Level, Subscriber};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::{format, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::ErrorKind;
use crate::types::LogLevel;

pub const BEGIN_MARKER: &str = "=== Rozpoczęcie synchronizacji FTP ===";
pub const END_MARKER: &str = "=== Zakończenie synchronizacji FTP ===";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

/// Shared, failure-tracking writer behind the file layer.
pub struct LogSink {
    writer: Mutex<Box<dyn Write + Send>>,
    failure: Mutex<Option<io::Error>>,
}

impl LogSink {
    /// Open `path` for appending, creating its directory if needed.
    pub fn open(path: &Path) -> io::Result<Arc<Self>> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let file_name = path
            .file_name()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("log path has no file name: {}", path.display()),
                )
            })?
            .to_string_lossy()
            .into_owned();
        std::fs::create_dir_all(dir)?;

        let appender = RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(file_name)
            .build(dir)
            .map_err(io::Error::other)?;
        Ok(Self::from_writer(Box::new(appender)))
    }

    pub fn from_writer(writer: Box<dyn Write + Send>) -> Arc<Self> {
        Arc::new(Self {
            writer: Mutex::new(writer),
            failure: Mutex::new(None),
        })
    }

    fn record_failure(&self, e: &io::Error) {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert_with(|| io::Error::new(e.kind(), e.to_string()));
        }
    }

    /// Flush, then report the first write failure since the last check.
    pub fn check(&self) -> io::Result<()> {
        let flushed = self
            .writer
            .lock()
            .map_err(|_| io::Error::other("log writer poisoned"))?
            .flush();
        if let Err(e) = flushed {
            self.record_failure(&e);
        }
        match self.failure.lock() {
            Ok(mut failure) => failure.take().map_or(Ok(()), Err),
            Err(_) => Err(io::Error::other("log failure state poisoned")),
        }
    }
}

struct SinkWriter(Arc<LogSink>);

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = match self.0.writer.lock() {
            Ok(mut w) => w.write_all(buf),
            Err(_) => Err(io::Error::other("log writer poisoned")),
        };
        match result {
            Ok(()) => Ok(buf.len()),
            Err(e) => {
                self.0.record_failure(&e);
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.writer.lock() {
            Ok(mut w) => w.flush(),
            Err(_) => Err(io::Error::other("log writer poisoned")),
        }
    }
}

/// `timestamp - LEVEL - message` lines.
struct LineFormat;

fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARNING",
        Level::INFO => "INFO",
        Level::DEBUG | Level::TRACE => "DEBUG",
    }
}

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        write!(
            writer,
            "{} - {} - ",
            Local::now().format(TIMESTAMP_FORMAT),
            level_name(event.metadata().level())
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// The file never drops below INFO: the session markers must always land.
fn file_level(level: LogLevel) -> LevelFilter {
    let chosen = match level {
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    };
    chosen.max(LevelFilter::INFO)
}

/// File layer with its own level filter, independent of the console's.
pub(crate) fn file_layer<S>(sink: Arc<LogSink>, level: LogLevel) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .event_format(LineFormat)
        .with_writer(move || SinkWriter(sink.clone()))
        .with_filter(file_level(level))
}

/// Install the global subscriber: console output plus the log file.
/// `RUST_LOG` and `--log-level` only narrow the console.
pub fn init(log_file: &Path, level: LogLevel) -> anyhow::Result<SessionLog> {
    let sink = LogSink::open(log_file)
        .map_err(|e| anyhow::anyhow!("Cannot open log file {}: {}", log_file.display(), e))?;
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(console_filter))
        .with(file_layer(sink.clone(), level))
        .try_init()?;

    Ok(SessionLog::new(sink))
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Failed { kind: ErrorKind, reason: String },
    Interrupted,
}

/// A session between its begin and end markers.
#[derive(Debug)]
pub struct ActiveSession {
    started_at: DateTime<Local>,
    clock: Instant,
}

/// A finished session, as recorded in the log.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub outcome: SessionOutcome,
}

#[derive(Clone)]
pub struct SessionLog {
    sink: Arc<LogSink>,
}

impl std::fmt::Debug for SessionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLog").finish_non_exhaustive()
    }
}

impl SessionLog {
    pub fn new(sink: Arc<LogSink>) -> Self {
        Self { sink }
    }

    pub fn begin(&self) -> io::Result<ActiveSession> {
        tracing::info!("{}", BEGIN_MARKER);
        self.sink.check()?;
        Ok(ActiveSession {
            started_at: Local::now(),
            clock: Instant::now(),
        })
    }

    /// Log the outcome, then the end marker.
    pub fn end(&self, session: ActiveSession, outcome: SessionOutcome) -> io::Result<SessionRecord> {
        let elapsed = crate::transfer::format_duration(session.clock.elapsed());
        match &outcome {
            SessionOutcome::Completed => tracing::info!("Session completed in {}", elapsed),
            SessionOutcome::Failed { kind, reason } => {
                tracing::error!("Session failed ({}) after {}: {}", kind, elapsed, reason)
            }
            SessionOutcome::Interrupted => {
                tracing::warn!("Session interrupted by shutdown signal after {}", elapsed)
            }
        }
        tracing::info!("{}", END_MARKER);
        self.sink.check()?;
        Ok(SessionRecord {
            started_at: session.started_at,
            ended_at: Local::now(),
            outcome,
        })
    }

    /// Log one line at `level`.
    pub fn event(&self, level: Level, message: &str) -> io::Result<()> {
        match level {
            Level::ERROR => tracing::error!("{}", message),
            Level::WARN => tracing::warn!("{}", message),
            Level::INFO => tracing::info!("{}", message),
            _ => tracing::debug!("{}", message),
        }
        self.sink.check()
    }

    /// Surface any file write failure since the last call.
    pub fn check(&self) -> io::Result<()> {
        self.sink.check()
    }
}

/// Lines of the last session that has both markers, markers included.
pub fn last_completed_session(contents: &str) -> Option<Vec<&str>> {
    let begin = format!("INFO - {}", BEGIN_MARKER);
    let end = format!("INFO - {}", END_MARKER);

    let mut last = None;
    let mut current: Option<Vec<&str>> = None;
    for line in contents.lines() {
        if line.contains(&begin) {
            current = Some(vec![line]);
        } else if let Some(session) = current.as_mut() {
            session.push(line);
        }
        if line.contains(&end) {
            if let Some(session) = current.take() {
                last = Some(session);
            }
        }
    }
    last
}
