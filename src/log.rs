//! Asynchronous log pipeline.
//!
//! Any number of request tasks produce [`Level`]-tagged records; exactly one
//! background thread consumes them and writes to the [`LogSink`]. Because the
//! consumer is the only writer, the destination itself needs no lock.
//!
//! ```text
//!  task ─┐
//!  task ─┼─► sync_channel(1) ─► "keel-log" thread ─► LogSink::write_line
//!  task ─┘        FIFO                 sole owner          ↓ on quit
//!                                                     LogSink::close
//! ```
//!
//! The queue holds a single record, so a producer hands its record over
//! almost synchronously and blocks briefly while the writer is busy. Records
//! from one producer are written in the order they were submitted.
//!
//! [`PipelineLayer`] forwards `tracing` events into a pipeline, for hosts that
//! want library diagnostics in the same log.

use std::fmt::{self, Write as _};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::JoinHandle;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Timestamp prefix of every line, e.g. `[2025/03/14 09:26:53.589793]`.
const TIME_FORMAT: &str = "[%Y/%m/%d %H:%M:%S%.6f]";

// ── Level ─────────────────────────────────────────────────────────────────────

/// Severity of a log record, from least to most severe.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Level {
    Message,
    Warning,
    Debug,
    Notice,
    Error,
    Panic,
}

impl Level {
    /// The tag written between the timestamp and the text.
    fn tag(self) -> &'static str {
        match self {
            Self::Message => "",
            Self::Warning => " (WARNING)",
            Self::Debug   => " *DEBUG*",
            Self::Notice  => " NOTICE:",
            Self::Error   => " -Error-",
            Self::Panic   => " !Panic!",
        }
    }
}

impl From<tracing::Level> for Level {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::ERROR => Self::Error,
            tracing::Level::WARN  => Self::Warning,
            tracing::Level::INFO  => Self::Message,
            _                     => Self::Debug,
        }
    }
}

// ── Sinks ─────────────────────────────────────────────────────────────────────

/// A log destination. Owned by the pipeline's consumer thread after
/// [`LogPipeline::start`].
pub trait LogSink: Send + 'static {
    fn write_line(&mut self, line: &[u8]) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
}

impl LogSink for Box<dyn LogSink> {
    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        (**self).write_line(line)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Adapts any [`Write`] into a [`LogSink`]. Every line is flushed as written.
pub struct WriterSink<W>(W);

impl<W: Write + Send + 'static> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self(writer)
    }
}

impl<W: Write + Send + 'static> LogSink for WriterSink<W> {
    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.0.write_all(line)?;
        self.0.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// Standard output.
pub fn stdout_sink() -> WriterSink<io::Stdout> {
    WriterSink(io::stdout())
}

/// Opens `path` for appending, creating it if needed.
pub fn file_sink(path: impl AsRef<Path>) -> io::Result<WriterSink<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(WriterSink(file))
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

struct Record {
    level: Level,
    text: String,
    at: DateTime<Local>,
}

impl Record {
    fn render(&self) -> Vec<u8> {
        format!("{}{} {}\n", self.at.format(TIME_FORMAT), self.level.tag(), self.text).into_bytes()
    }
}

enum Command {
    Write(Record),
    Quit,
}

/// Handle to a running log pipeline.
///
/// Cheap to clone; every clone feeds the same consumer.
#[derive(Clone)]
pub struct LogPipeline {
    inner: Arc<Inner>,
}

struct Inner {
    tx: SyncSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    failed_writes: Arc<AtomicU64>,
}

impl LogPipeline {
    /// Spawns the consumer thread, which takes ownership of `sink`.
    pub fn start(sink: impl LogSink) -> io::Result<Self> {
        let (tx, rx) = sync_channel(1);
        let failed_writes = Arc::new(AtomicU64::new(0));
        let failures = Arc::clone(&failed_writes);

        let worker = std::thread::Builder::new()
            .name("keel-log".to_owned())
            .spawn(move || consume(rx, sink, &failures))?;

        Ok(Self {
            inner: Arc::new(Inner {
                tx,
                worker: Mutex::new(Some(worker)),
                closed: AtomicBool::new(false),
                failed_writes,
            }),
        })
    }

    /// Logs `parts` joined by single spaces.
    pub fn log(&self, level: Level, parts: &[&str]) {
        self.submit(level, parts.join(" "));
    }

    /// Logs pre-formatted arguments. Pair with `format_args!`.
    pub fn logf(&self, level: Level, args: fmt::Arguments<'_>) {
        self.submit(level, args.to_string());
    }

    /// Logs the display text of `err`.
    pub fn log_error(&self, level: Level, err: &dyn std::error::Error) {
        self.submit(level, err.to_string());
    }

    fn submit(&self, level: Level, text: String) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let record = Record { level, text, at: Local::now() };
        // A disconnected channel means the consumer already finished.
        let _ = self.inner.tx.send(Command::Write(record));
    }

    /// Stops the consumer after it has written everything queued before this
    /// call, then closes the sink. Blocks until that is done.
    ///
    /// Later calls, from any clone, return immediately. Records submitted
    /// after the first call are dropped.
    pub fn quit(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.tx.send(Command::Quit);
        if let Some(worker) = self.inner.worker.lock().take() {
            let _ = worker.join();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of records the sink failed to write. Failed writes are not retried.
    pub fn failed_writes(&self) -> u64 {
        self.inner.failed_writes.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for LogPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogPipeline")
            .field("closed", &self.is_closed())
            .field("failed_writes", &self.failed_writes())
            .finish()
    }
}

fn consume(rx: Receiver<Command>, mut sink: impl LogSink, failures: &AtomicU64) {
    while let Ok(Command::Write(record)) = rx.recv() {
        if sink.write_line(&record.render()).is_err() {
            failures.fetch_add(1, Ordering::Relaxed);
        }
    }
    let _ = sink.close();
}

// ── tracing bridge ────────────────────────────────────────────────────────────

/// A `tracing-subscriber` layer that writes events through a [`LogPipeline`].
///
/// ```rust,no_run
/// use keel::log::{self, LogPipeline, PipelineLayer};
/// use tracing_subscriber::prelude::*;
///
/// let logs = LogPipeline::start(log::stdout_sink()).unwrap();
/// tracing_subscriber::registry().with(PipelineLayer::new(logs)).init();
/// ```
pub struct PipelineLayer {
    logs: LogPipeline,
}

impl PipelineLayer {
    pub fn new(logs: LogPipeline) -> Self {
        Self { logs }
    }
}

impl<S: Subscriber> Layer<S> for PipelineLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = EventText::default();
        event.record(&mut visitor);
        self.logs.submit(Level::from(*event.metadata().level()), visitor.finish());
    }
}

/// Renders an event as its message followed by ` key=value` pairs.
#[derive(Default)]
struct EventText {
    message: String,
    fields: String,
}

impl EventText {
    fn finish(mut self) -> String {
        self.message.push_str(&self.fields);
        self.message
    }
}

impl Visit for EventText {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
