//! Asynchronous log pipeline: producer fan-in, bounded queue, sink fan-out.
//!
//! Producers use the ordinary `log` crate macros. [`HubLogger`] formats
//! each record on the calling task into a fixed-size [`LogEntry`]
//! (10-byte tag, 110-byte message) and enqueues it non-blockingly into
//! the [`LogHub`] queue, dropping on overflow. A dedicated dispatcher
//! task blocks on the queue and hands every entry to each registered
//! sink in turn.
//!
//! Formatting truncation is detected by the length-checked writer and
//! recorded as a follow-up warning entry carrying the source location.
//! Level filtering is a sink concern; the hub carries everything.

use core::fmt;
use core::fmt::Write as _;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Fixed tag width (bytes).
pub const LOG_TAG_MAX: usize = 10;

/// Fixed message width (bytes).
pub const LOG_MSG_MAX: usize = 110;

/// Compile-time queue depth.
pub const LOG_QUEUE_LEN: usize = 64;

/// Maximum number of registered sinks.
pub const MAX_SINKS: usize = 4;

/// Log severity levels, ordered Debug < Info < Warn < Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "D",
            Self::Info => "I",
            Self::Warn => "W",
            Self::Error => "E",
        }
    }
}

/// One formatted log record. Fixed-size, copied by value into sinks.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Milliseconds since hub creation (monotonic).
    pub ts_ms: u64,
    pub level: LogLevel,
    pub tag: heapless::String<LOG_TAG_MAX>,
    pub msg: heapless::String<LOG_MSG_MAX>,
    /// Set when the message did not fit and was cut at the buffer edge.
    pub truncated: bool,
}

/// Length-checked formatter: writes `args` into `out`, returns `true`
/// when the output was truncated to fit.
pub fn write_checked<const N: usize>(out: &mut heapless::String<N>, args: fmt::Arguments<'_>) -> bool {
    struct Sink<'a, const N: usize> {
        out: &'a mut heapless::String<N>,
        truncated: bool,
    }
    impl<const N: usize> fmt::Write for Sink<'_, N> {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for ch in s.chars() {
                if self.out.push(ch).is_err() {
                    self.truncated = true;
                    return Ok(()); // swallow the rest, keep the prefix
                }
            }
            Ok(())
        }
    }
    let mut sink = Sink { out, truncated: false };
    let _ = fmt::write(&mut sink, args);
    sink.truncated
}

// ── Hub ───────────────────────────────────────────────────────

/// Central log queue. Producers enqueue without blocking; the dispatcher
/// blocks on dequeue.
pub struct LogHub {
    queue: Mutex<heapless::Deque<LogEntry, LOG_QUEUE_LEN>>,
    ready: Condvar,
    dropped: AtomicU32,
    truncations: AtomicU32,
    epoch: Instant,
}

impl LogHub {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(heapless::Deque::new()),
            ready: Condvar::new(),
            dropped: AtomicU32::new(0),
            truncations: AtomicU32::new(0),
            epoch: Instant::now(),
        }
    }

    /// Milliseconds since hub creation.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Non-blocking enqueue. Returns `false` and drops the entry when
    /// the queue is full.
    pub fn enqueue(&self, entry: LogEntry) -> bool {
        let ok = {
            let mut q = self.queue.lock().expect("log queue poisoned");
            q.push_back(entry).is_ok()
        };
        if ok {
            self.ready.notify_one();
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Blocking dequeue with timeout. Returns `None` on timeout.
    pub fn dequeue(&self, timeout: Duration) -> Option<LogEntry> {
        let mut q = self.queue.lock().expect("log queue poisoned");
        loop {
            if let Some(e) = q.pop_front() {
                return Some(e);
            }
            let (guard, res) = self
                .ready
                .wait_timeout(q, timeout)
                .expect("log queue poisoned");
            q = guard;
            if res.timed_out() {
                return q.pop_front();
            }
        }
    }

    /// Entries dropped on overflow since creation.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Messages truncated by the length-checked writer since creation.
    pub fn truncations(&self) -> u32 {
        self.truncations.load(Ordering::Relaxed)
    }

    /// Format and enqueue one record. Used by [`HubLogger`]; callable
    /// directly where the `log` facade is not available.
    pub fn log(&self, level: LogLevel, tag: &str, args: fmt::Arguments<'_>, location: Option<(&str, u32)>) {
        let mut entry = LogEntry {
            ts_ms: self.now_ms(),
            level,
            tag: heapless::String::new(),
            msg: heapless::String::new(),
            truncated: false,
        };
        let tag = if tag.is_empty() { "-" } else { tag };
        for ch in tag.chars().take(LOG_TAG_MAX) {
            if entry.tag.push(ch).is_err() {
                break;
            }
        }
        entry.truncated = write_checked(&mut entry.msg, args);
        let was_truncated = entry.truncated;
        let _ = self.enqueue(entry);

        if was_truncated {
            self.truncations.fetch_add(1, Ordering::Relaxed);
            let mut warnmsg: heapless::String<LOG_MSG_MAX> = heapless::String::new();
            let (file, line) = location.unwrap_or(("?", 0));
            let _ = write!(warnmsg, "log message truncated at {}:{}", file, line);
            let mut warn_tag: heapless::String<LOG_TAG_MAX> = heapless::String::new();
            let _ = warn_tag.push_str("logfmt");
            let _ = self.enqueue(LogEntry {
                ts_ms: self.now_ms(),
                level: LogLevel::Warn,
                tag: warn_tag,
                msg: warnmsg,
                truncated: false,
            });
        }
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

// ── Sinks ─────────────────────────────────────────────────────

/// Consumer-side interface. Sinks receive entries by value from the
/// dispatcher task and must not block on resources held by producers.
pub trait LogSink: Send + Sync {
    fn write(&self, entry: &LogEntry);
}

/// Bounded registry of log sinks.
pub struct SinkRegistry {
    sinks: Mutex<heapless::Vec<Arc<dyn LogSink>, MAX_SINKS>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self {
            sinks: Mutex::new(heapless::Vec::new()),
        }
    }

    /// Register a sink. Fails when the registry is full.
    pub fn add(&self, sink: Arc<dyn LogSink>) -> bool {
        self.sinks
            .lock()
            .expect("sink registry poisoned")
            .push(sink)
            .is_ok()
    }

    pub fn count(&self) -> usize {
        self.sinks.lock().expect("sink registry poisoned").len()
    }

    /// Snapshot of the registered sinks for one dispatch round.
    pub fn snapshot(&self) -> heapless::Vec<Arc<dyn LogSink>, MAX_SINKS> {
        self.sinks.lock().expect("sink registry poisoned").clone()
    }
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain one entry (with `timeout`) and fan it out to every sink.
/// Returns `true` when an entry was delivered. This is the body of the
/// dispatcher task's loop.
pub fn dispatch_once(hub: &LogHub, sinks: &SinkRegistry, timeout: Duration) -> bool {
    let Some(entry) = hub.dequeue(timeout) else {
        return false;
    };
    for sink in sinks.snapshot().iter() {
        sink.write(&entry);
    }
    true
}

// ── `log` facade bridge ───────────────────────────────────────

static HUB: OnceLock<Arc<LogHub>> = OnceLock::new();

/// Bridge from the `log` crate facade into the hub queue.
///
/// The tag is the last segment of the record target (typically the
/// producing module's path), truncated to the fixed tag width.
pub struct HubLogger;

static LOGGER: HubLogger = HubLogger;

/// Install the global logger routing `log` macros into `hub`.
/// Safe to call more than once; only the first call takes effect.
pub fn install(hub: Arc<LogHub>) {
    let _ = HUB.set(hub);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Debug);
    }
}

fn level_from(level: log::Level) -> LogLevel {
    match level {
        log::Level::Error => LogLevel::Error,
        log::Level::Warn => LogLevel::Warn,
        log::Level::Info => LogLevel::Info,
        log::Level::Debug | log::Level::Trace => LogLevel::Debug,
    }
}

impl log::Log for HubLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        HUB.get().is_some()
    }

    fn log(&self, record: &log::Record<'_>) {
        let Some(hub) = HUB.get() else { return };
        let tag = record.target().rsplit("::").next().unwrap_or("-");
        let location = record.file().map(|f| {
            let short = f.rsplit('/').next().unwrap_or(f);
            (short, record.line().unwrap_or(0))
        });
        hub.log(level_from(record.level()), tag, *record.args(), location);
    }

    fn flush(&self) {}
}
