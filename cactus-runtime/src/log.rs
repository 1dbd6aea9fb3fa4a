//! # Runtime Logging
//!
//! Structured log output for the stack runtime. Messages carry a level, the
//! component that emitted them and optional key/value fields, and render as
//! plain text or JSON.
//!
//! ## Design
//!
//! The minimum level and the enabled flag are atomics so that the hot paths
//! (segment allocation, cache hits) can test `would_log` without taking a
//! lock. Formatting only happens behind that check; the [`runtime_log!`]
//! macro wraps it.
//!
//! Tests install a capture sink with [`capture`]. While the returned guard is
//! alive, entries emitted by the capturing thread are recorded instead of
//! written to stderr.
//!
//! ```rust,ignore
//! use cactus_runtime::log::{LogBuilder, LogLevel, LogTarget};
//!
//! LogBuilder::new(LogLevel::Debug, LogTarget::Stack)
//!     .message("segment allocated")
//!     .field_int("wsize", 64)
//!     .emit();
//! ```

use std::cell::RefCell;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

// ============================================================================
// Levels, Formats and Targets
// ============================================================================

/// Log level, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum LogLevel {
    /// Per-operation detail (cache hits).
    Trace = 0,
    /// Segment lifecycle.
    Debug = 1,
    /// Stack growth and limit changes.
    #[default]
    Info = 2,
    /// Recoverable misuse.
    Warn = 3,
    /// Fatal invariant violations.
    Error = 4,
    /// Nothing is logged.
    Off = 5,
}

impl LogLevel {
    /// Upper-case level name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }

    /// Level from its `repr(u8)` discriminant.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(LogLevel::Trace),
            1 => Some(LogLevel::Debug),
            2 => Some(LogLevel::Info),
            3 => Some(LogLevel::Warn),
            4 => Some(LogLevel::Error),
            5 => Some(LogLevel::Off),
            _ => None,
        }
    }

    /// Parse a level name, case-insensitively.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "OFF" | "NONE" => Some(LogLevel::Off),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rendering of log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum LogFormat {
    /// Human readable single line.
    #[default]
    Plain = 0,
    /// One JSON object per line.
    Json = 1,
}

impl LogFormat {
    /// Parse a format name.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "plain" | "text" => Some(LogFormat::Plain),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Runtime component that emitted an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogTarget {
    /// Segment allocation and growth.
    Stack,
    /// Segment cache.
    Cache,
    /// Root scanning.
    Scan,
    /// Continuation protocol.
    Continuation,
    /// Domain lifecycle and limits.
    Domain,
    /// Unrecoverable errors.
    Fatal,
}

impl LogTarget {
    /// Lower-case component name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogTarget::Stack => "stack",
            LogTarget::Cache => "cache",
            LogTarget::Scan => "scan",
            LogTarget::Continuation => "continuation",
            LogTarget::Domain => "domain",
            LogTarget::Fatal => "fatal",
        }
    }
}

impl fmt::Display for LogTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Entries
// ============================================================================

/// A structured field value.
#[derive(Debug, Clone, PartialEq)]
pub enum LogValue {
    /// String value.
    Str(String),
    /// Integer value.
    Int(i64),
    /// Boolean value.
    Bool(bool),
}

impl fmt::Display for LogValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogValue::Str(s) => f.write_str(s),
            LogValue::Int(i) => write!(f, "{}", i),
            LogValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl LogValue {
    fn to_json(&self) -> String {
        match self {
            LogValue::Str(s) => format!("\"{}\"", escape_json(s)),
            LogValue::Int(i) => i.to_string(),
            LogValue::Bool(b) => b.to_string(),
        }
    }
}

/// One log record.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Severity.
    pub level: LogLevel,
    /// Emitting component.
    pub target: LogTarget,
    /// Message text.
    pub message: String,
    /// Key/value fields in insertion order.
    pub fields: Vec<(String, LogValue)>,
    /// Unix milliseconds.
    pub timestamp: u64,
}

impl LogEntry {
    /// Create an entry stamped with the current time.
    pub fn new(level: LogLevel, target: LogTarget, message: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            level,
            target,
            message: message.into(),
            fields: Vec::new(),
            timestamp,
        }
    }

    /// Look up a field by key.
    pub fn field(&self, key: &str) -> Option<&LogValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Render as a plain text line.
    pub fn format_plain(&self) -> String {
        let mut out = format!(
            "[{}.{:03}] {:<5} [{}] {}",
            self.timestamp / 1000,
            self.timestamp % 1000,
            self.level.as_str(),
            self.target,
            self.message
        );
        if !self.fields.is_empty() {
            let rendered: Vec<String> = self.fields.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            out.push_str(" {");
            out.push_str(&rendered.join(", "));
            out.push('}');
        }
        out
    }

    /// Render as a JSON object.
    pub fn format_json(&self) -> String {
        let mut out = format!(
            "{{\"timestamp\":{},\"level\":\"{}\",\"target\":\"{}\",\"message\":\"{}\"",
            self.timestamp,
            self.level.as_str(),
            self.target,
            escape_json(&self.message)
        );
        if !self.fields.is_empty() {
            let rendered: Vec<String> = self
                .fields
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json(k), v.to_json()))
                .collect();
            out.push_str(",\"fields\":{");
            out.push_str(&rendered.join(","));
            out.push('}');
        }
        out.push('}');
        out
    }

    /// Render in the given format.
    pub fn format(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Plain => self.format_plain(),
            LogFormat::Json => self.format_json(),
        }
    }
}

fn escape_json(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

// ============================================================================
// Global Logger State
// ============================================================================

static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static ENABLED: AtomicBool = AtomicBool::new(true);
static FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Plain as u8);

/// Serializes writes so lines from different threads never interleave.
static WRITER: OnceLock<Mutex<()>> = OnceLock::new();

thread_local! {
    static CAPTURE: RefCell<Option<Arc<Mutex<Vec<LogEntry>>>>> = const { RefCell::new(None) };
}

/// Set the minimum level.
pub fn set_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Current minimum level.
pub fn level() -> LogLevel {
    LogLevel::from_u8(MIN_LEVEL.load(Ordering::Relaxed)).unwrap_or_default()
}

/// Set the output format.
pub fn set_format(format: LogFormat) {
    FORMAT.store(format as u8, Ordering::Relaxed);
}

/// Current output format.
pub fn format() -> LogFormat {
    match FORMAT.load(Ordering::Relaxed) {
        1 => LogFormat::Json,
        _ => LogFormat::Plain,
    }
}

/// Enable or disable all output.
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

/// Whether output is enabled.
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Whether an entry at `level` would be recorded.
///
/// Error entries on the `Fatal` path bypass this check through [`emit_always`].
pub fn would_log(level: LogLevel) -> bool {
    if CAPTURE.with(|c| c.borrow().is_some()) {
        return true;
    }
    is_enabled() && level != LogLevel::Off && level >= self::level()
}

/// Record or print an entry if its level passes the filter.
pub fn emit(entry: LogEntry) {
    if would_log(entry.level) {
        write_entry(entry);
    }
}

/// Record or print an entry regardless of the filter.
pub fn emit_always(entry: LogEntry) {
    write_entry(entry);
}

fn write_entry(entry: LogEntry) {
    let captured = CAPTURE.with(|c| c.borrow().clone());
    if let Some(sink) = captured {
        sink.lock().push(entry);
        return;
    }
    let line = entry.format(format());
    let _guard = WRITER.get_or_init(|| Mutex::new(())).lock();
    let _ = writeln!(std::io::stderr(), "{}", line);
}

/// Log a plain message. Prefer [`runtime_log!`] when the message is formatted.
pub fn log(level: LogLevel, target: LogTarget, message: impl Into<String>) {
    if would_log(level) {
        write_entry(LogEntry::new(level, target, message));
    }
}

/// Log a formatted message, skipping the formatting when filtered out.
///
/// ```rust,ignore
/// runtime_log!(LogLevel::Info, LogTarget::Stack, "Growing stack to {}k bytes", kb);
/// ```
#[macro_export]
macro_rules! runtime_log {
    ($level:expr, $target:expr, $($arg:tt)+) => {{
        let level = $level;
        if $crate::log::would_log(level) {
            $crate::log::emit($crate::log::LogEntry::new(level, $target, format!($($arg)+)));
        }
    }};
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for entries with structured fields.
#[derive(Debug)]
pub struct LogBuilder {
    entry: LogEntry,
}

impl LogBuilder {
    /// Start an entry.
    pub fn new(level: LogLevel, target: LogTarget) -> Self {
        Self {
            entry: LogEntry::new(level, target, ""),
        }
    }

    /// Set the message.
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.entry.message = msg.into();
        self
    }

    /// Add a string field.
    pub fn field_str(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entry.fields.push((key.into(), LogValue::Str(value.into())));
        self
    }

    /// Add an integer field.
    pub fn field_int(mut self, key: impl Into<String>, value: i64) -> Self {
        self.entry.fields.push((key.into(), LogValue::Int(value)));
        self
    }

    /// Add a boolean field.
    pub fn field_bool(mut self, key: impl Into<String>, value: bool) -> Self {
        self.entry.fields.push((key.into(), LogValue::Bool(value)));
        self
    }

    /// Emit through the level filter.
    pub fn emit(self) {
        emit(self.entry);
    }
}

// ============================================================================
// Capture Sink
// ============================================================================

/// Records entries emitted on the current thread until dropped.
#[derive(Debug)]
pub struct CaptureGuard {
    sink: Arc<Mutex<Vec<LogEntry>>>,
    previous: Option<Arc<Mutex<Vec<LogEntry>>>>,
}

impl CaptureGuard {
    /// Entries recorded so far.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.sink.lock().clone()
    }

    /// Messages recorded so far.
    pub fn messages(&self) -> Vec<String> {
        self.sink.lock().iter().map(|e| e.message.clone()).collect()
    }

    /// Whether any recorded message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.sink.lock().iter().any(|e| e.message.contains(needle))
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CAPTURE.with(|c| *c.borrow_mut() = previous);
    }
}

/// Start capturing entries emitted on this thread, at every level.
pub fn capture() -> CaptureGuard {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let previous = CAPTURE.with(|c| c.borrow_mut().replace(Arc::clone(&sink)));
    CaptureGuard { sink, previous }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Off);
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::from_str("trace"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::from_str("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("none"), Some(LogLevel::Off));
        assert_eq!(LogLevel::from_str("loud"), None);
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!(LogFormat::from_str("TEXT"), Some(LogFormat::Plain));
        assert_eq!(LogFormat::from_str("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::from_str("xml"), None);
    }

    #[test]
    fn test_entry_plain_includes_target_and_fields() {
        let mut entry = LogEntry::new(LogLevel::Info, LogTarget::Stack, "Growing stack to 1k bytes");
        entry.fields.push(("fiber".into(), LogValue::Int(3)));
        let line = entry.format_plain();
        assert!(line.contains("INFO"));
        assert!(line.contains("[stack]"));
        assert!(line.contains("Growing stack to 1k bytes"));
        assert!(line.contains("fiber=3"));
    }

    #[test]
    fn test_entry_json() {
        let mut entry = LogEntry::new(LogLevel::Error, LogTarget::Fatal, "backwards \"local\" pointer");
        entry.fields.push(("arena".into(), LogValue::Int(1)));
        entry.fields.push(("fatal".into(), LogValue::Bool(true)));
        let json = entry.format_json();
        assert!(json.contains("\"level\":\"ERROR\""));
        assert!(json.contains("\"target\":\"fatal\""));
        assert!(json.contains("backwards \\\"local\\\" pointer"));
        assert!(json.contains("\"arena\":1"));
        assert!(json.contains("\"fatal\":true"));
    }

    #[test]
    fn test_escape_json() {
        assert_eq!(escape_json("a\nb"), "a\\nb");
        assert_eq!(escape_json("c:\\x"), "c:\\\\x");
        assert_eq!(escape_json("\u{1}"), "\\u0001");
    }

    #[test]
    fn test_capture_records_filtered_levels() {
        let guard = capture();
        runtime_log!(LogLevel::Trace, LogTarget::Cache, "hit class {}", 2);
        LogBuilder::new(LogLevel::Debug, LogTarget::Stack)
            .message("segment allocated")
            .field_int("wsize", 64)
            .emit();

        let entries = guard.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "hit class 2");
        assert_eq!(entries[0].target, LogTarget::Cache);
        assert_eq!(entries[1].field("wsize"), Some(&LogValue::Int(64)));
        assert!(guard.contains("allocated"));
    }

    #[test]
    fn test_capture_nesting_restores_outer_sink() {
        let outer = capture();
        {
            let inner = capture();
            log(LogLevel::Info, LogTarget::Domain, "inner");
            assert_eq!(inner.messages(), vec!["inner".to_string()]);
        }
        log(LogLevel::Info, LogTarget::Domain, "outer");
        assert_eq!(outer.messages(), vec!["outer".to_string()]);
    }

    #[test]
    fn test_set_level_roundtrip() {
        let original = level();
        set_level(LogLevel::Error);
        assert_eq!(level(), LogLevel::Error);
        set_level(original);
    }
}
