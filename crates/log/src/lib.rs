//! Process-wide leveled logger.
//!
//! Lines go to stderr as text or JSON, and can optionally be mirrored into a bounded in-memory
//! ring so tests and status views can inspect recent diagnostics.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text = 0,
    Json = 1,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
        }
    }
}

static LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static JSON_OUTPUT: AtomicBool = AtomicBool::new(false);
static TIMESTAMPS: AtomicBool = AtomicBool::new(true);
static STDERR_ENABLED: AtomicBool = AtomicBool::new(true);

/// One line retained by the capture ring.
#[derive(Clone, Debug)]
pub struct CapturedLog {
    pub ts_ms: u64,
    pub level: Level,
    pub target: &'static str,
    pub msg: String,
}

static CAPTURE_ENABLED: AtomicBool = AtomicBool::new(false);
static CAPTURE_CAPACITY: AtomicUsize = AtomicUsize::new(0);
static CAPTURE: OnceLock<Mutex<VecDeque<CapturedLog>>> = OnceLock::new();

pub fn init(config: LogConfig) {
    LEVEL.store(config.level as u8, Ordering::Relaxed);
    JSON_OUTPUT.store(matches!(config.format, Format::Json), Ordering::Relaxed);
    TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= LEVEL.load(Ordering::Relaxed)
}

pub fn set_stderr_enabled(enabled: bool) {
    STDERR_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn enable_capture(capacity: usize) {
    if capacity == 0 {
        CAPTURE_ENABLED.store(false, Ordering::Relaxed);
        return;
    }
    CAPTURE_CAPACITY.store(capacity, Ordering::Relaxed);
    CAPTURE.get_or_init(|| Mutex::new(VecDeque::with_capacity(capacity.min(1024))));
    CAPTURE_ENABLED.store(true, Ordering::Relaxed);
}

pub fn clear_captured_logs() {
    let Some(ring) = CAPTURE.get() else {
        return;
    };
    if let Ok(mut guard) = ring.lock() {
        guard.clear();
    }
}

/// Returns up to `limit` of the most recent captured lines, oldest first.
pub fn capture_snapshot(limit: usize) -> Vec<CapturedLog> {
    let Some(ring) = CAPTURE.get() else {
        return Vec::new();
    };
    let Ok(guard) = ring.lock() else {
        return Vec::new();
    };
    let start = guard.len().saturating_sub(limit);
    guard.iter().skip(start).cloned().collect()
}

pub fn log(
    level: Level,
    target: &'static str,
    file: &'static str,
    line: u32,
    args: fmt::Arguments<'_>,
) {
    if !enabled(level) {
        return;
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let ts_ms: u64 = now.as_millis().try_into().unwrap_or(u64::MAX);
    let msg = args.to_string();

    if STDERR_ENABLED.load(Ordering::Relaxed) {
        let rendered = if JSON_OUTPUT.load(Ordering::Relaxed) {
            render_json(ts_ms, level, target, file, line, &msg)
        } else {
            let stamp = TIMESTAMPS.load(Ordering::Relaxed).then_some(now);
            render_text(stamp, level, target, &msg)
        };
        let mut out = io::stderr().lock();
        let _ = writeln!(out, "{rendered}");
    }

    if CAPTURE_ENABLED.load(Ordering::Relaxed) {
        push_capture(CapturedLog {
            ts_ms,
            level,
            target,
            msg,
        });
    }
}

fn push_capture(entry: CapturedLog) {
    let Some(ring) = CAPTURE.get() else {
        return;
    };
    let Ok(mut guard) = ring.lock() else {
        return;
    };
    let cap = CAPTURE_CAPACITY.load(Ordering::Relaxed);
    if cap == 0 {
        return;
    }
    guard.push_back(entry);
    while guard.len() > cap {
        let _ = guard.pop_front();
    }
}

fn render_text(stamp: Option<Duration>, level: Level, target: &str, msg: &str) -> String {
    match stamp {
        Some(since_epoch) => format!(
            "{} {} {}: {}",
            Timestamp(since_epoch),
            level.as_str(),
            target,
            msg
        ),
        None => format!("{} {}: {}", level.as_str(), target, msg),
    }
}

fn render_json(
    ts_ms: u64,
    level: Level,
    target: &str,
    file: &str,
    line: u32,
    msg: &str,
) -> String {
    json!({
        "ts_ms": ts_ms,
        "level": level.as_str(),
        "target": target,
        "file": file,
        "line": line,
        "msg": msg,
    })
    .to_string()
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Trace, $($arg)*);
    }};
}

/// RFC3339 UTC rendering of a duration since the unix epoch, millisecond precision.
struct Timestamp(Duration);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SECS_PER_DAY: u64 = 86_400;
        let secs = self.0.as_secs();
        let (year, month, day) = civil_from_days((secs / SECS_PER_DAY) as i64);
        let of_day = secs % SECS_PER_DAY;
        write!(
            f,
            "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
            of_day / 3600,
            (of_day % 3600) / 60,
            of_day % 60,
            self.0.subsec_millis()
        )
    }
}

// Howard Hinnant's days-to-civil conversion.
fn civil_from_days(days: i64) -> (i32, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe as i32 + era as i32 * 400 + i32::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level() {
        assert_eq!(Level::parse("info"), Some(Level::Info));
        assert_eq!(Level::parse(" WARN "), Some(Level::Warn));
        assert_eq!(Level::parse("warning"), Some(Level::Warn));
        assert_eq!(Level::parse("trace"), Some(Level::Trace));
        assert_eq!(Level::parse("loud"), None);
    }

    #[test]
    fn parse_format() {
        assert_eq!(Format::parse("text"), Some(Format::Text));
        assert_eq!(Format::parse("JSON"), Some(Format::Json));
        assert_eq!(Format::parse("yaml"), None);
    }

    #[test]
    fn timestamp_renders_utc() {
        let stamp = Timestamp(Duration::from_millis(1_700_000_000_123));
        assert_eq!(stamp.to_string(), "2023-11-14T22:13:20.123Z");
        assert_eq!(
            Timestamp(Duration::ZERO).to_string(),
            "1970-01-01T00:00:00.000Z"
        );
    }

    #[test]
    fn text_line_layout() {
        let line = render_text(None, Level::Warn, "ledgerd_sync::manager", "stalled");
        assert_eq!(line, "WARN ledgerd_sync::manager: stalled");
    }

    #[test]
    fn capture_keeps_the_newest_lines() {
        set_stderr_enabled(false);
        enable_capture(2);
        clear_captured_logs();
        for idx in 0..3 {
            crate::log_error!("line {idx}");
        }
        let lines = capture_snapshot(10);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].msg, "line 1");
        assert_eq!(lines[1].msg, "line 2");
        assert_eq!(lines[1].level, Level::Error);
        assert_eq!(capture_snapshot(1)[0].msg, "line 2");
    }

    #[test]
    fn json_line_fields() {
        let line = render_json(42, Level::Info, "t", "f.rs", 7, "hello");
        let value: serde_json::Value = serde_json::from_str(&line).expect("json");
        assert_eq!(value["ts_ms"], 42);
        assert_eq!(value["level"], "INFO");
        assert_eq!(value["line"], 7);
        assert_eq!(value["msg"], "hello");
    }
}
