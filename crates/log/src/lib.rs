//! Leveled logging with plain-text and JSON line output.
//!
//! The backend is process-global so the `log_*!` macros can be used from
//! any crate without threading a handle around. Records go to stderr,
//! one line each.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
}

impl Level {
    const fn rank(self) -> u8 {
        match self {
            Self::Error => 0,
            Self::Warn => 1,
            Self::Info => 2,
            Self::Debug => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseError;

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized logging option")
    }
}

impl std::error::Error for ParseError {}

impl FromStr for Level {
    type Err = ParseError;

    fn from_str(raw: &str) -> Result<Self, ParseError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            _ => Err(ParseError),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl FromStr for LogFormat {
    type Err = ParseError;

    fn from_str(raw: &str) -> Result<Self, ParseError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "plain" | "text" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            _ => Err(ParseError),
        }
    }
}

static MAX_RANK: AtomicU8 = AtomicU8::new(Level::Info.rank());
static JSON_OUTPUT: AtomicBool = AtomicBool::new(false);

pub fn init(level: Level, format: LogFormat) {
    MAX_RANK.store(level.rank(), Ordering::Relaxed);
    JSON_OUTPUT.store(format == LogFormat::Json, Ordering::Relaxed);
}

pub fn level_enabled(level: Level) -> bool {
    level.rank() <= MAX_RANK.load(Ordering::Relaxed)
}

/// Write one record. Prefer the `log_*!` macros, which fill in the module
/// path and skip formatting entirely for disabled levels.
pub fn write_record(level: Level, module: &'static str, args: fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let line = if JSON_OUTPUT.load(Ordering::Relaxed) {
        let ts_ms = u64::try_from(now.as_millis()).unwrap_or(u64::MAX);
        json!({
            "ts": ts_ms,
            "level": level.name(),
            "module": module,
            "msg": args.to_string(),
        })
        .to_string()
    } else {
        format!(
            "{}.{:03} [{}] {}: {}",
            now.as_secs(),
            now.subsec_millis(),
            level.name(),
            module,
            args
        )
    };

    let mut out = io::stderr().lock();
    let _ = writeln!(out, "{line}");
}

#[macro_export]
macro_rules! log_record {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::level_enabled($level) {
            $crate::write_record($level, module_path!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::log_record!($crate::Level::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log_record!($crate::Level::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log_record!($crate::Level::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log_record!($crate::Level::Debug, $($arg)*);
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_levels() {
        assert_eq!("info".parse(), Ok(Level::Info));
        assert_eq!("WARN".parse(), Ok(Level::Warn));
        assert_eq!("warning".parse(), Ok(Level::Warn));
        assert_eq!(" debug ".parse(), Ok(Level::Debug));
        assert_eq!("nope".parse::<Level>(), Err(ParseError));
    }

    #[test]
    fn parse_formats() {
        assert_eq!("plain".parse(), Ok(LogFormat::Plain));
        assert_eq!("text".parse(), Ok(LogFormat::Plain));
        assert_eq!("JSON".parse(), Ok(LogFormat::Json));
        assert_eq!("yaml".parse::<LogFormat>(), Err(ParseError));
    }

    #[test]
    fn severity_ranks_are_ordered() {
        assert!(Level::Error.rank() < Level::Warn.rank());
        assert!(Level::Warn.rank() < Level::Info.rank());
        assert!(Level::Info.rank() < Level::Debug.rank());
    }

    #[test]
    fn threshold_gates_lower_severities() {
        init(Level::Info, LogFormat::Plain);
        assert!(level_enabled(Level::Error));
        assert!(level_enabled(Level::Info));
        assert!(!level_enabled(Level::Debug));
    }
}
