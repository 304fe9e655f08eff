//! Structured logging for the server core.
//!
//! Log records carry a level, a target and a message, and are written to
//! stderr either as JSON lines (production) or compact text. The logger is
//! process-global and installed once; before installation, records at Info
//! and above fall through to a compact default so lifecycle warnings are
//! never silently lost.

use std::fmt;
use std::io::Write;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Most verbose.
    Trace = 0,
    /// Debugging detail.
    Debug = 1,
    /// Normal operation.
    Info = 2,
    /// Unexpected but recoverable.
    Warn = 3,
    /// A failure that affected processing.
    Error = 4,
}

impl LogLevel {
    /// Lowercase level name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logger configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum level to emit.
    pub level: LogLevel,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
    /// Include the target in compact output.
    pub include_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json: false,
            include_target: true,
        }
    }
}

impl LogConfig {
    /// Create a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum level.
    #[must_use]
    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Enable or disable JSON output.
    #[must_use]
    pub fn json_output(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

static LOGGER: OnceLock<LogConfig> = OnceLock::new();

/// Install the global logger configuration. First call wins.
pub fn init(config: LogConfig) {
    let _ = LOGGER.set(config);
}

fn config() -> LogConfig {
    LOGGER.get().cloned().unwrap_or_default()
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Emit a record at the given level.
pub fn log(level: LogLevel, target: &str, message: &str) {
    let cfg = config();
    if level < cfg.level {
        return;
    }
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    if cfg.json {
        let record = serde_json::json!({
            "ts": unix_millis(),
            "level": level.as_str(),
            "target": target,
            "message": message,
        });
        let _ = writeln!(out, "{record}");
    } else if cfg.include_target {
        let _ = writeln!(out, "[{level}] {target}: {message}");
    } else {
        let _ = writeln!(out, "[{level}] {message}");
    }
}

/// Emit at `Debug`.
pub fn debug(target: &str, message: &str) {
    log(LogLevel::Debug, target, message);
}

/// Emit at `Info`.
pub fn info(target: &str, message: &str) {
    log(LogLevel::Info, target, message);
}

/// Emit at `Warn`.
pub fn warn(target: &str, message: &str) {
    log(LogLevel::Warn, target, message);
}

/// Emit at `Error`.
pub fn error(target: &str, message: &str) {
    log(LogLevel::Error, target, message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert_eq!(LogLevel::Warn.as_str(), "warn");
    }

    #[test]
    fn default_config_is_info_text() {
        let cfg = LogConfig::default();
        assert_eq!(cfg.level, LogLevel::Info);
        assert!(!cfg.json);
    }

    #[test]
    fn builder_sets_fields() {
        let cfg = LogConfig::new().level(LogLevel::Debug).json_output(true);
        assert_eq!(cfg.level, LogLevel::Debug);
        assert!(cfg.json);
    }
}
