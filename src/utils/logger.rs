use anyhow::Context;
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LoggerConfig {
    pub level: String,
    pub file_dir: Option<String>,
    pub file_prefix: Option<String>,
    pub rolling: Option<String>,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_max_files() -> usize {
    2
}

impl LoggerConfig {
    /// Reads PARASTREAM_LOG_LEVEL, PARASTREAM_LOG_DIR, PARASTREAM_LOG_PREFIX and
    /// PARASTREAM_LOG_ROLLING; unset variables fall back to the defaults.
    pub fn from_env() -> Self {
        let level = std::env::var("PARASTREAM_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let file_dir = std::env::var("PARASTREAM_LOG_DIR").ok();
        let file_prefix = std::env::var("PARASTREAM_LOG_PREFIX").ok();
        let rolling = std::env::var("PARASTREAM_LOG_ROLLING").ok();

        Self {
            level,
            file_dir,
            file_prefix,
            rolling,
            max_files: default_max_files(),
        }
    }

    /// Installs a global subscriber. Keep the returned guard alive while logging to files.
    pub fn init(&self) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
        let level = Level::from_str(&self.level).unwrap_or(Level::INFO);

        let Some(dir_str) = self.file_dir.as_deref() else {
            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_thread_names(true)
                .try_init();
            tracing::info!("logging to stdout (no file_dir)");
            return Ok(None);
        };

        let prefix = self.file_prefix.as_deref().unwrap_or("parastream");
        let rotation = match self.rolling.as_deref() {
            Some("hourly") => Rotation::HOURLY,
            Some("minutely") => Rotation::MINUTELY,
            Some("never") => Rotation::NEVER,
            _ => Rotation::DAILY,
        };

        let appender: RollingFileAppender = RollingFileAppender::builder()
            .rotation(rotation)
            .max_log_files(self.max_files)
            .filename_prefix(prefix)
            .build(dir_str)
            .with_context(|| format!("failed to create rolling appender in {}", dir_str))?;

        let (nb, guard) = tracing_appender::non_blocking(appender);

        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_thread_names(true)
            .with_writer(nb)
            .try_init();

        tracing::info!(
            "logging to dir: {}, prefix: {}, rotation: {:?}",
            dir_str,
            prefix,
            self.rolling
        );
        Ok(Some(guard))
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_dir: None,
            file_prefix: None,
            rolling: Some("daily".to_string()),
            max_files: default_max_files(),
        }
    }
}

/// Rate limiter for a single log callsite.
///
/// Messages inside `interval` of the last emitted one are suppressed; the next
/// emitted message reports how many were dropped.
///
/// Usage:
///   warn_throttled!(std::time::Duration::from_secs(5), "take buffer full, dropping chunk");
pub struct Throttle {
    last: Mutex<Instant>,
    suppressed: AtomicU64,
    interval: Duration,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        // start in the past so the first message goes through
        let start = Instant::now()
            .checked_sub(interval)
            .unwrap_or_else(Instant::now);
        Self {
            last: Mutex::new(start),
            suppressed: AtomicU64::new(0),
            interval,
        }
    }

    /// `Some(suppressed)` when the caller may emit now.
    #[inline]
    pub fn poll(&self) -> Option<u64> {
        let Some(mut last) = self.last.try_lock() else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if last.elapsed() >= self.interval {
            *last = Instant::now();
            Some(self.suppressed.swap(0, Ordering::Relaxed))
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

#[macro_export]
macro_rules! log_throttled {
    ($level:ident, $interval:expr, $($arg:tt)*) => {{
        static _THROTTLE: std::sync::OnceLock<$crate::Throttle> = std::sync::OnceLock::new();
        let t = _THROTTLE.get_or_init(|| $crate::Throttle::new($interval));
        if let Some(_suppressed) = t.poll() {
            if _suppressed > 0 {
                tracing::$level!(suppressed = _suppressed, $($arg)*);
            } else {
                tracing::$level!($($arg)*);
            }
        }
    }};
}

#[macro_export]
macro_rules! warn_throttled  { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(warn,  $interval, $($arg)*); } }
#[macro_export]
macro_rules! debug_throttled { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(debug, $interval, $($arg)*); } }

#[cfg(test)]
mod tests {
    use super::Throttle;
    use std::time::Duration;

    #[test]
    fn throttle_suppresses_within_interval() {
        let t = Throttle::new(Duration::from_secs(60));
        assert_eq!(t.poll(), Some(0));
        assert_eq!(t.poll(), None);
        assert_eq!(t.poll(), None);
    }

    #[test]
    fn zero_interval_never_suppresses() {
        let t = Throttle::new(Duration::ZERO);
        assert_eq!(t.poll(), Some(0));
        assert_eq!(t.poll(), Some(0));
    }
}
