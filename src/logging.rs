//! Logging and tracing initialization for isoflash.
//!
//! Structured logging uses the `tracing` ecosystem. The minimum severity is a
//! reloadable filter owned by [`LogSink`], so a caller can change it at any
//! time; records below the threshold are dropped, not buffered. Accepted
//! records are also forwarded as [`LogRecord`]s to any subscriber, which is how
//! a front-end shows a log pane.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    filter::LevelFilter,
    fmt::{self as tfmt, format::FmtSpan},
    layer::{Context as LayerContext, SubscriberExt},
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
};

/// Severity levels exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }

    fn directive(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
        }
    }

    fn from_tracing(level: &Level) -> Self {
        match *level {
            Level::ERROR => Self::Error,
            Level::WARN => Self::Warning,
            Level::INFO => Self::Info,
            _ => Self::Debug,
        }
    }

    /// `OFF` maps to the highest severity.
    fn from_filter(filter: LevelFilter) -> Self {
        filter
            .into_level()
            .map(|level| Self::from_tracing(&level))
            .unwrap_or(Self::Error)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "debug" | "trace" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(anyhow!("unknown log level '{}'", other)),
        }
    }
}

/// A single accepted log event.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
    pub target: String,
    pub message: String,
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.level, self.message)
    }
}

/// Configuration for the logging system.
pub struct LogConfig {
    /// Output logs as JSON (for machine parsing)
    pub json: bool,
    /// Initial minimum severity
    pub level: LogLevel,
    /// Write formatted records to stderr
    pub console: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            json: false,
            level: LogLevel::Info,
            console: true,
        }
    }
}

const RECORD_CHANNEL_CAPACITY: usize = 256;

/// Handle to the process-wide log threshold and record stream.
#[derive(Clone)]
pub struct LogSink {
    filter: reload::Handle<EnvFilter, Registry>,
    level: Arc<RwLock<LogLevel>>,
    records: broadcast::Sender<LogRecord>,
}

fn filter_for(level: LogLevel) -> EnvFilter {
    EnvFilter::new(format!("isoflash={}", level.directive()))
}

impl LogSink {
    /// Build a subscriber and its sink without installing it globally.
    pub fn build(config: &LogConfig) -> (impl Subscriber + Send + Sync + 'static, LogSink) {
        Self::build_with(config, filter_for(config.level), config.level)
    }

    fn build_with(
        config: &LogConfig,
        initial: EnvFilter,
        level: LogLevel,
    ) -> (impl Subscriber + Send + Sync + 'static, LogSink) {
        let (filter, handle) = reload::Layer::new(initial);
        let (records, _) = broadcast::channel(RECORD_CHANNEL_CAPACITY);

        let console = if !config.console {
            None
        } else if config.json {
            // JSON output for structured logging / log aggregation
            Some(
                tfmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .boxed(),
            )
        } else {
            // Pretty console output for human readability
            Some(
                tfmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_writer(std::io::stderr)
                    .boxed(),
            )
        };

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(RecordLayer {
                tx: records.clone(),
            })
            .with(console);

        let sink = LogSink {
            filter: handle,
            level: Arc::new(RwLock::new(level)),
            records,
        };
        (subscriber, sink)
    }

    /// Current threshold.
    pub fn level(&self) -> LogLevel {
        *self.level.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Change the threshold. Applies to records emitted after the call.
    pub fn set_log_level(&self, level: LogLevel) -> Result<()> {
        self.filter
            .reload(filter_for(level))
            .context("Failed to update log level")?;
        *self.level.write().unwrap_or_else(|e| e.into_inner()) = level;
        Ok(())
    }

    /// Receive every record accepted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.records.subscribe()
    }
}

/// Initialize the global tracing subscriber with the given configuration.
///
/// This should be called early in main(), after config is loaded.
/// The initial level can be overridden via the `RUST_LOG` environment variable.
///
/// # Examples
///
/// ```ignore
/// let sink = isoflash::logging::init(LogConfig::default())?;
/// sink.set_log_level(LogLevel::Debug)?;
/// ```
pub fn init(config: LogConfig) -> Result<LogSink> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let (initial, level) = initial_filter(env.as_deref(), config.level);
    let (subscriber, sink) = LogSink::build_with(&config, initial, level);
    subscriber
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(sink)
}

/// Valid `RUST_LOG` directives win over the configured level. The reported
/// level is the most verbose one the directives enable.
fn initial_filter(directives: Option<&str>, configured: LogLevel) -> (EnvFilter, LogLevel) {
    let from_env = directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok());

    match from_env {
        Some(filter) => {
            let level = filter
                .max_level_hint()
                .map(LogLevel::from_filter)
                .unwrap_or(configured);
            (filter, level)
        }
        None => (filter_for(configured), configured),
    }
}

/// Forwards accepted events to the record channel.
struct RecordLayer {
    tx: broadcast::Sender<LogRecord>,
}

impl<S> Layer<S> for RecordLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        if self.tx.receiver_count() == 0 {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let metadata = event.metadata();
        let _ = self.tx.send(LogRecord {
            level: LogLevel::from_tracing(metadata.level()),
            timestamp: Utc::now(),
            target: metadata.target().to_string(),
            message: visitor.finish(),
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

/// A rate limiter for throttling log messages.
///
/// Useful for progress updates that would otherwise spam the logs.
///
/// # Example
///
/// ```ignore
/// let throttle = LogThrottle::new(Duration::from_millis(500));
///
/// loop {
///     if throttle.should_log() {
///         tracing::debug!(bytes = written, "dd progress");
///     }
/// }
/// ```
pub struct LogThrottle {
    interval_ms: u64,
    /// Stores the last log time in ms, or u64::MAX to indicate "never logged"
    last_log_ms: AtomicU64,
    start: Instant,
}

/// Sentinel value indicating the throttle has never logged
const NEVER_LOGGED: u64 = u64::MAX;

impl LogThrottle {
    /// Create a new throttle with the given minimum interval between logs.
    pub fn new(interval: std::time::Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_log_ms: AtomicU64::new(NEVER_LOGGED),
            start: Instant::now(),
        }
    }

    /// Returns true if enough time has passed since the last log.
    pub fn should_log(&self) -> bool {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_log_ms.load(Ordering::Relaxed);

        let should = last == NEVER_LOGGED || now_ms.saturating_sub(last) >= self.interval_ms;

        if should {
            // Try to update; if we lose the race, another thread logged
            self.last_log_ms
                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quiet(level: LogLevel) -> LogConfig {
        LogConfig {
            json: false,
            level,
            console: false,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<LogRecord>) -> Vec<LogRecord> {
        let mut out = Vec::new();
        while let Ok(record) = rx.try_recv() {
            out.push(record);
        }
        out
    }

    #[test]
    fn level_parses_common_spellings() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!("Debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("loud".parse::<LogLevel>().is_err());
        assert!(LogLevel::Debug < LogLevel::Error);
    }

    #[test]
    fn records_below_threshold_are_dropped() {
        let (subscriber, sink) = LogSink::build(&quiet(LogLevel::Warning));
        let mut rx = sink.subscribe();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("routine detail");
            tracing::warn!(device = "/dev/sdb", "device looks busy");
        });

        let records = drain(&mut rx);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, LogLevel::Warning);
        assert!(records[0].message.contains("device looks busy"));
        assert!(records[0].message.contains("device=/dev/sdb"));
    }

    #[test]
    fn threshold_change_applies_to_later_records_only() {
        let (subscriber, sink) = LogSink::build(&quiet(LogLevel::Error));
        let mut rx = sink.subscribe();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("before change");
            sink.set_log_level(LogLevel::Debug).unwrap();
            tracing::debug!("after change");
        });

        let messages: Vec<_> = drain(&mut rx).into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["after change".to_string()]);
        assert_eq!(sink.level(), LogLevel::Debug);
    }

    #[test]
    fn env_directives_decide_the_reported_level() {
        let (_, level) = initial_filter(Some("isoflash=debug"), LogLevel::Warning);
        assert_eq!(level, LogLevel::Debug);

        let (_, level) = initial_filter(Some("error"), LogLevel::Info);
        assert_eq!(level, LogLevel::Error);

        let (_, level) = initial_filter(Some("   "), LogLevel::Info);
        assert_eq!(level, LogLevel::Info);

        let (_, level) = initial_filter(None, LogLevel::Warning);
        assert_eq!(level, LogLevel::Warning);
    }

    #[test]
    fn console_layers_build_in_both_formats() {
        for json in [false, true] {
            let config = LogConfig {
                json,
                level: LogLevel::Info,
                console: true,
            };
            let (subscriber, sink) = LogSink::build(&config);
            let mut rx = sink.subscribe();
            tracing::subscriber::with_default(subscriber, || {
                tracing::info!(json, "console output");
            });
            assert_eq!(drain(&mut rx).len(), 1);
        }
    }

    #[test]
    fn throttle_allows_first_log() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
    }

    #[test]
    fn throttle_blocks_immediate_second_log() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
    }
}
