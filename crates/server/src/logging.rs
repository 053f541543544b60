//! Structured logging to `<log_dir>/arbor.log`.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";
const LOG_FILE: &str = "arbor.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// Anything other than `pretty` (any case) is JSON.
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        }
    }
}

/// Logging knobs read from the environment:
/// `ARBOR_LOG_FILTER` > `RUST_LOG` > default filter, `ARBOR_LOG_FORMAT`,
/// `ARBOR_TRUNCATE_LOG_ON_START=1` and `ARBOR_RUN_ID`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub filter: String,
    pub format: LogFormat,
    pub truncate: bool,
    pub run_id: String,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let filter = non_empty("ARBOR_LOG_FILTER")
            .filter(|v| EnvFilter::try_new(v).is_ok())
            .or_else(|| non_empty("RUST_LOG").filter(|v| EnvFilter::try_new(v).is_ok()))
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());

        Self {
            filter,
            format: LogFormat::parse(lookup("ARBOR_LOG_FORMAT").as_deref()),
            truncate: lookup("ARBOR_TRUNCATE_LOG_ON_START").as_deref() == Some("1"),
            run_id: non_empty("ARBOR_RUN_ID").unwrap_or_else(generated_run_id),
        }
    }
}

fn generated_run_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("pid-{}-{}", std::process::id(), now)
}

pub struct LoggingHandle {
    pub run_id: String,
    /// Flushes the file writer on drop; keep alive for the process lifetime.
    pub guard: WorkerGuard,
}

pub fn init_logging(log_dir: &Path) -> anyhow::Result<LoggingHandle> {
    init_with(log_dir, LogSettings::from_env())
}

pub fn init_with(log_dir: &Path, settings: LogSettings) -> anyhow::Result<LoggingHandle> {
    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE);
    if settings.truncate {
        std::fs::File::create(&log_path)?;
    }

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, LOG_FILE));
    let registry = tracing_subscriber::registry().with(EnvFilter::try_new(&settings.filter)?);
    let layer = fmt::layer()
        .with_writer(writer)
        .with_file(true)
        .with_line_number(true)
        .with_target(true);

    match settings.format {
        LogFormat::Pretty => registry.with(layer.with_ansi(false).pretty()).try_init()?,
        LogFormat::Json => registry
            .with(layer.json().flatten_event(true).with_current_span(true))
            .try_init()?,
    }

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_path = %log_path.display(),
        format = settings.format.as_str(),
        filter = %settings.filter,
        run_id = %settings.run_id,
    );

    Ok(LoggingHandle {
        run_id: settings.run_id,
        guard,
    })
}
