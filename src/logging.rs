//! # Structured Logging Module
//!
//! Environment-aware structured logging to the console and, when a log
//! directory is configured, to a JSON file per process.
//!
//! `RUST_LOG` wins over the configured level. Chatty AMQP internals are
//! capped at `warn` unless `RUST_LOG` says otherwise.

use std::fs;
use std::path::Path;
use std::process;
use std::sync::OnceLock;

use chrono::Utc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::error::{RelayError, Result};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

const QUIET_DEPENDENCIES: &str = "lapin=warn,amq_protocol=warn,pinky_swear=warn";

/// Flushes the JSON log file when dropped; hold it for the life of the process
#[derive(Debug, Default)]
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Initialize structured logging. Later calls return an empty guard.
pub fn init_structured_logging(config: &LoggingConfig) -> Result<LoggingGuard> {
    if LOGGER_INITIALIZED.set(()).is_err() {
        return Ok(LoggingGuard::default());
    }

    let environment = get_environment();
    let directive = filter_directive(&config.level);

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_ansi(config.ansi)
        .with_filter(build_filter(&directive)?);

    let (file_layer, guard, log_path) = match &config.directory {
        Some(log_dir) => {
            let file_name = log_file_name(&environment);
            let (writer, guard) = file_writer(log_dir, &file_name)?;
            let layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .with_filter(build_filter(&directive)?);
            (Some(layer), Some(guard), Some(log_dir.join(file_name)))
        }
        None => (None, None, None),
    };

    // Another subscriber may already be installed (tests, embedding host)
    if tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
    }

    tracing::info!(
        pid = process::id(),
        environment = %environment,
        log_file = ?log_path,
        "Structured logging initialized"
    );

    Ok(LoggingGuard { _file: guard })
}

fn file_writer(
    log_dir: &Path,
    file_name: &str,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    fs::create_dir_all(log_dir).map_err(|e| {
        RelayError::logging(format!(
            "failed to create log directory {}: {e}",
            log_dir.display()
        ))
    })?;
    let appender = tracing_appender::rolling::never(log_dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

fn build_filter(directive: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(directive)
            .map_err(|e| RelayError::logging(format!("invalid log filter {directive:?}: {e}"))),
    }
}

fn filter_directive(level: &str) -> String {
    format!("{level},{QUIET_DEPENDENCIES}")
}

fn log_file_name(environment: &str) -> String {
    format!(
        "{}.{}.{}.log",
        environment,
        process::id(),
        Utc::now().format("%Y%m%d_%H%M%S")
    )
}

/// Get current environment from environment variables
fn get_environment() -> String {
    environment_from(|key| std::env::var(key).ok())
}

fn environment_from(lookup: impl Fn(&str) -> Option<String>) -> String {
    lookup("RELAY_ENV")
        .or_else(|| lookup("APP_ENV"))
        .unwrap_or_else(|| "development".to_string())
}

/// Log structured data for queue operations
pub fn log_queue_operation(
    operation: &str,
    queue_name: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        queue_name = queue_name,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📨 QUEUE_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
