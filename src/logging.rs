//! # Structured Logging
//!
//! Environment-aware console logging using the tracing ecosystem.
//!
//! - `RUST_LOG` (or `LOG_LEVEL`) overrides the filter; otherwise the level is
//!   derived from `COORD_ENV` (test/development ⇒ debug, production ⇒ info)
//! - `COORD_LOG_FORMAT=json` switches the console layer to JSON lines
//! - ANSI colors only when stdout is a TTY
//!
//! Initialization is idempotent and never panics when the host application
//! already installed a global subscriber.

use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Output format for the console layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);
        let format = get_log_format();
        let use_ansi = IsTerminal::is_terminal(&std::io::stdout());

        let console_layer = (format == LogFormat::Pretty).then(|| {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(use_ansi)
                .with_filter(EnvFilter::new(&log_level))
        });

        let json_layer = (format == LogFormat::Json).then(|| {
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_current_span(true)
                .with_filter(EnvFilter::new(&log_level))
        });

        let subscriber = tracing_subscriber::registry()
            .with(console_layer)
            .with(json_layer);

        if subscriber.try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        } else {
            tracing::info!(
                environment = %environment,
                log_level = %log_level,
                format = ?format,
                ansi_colors = use_ansi,
                "🔧 Coordination logging initialized"
            );
        }
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("COORD_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level from `LOG_LEVEL`/`RUST_LOG`, or from the environment default
fn get_log_level(environment: &str) -> String {
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        return level.to_lowercase();
    }

    if let Ok(level) = std::env::var("RUST_LOG") {
        return level;
    }

    default_level_for(environment).to_string()
}

fn default_level_for(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

fn get_log_format() -> LogFormat {
    parse_log_format(std::env::var("COORD_LOG_FORMAT").ok().as_deref())
}

fn parse_log_format(value: Option<&str>) -> LogFormat {
    match value {
        Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

/// Log a lock acquisition/release decision
pub fn log_lock_operation(operation: &str, lock_name: &str, lock_key: i64, outcome: &str) {
    tracing::debug!(
        operation = %operation,
        lock_name = %lock_name,
        lock_key = lock_key,
        outcome = %outcome,
        "🔒 LOCK_OPERATION"
    );
}

/// Log a failed or panicked user handler with its component context
pub fn log_handler_failure(component: &str, name: &str, error: &dyn std::error::Error) {
    tracing::error!(
        component = %component,
        handler = %name,
        error = %error,
        timestamp = %chrono::Utc::now().to_rfc3339(),
        "❌ HANDLER_FAILURE"
    );
}
