//! # Structured Logging Module
//!
//! Environment-aware structured logging for orchestration operations. Console
//! output is human readable by default and switches to JSON lines when
//! `LoggingConfig::json` is set.

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

use crate::config::loader::ENVIRONMENT_VAR;
use crate::config::LoggingConfig;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-derived defaults
pub fn init_structured_logging() {
    init_structured_logging_with(&LoggingConfig::default());
}

/// Initialize structured logging from configuration.
///
/// `RUST_LOG` wins over `config.level`, which wins over the environment
/// default. Safe to call more than once; only the first call installs a
/// subscriber.
pub fn init_structured_logging_with(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let default_level = config
            .level
            .clone()
            .unwrap_or_else(|| get_log_level(&environment).to_string());
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_level));

        let console = if config.json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // Another subscriber (test harness, host application) may already be set
        if tracing_subscriber::registry().with(console).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json = config.json,
            "Structured logging initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Log structured data for process operations
pub fn log_process_operation(
    operation: &str,
    process_id: Uuid,
    process_name: Option<&str>,
    status: &str,
    operator: Option<&str>,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        process_id = %process_id,
        process_name = process_name,
        status = %status,
        operator = operator,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "PROCESS_OPERATION"
    );
}

/// Log structured data for node operations
pub fn log_node_operation(
    operation: &str,
    process_id: Uuid,
    node_id: Uuid,
    node_name: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        process_id = %process_id,
        node_id = %node_id,
        node_name = node_name,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "NODE_OPERATION"
    );
}

/// Log structured data for task operations
pub fn log_task_operation(
    operation: &str,
    process_id: Uuid,
    task_id: Uuid,
    operator: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        process_id = %process_id,
        task_id = %task_id,
        operator = operator,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "TASK_OPERATION"
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
        "ERROR"
    );
}
