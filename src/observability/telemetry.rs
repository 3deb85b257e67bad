//! Telemetry & Observability
//!
//! Structured logging for synchronization activity:
//! - Mutation spans with timing and outcome
//! - Channel state transition logging
//! - Configurable log levels via RUST_LOG or the `[logging]` config section
//! - Sanitizing of untrusted text (server bodies, notification frames)

use regex::Regex;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{info, info_span, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Sanitize a string for safe log output by escaping control characters.
/// Prevents log injection where a peer embeds newlines to forge log entries.
pub fn sanitize_for_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x1b' => out.push_str("\\e"),
            '\x00' => out.push_str("\\0"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}

static SECRET_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

fn secret_patterns() -> &'static Vec<Regex> {
    SECRET_PATTERNS.get_or_init(|| {
        vec![
            // Bearer tokens in Authorization headers
            Regex::new(r"(?i)Bearer\s+[A-Za-z0-9_\-\.]{8,}").expect("invalid bearer regex"),
            // Token-style query parameters in URLs
            Regex::new(r"(?i)(token|key|secret)=[^&\s]+").expect("invalid query secret regex"),
        ]
    })
}

/// Redact credentials from a string before logging.
pub fn redact_secrets(input: &str) -> String {
    let mut result = input.to_string();
    for pattern in secret_patterns() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }
    result
}

/// Initialize global tracing subscriber.
/// Only enables tracing if RUST_LOG is explicitly set.
pub fn init_tracing() {
    if let Ok(filter) = std::env::var("RUST_LOG") {
        init_tracing_with_filter(&filter, false);
    }
}

/// Initialize with a custom filter string, compact or JSON output.
pub fn init_tracing_with_filter(filter: &str, json: bool) {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter_layer = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));
        let registry = tracing_subscriber::registry().with(filter_layer);

        let result = if json {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .try_init()
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_level(true)
                        .compact()
                        .with_writer(std::io::stderr),
                )
                .try_init()
        };
        let _ = result;
    });
}

/// Run a mutation round-trip inside a span that records duration and outcome.
pub async fn track_mutation<F, Fut, T, E>(resource: &str, kind: &str, f: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let span = info_span!(
        "mutation",
        resource = resource,
        kind = kind,
        duration_ms = tracing::field::Empty,
        success = tracing::field::Empty,
    );

    let result = f().await;
    let duration = start.elapsed().as_millis() as u64;
    span.record("duration_ms", duration);
    let _enter = span.enter();
    match &result {
        Ok(_) => {
            span.record("success", true);
            info!(duration_ms = duration, "Mutation confirmed");
        }
        Err(e) => {
            let safe_err = redact_secrets(&sanitize_for_log(&e.to_string()));
            span.record("success", false);
            warn!(duration_ms = duration, error = safe_err.as_str(), "Mutation rolled back");
        }
    }
    result
}

/// Record a connection state transition.
pub fn record_state_transition(scope: &str, from: &str, to: &str) {
    info!(scope = scope, from = from, to = to, "Channel state transition");
}

/// Initialize tracing for tests with a simple subscriber
#[cfg(test)]
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
