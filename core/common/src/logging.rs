// core/common/src/logging.rs
// Structured JSON logging

use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};
use uuid::Uuid;

/// Initialize structured logging for a service
pub fn init_logging(service_name: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true),
        )
        .try_init();

    if result.is_ok() {
        info!(service = service_name, "Logging initialized");
    }
}

/// Initialize simple console logging (for development)
pub fn init_console_logging(service_name: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().pretty().with_target(true))
        .try_init();

    if result.is_ok() {
        info!(service = service_name, "Console logging initialized");
    }
}

/// Correlation ID attached to a sweep or a monitor session
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Redact values that look like secrets before they reach a log line.
pub fn sanitize_for_logging(input: &str) -> String {
    let lower = input.to_lowercase();
    if lower.contains("private") || lower.contains("password") || lower.contains("secret") {
        "[REDACTED]".to_string()
    } else if input.chars().count() > 100 {
        let prefix: String = input.chars().take(20).collect();
        format!("{}...[REDACTED]", prefix)
    } else {
        input.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_request_id() {
        let id1 = generate_request_id();
        let id2 = generate_request_id();

        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 36);
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging("coinwatch-test");
        init_console_logging("coinwatch-test");
    }

    #[test]
    fn test_sanitize_for_logging_long() {
        let input = "a".repeat(200);
        let sanitized = sanitize_for_logging(&input);
        assert!(sanitized.ends_with("[REDACTED]"));
        assert!(sanitized.len() < input.len());
    }

    #[test]
    fn test_sanitize_for_logging_sensitive() {
        for input in ["my_private_key_here", "Password123", "secret_token"] {
            assert_eq!(sanitize_for_logging(input), "[REDACTED]");
        }
    }

    #[test]
    fn test_sanitize_for_logging_normal() {
        assert_eq!(
            sanitize_for_logging("LQTpS3VaYTjCr4s9Y1t5zbeY26zevf7Fb3"),
            "LQTpS3VaYTjCr4s9Y1t5zbeY26zevf7Fb3"
        );
    }
}
