//! Structured logger capability.
//!
//! Observability only — nothing in the engine branches on logger behavior.
//! Types may select a named logger at configuration time via the registry's
//! logger table; everything else shares [`shared_logger`], which forwards to
//! the process-wide `tracing` subscriber.

use std::sync::Arc;

use once_cell::sync::Lazy;
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// Severity of a structured log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Structured context attached to a log record.
pub type LogContext = serde_json::Map<String, Value>;

pub trait Logger: Send + Sync {
    fn log(&self, severity: Severity, message: &str, ctx: &LogContext);
}

/// Default [`Logger`] forwarding to the `tracing` subscriber.
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, severity: Severity, message: &str, ctx: &LogContext) {
        let ctx = Value::Object(ctx.clone());
        match severity {
            Severity::Debug => debug!(context = %ctx, "{message}"),
            Severity::Info => info!(context = %ctx, "{message}"),
            Severity::Warning => warn!(context = %ctx, "{message}"),
            Severity::Error => error!(context = %ctx, "{message}"),
        }
    }
}

static SHARED: Lazy<Arc<TracingLogger>> = Lazy::new(|| Arc::new(TracingLogger));

/// The process-wide default logger instance.
pub fn shared_logger() -> Arc<dyn Logger> {
    SHARED.clone()
}

/// Build a log context from key/value pairs.
pub fn log_ctx<const N: usize>(pairs: [(&str, Value); N]) -> LogContext {
    let mut ctx = LogContext::new();
    for (key, value) in pairs {
        ctx.insert(key.to_string(), value);
    }
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_ctx_builds_ordered_map() {
        let ctx = log_ctx([("type", json!("widget")), ("count", json!(3))]);
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx["type"], json!("widget"));
    }

    #[test]
    fn shared_logger_accepts_all_severities() {
        let logger = shared_logger();
        let ctx = log_ctx([("op", json!("test"))]);
        for severity in [
            Severity::Debug,
            Severity::Info,
            Severity::Warning,
            Severity::Error,
        ] {
            logger.log(severity, "severity smoke", &ctx);
        }
    }
}
