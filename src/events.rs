use std::io::{self, Write};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber. An explicit level wins over `RUST_LOG`;
/// an unparsable filter falls back to `info`.
pub fn init_logging(log_level: Option<&str>) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(log_filter(log_level))
        .with_target(true)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
}

fn log_filter(log_level: Option<&str>) -> EnvFilter {
    match log_level {
        Some(level) => EnvFilter::try_new(level).ok(),
        None => EnvFilter::try_from_default_env().ok(),
    }
    .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Emits machine-readable lifecycle lines on stderr when enabled.
#[derive(Clone, Debug, Default)]
pub struct EventEmitter {
    json_output: bool,
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }

    pub fn is_enabled(&self) -> bool {
        self.json_output
    }

    pub fn emit<T: Serialize>(&self, event_type: &str, payload: T) {
        if !self.json_output {
            return;
        }

        let line = event_line(event_type, payload);
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{}", line);
    }
}

fn event_line<T: Serialize>(event_type: &str, payload: T) -> serde_json::Value {
    json!({
        "ts": Utc::now().to_rfc3339(),
        "type": event_type,
        "payload": payload,
    })
}
