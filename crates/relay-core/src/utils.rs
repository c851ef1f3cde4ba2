use std::{
    fs::OpenOptions,
    io::Write,
    path::PathBuf,
    sync::Mutex,
};

use chrono::Utc;
use serde::Serialize;

use crate::{domain::UserId, errors::Error, Result};

// ============== Timestamp Helpers ==============

/// RFC3339 timestamp in UTC (for logs/telemetry).
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

pub fn truncate_text(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out = s.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}

// ============== Audit Logging ==============

const AUDIT_MAX_TEXT: usize = 500;

#[derive(Clone, Debug, Default, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorized: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
}

impl AuditEvent {
    fn base(event: &str, user_id: UserId, username: &str) -> Self {
        Self {
            timestamp: iso_timestamp_utc(),
            event: event.to_string(),
            user_id: Some(user_id.0),
            username: Some(username.to_string()),
            ..Self::default()
        }
    }

    pub fn message(
        user_id: UserId,
        username: &str,
        persona: &str,
        content: &str,
        response: &str,
    ) -> Self {
        Self {
            persona: Some(persona.to_string()),
            content: Some(content.to_string()),
            response: Some(response.to_string()),
            ..Self::base("message", user_id, username)
        }
    }

    pub fn auth(user_id: UserId, username: &str, authorized: bool) -> Self {
        Self {
            authorized: Some(authorized),
            ..Self::base("auth", user_id, username)
        }
    }

    pub fn reset(user_id: UserId, username: &str) -> Self {
        Self::base("reset", user_id, username)
    }

    pub fn error(user_id: UserId, username: &str, error: &str, attempts: Option<u32>) -> Self {
        Self {
            error: Some(error.to_string()),
            attempts,
            ..Self::base("error", user_id, username)
        }
    }

    pub fn rate_limit(user_id: UserId, username: &str, retry_after: f64) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..Self::base("rate_limit", user_id, username)
        }
    }
}

/// Append-only audit trail (JSON lines or a human-readable block format).
#[derive(Debug)]
pub struct AuditLogger {
    path: Option<PathBuf>,
    json: bool,
    // Serializes writers so concurrent events never interleave within a line.
    write_lock: Mutex<()>,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>, json: bool) -> Self {
        Self {
            path: Some(path.into()),
            json,
            write_lock: Mutex::new(()),
        }
    }

    /// Logger that drops every event.
    pub fn disabled() -> Self {
        Self {
            path: None,
            json: false,
            write_lock: Mutex::new(()),
        }
    }

    pub fn write(&self, mut event: AuditEvent) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(s) = &event.content {
            event.content = Some(truncate_text(s, AUDIT_MAX_TEXT));
        }
        if let Some(s) = &event.response {
            event.response = Some(truncate_text(s, AUDIT_MAX_TEXT));
        }

        let rendered = if self.json {
            let mut line = serde_json::to_string(&event)?;
            line.push('\n');
            line
        } else {
            render_plain(&event)?
        };

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::External("audit log lock poisoned".to_string()))?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(rendered.as_bytes())?;
        Ok(())
    }

    /// Write and log (never propagate) failures; audit must not break message handling.
    pub fn record(&self, event: AuditEvent) {
        let name = event.event.clone();
        if let Err(e) = self.write(event) {
            tracing::warn!(event = %name, error = %e, "failed to write audit event");
        }
    }
}

fn render_plain(event: &AuditEvent) -> Result<String> {
    let mut out = String::new();
    out.push('\n');
    out.push_str(&"=".repeat(60));

    let value = serde_json::to_value(event)?;
    let Some(obj) = value.as_object() else {
        return Err(Error::External(
            "audit event is not a JSON object".to_string(),
        ));
    };
    for (k, v) in obj {
        out.push('\n');
        out.push_str(k);
        out.push_str(": ");
        out.push_str(&json_value_to_display(v));
    }
    out.push('\n');
    Ok(out)
}

fn json_value_to_display(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "<unprintable>".to_string()),
    }
}
