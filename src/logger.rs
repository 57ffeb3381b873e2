use std::fmt::Display;

use serde_json::{Map, Value as JsonValue, json};

use crate::event_log;

/// Structured logger bound to a set of context fields. Cloning is cheap
/// enough for the call rates involved; every emitted record lands in the
/// JSONL event log (when enabled) and warn/error additionally go to the
/// process stderr.
#[derive(Debug, Clone, Default)]
pub struct Logger {
    fields: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

impl Logger {
    pub fn global() -> Self {
        Self::default()
    }

    pub fn with(&self, key: &str, value: impl Into<JsonValue>) -> Self {
        let mut fields = self.fields.clone();
        fields.insert(key.to_string(), value.into());
        Self { fields }
    }

    pub fn with_error(&self, err: &impl Display) -> Self {
        self.with("error", err.to_string())
    }

    pub fn debug(&self, message: &str) {
        self.emit(Level::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.emit(Level::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.emit(Level::Warn, message);
        eprintln!("[mcp-engine][warn] {}", self.render(message));
    }

    pub fn error(&self, message: &str) {
        self.emit(Level::Error, message);
        eprintln!("[mcp-engine][error] {}", self.render(message));
    }

    fn emit(&self, level: Level, message: &str) {
        event_log::log(
            "log",
            json!({
                "level": level.as_str(),
                "message": message,
                "fields": JsonValue::Object(self.fields.clone()),
            }),
        );
    }

    fn render(&self, message: &str) -> String {
        if self.fields.is_empty() {
            return message.to_string();
        }
        let mut out = String::from(message);
        for (key, value) in &self.fields {
            out.push(' ');
            out.push_str(key);
            out.push('=');
            match value {
                JsonValue::String(text) => out.push_str(text),
                other => out.push_str(&other.to_string()),
            }
        }
        out
    }
}
