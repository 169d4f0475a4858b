use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{Level, Subscriber};
use tracing_subscriber::{Layer, layer::Context};

/// One captured log event.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedEvent {
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: HashMap<String, serde_json::Value>,
}

/// Shared, cloneable buffer of captured events.
#[derive(Debug, Clone, Default)]
pub struct CapturedEvents {
    events: Arc<RwLock<Vec<CapturedEvent>>>,
}

impl CapturedEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event captured so far.
    pub fn all(&self) -> Vec<CapturedEvent> {
        self.events.read().map(|events| events.clone()).unwrap_or_default()
    }

    /// Events at exactly `level`.
    pub fn at_level(&self, level: Level) -> Vec<CapturedEvent> {
        let level = level.to_string();
        self.all().into_iter().filter(|e| e.level == level).collect()
    }

    /// Whether any event's message contains `needle`.
    pub fn contains_message(&self, needle: &str) -> bool {
        self.all().iter().any(|e| e.message.contains(needle))
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.write() {
            events.clear();
        }
    }

    fn push(&self, event: CapturedEvent) {
        if let Ok(mut events) = self.events.write() {
            events.push(event);
        }
    }
}

/// A tracing layer that appends every event to a [`CapturedEvents`] buffer.
pub struct CaptureLayer {
    events: CapturedEvents,
}

impl CaptureLayer {
    pub fn new(events: CapturedEvents) -> Self {
        Self { events }
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: HashMap<String, serde_json::Value>,
}

impl tracing::field::Visit for JsonVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.fields.insert(field.name().to_string(), serde_json::Value::String(rendered));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::String(value.to_string()));
        }
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), serde_json::Value::Bool(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), serde_json::json!(value));
    }
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();
        self.events.push(CapturedEvent {
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
        });
    }
}
