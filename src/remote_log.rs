//! Remote log forwarding for `tracing` events.
//!
//! [`RemoteLogLayer`] implements [`tracing_subscriber::Layer`] and turns every
//! event at or above its minimum level into one line on a
//! [`ReconnectingClient`]'s outbound queue, so log output reaches a remote
//! log server whenever a connection is up and is buffered while it is not.
//!
//! Events emitted by the transport modules themselves are skipped; logging
//! them would enqueue a new line for every line sent.

use crate::client::ReconnectingClient;
use crate::config::{RemoteLogConfig, RemoteLogFormat};
use crate::message::Message;
use crate::queue::MessageQueue;
use crate::{LinkError, Result};
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const SKIPPED_TARGETS: &[&str] = &["robolink::client", "robolink::connection", "robolink::framing"];

pub struct RemoteLogLayer {
    queue: Arc<MessageQueue<Message>>,
    format: RemoteLogFormat,
    min_level: Level,
    dropped: Arc<AtomicU64>,
}

impl RemoteLogLayer {
    pub fn new(queue: Arc<MessageQueue<Message>>) -> Self {
        Self {
            queue,
            format: RemoteLogFormat::Text,
            min_level: Level::INFO,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn for_client(client: &ReconnectingClient) -> Self {
        Self::new(client.queue())
    }

    /// Build a layer for `client` with format and level taken from `config`.
    pub fn from_config(config: &RemoteLogConfig, client: &ReconnectingClient) -> Result<Self> {
        let mut layer = Self::for_client(client).with_format(config.format);
        if let Some(level) = &config.min_level {
            let level = Level::from_str(level)
                .map_err(|_| LinkError::Config(format!("unknown remote log level: {}", level)))?;
            layer = layer.with_min_level(level);
        }
        Ok(layer)
    }

    pub fn with_format(mut self, format: RemoteLogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }

    /// Counter of events discarded because the queue was full
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    fn render(&self, level: &Level, target: &str, visitor: EventFieldVisitor) -> String {
        let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        match self.format {
            RemoteLogFormat::Text => {
                let mut line = format!("{} {} {}: {}", timestamp, level, target, visitor.message);
                for (name, value) in &visitor.fields {
                    match value {
                        serde_json::Value::String(s) => {
                            let _ = write!(line, " {}={}", name, s);
                        }
                        other => {
                            let _ = write!(line, " {}={}", name, other);
                        }
                    }
                }
                // Keep one event per frame
                line.replace(['\n', '\r'], " ")
            }
            RemoteLogFormat::Json => serde_json::json!({
                "timestamp": timestamp,
                "level": level.as_str(),
                "target": target,
                "message": visitor.message,
                "fields": visitor.fields,
            })
            .to_string(),
        }
    }
}

struct EventFieldVisitor {
    message: String,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl EventFieldVisitor {
    fn new() -> Self {
        Self {
            message: String::new(),
            fields: serde_json::Map::new(),
        }
    }
}

impl Visit for EventFieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.insert(
                field.name().to_string(),
                serde_json::Value::String(format!("{:?}", value)),
            );
        }
    }
}

impl<S> Layer<S> for RemoteLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > self.min_level {
            return;
        }
        let target = metadata.target();
        if SKIPPED_TARGETS.iter().any(|skipped| target.starts_with(skipped)) {
            return;
        }

        let mut visitor = EventFieldVisitor::new();
        event.record(&mut visitor);
        let line = self.render(metadata.level(), target, visitor);

        if self.queue.push(Message::from(line)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
