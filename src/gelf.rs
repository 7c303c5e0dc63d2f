//! GELF log forwarding
//!
//! A `tracing` layer that turns every event into a GELF 1.1 message and hands
//! it to a background task, which POSTs it to a Graylog HTTPS input with basic
//! auth. Forwarding never blocks the caller; delivery failures go to stderr.
//! The queue is bounded: while Graylog is unreachable, messages beyond
//! [`QUEUE_CAPACITY`] are dropped and counted.

use certfleet_config::GelfConfig;
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Targets whose events are never forwarded (the forwarder's own HTTP stack)
const IGNORED_TARGETS: &[&str] = &["reqwest", "hyper", "h2", "rustls", "tokio_util"];

/// Messages waiting for delivery before new ones are dropped
pub const QUEUE_CAPACITY: usize = 1024;

/// Items consumed by the forwarder task, in order
enum Queued {
    Message(Value),
    /// Answered once everything queued before it has been handled
    Flush(oneshot::Sender<()>),
}

/// Layer feeding the forwarder task
pub struct GelfLayer {
    tx: mpsc::Sender<Queued>,
    dropped: Arc<AtomicU64>,
    host: String,
    app: String,
}

impl GelfLayer {
    /// Spawn the forwarder task and return the layer that feeds it
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: &GelfConfig) -> Result<(Self, GelfHandle), reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));

        let forwarder = Forwarder {
            client,
            endpoint: endpoint(config),
            username: config.username.clone(),
            password: config.password.clone(),
            dropped: dropped.clone(),
        };
        tokio::spawn(forwarder.run(rx));

        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let handle = GelfHandle { tx: tx.clone() };
        let layer = Self {
            tx,
            dropped,
            host,
            app: config.app.clone(),
        };

        Ok((layer, handle))
    }

    /// Queue `message` without waiting; returns false if it was dropped
    fn enqueue(&self, message: Value) -> bool {
        match self.tx.try_send(Queued::Message(message)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            // Receiver gone means the runtime is shutting down
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

impl<S> Layer<S> for GelfLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if IGNORED_TARGETS
            .iter()
            .any(|t| metadata.target().starts_with(t))
        {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let timestamp = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let message = gelf_message(
            &self.host,
            &self.app,
            *metadata.level(),
            metadata.target(),
            &visitor.message,
            visitor.fields,
            timestamp,
        );

        self.enqueue(message);
    }
}

/// Lets the binary wait for queued messages before exiting
#[derive(Clone)]
pub struct GelfHandle {
    tx: mpsc::Sender<Queued>,
}

impl GelfHandle {
    /// Wait until every message queued so far has been sent (or failed)
    ///
    /// Returns false if that did not happen within `timeout`.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        let flushed = async {
            self.tx.send(Queued::Flush(done_tx)).await.is_ok() && done_rx.await.is_ok()
        };

        tokio::time::timeout(timeout, flushed)
            .await
            .unwrap_or(false)
    }
}

struct Forwarder {
    client: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
    dropped: Arc<AtomicU64>,
}

impl Forwarder {
    async fn run(self, mut rx: mpsc::Receiver<Queued>) {
        while let Some(item) = rx.recv().await {
            let message = match item {
                Queued::Message(message) => message,
                Queued::Flush(done) => {
                    let _ = done.send(());
                    continue;
                }
            };

            let dropped = self.dropped.swap(0, Ordering::Relaxed);
            if dropped > 0 {
                eprintln!(
                    "certfleet: log queue full, dropped {} message(s) for {}",
                    dropped, self.endpoint
                );
            }

            let result = self
                .client
                .post(&self.endpoint)
                .basic_auth(&self.username, Some(&self.password))
                .json(&message)
                .send()
                .await
                .and_then(|response| response.error_for_status());

            if let Err(e) = result {
                eprintln!("certfleet: failed to forward log message to {}: {}", self.endpoint, e);
            }
        }
    }
}

/// HTTPS input URL for `config`
pub fn endpoint(config: &GelfConfig) -> String {
    format!("https://{}:{}/gelf", config.host, config.port)
}

/// Syslog severity used by GELF
pub fn syslog_level(level: Level) -> u8 {
    match level {
        Level::ERROR => 3,
        Level::WARN => 4,
        Level::INFO => 6,
        Level::DEBUG | Level::TRACE => 7,
    }
}

/// Build a GELF 1.1 message
pub fn gelf_message(
    host: &str,
    app: &str,
    level: Level,
    target: &str,
    message: &str,
    fields: Map<String, Value>,
    timestamp: f64,
) -> Value {
    let short_message = message.lines().next().unwrap_or_default();

    let mut gelf = json!({
        "version": "1.1",
        "host": host,
        "short_message": if short_message.is_empty() { "-" } else { short_message },
        "timestamp": timestamp,
        "level": syslog_level(level),
        "_app": app,
        "_target": target,
    });

    if let Some(object) = gelf.as_object_mut() {
        if message.contains('\n') {
            object.insert("full_message".to_string(), Value::from(message));
        }
        for (name, value) in fields {
            // `_id` is reserved by GELF
            let key = if name == "id" {
                "_field_id".to_string()
            } else {
                format!("_{}", name)
            };
            object.entry(key).or_insert(value);
        }
    }

    gelf
}

/// Collects the `message` field and any structured fields of an event
#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Map<String, Value>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::from(format!("{:?}", value)));
    }
}
