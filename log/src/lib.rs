use chrono::Utc;
use crossbeam_channel::{self, Sender};
use nebula_utils::get_hostname;
use serde::Serialize;
use std::{collections::BTreeMap, io::Write, thread};
use tracing::{
    field::{Field, Visit},
    level_filters::LevelFilter,
    Level, Subscriber,
};
use tracing_subscriber::{
    layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, Layer,
};

pub const LOG_ENV: &str = "NEBULA_LOG";
pub const LOG_FORMAT_ENV: &str = "NEBULA_LOG_FORMAT";

/// Hands log lines to a background thread so an event never waits on
/// stderr. Lines are dropped when the thread falls too far behind.
#[derive(Clone)]
pub struct LogWriter {
    sender: Sender<Vec<u8>>,
}

impl Default for LogWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl LogWriter {
    pub fn new() -> Self {
        Self::with_output(std::io::stderr())
    }

    pub fn with_output<W: Write + Send + 'static>(mut output: W) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded::<Vec<u8>>(1000);
        thread::spawn(move || {
            while let Ok(data) = receiver.recv() {
                let _ = output.write_all(&data);
                let _ = output.flush();
            }
        });
        Self { sender }
    }

    pub fn send(&self, line: Vec<u8>) {
        let _ = self.sender.try_send(line);
    }
}

#[derive(Debug, Default, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogSeverity {
    #[default]
    Default,
    Debug,
    Info,
    Warning,
    Error,
}

impl From<&Level> for LogSeverity {
    fn from(level: &Level) -> Self {
        match level {
            &Level::DEBUG | &Level::TRACE => Self::Debug,
            &Level::INFO => Self::Info,
            &Level::WARN => Self::Warning,
            &Level::ERROR => Self::Error,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
struct LogEntry<'a> {
    timestamp: String,
    severity: LogSeverity,
    target: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<u32>,
    fields: BTreeMap<&'a str, serde_json::Value>,
}

/// One JSON object per event, on its own line.
pub struct JsonLayer {
    hostname: String,
    writer: LogWriter,
}

impl JsonLayer {
    pub fn new(writer: LogWriter) -> Self {
        Self {
            hostname: get_hostname().unwrap_or_default(),
            writer,
        }
    }

    fn render(&self, event: &tracing::Event<'_>) -> Option<Vec<u8>> {
        let meta = event.metadata();
        let mut visitor = Visitor::new(&self.hostname);
        event.record(&mut visitor);
        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            severity: LogSeverity::from(meta.level()),
            target: meta.target(),
            file: meta.file(),
            line: meta.line(),
            fields: visitor.values,
        };
        let mut line = serde_json::to_vec(&entry).ok()?;
        line.push(b'\n');
        Some(line)
    }
}

impl<S> Layer<S> for JsonLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(line) = self.render(event) {
            self.writer.send(line);
        }
    }
}

struct Visitor<'a> {
    values: BTreeMap<&'a str, serde_json::Value>,
}

impl<'a> Visitor<'a> {
    fn new(hostname: &str) -> Self {
        let mut values = BTreeMap::new();
        values.insert("hostname", serde_json::Value::from(hostname));
        Self { values }
    }
}

impl<'a> Visit for Visitor<'a> {
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.values
            .insert(field.name(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.values
            .insert(field.name(), serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.values
            .insert(field.name(), serde_json::Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.values
            .insert(field.name(), serde_json::Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.values.insert(
            field.name(),
            serde_json::Value::from(format!("{:?}", value)),
        );
    }
}

fn filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy()
}

/// Installs the global subscriber. `NEBULA_LOG` takes the usual filter
/// directives; `NEBULA_LOG_FORMAT=json` switches stderr output to JSON
/// lines.
pub fn init() {
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(filter())
            .with(JsonLayer::new(LogWriter::new()))
            .init();
        return;
    }

    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
    std::mem::forget(guard);
    tracing_subscriber::registry()
        .with(filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .compact(),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn json_lines() {
        let captured = Captured::default();
        let layer = JsonLayer::new(LogWriter::with_output(captured.clone()));
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(server = 3, url = "amqp://a", "amqp connection lost");
        });

        let start = Instant::now();
        while captured.0.lock().unwrap().is_empty()
            && start.elapsed() < Duration::from_secs(2)
        {
            thread::sleep(Duration::from_millis(5));
        }
        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let line: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(line["severity"], "WARNING");
        assert_eq!(line["fields"]["server"], 3);
        assert_eq!(line["fields"]["url"], "amqp://a");
        assert_eq!(line["fields"]["message"], "amqp connection lost");
    }

    #[test]
    fn severity_from_level() {
        assert_eq!(LogSeverity::from(&Level::TRACE), LogSeverity::Debug);
        assert_eq!(LogSeverity::from(&Level::ERROR), LogSeverity::Error);
    }
}
