//! Relays a plugin's diagnostic output into the host's `tracing` subscriber.
//!
//! Plugins may write structured JSON lines (`{"@level": "debug",
//! "@message": "...", "@timestamp": "...", ...}`) or plain text to stderr.

use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Target of every event re-emitted from a plugin.
pub const PLUGIN_LOG_TARGET: &str = "pluglink::plugin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One diagnostic line, decoded.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LogLine {
    /// `None` when the line declared a level we do not know.
    pub(crate) level:   Option<Level>,
    pub(crate) message: String,
    /// Remaining keys sorted by name, `@` prefixes stripped.
    pub(crate) fields:  Vec<(String, String)>,
}

impl LogLine {
    pub(crate) fn parse(line: &str) -> Self {
        match serde_json::from_str::<Map<String, Value>>(line) {
            Ok(entry) => Self::from_entry(entry),
            Err(_) => Self {
                level:   Some(Level::Info),
                message: line.to_owned(),
                fields:  Vec::new(),
            },
        }
    }

    fn from_entry(mut entry: Map<String, Value>) -> Self {
        let level = match entry.remove("@level") {
            Some(Value::String(level)) => parse_level(&level),
            _ => Some(Level::Info),
        };
        let message = match entry.remove("@message") {
            Some(Value::String(message)) => message,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        entry.remove("@timestamp");

        let fields = entry
            .into_iter()
            .map(|(key, value)| {
                let key = key.strip_prefix('@').map(str::to_owned).unwrap_or(key);
                let value = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect();

        Self {
            level,
            message,
            fields,
        }
    }

    /// `message [k=v, k2=v2]`, or just the message without fields.
    pub(crate) fn render(&self) -> String {
        if self.fields.is_empty() {
            return self.message.clone();
        }
        let pairs = self
            .fields
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{} [{}]", self.message, pairs)
    }
}

fn parse_level(level: &str) -> Option<Level> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Some(Level::Trace),
        "debug" => Some(Level::Debug),
        "info" => Some(Level::Info),
        "warn" | "warning" => Some(Level::Warn),
        "error" => Some(Level::Error),
        _ => None,
    }
}

/// Log one line of plugin output.
pub(crate) fn log_plugin_line(plugin: &str, line: &str) {
    let entry = LogLine::parse(line);
    let text = entry.render();
    let level = entry.level.unwrap_or_else(|| {
        tracing::warn!(target: PLUGIN_LOG_TARGET, plugin, "Unknown log level in plugin output");
        Level::Info
    });

    match level {
        Level::Trace => tracing::trace!(target: PLUGIN_LOG_TARGET, plugin, "{}", text),
        Level::Debug => tracing::debug!(target: PLUGIN_LOG_TARGET, plugin, "{}", text),
        Level::Info => tracing::info!(target: PLUGIN_LOG_TARGET, plugin, "{}", text),
        Level::Warn => tracing::warn!(target: PLUGIN_LOG_TARGET, plugin, "{}", text),
        Level::Error => tracing::error!(target: PLUGIN_LOG_TARGET, plugin, "{}", text),
    }
}

/// Log every line read from `stream` until it ends.
pub(crate) async fn relay_diagnostics<R>(stream: R, plugin: String)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => log_plugin_line(&plugin, &line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Stopped reading diagnostics of {}: {}", plugin, e);
                break;
            }
        }
    }
}

/// Anything the plugin prints on stdout after its handshake line.
pub(crate) async fn drain_stdout<R>(stream: R, plugin: String)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: PLUGIN_LOG_TARGET, plugin = %plugin, "stdout: {}", line);
    }
}
