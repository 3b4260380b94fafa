//! Severity-tagged message sink.
//!
//! The scanner never writes to a console or UI itself. Everything it has to
//! say goes through `tracing`; [`MessageLayer`] turns those events into
//! [`ScanMessage`]s for whoever embeds the scanner.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

impl From<&Level> for Severity {
    fn from(level: &Level) -> Self {
        if *level == Level::ERROR {
            Severity::Error
        } else if *level == Level::WARN {
            Severity::Warning
        } else if *level == Level::INFO {
            Severity::Info
        } else {
            Severity::Debug
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanMessage {
    pub severity: Severity,
    pub text: String,
    pub target: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

/// Forwards events at or above a minimum severity over a channel.
pub struct MessageLayer {
    tx: mpsc::UnboundedSender<ScanMessage>,
    min_severity: Severity,
}

impl MessageLayer {
    pub fn new(min_severity: Severity) -> (Self, mpsc::UnboundedReceiver<ScanMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, min_severity }, rx)
    }
}

impl<S: Subscriber> Layer<S> for MessageLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let severity = Severity::from(metadata.level());
        if severity < self.min_severity {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let text = if visitor.fields.is_empty() {
            visitor.message
        } else {
            format!("{} ({})", visitor.message, visitor.fields.join(", "))
        };

        // a closed receiver just means nobody is listening
        let _ = self.tx.send(ScanMessage {
            severity,
            text,
            target: metadata.target().to_string(),
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_events_become_messages() {
        let (layer, mut rx) = MessageLayer::new(Severity::Info);
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("too quiet");
            tracing::warn!(attempt = 2, id = "1-1-1-1-1", "Feed request failed");
            tracing::error!("No active filters");
        });

        let warning = rx.try_recv().unwrap();
        assert_eq!(warning.severity, Severity::Warning);
        assert_eq!(warning.text, "Feed request failed (attempt=2, id=1-1-1-1-1)");

        let error = rx.try_recv().unwrap();
        assert_eq!(error.severity, Severity::Error);
        assert_eq!(error.text, "No active filters");

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::Debug < Severity::Info);
        assert!(Severity::Warning < Severity::Error);
        assert_eq!(Severity::from(&Level::TRACE), Severity::Debug);
        assert_eq!(Severity::Warning.to_string(), "warning");
    }
}
