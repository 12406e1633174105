use chrono::Utc;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use soagent_core::events::LogRecord;

/// Targets whose events are produced while publishing to the bus itself.
/// Forwarding them would feed the bus its own output.
const SKIPPED_TARGET_PREFIXES: &[&str] = &["soagent_server::bus"];

/// tracing Layer that forwards info-and-above events as `LogRecord`s into
/// a channel. The receiving side decides what to do with them; the layer
/// itself never blocks and never logs.
pub struct BusLayer {
    tx: mpsc::UnboundedSender<LogRecord>,
}

impl BusLayer {
    pub fn new(tx: mpsc::UnboundedSender<LogRecord>) -> Self {
        Self { tx }
    }
}

/// Visitor that extracts the `message` field from a tracing event.
#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }
}

impl<S> Layer<S> for BusLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::INFO {
            return;
        }

        let target = event.metadata().target();
        if SKIPPED_TARGET_PREFIXES.iter().any(|p| target.starts_with(p)) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: target.to_string(),
            message: visitor.message.unwrap_or_default(),
        };

        let _ = self.tx.send(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn subscriber_with_layer() -> (
        impl tracing::Subscriber + Send + Sync + 'static,
        mpsc::UnboundedReceiver<LogRecord>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = tracing_subscriber::registry().with(BusLayer::new(tx));
        (subscriber, rx)
    }

    #[test]
    fn info_events_are_forwarded() {
        let (subscriber, mut rx) = subscriber_with_layer();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("agent started");
        });

        let record = rx.try_recv().unwrap();
        assert_eq!(record.level, "INFO");
        assert_eq!(record.message, "agent started");
        assert!(!record.timestamp.is_empty());
    }

    #[test]
    fn warn_and_error_are_forwarded() {
        let (subscriber, mut rx) = subscriber_with_layer();
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("low disk");
            tracing::error!("query failed");
        });

        assert_eq!(rx.try_recv().unwrap().level, "WARN");
        assert_eq!(rx.try_recv().unwrap().level, "ERROR");
    }

    #[test]
    fn debug_and_trace_are_dropped() {
        let (subscriber, mut rx) = subscriber_with_layer();
        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("noisy");
            tracing::trace!("noisier");
        });

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn bus_internal_targets_are_dropped() {
        let (subscriber, mut rx) = subscriber_with_layer();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "soagent_server::bus", "dropping slow subscriber");
            tracing::info!(target: "soagent_server::handlers", "kept");
        });

        let record = rx.try_recv().unwrap();
        assert_eq!(record.target, "soagent_server::handlers");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn formatted_message_fields_are_captured() {
        let (subscriber, mut rx) = subscriber_with_layer();
        tracing::subscriber::with_default(subscriber, || {
            let port = 3000;
            tracing::info!(port, "listening on {port}");
        });

        let record = rx.try_recv().unwrap();
        assert_eq!(record.message, "listening on 3000");
    }

    #[test]
    fn closed_receiver_is_not_an_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let subscriber = tracing_subscriber::registry().with(BusLayer::new(tx));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("nobody listening");
        });
    }
}
