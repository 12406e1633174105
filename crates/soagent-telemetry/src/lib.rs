mod logging;

pub use logging::BusLayer;

use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use soagent_core::events::LogRecord;

/// Initialize the tracing subscriber. Call once at startup.
///
/// Returns the channel that receives every info-and-above record; the
/// server drains it into the event bus so connected clients see the
/// process log live.
pub fn init() -> mpsc::UnboundedReceiver<LogRecord> {
    let (tx, rx) = mpsc::unbounded_channel();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(BusLayer::new(tx))
        .init();

    rx
}
