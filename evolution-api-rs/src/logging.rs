// evolution-api-rs/src/logging.rs
// Subscriber setup for the service binary.

use shared_types::config::LoggingConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},hyper=warn", config.level)));
    let subscriber = Registry::default().with(filter);

    if config.json {
        let json_layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .with_span_list(true);
        subscriber.with(json_layer).try_init()
    } else {
        let text_layer = fmt::layer().with_target(true).with_thread_ids(true);
        subscriber.with(text_layer).try_init()
    }
}
