use crate::config::Environment;
use tracing::Subscriber;
use tracing_subscriber::{
    EnvFilter, Layer, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt,
};

/// `RUST_LOG` filter, `info` when unset or invalid.
pub(crate) fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// JSON lines in production, pretty output in development. Both carry the
/// thread name, which identifies the detector device.
pub(crate) fn fmt_layer<S>(environment: Environment) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match environment {
        Environment::Production => tracing_subscriber::fmt::layer()
            .json()
            .with_level(true)
            .with_thread_names(true)
            .boxed(),
        Environment::Development => tracing_subscriber::fmt::layer()
            .pretty()
            .with_ansi(true)
            .with_thread_names(true)
            .boxed(),
    }
}

/// Install the global subscriber without OpenTelemetry export. A second call
/// is ignored.
pub fn setup_logging(environment: Environment) {
    let result = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(environment))
        .try_init();

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
