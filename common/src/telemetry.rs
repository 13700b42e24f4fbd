use tracing::subscriber::set_global_default;
use tracing::Subscriber;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt::MakeWriter, layer::SubscriberExt, EnvFilter, Registry};

/// Builds the `tracing` subscriber shared by the ingestion service and the processing workers
///
/// Spans and events go through an `EnvFilter` (driven by `RUST_LOG`), are stored as JSON
/// by `JsonStorageLayer` and written out in bunyan format to `sink`.
///
/// # Arguments
/// - `name`: name of the binary, written in every log record
/// - `fallback_env_filter`: filter used when `RUST_LOG` is not set, ex: "info"
/// - `sink`: where the records are written, ex: `std::io::stdout` or `std::io::sink` in tests
pub fn get_tracing_subscriber<Sink>(
    name: String,
    fallback_env_filter: String,
    sink: Sink,
) -> impl Subscriber + Send + Sync
where
    Sink: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback_env_filter));

    let formatting_layer = BunyanFormattingLayer::new(name, sink);

    Registry::default()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(formatting_layer)
}

/// Installs the given subscriber as the process-wide default
///
/// `log` records emitted by dependencies (sqlx, lapin, rust-s3) are redirected to it.
/// Must be called at most once per process.
pub fn init_tracing_subscriber(subscriber: impl Subscriber + Send + Sync) {
    LogTracer::init().expect("Failed to set logger");

    set_global_default(subscriber).expect("Failed to set subscriber");
}
