use color_eyre::eyre::WrapErr;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tracing_tree::HierarchicalLayer;

const DEFAULT_FILTER: &str = "warn,skypost=info";

/// Install the global tracing subscriber
///
/// Hierarchical console output filtered by `RUST_LOG`, plus an OTLP exporter
/// when `OTEL_EXPORTER_OTLP_ENDPOINT` is set. Must run inside the Tokio runtime.
pub fn setup_tracing(service_name: &str) -> color_eyre::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let otel_tracer = match std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        Ok(endpoint) => Some(otlp_tracer(service_name, &endpoint)?),
        Err(_) => None,
    };
    let otel_layer = otel_tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(true),
        )
        .with(otel_layer)
        .try_init()
        .wrap_err("Failed to install tracing subscriber")?;

    tracing::info!("Tracing initialized for {}", service_name);
    Ok(())
}

fn otlp_tracer(
    service_name: &str,
    endpoint: &str,
) -> color_eyre::Result<opentelemetry_sdk::trace::Tracer> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(endpoint),
        )
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(Resource::new(
            vec![KeyValue::new("service.name", service_name.to_string())],
        )))
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .wrap_err("Failed to install OTLP exporter")
}

/// Initialise Sentry when `SENTRY_DSN` is set. Keep the guard alive for the
/// life of the process.
pub fn setup_sentry() -> Option<sentry::ClientInitGuard> {
    let dsn = std::env::var("SENTRY_DSN").ok()?;

    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            traces_sample_rate: 1.0,
            ..Default::default()
        },
    )))
}
