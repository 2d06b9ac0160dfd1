use opentelemetry::trace::TraceId;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

use crate::{config::LogFormat, Result};

/// Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> TraceId {
    use opentelemetry::trace::TraceContextExt as _;
    use tracing_opentelemetry::OpenTelemetrySpanExt as _;

    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

#[cfg(feature = "telemetry")]
async fn init_tracer() -> Result<opentelemetry::sdk::trace::Tracer> {
    use opentelemetry::{
        sdk::{trace, Resource},
        KeyValue,
    };
    use opentelemetry_otlp::WithExportConfig;

    use crate::Error;

    let otlp_endpoint = std::env::var("OPENTELEMETRY_ENDPOINT_URL").map_err(|_| {
        Error::ConfigError("missing OPENTELEMETRY_ENDPOINT_URL environment variable".into())
    })?;
    let channel = tonic::transport::Channel::from_shared(otlp_endpoint)
        .map_err(|e| Error::ConfigError(format!("invalid OPENTELEMETRY_ENDPOINT_URL: {e}")))?
        .connect_lazy();

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_channel(channel))
        .with_trace_config(trace::config().with_resource(Resource::new(vec![KeyValue::new(
            "service.name",
            "bucket-operator",
        )])))
        .install_batch(opentelemetry::runtime::Tokio)
        .map_err(|e| Error::ConfigError(format!("failed to install tracer: {e}")))
}

/// Initialize tracing
pub async fn init(format: LogFormat) -> Result<()> {
    // Setup tracing layers
    #[cfg(feature = "telemetry")]
    let telemetry = tracing_opentelemetry::layer().with_tracer(init_tracer().await?);

    let (json, compact) = match format {
        LogFormat::Json => (Some(tracing_subscriber::fmt::layer().json()), None),
        LogFormat::Compact => (None, Some(tracing_subscriber::fmt::layer().compact())),
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| crate::Error::ConfigError(format!("invalid log filter: {e}")))?;

    // Decide on layers
    #[cfg(feature = "telemetry")]
    let collector = Registry::default()
        .with(telemetry)
        .with(json)
        .with(compact)
        .with(env_filter);
    #[cfg(not(feature = "telemetry"))]
    let collector = Registry::default().with(json).with(compact).with(env_filter);

    // Initialize tracing
    tracing::subscriber::set_global_default(collector)
        .map_err(|e| crate::Error::ConfigError(format!("failed to set log collector: {e}")))
}
