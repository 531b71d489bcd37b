// Logging, tracing, and metrics for the ingest service. Local-first:
// structured logs and the Prometheus recorder are always on; the OTLP
// trace exporter is attached only when an endpoint is configured, so a
// dev box never waits on a collector that is not there.
use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace as sdktrace;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::MonitoringSection;

pub fn init(monitoring: &MonitoringSection) -> PrometheusHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match otlp_endpoint(monitoring) {
        Some(endpoint) => match build_tracer_provider(&endpoint, monitoring) {
            Ok(provider) => {
                opentelemetry::global::set_text_map_propagator(
                    opentelemetry_sdk::propagation::TraceContextPropagator::new(),
                );
                let tracer = provider.tracer(monitoring.service_name.clone());
                registry
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .init();
                tracing::info!(endpoint, "trace export enabled");
            }
            Err(err) => {
                registry.init();
                tracing::warn!(error = %err, endpoint, "trace export disabled");
            }
        },
        None => registry.init(),
    }

    PrometheusBuilder::new()
        .install_recorder()
        .expect("install metrics recorder")
}

// Config wins; the environment variable covers containerized deploys
// where the collector address is injected rather than templated in.
fn otlp_endpoint(monitoring: &MonitoringSection) -> Option<String> {
    monitoring
        .otlp_endpoint
        .clone()
        .or_else(|| std::env::var("FLEETLINE_OTLP_ENDPOINT").ok())
}

fn build_tracer_provider(
    endpoint: &str,
    monitoring: &MonitoringSection,
) -> Result<sdktrace::TracerProvider> {
    let mut attrs = vec![
        KeyValue::new("service.name", monitoring.service_name.clone()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ];
    if let Ok(instance) =
        std::env::var("FLEETLINE_INSTANCE_ID").or_else(|_| std::env::var("HOSTNAME"))
    {
        attrs.push(KeyValue::new("service.instance.id", instance));
    }
    if let Ok(environment) = std::env::var("FLEETLINE_ENVIRONMENT") {
        attrs.push(KeyValue::new("deployment.environment", environment));
    }
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint.to_string()),
        )
        .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(attrs)))
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .context("install OTLP trace pipeline")
}

/// Prometheus scrape endpoint plus a liveness probe for the fleet LB.
pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> Result<()> {
    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/healthz", axum::routing::get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind metrics endpoint {addr}"))?;
    tracing::info!(addr = %addr, "metrics endpoint started");
    axum::serve(listener, app.into_make_service())
        .await
        .context("serve metrics endpoint")
}
