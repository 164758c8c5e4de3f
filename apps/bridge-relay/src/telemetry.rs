use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use opentelemetry::trace::TracerProvider;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "bridge-relay";
const OTEL_STDOUT_ENV: &str = "BRIDGE_RELAY_OTEL_STDOUT";
const FRAME_SIZE_BUCKETS: &[f64] = &[64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0];

/// Process-wide logging, tracing and metrics for the relay binary. Spans
/// are flushed when this is dropped.
pub struct Telemetry {
    metrics: PrometheusHandle,
    spans: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full("bridge_relay_frame_size_bytes".to_string()),
                FRAME_SIZE_BUCKETS,
            )
            .context("invalid histogram buckets")?
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_relay_metrics();

        let spans = env_truthy(OTEL_STDOUT_ENV).then(stdout_spans);
        let otel_layer = spans.as_ref().map(|provider| {
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;
        if spans.is_some() {
            info!("span export to stdout enabled by {OTEL_STDOUT_ENV}");
        }

        Ok(Self { metrics, spans })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        let Some(provider) = self.spans.take() else {
            return;
        };
        if let Err(err) = provider.shutdown() {
            warn!(error = %err, "span exporter did not shut down cleanly");
        }
    }
}

fn stdout_spans() -> SdkTracerProvider {
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes([KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build();
    global::set_tracer_provider(provider.clone());
    provider
}

fn describe_relay_metrics() {
    describe_gauge!(
        "bridge_relay_connections_active",
        Unit::Count,
        "Registered websocket connections per class"
    );
    describe_counter!(
        "bridge_relay_connections_total",
        Unit::Count,
        "Connections accepted per class"
    );
    describe_counter!(
        "bridge_relay_connections_closed_total",
        Unit::Count,
        "Connections unregistered per class"
    );
    describe_counter!(
        "bridge_relay_frames_forwarded_total",
        Unit::Count,
        "Frames delivered to recipient queues, by sender class"
    );
    describe_counter!(
        "bridge_relay_bytes_forwarded_total",
        Unit::Bytes,
        "Payload bytes delivered to recipient queues, by sender class"
    );
    describe_histogram!(
        "bridge_relay_frame_size_bytes",
        Unit::Bytes,
        "Size of relayed frames"
    );
    describe_counter!(
        "bridge_relay_flow_control_drops_total",
        Unit::Count,
        "Frames skipped for a recipient whose queue was full"
    );
    describe_counter!(
        "bridge_relay_evictions_total",
        Unit::Count,
        "Recipients removed because their queue was closed"
    );
    describe_counter!(
        "bridge_relay_token_rejections_total",
        Unit::Count,
        "Upgrades refused for a token mismatch"
    );
    describe_counter!(
        "bridge_relay_undecodable_frames_total",
        Unit::Count,
        "Relayed frames that are not signaling envelopes"
    );
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
