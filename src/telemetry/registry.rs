//! Tracer registry
//!
//! ```text
//!            init(config)
//!                │
//!     endpoint? ─┼─ no ──► Disabled ──► container_tracer() ──► Tracer::Disabled
//!                │
//!                └─ yes ─► Enabled(Pipeline { exporter, identity, runtime })
//!                               │
//!                               └─► container_tracer(id)
//!                                     TracerProvider(resource: host + container)
//!                                       └─► Tracer::Enabled
//! ```
//!
//! Batch processors run on the tokio runtime the registry was built on, so
//! `container_tracer` may be called from any thread.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::export::trace::SpanExporter;
use opentelemetry_sdk::trace::{Config, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};
use tokio::runtime::Handle;
use tracing::{info, warn};

use super::exporter::{otlp_http_exporter, parse_endpoint, SharedExporter, TracesConfig};
use super::trace::Tracer;
use super::TelemetryError;

/// Instrumentation scope name reported on every span.
pub const INSTRUMENTATION_NAME: &str = "flowtrace";

/// Identity of the host the agent runs on.
#[derive(Debug, Clone, Default)]
pub struct AgentIdentity {
    pub machine_id: String,
    pub hostname: String,
    pub version: String,
}

/// How finished spans reach the exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    /// Batched on the tokio runtime.
    Batch,
    /// One export per finished span.
    Simple,
}

/// Shared export pipeline: one exporter connection, host identity.
#[derive(Debug, Clone)]
pub struct Pipeline {
    exporter: SharedExporter,
    identity: AgentIdentity,
    mode: ExportMode,
    runtime: Option<Handle>,
}

/// Process-wide factory for per-container tracers. Built once at startup.
#[derive(Debug, Clone)]
pub enum TracerRegistry {
    Disabled,
    Enabled(Pipeline),
}

impl TracerRegistry {
    /// Build the registry from configuration. No endpoint disables tracing;
    /// a malformed endpoint or an exporter that cannot be built is an error.
    pub fn init(config: &TracesConfig, identity: AgentIdentity) -> Result<Self, TelemetryError> {
        let endpoint = match config.endpoint.as_deref().map(str::trim) {
            Some(e) if !e.is_empty() => e,
            _ => {
                info!("no OpenTelemetry traces collector endpoint configured");
                return Ok(TracerRegistry::Disabled);
            }
        };
        let url = parse_endpoint(endpoint)?;
        let exporter = otlp_http_exporter(&url, config)?;
        info!(
            endpoint = %url,
            insecure_skip_verify = config.insecure_skip_verify,
            "OpenTelemetry traces collector endpoint configured"
        );
        Ok(Self::with_exporter(exporter, identity, ExportMode::Batch))
    }

    /// Enabled registry around an arbitrary exporter. The current tokio
    /// runtime, if any, hosts the batch processors.
    pub fn with_exporter<E: SpanExporter + 'static>(
        exporter: E,
        identity: AgentIdentity,
        mode: ExportMode,
    ) -> Self {
        TracerRegistry::Enabled(Pipeline {
            exporter: SharedExporter::new(exporter),
            identity,
            mode,
            runtime: Handle::try_current().ok(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, TracerRegistry::Enabled(_))
    }

    /// Tracer whose spans carry the container's identity.
    pub fn container_tracer(&self, container_id: &str) -> Tracer {
        let pipeline = match self {
            TracerRegistry::Disabled => return Tracer::Disabled,
            TracerRegistry::Enabled(p) => p,
        };
        let resource = Resource::new(container_resource(&pipeline.identity, container_id));
        let builder =
            TracerProvider::builder().with_config(Config::default().with_resource(resource));
        let provider = match pipeline.mode {
            ExportMode::Batch => {
                let handle = match pipeline.runtime.clone().or_else(|| Handle::try_current().ok()) {
                    Some(h) => h,
                    None => {
                        warn!(container_id, "no tokio runtime for batch span export, not tracing");
                        return Tracer::Disabled;
                    }
                };
                // the batch processor spawns its worker on construction
                let _guard = handle.enter();
                builder
                    .with_batch_exporter(pipeline.exporter.clone(), runtime::Tokio)
                    .build()
            }
            ExportMode::Simple => builder.with_simple_exporter(pipeline.exporter.clone()).build(),
        };
        let tracer = provider.versioned_tracer(
            INSTRUMENTATION_NAME,
            Some(pipeline.identity.version.clone()),
            None::<String>,
            None,
        );
        Tracer::enabled(provider, tracer)
    }
}

fn container_resource(identity: &AgentIdentity, container_id: &str) -> Vec<KeyValue> {
    vec![
        KeyValue::new("host.name", identity.hostname.clone()),
        KeyValue::new("host.id", identity.machine_id.clone()),
        KeyValue::new("service.name", container_id_to_service_name(container_id)),
        KeyValue::new("container.id", container_id.to_string()),
    ]
}

/// Human-friendly service name for a container id.
///
/// ```text
/// /k8s/<namespace>/<pod>/<container>   → <namespace>/<container>
/// /docker/<name>                       → <name>
/// /system.slice/<unit>.service         → <unit>
/// ```
///
/// Anything else is returned unchanged.
pub fn container_id_to_service_name(container_id: &str) -> String {
    let parts: Vec<&str> = container_id.split('/').collect();
    match parts.as_slice() {
        ["", "k8s", namespace, _pod, container] => format!("{}/{}", namespace, container),
        ["", "docker", name] if !name.is_empty() => name.to_string(),
        ["", "system.slice", unit] => match unit.strip_suffix(".service") {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => container_id.to_string(),
        },
        _ => container_id.to_string(),
    }
}
