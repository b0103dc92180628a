//! Span synthesis and export
//!
//! ```text
//! protocol event ──► Trace::<protocol>() ──► span::<protocol>() (shape)
//!                         │
//!                         ▼
//!                  sdk span (client, back-dated)
//!                         │
//!     per-container TracerProvider ──► SharedExporter ──► OTLP/HTTP
//! ```

pub mod exporter;
pub mod l7;
pub mod registry;
pub mod span;
pub mod trace;

use std::fmt;

pub use exporter::{SharedExporter, TracesConfig};
pub use l7::Status;
pub use registry::{container_id_to_service_name, AgentIdentity, ExportMode, TracerRegistry};
pub use span::SpanRecord;
pub use trace::{Trace, Tracer};

/// Error type for telemetry setup
#[derive(Debug)]
pub enum TelemetryError {
    /// The collector endpoint is not a usable http(s) URL
    InvalidEndpoint(String),
    /// The exporter or its HTTP client could not be built
    Exporter(String),
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryError::InvalidEndpoint(msg) => write!(f, "invalid traces endpoint: {}", msg),
            TelemetryError::Exporter(msg) => write!(f, "span exporter error: {}", msg),
        }
    }
}

impl std::error::Error for TelemetryError {}
