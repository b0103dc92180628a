//! flowtrace - host telemetry agent turning observed connections into spans
//!
//! The agent watches live processes and their network flows, decides which
//! destinations are worth tracing, keeps per-process probes attached, and
//! exports protocol-aware client spans over OTLP/HTTP.
//!
//! # Modules
//!
//! - `net` - address classification, destination whitelist, endpoint identity
//! - `process` - per-process instrumentation lifecycle and process table
//! - `telemetry` - tracer registry, span synthesis, exporters
//! - `flows` - routing of protocol events to per-container traces
//! - `ebpf` - uprobe backend (optional, requires `--features ebpf`)
//! - `config` - agent settings from file and environment
//! - `metrics` - Prometheus metrics for the agent itself
//! - `logging` - structured log setup
//!
//! # Quick Start
//!
//! ```ignore
//! use flowtrace::{AgentConfig, TracerRegistry};
//!
//! let config = AgentConfig::load()?;
//! let registry = TracerRegistry::init(&config.traces_config(), config.identity("0.1.0"))?;
//! let trace = registry
//!     .container_tracer("/docker/web")
//!     .new_trace(&"10.0.0.5:5432".parse::<std::net::SocketAddr>()?.into());
//! trace.postgres_query("SELECT 1", false, std::time::Duration::from_millis(3));
//! ```

pub mod config;
pub mod ebpf;
pub mod flows;
pub mod logging;
pub mod metrics;
pub mod net;
pub mod process;
pub mod telemetry;

// Re-export commonly used types at crate root for convenience
pub use config::{AgentConfig, ConfigError};
pub use flows::{Connection, FlowRouter, L7Event};
pub use net::{DestinationFilter, DestinationKey, HostPort, PortFilter};
pub use process::{InstrumentationContext, Process, ProcessState, ProcessTable};
pub use telemetry::{Trace, Tracer, TracerRegistry};
