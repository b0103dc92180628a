//! Process instrumentation
//!
//! ```text
//!  ProcessTable::reconcile(live pids)
//!        │
//!        ├── new pid ────► Process::spawn ──► instrument task
//!        │                                     │  resolve exe (backoff)
//!        │                                     │  detect runtimes
//!        │                                     ▼  attach probes once per kind
//!        └── gone pid ───► Process::close ──► cancel + detach
//! ```
//!
//! Host access is abstracted by the traits in `host`; `procfs` provides the
//! Linux implementation and `crate::ebpf` the probe backend.

pub mod backoff;
pub mod host;
pub mod lifecycle;
pub mod procfs;
pub mod runtime;
pub mod table;

pub use backoff::Backoff;
pub use host::{
    NamespaceResolver, NetNs, NoopProbeAttacher, ProbeAttacher, ProbeError, ProbeHandle,
    ProbeKind, ProcessHost, ProcessSnapshot, ProcessSnapshotSource, RuntimeMonitor,
    RuntimeMonitorFactory,
};
pub use lifecycle::{InstrumentationContext, Process, ProcessState};
pub use procfs::{host_net_ns_id, Procfs};
pub use table::ProcessTable;
