//! eBPF uprobe backend for process instrumentation
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │  probes object (loaded once)                                  │
//! │                                                               │
//! │  python_lock_enter / _exit ─► libc   pthread_cond_timedwait   │
//! │  ssl_{read,write}[_ret]    ─► libssl SSL_read / SSL_write     │
//! │  go_tls_{read,write}       ─► exe    crypto/tls.(*Conn).*     │
//! └───────────────────────────────────────────────────────────────┘
//!                              │ attach(pid, kind)
//!                              ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │  EbpfProbeAttacher: one UProbe link per spec, scoped to pid   │
//! │  EbpfProbeHandle::detach → UProbe::detach(link)               │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Requirements
//!
//! - Linux kernel 5.8+ with CONFIG_BPF_SYSCALL=y
//! - CAP_BPF and CAP_PERFMON capabilities (or root)
//! - A probes object exporting the programs above
//! - Compiled with `--features ebpf`

use std::path::PathBuf;

use crate::process::ProbeKind;

#[cfg(feature = "ebpf")]
mod loader;

#[cfg(feature = "ebpf")]
pub use loader::{EbpfProbeAttacher, EbpfProbeHandle};

/// Where a uprobe is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTarget {
    /// A shared library, resolved through the process's memory maps.
    Library(&'static str),
    /// The process executable itself.
    Executable,
}

impl ProbeTarget {
    pub fn path(&self, pid: u32) -> PathBuf {
        match self {
            ProbeTarget::Library(name) => PathBuf::from(name),
            ProbeTarget::Executable => PathBuf::from(format!("/proc/{}/exe", pid)),
        }
    }
}

/// One program of the probes object and the symbol it is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSpec {
    pub program: &'static str,
    pub symbol: &'static str,
    pub target: ProbeTarget,
}

const PYTHON_THREAD_LOCK: &[ProbeSpec] = &[
    ProbeSpec {
        program: "python_lock_enter",
        symbol: "pthread_cond_timedwait",
        target: ProbeTarget::Library("libc"),
    },
    ProbeSpec {
        program: "python_lock_exit",
        symbol: "pthread_cond_timedwait",
        target: ProbeTarget::Library("libc"),
    },
];

const OPENSSL: &[ProbeSpec] = &[
    ProbeSpec {
        program: "ssl_write",
        symbol: "SSL_write",
        target: ProbeTarget::Library("libssl"),
    },
    ProbeSpec {
        program: "ssl_write_ret",
        symbol: "SSL_write",
        target: ProbeTarget::Library("libssl"),
    },
    ProbeSpec {
        program: "ssl_read",
        symbol: "SSL_read",
        target: ProbeTarget::Library("libssl"),
    },
    ProbeSpec {
        program: "ssl_read_ret",
        symbol: "SSL_read",
        target: ProbeTarget::Library("libssl"),
    },
];

// Go moves goroutine stacks, so only entry probes are safe here.
const GO_TLS: &[ProbeSpec] = &[
    ProbeSpec {
        program: "go_tls_write",
        symbol: "crypto/tls.(*Conn).Write",
        target: ProbeTarget::Executable,
    },
    ProbeSpec {
        program: "go_tls_read",
        symbol: "crypto/tls.(*Conn).Read",
        target: ProbeTarget::Executable,
    },
];

/// Programs attached for a probe kind.
pub fn probe_specs(kind: ProbeKind) -> &'static [ProbeSpec] {
    match kind {
        ProbeKind::PythonThreadLock => PYTHON_THREAD_LOCK,
        ProbeKind::OpenSsl => OPENSSL,
        ProbeKind::GoTls => GO_TLS,
    }
}

/// Every program name the probes object is expected to contain.
pub fn program_names() -> impl Iterator<Item = &'static str> {
    [ProbeKind::PythonThreadLock, ProbeKind::OpenSsl, ProbeKind::GoTls]
        .into_iter()
        .flat_map(|kind| probe_specs(kind).iter().map(|spec| spec.program))
}

/// Stub attacher for when the eBPF feature is disabled.
///
/// This allows the rest of the codebase to compile without feature flags everywhere.
#[cfg(not(feature = "ebpf"))]
#[derive(Debug)]
pub struct EbpfProbeAttacher;

#[cfg(not(feature = "ebpf"))]
impl EbpfProbeAttacher {
    /// Returns None when the eBPF feature is disabled.
    pub fn new(_object: &std::path::Path) -> Option<Self> {
        tracing::info!("eBPF feature not enabled at compile time, probes disabled");
        None
    }
}

#[cfg(not(feature = "ebpf"))]
impl crate::process::ProbeAttacher for EbpfProbeAttacher {
    fn attach(
        &self,
        _pid: u32,
        _kind: ProbeKind,
    ) -> Result<Vec<Box<dyn crate::process::ProbeHandle>>, crate::process::ProbeError> {
        Err(crate::process::ProbeError::NotSupported)
    }
}
