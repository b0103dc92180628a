//! Host capabilities consumed by process instrumentation
//!
//! The lifecycle manager never touches the kernel directly. Everything it
//! needs from the host goes through these traits, so the `/proc` and eBPF
//! implementations can be swapped for in-memory ones in tests.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;

/// Kind of probe attached to a process. Each kind is attempted at most once
/// per process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    /// Interpreter lock wait probes (CPython GIL contention)
    PythonThreadLock,
    /// `SSL_read`/`SSL_write` uprobes in a dynamically linked libssl
    OpenSsl,
    /// `crypto/tls` uprobes in a Go binary
    GoTls,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::PythonThreadLock => "python_thread_lock",
            ProbeKind::OpenSsl => "openssl",
            ProbeKind::GoTls => "go_tls",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for probe operations
#[derive(Debug)]
pub enum ProbeError {
    /// The probe backend could not be initialized
    LoadError(String),
    /// The probe could not be attached
    AttachError(String),
    /// The probe could not be released
    DetachError(String),
    /// No probe backend is available (e.g. built without eBPF support)
    NotSupported,
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::LoadError(msg) => write!(f, "probe load error: {}", msg),
            ProbeError::AttachError(msg) => write!(f, "probe attach error: {}", msg),
            ProbeError::DetachError(msg) => write!(f, "probe detach error: {}", msg),
            ProbeError::NotSupported => write!(f, "probes are not supported"),
        }
    }
}

impl std::error::Error for ProbeError {}

/// An attached probe. Detaching consumes the handle.
pub trait ProbeHandle: Send + Sync + fmt::Debug {
    fn kind(&self) -> ProbeKind;

    fn detach(self: Box<Self>) -> Result<(), ProbeError>;
}

/// Attaches kernel or user-space probes to a running process.
pub trait ProbeAttacher: Send + Sync {
    fn attach(&self, pid: u32, kind: ProbeKind) -> Result<Vec<Box<dyn ProbeHandle>>, ProbeError>;
}

/// A runtime-specific monitor (e.g. the .NET diagnostics client). It runs
/// until the token it was started with is cancelled.
pub trait RuntimeMonitor: Send + Sync + fmt::Debug {
    fn runtime(&self) -> &'static str;

    fn app_name(&self) -> &str;
}

pub trait RuntimeMonitorFactory: Send + Sync {
    fn start(&self, token: CancellationToken, pid: u32, app_name: &str) -> Box<dyn RuntimeMonitor>;
}

/// Read-only view of a process as exposed by the host.
pub trait ProcessHost: Send + Sync {
    /// Target of the process executable link. Fails once the process is gone.
    fn executable(&self, pid: u32) -> io::Result<PathBuf>;

    /// Raw NUL-separated command line.
    fn cmdline(&self, pid: u32) -> io::Result<Vec<u8>>;

    /// Paths of files mapped into the process address space.
    fn mapped_files(&self, pid: u32) -> io::Result<Vec<String>>;

    /// Whether the executable carries Go build information.
    fn is_go_binary(&self, pid: u32) -> io::Result<bool>;
}

/// An open network namespace handle. Dropping it closes the handle.
#[derive(Debug)]
pub struct NetNs {
    dev: u64,
    ino: u64,
    _handle: Option<std::fs::File>,
}

impl NetNs {
    pub fn new(dev: u64, ino: u64, handle: Option<std::fs::File>) -> Self {
        Self {
            dev,
            ino,
            _handle: handle,
        }
    }

    /// Identity stable across handles to the same namespace.
    pub fn unique_id(&self) -> String {
        format!("NS({}:{})", self.dev, self.ino)
    }
}

pub trait NamespaceResolver: Send + Sync {
    fn net_ns(&self, pid: u32) -> io::Result<NetNs>;
}

/// Accounting record of a process at discovery time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub started_at: SystemTime,
}

pub trait ProcessSnapshotSource: Send + Sync {
    fn snapshot(&self, pid: u32) -> io::Result<ProcessSnapshot>;
}

/// Probe backend used when nothing can be attached. Every attempt fails with
/// `NotSupported`, which the lifecycle manager logs and moves past.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProbeAttacher;

impl ProbeAttacher for NoopProbeAttacher {
    fn attach(&self, _pid: u32, _kind: ProbeKind) -> Result<Vec<Box<dyn ProbeHandle>>, ProbeError> {
        Err(ProbeError::NotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_ns_unique_id() {
        assert_eq!(NetNs::new(4, 4026531992, None).unique_id(), "NS(4:4026531992)");
    }

    #[test]
    fn test_probe_kind_names() {
        assert_eq!(ProbeKind::PythonThreadLock.to_string(), "python_thread_lock");
        assert_eq!(ProbeKind::GoTls.as_str(), "go_tls");
    }

    #[test]
    fn test_noop_attacher() {
        assert!(matches!(
            NoopProbeAttacher.attach(1, ProbeKind::OpenSsl),
            Err(ProbeError::NotSupported)
        ));
    }
}
