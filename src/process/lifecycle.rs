//! Per-process instrumentation lifecycle
//!
//! Each tracked process owns one background task:
//!
//! ```text
//! Discovered ──► ProbingExecutable ──┬──► ProbesAttached ──┐
//!                   ▲        │       │                      ├──► Closed
//!                   └─backoff┘       └──► Unresolvable ─────┘
//! ```
//!
//! The task polls the executable link until it resolves (the image may not
//! be visible yet right after exec), waiting with exponential backoff between
//! attempts. Every wait races against the process cancellation token, so a
//! `close()` interrupts it immediately. Once resolved, runtime detection runs
//! and each probe kind is attached at most once.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::host::{
    NamespaceResolver, ProbeAttacher, ProbeHandle, ProbeKind, ProcessHost, ProcessSnapshot,
    RuntimeMonitor, RuntimeMonitorFactory,
};
use super::runtime::{dotnet_app_name, is_python_cmdline, uses_openssl};
use crate::metrics::{
    EXECUTABLE_RETRIES, PROBES_ATTACHED, PROBE_ERRORS, RUNTIME_MONITORS, TRACKED_PROCESSES,
};

/// Lifecycle state of a tracked process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Created, task not yet running
    Discovered,
    /// Waiting for the executable link to resolve
    ProbingExecutable,
    /// Runtime detection finished
    ProbesAttached,
    /// The process went away before its executable resolved
    Unresolvable,
    /// Cancelled and probes released
    Closed,
}

/// Host capabilities shared by every process task.
#[derive(Clone)]
pub struct InstrumentationContext {
    pub host: Arc<dyn ProcessHost>,
    pub attacher: Arc<dyn ProbeAttacher>,
    pub namespaces: Arc<dyn NamespaceResolver>,
    pub monitors: Option<Arc<dyn RuntimeMonitorFactory>>,
    pub backoff: Backoff,
}

#[derive(Default)]
struct ProbeSet {
    handles: Vec<Box<dyn ProbeHandle>>,
    python_gil_checked: bool,
    openssl_checked: bool,
    go_tls_checked: bool,
    managed_runtime_checked: bool,
    monitor: Option<Box<dyn RuntimeMonitor>>,
    closed: bool,
}

struct Inner {
    pid: u32,
    ctx: InstrumentationContext,
    token: CancellationToken,
    probes: Mutex<ProbeSet>,
    net_ns_id: Mutex<Option<String>>,
    state: watch::Sender<ProcessState>,
}

/// A live process under observation.
pub struct Process {
    pub pid: u32,
    pub started_at: SystemTime,
    inner: Arc<Inner>,
    state_rx: watch::Receiver<ProcessState>,
    task: JoinHandle<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Process {
    /// Start tracking a process. Must be called within a tokio runtime.
    pub fn spawn(snapshot: ProcessSnapshot, ctx: InstrumentationContext) -> Self {
        let (state_tx, state_rx) = watch::channel(ProcessState::Discovered);
        let inner = Arc::new(Inner {
            pid: snapshot.pid,
            ctx,
            token: CancellationToken::new(),
            probes: Mutex::new(ProbeSet::default()),
            net_ns_id: Mutex::new(None),
            state: state_tx,
        });
        let task = tokio::spawn(instrument(Arc::clone(&inner)));
        TRACKED_PROCESSES.inc();
        Self {
            pid: snapshot.pid,
            started_at: snapshot.started_at,
            inner,
            state_rx,
            task,
        }
    }

    pub fn state(&self) -> ProcessState {
        *self.state_rx.borrow()
    }

    /// Whether the instrumentation task has returned.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Receiver for lifecycle state changes.
    pub fn state_changes(&self) -> watch::Receiver<ProcessState> {
        self.state_rx.clone()
    }

    /// Token cancelled when the process is closed.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Network namespace identity, resolved on first use and cached.
    /// Resolution failures yield an empty string and are retried next time.
    pub fn net_ns_id(&self) -> String {
        let mut cached = lock(&self.inner.net_ns_id);
        if let Some(id) = cached.as_ref() {
            return id.clone();
        }
        match self.inner.ctx.namespaces.net_ns(self.pid) {
            Ok(ns) => {
                let id = ns.unique_id();
                *cached = Some(id.clone());
                id
            }
            Err(e) => {
                debug!(pid = self.pid, error = %e, "failed to resolve network namespace");
                String::new()
            }
        }
    }

    pub fn is_host_ns(&self, host_ns_id: &str) -> bool {
        let id = self.net_ns_id();
        !id.is_empty() && id == host_ns_id
    }

    /// Number of currently attached probe handles.
    pub fn attached_probes(&self) -> usize {
        lock(&self.inner.probes).handles.len()
    }

    /// Name of the managed application, if a runtime monitor was started.
    pub fn runtime_app_name(&self) -> Option<String> {
        lock(&self.inner.probes)
            .monitor
            .as_ref()
            .map(|m| m.app_name().to_string())
    }

    /// Attach interpreter lock probes if this is a Python process.
    pub fn instrument_python(&self) {
        self.inner.instrument_python();
    }

    /// Attach OpenSSL probes if libssl is mapped.
    pub fn instrument_openssl(&self) {
        self.inner.instrument_openssl();
    }

    /// Attach Go TLS probes if the executable is a Go binary.
    pub fn instrument_go_tls(&self) {
        self.inner.instrument_go_tls();
    }

    /// Cancel the instrumentation task and release every attached probe.
    /// Release failures are logged and skipped. Safe to call more than once.
    pub fn close(&self) {
        let first = !self.inner.token.is_cancelled();
        self.inner.token.cancel();
        let (handles, monitor) = {
            let mut probes = lock(&self.inner.probes);
            probes.closed = true;
            (std::mem::take(&mut probes.handles), probes.monitor.take())
        };
        release(self.pid, handles);
        drop(monitor);
        self.inner.state.send_replace(ProcessState::Closed);
        if first {
            TRACKED_PROCESSES.dec();
            debug!(pid = self.pid, "process closed");
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .field("state", &self.state())
            .field("attached_probes", &self.attached_probes())
            .finish()
    }
}

fn release(pid: u32, handles: Vec<Box<dyn ProbeHandle>>) {
    for handle in handles {
        let kind = handle.kind();
        if let Err(e) = handle.detach() {
            PROBE_ERRORS.with_label_values(&[kind.as_str(), "detach"]).inc();
            warn!(pid, probe = %kind, error = %e, "failed to detach probe");
        }
    }
}

async fn instrument(inner: Arc<Inner>) {
    let mut backoff = inner.ctx.backoff.clone();
    inner.set_state(ProcessState::ProbingExecutable);
    loop {
        if inner.token.is_cancelled() {
            return;
        }
        match inner.ctx.host.executable(inner.pid) {
            Err(e) => {
                // exited before we got to it; expected, not an error
                debug!(pid = inner.pid, error = %e, "executable not resolvable, giving up");
                inner.set_state(ProcessState::Unresolvable);
                return;
            }
            Ok(exe) if is_resolved(&exe) => {
                inner.detect_runtimes(&exe);
                inner.set_state(ProcessState::ProbesAttached);
                return;
            }
            Ok(_) => {}
        }
        let delay = backoff.next_delay();
        EXECUTABLE_RETRIES.inc();
        tokio::select! {
            _ = inner.token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn is_resolved(exe: &Path) -> bool {
    !exe.as_os_str().is_empty() && exe != Path::new("/")
}

impl Inner {
    fn set_state(&self, next: ProcessState) {
        self.state.send_if_modified(|state| {
            if *state == ProcessState::Closed || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    fn detect_runtimes(&self, exe: &Path) {
        self.instrument_python();
        self.instrument_openssl();
        self.instrument_go_tls();
        self.start_runtime_monitor(exe);
    }

    /// Flip a checked flag. Returns false if this kind was already checked or
    /// the process is closing.
    fn claim(&self, flag: impl FnOnce(&mut ProbeSet) -> &mut bool) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        let mut probes = lock(&self.probes);
        if probes.closed {
            return false;
        }
        let checked = flag(&mut *probes);
        if *checked {
            return false;
        }
        *checked = true;
        true
    }

    fn instrument_python(&self) {
        if !self.claim(|p| &mut p.python_gil_checked) {
            return;
        }
        let cmdline = match self.ctx.host.cmdline(self.pid) {
            Ok(c) => c,
            Err(_) => return,
        };
        if is_python_cmdline(&cmdline) {
            self.attach(ProbeKind::PythonThreadLock);
        }
    }

    fn instrument_openssl(&self) {
        if !self.claim(|p| &mut p.openssl_checked) {
            return;
        }
        if let Ok(maps) = self.ctx.host.mapped_files(self.pid) {
            if uses_openssl(&maps) {
                self.attach(ProbeKind::OpenSsl);
            }
        }
    }

    fn instrument_go_tls(&self) {
        if !self.claim(|p| &mut p.go_tls_checked) {
            return;
        }
        if let Ok(true) = self.ctx.host.is_go_binary(self.pid) {
            self.attach(ProbeKind::GoTls);
        }
    }

    fn start_runtime_monitor(&self, exe: &Path) {
        let factory = match &self.ctx.monitors {
            Some(f) => Arc::clone(f),
            None => return,
        };
        if !self.claim(|p| &mut p.managed_runtime_checked) {
            return;
        }
        let (maps, cmdline) = match (
            self.ctx.host.mapped_files(self.pid),
            self.ctx.host.cmdline(self.pid),
        ) {
            (Ok(m), Ok(c)) => (m, c),
            _ => return,
        };
        let app = match dotnet_app_name(&maps, &cmdline, exe) {
            Some(app) => app,
            None => return,
        };
        let monitor = factory.start(self.token.child_token(), self.pid, &app);
        RUNTIME_MONITORS.with_label_values(&[monitor.runtime()]).inc();
        info!(pid = self.pid, app = %app, runtime = monitor.runtime(), "runtime monitor started");
        let mut probes = lock(&self.probes);
        if !probes.closed {
            probes.monitor = Some(monitor);
        }
    }

    fn attach(&self, kind: ProbeKind) {
        match self.ctx.attacher.attach(self.pid, kind) {
            Ok(handles) => {
                PROBES_ATTACHED
                    .with_label_values(&[kind.as_str()])
                    .inc_by(handles.len() as f64);
                debug!(pid = self.pid, probe = %kind, count = handles.len(), "probes attached");
                let mut probes = lock(&self.probes);
                if probes.closed {
                    // closed while attaching: nothing will release these later
                    drop(probes);
                    release(self.pid, handles);
                    return;
                }
                probes.handles.extend(handles);
            }
            Err(e) => {
                PROBE_ERRORS.with_label_values(&[kind.as_str(), "attach"]).inc();
                warn!(pid = self.pid, probe = %kind, error = %e, "failed to attach probes");
            }
        }
    }
}
