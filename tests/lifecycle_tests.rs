//! Integration tests for the per-process instrumentation lifecycle
//!
//! The host, probe backend and namespace resolver are replaced with in-memory
//! fakes so every transition can be driven deterministically.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use flowtrace::process::{
    Backoff, InstrumentationContext, NamespaceResolver, NetNs, ProbeAttacher, ProbeError,
    ProbeHandle, ProbeKind, Process, ProcessHost, ProcessSnapshot, ProcessSnapshotSource,
    ProcessState, ProcessTable, RuntimeMonitor, RuntimeMonitorFactory,
};

// ─────────────────────────────────────────────────────────────────────────────
// Fakes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeHost {
    /// Successive executable lookups; the last entry repeats.
    exe: Mutex<VecDeque<Option<&'static str>>>,
    exe_calls: AtomicUsize,
    cmdline: Vec<u8>,
    maps: Vec<String>,
    go: bool,
}

impl FakeHost {
    fn new(exe: &[Option<&'static str>]) -> Self {
        Self {
            exe: Mutex::new(exe.iter().copied().collect()),
            ..Default::default()
        }
    }

    fn exe_calls(&self) -> usize {
        self.exe_calls.load(Ordering::SeqCst)
    }
}

impl ProcessHost for FakeHost {
    fn executable(&self, _pid: u32) -> io::Result<PathBuf> {
        self.exe_calls.fetch_add(1, Ordering::SeqCst);
        let mut exe = self.exe.lock().unwrap();
        let next = if exe.len() > 1 { exe.pop_front().unwrap() } else { exe[0] };
        next.map(PathBuf::from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such process"))
    }

    fn cmdline(&self, _pid: u32) -> io::Result<Vec<u8>> {
        Ok(self.cmdline.clone())
    }

    fn mapped_files(&self, _pid: u32) -> io::Result<Vec<String>> {
        Ok(self.maps.clone())
    }

    fn is_go_binary(&self, _pid: u32) -> io::Result<bool> {
        Ok(self.go)
    }
}

#[derive(Debug)]
struct FakeHandle {
    kind: ProbeKind,
    detached: Arc<AtomicUsize>,
    fail_detach: bool,
}

impl ProbeHandle for FakeHandle {
    fn kind(&self) -> ProbeKind {
        self.kind
    }

    fn detach(self: Box<Self>) -> Result<(), ProbeError> {
        self.detached.fetch_add(1, Ordering::SeqCst);
        if self.fail_detach {
            return Err(ProbeError::DetachError("link already gone".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeAttacher {
    attached: Mutex<Vec<(u32, ProbeKind)>>,
    detached: Arc<AtomicUsize>,
    fail_attach: bool,
    fail_detach: bool,
}

impl FakeAttacher {
    fn kinds(&self) -> Vec<ProbeKind> {
        self.attached.lock().unwrap().iter().map(|(_, k)| *k).collect()
    }

    fn detached(&self) -> usize {
        self.detached.load(Ordering::SeqCst)
    }
}

impl ProbeAttacher for FakeAttacher {
    fn attach(&self, pid: u32, kind: ProbeKind) -> Result<Vec<Box<dyn ProbeHandle>>, ProbeError> {
        self.attached.lock().unwrap().push((pid, kind));
        if self.fail_attach {
            return Err(ProbeError::AttachError("symbol not found".into()));
        }
        Ok(vec![Box::new(FakeHandle {
            kind,
            detached: Arc::clone(&self.detached),
            fail_detach: self.fail_detach,
        })])
    }
}

#[derive(Default)]
struct FakeNamespaces {
    calls: AtomicUsize,
    fail_first: bool,
}

impl NamespaceResolver for FakeNamespaces {
    fn net_ns(&self, _pid: u32) -> io::Result<NetNs> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_first && n == 0 {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        }
        Ok(NetNs::new(4, 4026531992, None))
    }
}

#[derive(Debug)]
struct FakeMonitor {
    app: String,
}

impl RuntimeMonitor for FakeMonitor {
    fn runtime(&self) -> &'static str {
        "dotnet"
    }

    fn app_name(&self) -> &str {
        &self.app
    }
}

#[derive(Default)]
struct FakeMonitors {
    tokens: Mutex<Vec<CancellationToken>>,
}

impl RuntimeMonitorFactory for FakeMonitors {
    fn start(
        &self,
        token: CancellationToken,
        _pid: u32,
        app_name: &str,
    ) -> Box<dyn RuntimeMonitor> {
        self.tokens.lock().unwrap().push(token);
        Box::new(FakeMonitor {
            app: app_name.to_string(),
        })
    }
}

fn context(
    host: &Arc<FakeHost>,
    attacher: &Arc<FakeAttacher>,
    namespaces: &Arc<FakeNamespaces>,
) -> InstrumentationContext {
    InstrumentationContext {
        host: host.clone(),
        attacher: attacher.clone(),
        namespaces: namespaces.clone(),
        monitors: None,
        backoff: Backoff::default(),
    }
}

fn snapshot(pid: u32) -> ProcessSnapshot {
    ProcessSnapshot {
        pid,
        started_at: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
    }
}

async fn wait_state(process: &Process, target: ProcessState) {
    let mut rx = process.state_changes();
    let reached = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == target)).await;
    assert!(matches!(reached, Ok(Ok(_))), "process never reached {:?}", target);
}

async fn wait_finished(process: &Process) {
    for _ in 0..1000 {
        if process.is_finished() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("instrumentation task did not exit");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

/// Test that a Python process gets interpreter lock probes exactly once
#[tokio::test]
async fn test_python_probes_attached_once() {
    let host = Arc::new(FakeHost {
        cmdline: b"/usr/bin/python3\0app.py\0".to_vec(),
        ..FakeHost::new(&[Some("/usr/bin/python3.11")])
    });
    let attacher = Arc::new(FakeAttacher::default());
    let namespaces = Arc::new(FakeNamespaces::default());
    let process = Process::spawn(snapshot(100), context(&host, &attacher, &namespaces));

    wait_state(&process, ProcessState::ProbesAttached).await;
    assert_eq!(attacher.kinds(), vec![ProbeKind::PythonThreadLock]);
    assert_eq!(process.attached_probes(), 1);

    process.instrument_python();
    assert_eq!(attacher.kinds().len(), 1);

    process.close();
    assert_eq!(process.state(), ProcessState::Closed);
    assert_eq!(process.attached_probes(), 0);
    assert_eq!(attacher.detached(), 1);
    wait_finished(&process).await;
}

/// Test that OpenSSL and Go TLS probes follow maps and build info
#[tokio::test]
async fn test_openssl_and_go_detection() {
    let host = Arc::new(FakeHost {
        cmdline: b"/srv/api\0".to_vec(),
        maps: vec!["/usr/lib/x86_64-linux-gnu/libssl.so.3".to_string()],
        go: true,
        ..FakeHost::new(&[Some("/srv/api")])
    });
    let attacher = Arc::new(FakeAttacher::default());
    let namespaces = Arc::new(FakeNamespaces::default());
    let process = Process::spawn(snapshot(7), context(&host, &attacher, &namespaces));

    wait_state(&process, ProcessState::ProbesAttached).await;
    assert_eq!(attacher.kinds(), vec![ProbeKind::OpenSsl, ProbeKind::GoTls]);
    assert_eq!(process.attached_probes(), 2);

    drop(process);
    assert_eq!(attacher.detached(), 2);
}

/// Test that a process that vanished before its executable resolved ends quietly
#[tokio::test]
async fn test_unresolvable_executable() {
    let host = Arc::new(FakeHost::new(&[None]));
    let attacher = Arc::new(FakeAttacher::default());
    let namespaces = Arc::new(FakeNamespaces::default());
    let process = Process::spawn(snapshot(9), context(&host, &attacher, &namespaces));

    wait_state(&process, ProcessState::Unresolvable).await;
    wait_finished(&process).await;
    assert!(attacher.kinds().is_empty());
    assert_eq!(host.exe_calls(), 1);
}

/// Test that closing during a backoff wait stops the task without further attempts
#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff() {
    let host = Arc::new(FakeHost {
        cmdline: b"python3\0".to_vec(),
        ..FakeHost::new(&[Some("")])
    });
    let attacher = Arc::new(FakeAttacher::default());
    let namespaces = Arc::new(FakeNamespaces::default());
    let process = Process::spawn(snapshot(11), context(&host, &attacher, &namespaces));

    // lookups at t=0, 1, 3, 7 (backoff 1s, 2s, 4s)
    tokio::time::sleep(Duration::from_secs(10)).await;
    let calls = host.exe_calls();
    assert!((3..=4).contains(&calls), "unexpected lookup count {}", calls);
    assert_eq!(process.state(), ProcessState::ProbingExecutable);

    process.close();
    wait_finished(&process).await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(host.exe_calls(), calls);
    assert!(attacher.kinds().is_empty());
    assert_eq!(process.state(), ProcessState::Closed);
}

/// Test that the executable is retried until it resolves
#[tokio::test(start_paused = true)]
async fn test_executable_resolves_after_retries() {
    let host = Arc::new(FakeHost {
        cmdline: b"python\0".to_vec(),
        ..FakeHost::new(&[Some(""), Some("/"), Some("/usr/bin/python")])
    });
    let attacher = Arc::new(FakeAttacher::default());
    let namespaces = Arc::new(FakeNamespaces::default());
    let process = Process::spawn(snapshot(12), context(&host, &attacher, &namespaces));

    wait_state(&process, ProcessState::ProbesAttached).await;
    assert_eq!(host.exe_calls(), 3);
    assert_eq!(attacher.kinds(), vec![ProbeKind::PythonThreadLock]);
}

/// Test that a failed attach is not retried and does not block the lifecycle
#[tokio::test]
async fn test_attach_failure_is_not_retried() {
    let host = Arc::new(FakeHost {
        cmdline: b"python3\0".to_vec(),
        ..FakeHost::new(&[Some("/usr/bin/python3")])
    });
    let attacher = Arc::new(FakeAttacher {
        fail_attach: true,
        ..Default::default()
    });
    let namespaces = Arc::new(FakeNamespaces::default());
    let process = Process::spawn(snapshot(13), context(&host, &attacher, &namespaces));

    wait_state(&process, ProcessState::ProbesAttached).await;
    process.instrument_python();
    assert_eq!(attacher.kinds(), vec![ProbeKind::PythonThreadLock]);
    assert_eq!(process.attached_probes(), 0);
}

/// Test that detach failures are tolerated on close
#[tokio::test]
async fn test_detach_failure_tolerated() {
    let host = Arc::new(FakeHost {
        cmdline: b"python3\0".to_vec(),
        maps: vec!["/lib/libssl.so.1.1".to_string()],
        ..FakeHost::new(&[Some("/usr/bin/python3")])
    });
    let attacher = Arc::new(FakeAttacher {
        fail_detach: true,
        ..Default::default()
    });
    let namespaces = Arc::new(FakeNamespaces::default());
    let process = Process::spawn(snapshot(14), context(&host, &attacher, &namespaces));

    wait_state(&process, ProcessState::ProbesAttached).await;
    process.close();
    process.close();
    assert_eq!(attacher.detached(), 2);
    assert_eq!(process.state(), ProcessState::Closed);
}

/// Test that probe checks after close do nothing
#[tokio::test]
async fn test_no_attach_after_close() {
    let host = Arc::new(FakeHost {
        cmdline: b"python3\0".to_vec(),
        ..FakeHost::new(&[None])
    });
    let attacher = Arc::new(FakeAttacher::default());
    let namespaces = Arc::new(FakeNamespaces::default());
    let process = Process::spawn(snapshot(15), context(&host, &attacher, &namespaces));

    process.close();
    process.instrument_python();
    process.instrument_openssl();
    process.instrument_go_tls();
    assert!(attacher.kinds().is_empty());
}

/// Test namespace id caching: failures are not cached, successes are
#[tokio::test]
async fn test_net_ns_id_cached_after_success() {
    let host = Arc::new(FakeHost::new(&[None]));
    let attacher = Arc::new(FakeAttacher::default());
    let namespaces = Arc::new(FakeNamespaces {
        fail_first: true,
        ..Default::default()
    });
    let process = Process::spawn(snapshot(16), context(&host, &attacher, &namespaces));

    assert_eq!(process.net_ns_id(), "");
    assert_eq!(process.net_ns_id(), "NS(4:4026531992)");
    assert_eq!(process.net_ns_id(), "NS(4:4026531992)");
    assert_eq!(namespaces.calls.load(Ordering::SeqCst), 2);
    assert!(process.is_host_ns("NS(4:4026531992)"));
    assert!(!process.is_host_ns("NS(4:1)"));
}

/// Test that a .NET process starts a runtime monitor scoped to the process
#[tokio::test]
async fn test_dotnet_runtime_monitor() {
    let host = Arc::new(FakeHost {
        cmdline: b"dotnet\0/app/Orders.Api.dll\0".to_vec(),
        maps: vec![
            "/usr/share/dotnet/shared/Microsoft.NETCore.App/8.0.0/libcoreclr.so".to_string(),
        ],
        ..FakeHost::new(&[Some("/usr/share/dotnet/dotnet")])
    });
    let attacher = Arc::new(FakeAttacher::default());
    let namespaces = Arc::new(FakeNamespaces::default());
    let monitors = Arc::new(FakeMonitors::default());
    let mut ctx = context(&host, &attacher, &namespaces);
    ctx.monitors = Some(monitors.clone());
    let process = Process::spawn(snapshot(17), ctx);

    wait_state(&process, ProcessState::ProbesAttached).await;
    assert_eq!(process.runtime_app_name().as_deref(), Some("Orders.Api"));
    let token = monitors.tokens.lock().unwrap()[0].clone();
    assert!(!token.is_cancelled());

    process.close();
    assert!(token.is_cancelled());
    assert_eq!(process.runtime_app_name(), None);
}

// ─────────────────────────────────────────────────────────────────────────────
// Process table
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeSnapshots {
    started: Mutex<HashMap<u32, u64>>,
}

impl ProcessSnapshotSource for FakeSnapshots {
    fn snapshot(&self, pid: u32) -> io::Result<ProcessSnapshot> {
        match self.started.lock().unwrap().get(&pid) {
            Some(secs) => Ok(ProcessSnapshot {
                pid,
                started_at: UNIX_EPOCH + Duration::from_secs(*secs),
            }),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "gone")),
        }
    }
}

/// Test that reconcile spawns, closes and replaces processes
#[tokio::test]
async fn test_process_table_reconcile() {
    let host = Arc::new(FakeHost {
        cmdline: b"python3\0".to_vec(),
        ..FakeHost::new(&[Some("/usr/bin/python3")])
    });
    let attacher = Arc::new(FakeAttacher::default());
    let namespaces = Arc::new(FakeNamespaces::default());
    let snapshots = Arc::new(FakeSnapshots::default());
    snapshots.started.lock().unwrap().extend([(1, 100), (2, 200)]);
    let mut table = ProcessTable::new(context(&host, &attacher, &namespaces), snapshots.clone());

    table.reconcile(&[1, 2, 3]);
    assert_eq!(table.len(), 2, "pid 3 has no snapshot");
    wait_state(table.get(1).unwrap(), ProcessState::ProbesAttached).await;
    wait_state(table.get(2).unwrap(), ProcessState::ProbesAttached).await;

    table.reconcile(&[2]);
    assert_eq!(table.len(), 1);
    assert!(table.get(1).is_none());
    assert_eq!(attacher.detached(), 1);

    // pid 2 reused by a new process
    snapshots.started.lock().unwrap().insert(2, 250);
    table.reconcile(&[2]);
    assert_eq!(table.len(), 1);
    assert_eq!(attacher.detached(), 2);
    let replaced = table.get(2).unwrap();
    assert_eq!(replaced.started_at, UNIX_EPOCH + Duration::from_secs(250));
    wait_state(replaced, ProcessState::ProbesAttached).await;

    table.close_all();
    assert!(table.is_empty());
    assert_eq!(attacher.detached(), 3);
}
