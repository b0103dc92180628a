//! flowtrace agent binary
//!
//! ```text
//! config ─► logging ─► metrics ─► filters ─► tracer registry
//!                                              │
//!            ┌─────────────────────────────────┘
//!            ▼
//!   every scan interval: /proc pids ─► ProcessTable::reconcile
//!   SIGINT / SIGTERM: close all processes, flush spans, exit
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use flowtrace::ebpf::EbpfProbeAttacher;
use flowtrace::process::{host_net_ns_id, Backoff, NoopProbeAttacher, ProbeAttacher, Procfs};
use flowtrace::{
    metrics, AgentConfig, FlowRouter, InstrumentationContext, ProcessTable, TracerRegistry,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> ExitCode {
    let config = match AgentConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("flowtrace: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = flowtrace::logging::init_logging(config.log_json) {
        eprintln!("flowtrace: failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }
    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AgentConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!(version = VERSION, "starting flowtrace agent");
    metrics::init();

    let shutdown = CancellationToken::new();
    if let Some(addr) = config.metrics_listen {
        let listener = metrics::bind(addr).await?;
        tokio::spawn(metrics::serve(listener, shutdown.child_token()));
    }

    let filter = Arc::new(config.destination_filter()?);
    let ports = config.port_filter()?;
    if let Some(p) = &ports {
        info!(from = p.from(), to = p.to(), "ephemeral port range");
    }
    let identity = config.identity(VERSION);
    info!(machine_id = %identity.machine_id, hostname = %identity.hostname, "agent identity");
    let registry = TracerRegistry::init(&config.traces_config(), identity)?;
    let router = FlowRouter::new(filter, ports, registry);

    let procfs = Arc::new(Procfs::default());
    info!(host_net_ns = %host_net_ns_id(&procfs), "host network namespace");
    let attacher: Arc<dyn ProbeAttacher> = match EbpfProbeAttacher::new(&config.probes_object()) {
        Some(a) => Arc::new(a),
        None => Arc::new(NoopProbeAttacher),
    };
    let ctx = InstrumentationContext {
        host: procfs.clone(),
        attacher,
        namespaces: procfs.clone(),
        monitors: None,
        backoff: Backoff::default(),
    };
    let mut table = ProcessTable::new(ctx, procfs.clone());

    let mut signals = ShutdownSignals::register()?;
    let mut ticker = interval(config.scan_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            signal = signals.recv() => {
                info!(signal, "shutdown requested");
                break;
            }
            _ = ticker.tick() => match procfs.list_pids() {
                Ok(pids) => table.reconcile(&pids),
                Err(e) => warn!(error = %e, "failed to list processes"),
            },
        }
    }

    info!(tracked = table.len(), "shutting down");
    shutdown.cancel();
    table.close_all();
    router.flush();
    Ok(())
}

/// Termination signals, registered once for the agent's lifetime.
struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignals {
    fn register() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Name of the next termination signal received.
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}
