//! Set of tracked processes, reconciled against the host process list

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::host::ProcessSnapshotSource;
use super::lifecycle::{InstrumentationContext, Process};

/// Tracks one `Process` per live pid.
pub struct ProcessTable {
    ctx: InstrumentationContext,
    snapshots: Arc<dyn ProcessSnapshotSource>,
    processes: HashMap<u32, Process>,
}

impl ProcessTable {
    pub fn new(ctx: InstrumentationContext, snapshots: Arc<dyn ProcessSnapshotSource>) -> Self {
        Self {
            ctx,
            snapshots,
            processes: HashMap::new(),
        }
    }

    /// Bring the table in line with the pids currently alive.
    ///
    /// New pids are spawned, vanished ones closed. A pid whose start time
    /// changed was reused by a new process and is replaced. Pids whose
    /// snapshot cannot be read are left alone until the next pass.
    pub fn reconcile(&mut self, live: &[u32]) {
        let before = self.processes.len();
        self.processes.retain(|pid, process| {
            let keep = live.contains(pid);
            if !keep {
                process.close();
            }
            keep
        });
        let removed = before - self.processes.len();

        let mut started = 0;
        for &pid in live {
            let snapshot = match self.snapshots.snapshot(pid) {
                Ok(s) => s,
                Err(e) => {
                    debug!(pid, error = %e, "failed to read process snapshot");
                    continue;
                }
            };
            if let Some(existing) = self.processes.get(&pid) {
                if existing.started_at == snapshot.started_at {
                    continue;
                }
                debug!(pid, "pid reused, replacing process");
                if let Some(old) = self.processes.remove(&pid) {
                    old.close();
                }
            }
            self.processes.insert(pid, Process::spawn(snapshot, self.ctx.clone()));
            started += 1;
        }

        if started > 0 || removed > 0 {
            info!(started, removed, tracked = self.processes.len(), "process table reconciled");
        }
    }

    pub fn get(&self, pid: u32) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Close every tracked process.
    pub fn close_all(&mut self) {
        for (_, process) in self.processes.drain() {
            process.close();
        }
    }
}

impl Drop for ProcessTable {
    fn drop(&mut self) {
        self.close_all();
    }
}
