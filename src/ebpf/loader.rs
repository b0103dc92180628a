//! aya-backed probe attacher
//!
//! The probes object is loaded once; every program is loaded into the kernel
//! up front and then attached per process on demand.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use aya::programs::uprobe::UProbeLinkId;
use aya::programs::{ProgramError, UProbe};
use aya::Bpf;
use tracing::{info, warn};

use super::{probe_specs, program_names, ProbeSpec};
use crate::process::{ProbeAttacher, ProbeError, ProbeHandle, ProbeKind};

/// Attaches uprobes from a loaded probes object.
pub struct EbpfProbeAttacher {
    bpf: Arc<Mutex<Bpf>>,
}

impl fmt::Debug for EbpfProbeAttacher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EbpfProbeAttacher").finish_non_exhaustive()
    }
}

fn lock(bpf: &Mutex<Bpf>) -> MutexGuard<'_, Bpf> {
    match bpf.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn uprobe<'a>(bpf: &'a mut Bpf, program: &str) -> Result<&'a mut UProbe, ProbeError> {
    bpf.program_mut(program)
        .ok_or_else(|| ProbeError::AttachError(format!("{} program not found", program)))?
        .try_into()
        .map_err(|e: ProgramError| ProbeError::AttachError(format!("{}: {}", program, e)))
}

fn detach_link(bpf: &mut Bpf, program: &str, link: UProbeLinkId) -> Result<(), ProbeError> {
    let probe = uprobe(bpf, program).map_err(|e| ProbeError::DetachError(e.to_string()))?;
    probe
        .detach(link)
        .map_err(|e| ProbeError::DetachError(format!("{}: {}", program, e)))
}

impl EbpfProbeAttacher {
    /// Load the probes object.
    ///
    /// Returns `None` if the object cannot be loaded (graceful degradation).
    pub fn new(object: &Path) -> Option<Self> {
        match Self::try_new(object) {
            Ok(attacher) => {
                info!(object = %object.display(), "eBPF probes loaded");
                Some(attacher)
            }
            Err(e) => {
                warn!(error = %e, "failed to load eBPF probes, continuing without them");
                None
            }
        }
    }

    fn try_new(object: &Path) -> Result<Self, ProbeError> {
        let mut bpf = Bpf::load_file(object)
            .map_err(|e| ProbeError::LoadError(format!("{}: {}", object.display(), e)))?;
        for name in program_names() {
            let program: &mut UProbe = match bpf.program_mut(name) {
                Some(p) => p
                    .try_into()
                    .map_err(|e: ProgramError| ProbeError::LoadError(format!("{}: {}", name, e)))?,
                None => {
                    warn!(program = name, "program missing from probes object");
                    continue;
                }
            };
            program
                .load()
                .map_err(|e| ProbeError::LoadError(format!("{}: {}", name, e)))?;
        }
        Ok(Self {
            bpf: Arc::new(Mutex::new(bpf)),
        })
    }

    fn attach_spec(bpf: &mut Bpf, spec: &ProbeSpec, pid: u32) -> Result<UProbeLinkId, ProbeError> {
        uprobe(bpf, spec.program)?
            .attach(Some(spec.symbol), 0, spec.target.path(pid), Some(pid as libc::pid_t))
            .map_err(|e| {
                ProbeError::AttachError(format!("{} -> {}: {}", spec.program, spec.symbol, e))
            })
    }
}

impl ProbeAttacher for EbpfProbeAttacher {
    /// All programs of a kind are attached, or none are.
    fn attach(&self, pid: u32, kind: ProbeKind) -> Result<Vec<Box<dyn ProbeHandle>>, ProbeError> {
        let mut bpf = lock(&self.bpf);
        let mut links: Vec<(&'static str, UProbeLinkId)> = Vec::new();
        for spec in probe_specs(kind) {
            match Self::attach_spec(&mut bpf, spec, pid) {
                Ok(link) => links.push((spec.program, link)),
                Err(e) => {
                    for (program, link) in links {
                        if let Err(e) = detach_link(&mut bpf, program, link) {
                            warn!(pid, error = %e, "failed to roll back probe");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(links
            .into_iter()
            .map(|(program, link)| {
                Box::new(EbpfProbeHandle {
                    bpf: Arc::clone(&self.bpf),
                    kind,
                    program,
                    link,
                }) as Box<dyn ProbeHandle>
            })
            .collect())
    }
}

/// One attached uprobe link.
pub struct EbpfProbeHandle {
    bpf: Arc<Mutex<Bpf>>,
    kind: ProbeKind,
    program: &'static str,
    link: UProbeLinkId,
}

impl fmt::Debug for EbpfProbeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EbpfProbeHandle")
            .field("kind", &self.kind)
            .field("program", &self.program)
            .finish()
    }
}

impl ProbeHandle for EbpfProbeHandle {
    fn kind(&self) -> ProbeKind {
        self.kind
    }

    fn detach(self: Box<Self>) -> Result<(), ProbeError> {
        let EbpfProbeHandle {
            bpf, program, link, ..
        } = *self;
        let mut guard = lock(&bpf);
        detach_link(&mut guard, program, link)
    }
}
