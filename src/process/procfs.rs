//! `/proc`-backed host capabilities
//!
//! ```text
//! /proc/<pid>/exe      → executable link      (ProcessHost::executable)
//! /proc/<pid>/cmdline  → NUL-separated argv   (ProcessHost::cmdline)
//! /proc/<pid>/maps     → mapped libraries     (ProcessHost::mapped_files)
//! /proc/<pid>/ns/net   → namespace identity   (NamespaceResolver)
//! /proc/<pid>/stat     → start time           (ProcessSnapshotSource)
//! ```

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};

use nix::unistd::{sysconf, SysconfVar};

use super::host::{NamespaceResolver, NetNs, ProcessHost, ProcessSnapshot, ProcessSnapshotSource};

/// Marker the Go linker places at the start of the `.go.buildinfo` section.
const GO_BUILDINFO_MAGIC: &[u8] = b"\xff Go buildinf:";

const SCAN_CHUNK: usize = 64 * 1024;

/// Host capabilities read from a procfs mount.
#[derive(Debug, Clone)]
pub struct Procfs {
    root: PathBuf,
    clock_ticks: u64,
}

impl Default for Procfs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl Procfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let clock_ticks = match sysconf(SysconfVar::CLK_TCK) {
            Ok(Some(t)) if t > 0 => t as u64,
            _ => 100,
        };
        Self {
            root: root.into(),
            clock_ticks,
        }
    }

    pub fn path(&self, pid: u32, name: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(name)
    }

    /// Pids of all processes currently visible.
    pub fn list_pids(&self) -> io::Result<Vec<u32>> {
        let mut pids: Vec<u32> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    fn boot_time(&self) -> io::Result<u64> {
        let stat = fs::read_to_string(self.root.join("stat"))?;
        stat.lines()
            .find_map(|line| line.strip_prefix("btime "))
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "btime not found"))
    }
}

/// Field 22 of `/proc/<pid>/stat` (start time in clock ticks since boot).
/// The command name may contain spaces and parentheses, so fields are counted
/// from the last `)`.
fn parse_start_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    // rest starts at field 3 (state); starttime is field 22
    rest.split_whitespace().nth(19)?.parse().ok()
}

fn parse_mapped_files(maps: &str) -> Vec<String> {
    let files: BTreeSet<String> = maps
        .lines()
        .filter_map(|line| line.split_whitespace().nth(5))
        .filter(|path| path.starts_with('/'))
        .map(str::to_string)
        .collect();
    files.into_iter().collect()
}

fn contains_magic(mut reader: impl Read, magic: &[u8]) -> io::Result<bool> {
    let mut buf = vec![0u8; SCAN_CHUNK + magic.len()];
    let mut carried = 0;
    loop {
        let n = reader.read(&mut buf[carried..])?;
        if n == 0 {
            return Ok(false);
        }
        let filled = carried + n;
        if buf[..filled].windows(magic.len()).any(|w| w == magic) {
            return Ok(true);
        }
        carried = (magic.len() - 1).min(filled);
        buf.copy_within(filled - carried..filled, 0);
    }
}

impl ProcessHost for Procfs {
    fn executable(&self, pid: u32) -> io::Result<PathBuf> {
        fs::read_link(self.path(pid, "exe"))
    }

    fn cmdline(&self, pid: u32) -> io::Result<Vec<u8>> {
        fs::read(self.path(pid, "cmdline"))
    }

    fn mapped_files(&self, pid: u32) -> io::Result<Vec<String>> {
        Ok(parse_mapped_files(&fs::read_to_string(self.path(pid, "maps"))?))
    }

    fn is_go_binary(&self, pid: u32) -> io::Result<bool> {
        contains_magic(File::open(self.path(pid, "exe"))?, GO_BUILDINFO_MAGIC)
    }
}

impl NamespaceResolver for Procfs {
    fn net_ns(&self, pid: u32) -> io::Result<NetNs> {
        let file = File::open(self.path(pid, "ns/net"))?;
        let meta = file.metadata()?;
        Ok(NetNs::new(meta.dev(), meta.ino(), Some(file)))
    }
}

impl ProcessSnapshotSource for Procfs {
    fn snapshot(&self, pid: u32) -> io::Result<ProcessSnapshot> {
        let stat = fs::read_to_string(self.path(pid, "stat"))?;
        let ticks = parse_start_ticks(&stat)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed stat"))?;
        let since_boot = Duration::from_millis(ticks.saturating_mul(1000) / self.clock_ticks);
        let started_at = UNIX_EPOCH + Duration::from_secs(self.boot_time()?) + since_boot;
        Ok(ProcessSnapshot { pid, started_at })
    }
}

/// Namespace identity of the agent's own network namespace.
pub fn host_net_ns_id(procfs: &Procfs) -> String {
    match fs::metadata(procfs.root.join("self/ns/net")) {
        Ok(meta) => NetNs::new(meta.dev(), meta.ino(), None).unique_id(),
        Err(_) => String::new(),
    }
}
