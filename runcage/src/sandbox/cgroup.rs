//! cgroup v2 resource cage.
//!
//! One handle owns one directory under `/sys/fs/cgroup`. The supervisor
//! creates it, applies the configured limits, and holds an O_PATH
//! descriptor of the directory that `clone3` consumes via
//! `CLONE_INTO_CGROUP` — the kernel places the jailer into the cage
//! atomically with its creation, so there is no window in which the child
//! runs outside it.
//!
//! Control files behave asymmetrically on purpose:
//! - a *known* control that is absent on this kernel is skipped silently
//!   (older kernels, controller not enabled in the parent);
//! - an *unknown* name that nevertheless exists is an error — writing it
//!   would do something we never meant to do.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::config::{CgroupLimits, CpuLimits};
use runcage_shared::{RuncageError, RuncageResult};

/// Mount point of the unified hierarchy.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Control files this module knows how to write.
const KNOWN_CONTROLS: &[&str] = &[
    "cpu.weight",
    "cpu.max",
    "memory.max",
    "memory.oom.group",
    "memory.swap.max",
    "memory.zswap.max",
    "pids.max",
    "cgroup.max.depth",
    "cgroup.max.descendants",
    "cgroup.procs",
    "cgroup.kill",
    "cgroup.subtree_control",
];

/// Tag emitted when the pids controller counted a denied fork.
pub const PIDS_VIOLATION: &str = "maximum pids restriction violated";

/// Tag emitted when the memory controller killed or OOMed the group.
pub const MEMORY_VIOLATION: &str = "memory restriction violated";

pub struct CgroupV2 {
    path: PathBuf,
    controls: HashSet<String>,
    dir_fd: Option<File>,
}

impl CgroupV2 {
    /// Create `/sys/fs/cgroup/<name>`. Fails if the directory already
    /// exists or if `cgroup.controllers` turns out empty.
    pub fn create(name: &str) -> RuncageResult<Self> {
        Self::create_under(Path::new(CGROUP_ROOT), name)
    }

    fn create_under(root: &Path, name: &str) -> RuncageResult<Self> {
        let path = root.join(name);

        fs::DirBuilder::new()
            .mode(0o744)
            .create(&path)
            .map_err(|e| {
                RuncageError::Cgroup(format!(
                    "failed to create cgroup {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let controls = read_controllers(&path)?;
        if controls.is_empty() {
            return Err(RuncageError::Cgroup("no controllers available".into()));
        }

        tracing::debug!(
            path = %path.display(),
            controllers = ?controls,
            "cgroup created"
        );

        Ok(CgroupV2 {
            path,
            controls,
            dir_fd: None,
        })
    }

    #[cfg(test)]
    fn with_path(path: PathBuf, controls: &[&str]) -> Self {
        CgroupV2 {
            path,
            controls: controls.iter().map(|c| c.to_string()).collect(),
            dir_fd: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply every configured limit. Zero and empty values are no-ops.
    /// Swap is always disabled, whether or not a memory cap is configured,
    /// so no cage can page its way past the accounting.
    pub fn apply(&self, limits: &CgroupLimits) -> RuncageResult<()> {
        self.set_cpu(&limits.cpu)?;
        self.set_max_memory(&limits.max_memory)?;
        self.set_max_pids(limits.max_pids)?;
        self.set_max_depth(limits.max_depth)?;
        self.set_max_descendants(limits.max_descendants)?;
        self.disable_swap()
    }

    pub fn set_cpu(&self, cpu: &CpuLimits) -> RuncageResult<()> {
        if cpu.weight > 0 {
            self.write_control("cpu.weight", &cpu.weight.to_string())?;
        }
        if cpu.time > 0 && cpu.period > 0 {
            self.write_control("cpu.max", &format!("{} {}", cpu.time, cpu.period))?;
        }
        Ok(())
    }

    /// Set `memory.max` and make an OOM reap the whole group atomically.
    pub fn set_max_memory(&self, limit: &str) -> RuncageResult<()> {
        if limit.is_empty() {
            return Ok(());
        }
        self.write_control("memory.max", limit)?;
        self.write_control("memory.oom.group", "1")
    }

    pub fn set_max_pids(&self, limit: u64) -> RuncageResult<()> {
        if limit > 0 {
            self.write_control("pids.max", &limit.to_string())?;
        }
        Ok(())
    }

    pub fn set_max_depth(&self, limit: u64) -> RuncageResult<()> {
        if limit > 0 {
            self.write_control("cgroup.max.depth", &limit.to_string())?;
        }
        Ok(())
    }

    pub fn set_max_descendants(&self, limit: u64) -> RuncageResult<()> {
        if limit > 0 {
            self.write_control("cgroup.max.descendants", &limit.to_string())?;
        }
        Ok(())
    }

    pub fn disable_swap(&self) -> RuncageResult<()> {
        self.write_control("memory.swap.max", "0")?;
        self.write_control("memory.zswap.max", "0")
    }

    pub fn add_pid(&self, pid: i32) -> RuncageResult<()> {
        self.write_control("cgroup.procs", &pid.to_string())
    }

    /// Kill every process in the cage.
    pub fn kill_all(&self) -> RuncageResult<()> {
        self.write_control("cgroup.kill", "1")
    }

    /// Delegate a controller to child groups (`+<name>`).
    pub fn add_control(&self, ctl: &str) -> RuncageResult<()> {
        self.write_subtree_control(ctl, '+')
    }

    /// Revoke a delegated controller (`-<name>`).
    pub fn remove_control(&self, ctl: &str) -> RuncageResult<()> {
        self.write_subtree_control(ctl, '-')
    }

    fn write_subtree_control(&self, ctl: &str, op: char) -> RuncageResult<()> {
        if !self.controls.contains(ctl) {
            return Err(RuncageError::UnavailableControl(ctl.to_string()));
        }
        let path = self.path.join("cgroup.subtree_control");
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| RuncageError::Cgroup(format!("open {}: {}", path.display(), e)))?;
        use std::io::Write;
        write!(file, "{}{}", op, ctl)
            .map_err(|e| RuncageError::Cgroup(format!("write {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// O_PATH descriptor of the cgroup directory, for `CLONE_INTO_CGROUP`.
    /// Cached; stays open until [`CgroupV2::close_fd`].
    pub fn fd(&mut self) -> RuncageResult<RawFd> {
        if self.dir_fd.is_none() {
            let file = fs::OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC)
                .open(&self.path)
                .map_err(|e| {
                    RuncageError::Cgroup(format!("open {}: {}", self.path.display(), e))
                })?;
            self.dir_fd = Some(file);
        }
        Ok(self.dir_fd.as_ref().unwrap().as_raw_fd())
    }

    /// Drop the directory descriptor. Called right after the spawn that
    /// consumed it.
    pub fn close_fd(&mut self) {
        self.dir_fd = None;
    }

    /// Violation tags observed by the kernel while the cage ran.
    pub fn violations(&self) -> Vec<String> {
        let pids = fs::read_to_string(self.path.join("pids.events")).unwrap_or_default();
        let memory = fs::read_to_string(self.path.join("memory.events")).unwrap_or_default();
        violation_tags(&pids, &memory)
    }

    /// Remove the cgroup directory tree. The descriptor is closed first.
    pub fn remove(&mut self) -> RuncageResult<()> {
        self.close_fd();
        remove_dir_tree(&self.path)
            .map_err(|e| RuncageError::Cgroup(format!("remove {}: {}", self.path.display(), e)))
    }

    fn write_control(&self, name: &str, value: &str) -> RuncageResult<()> {
        let path = self.path.join(name);
        if !path.exists() {
            // Kernel without this control; skip per the forward-compat rule.
            tracing::debug!(control = name, "control file absent, skipping");
            return Ok(());
        }
        if !KNOWN_CONTROLS.contains(&name) {
            return Err(RuncageError::InvalidControl(name.to_string()));
        }
        tracing::debug!(control = name, value = value, "writing cgroup control");
        fs::write(&path, value)
            .map_err(|e| RuncageError::Cgroup(format!("write {}: {}", path.display(), e)))
    }
}

fn read_controllers(path: &Path) -> RuncageResult<HashSet<String>> {
    let file = path.join("cgroup.controllers");
    let raw = fs::read_to_string(&file)
        .map_err(|e| RuncageError::Cgroup(format!("read {}: {}", file.display(), e)))?;
    Ok(parse_controllers(&raw))
}

fn parse_controllers(raw: &str) -> HashSet<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Parse `<key> <value>` event lines as the kernel writes them. Lines that
/// do not fit the shape are skipped.
fn parse_events(raw: &str) -> BTreeMap<String, u64> {
    raw.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let key = fields.next()?;
            let value = fields.next()?.parse().ok()?;
            Some((key.to_string(), value))
        })
        .collect()
}

/// Map event counters to violation tags. Only the `max` counter of
/// `pids.events` and the OOM family of `memory.events` count; the other
/// keys (`low`, `high`, `max` for memory) are throttling indicators, not
/// violations.
fn violation_tags(pids_events: &str, memory_events: &str) -> Vec<String> {
    let mut tags = Vec::new();

    let pids = parse_events(pids_events);
    if pids.get("max").copied().unwrap_or(0) > 0 {
        tags.push(PIDS_VIOLATION.to_string());
    }

    let memory = parse_events(memory_events);
    let oom_hits = ["oom", "oom_kill", "oom_group_kill"]
        .iter()
        .any(|key| memory.get(*key).copied().unwrap_or(0) > 0);
    if oom_hits {
        tags.push(MEMORY_VIOLATION.to_string());
    }

    tags
}

/// Remove a cgroup directory and any child groups. Only directories are
/// removed; the control files inside are virtual and vanish with rmdir.
fn remove_dir_tree(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            remove_dir_tree(&entry.path())?;
        }
    }
    fs::remove_dir(path)
}
