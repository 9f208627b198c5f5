//! Jailer process creation.
//!
//! The jailer is this same binary re-executed under the `setup` sentinel,
//! cloned with `clone3` so the namespace flags and the cgroup attachment
//! happen atomically with process creation: `CLONE_INTO_CGROUP` places the
//! child into the cage before its first instruction runs.
//!
//! Handshake, in order:
//!
//! 1. parent clones; the child immediately blocks on the sync pipe;
//! 2. parent writes `setgroups`, `uid_map`, `gid_map` (USER namespace
//!    only), then signals the sync pipe — no setup happens inside the new
//!    user namespace before the id maps are in place;
//! 3. child sets its parent-death signal, wires the config pipe to stdin
//!    and the capture pipe to stdout, chroots (unless the pivot strategy
//!    is selected) and execs `/proc/self/exe` as `setup`;
//! 4. parent streams the config bytes in from a writer thread, drains the
//!    child's stdout from the main thread, and reaps the child last. The
//!    drain runs concurrently with the wait, so a chatty child cannot
//!    deadlock on a full pipe.

use std::ffi::CString;
use std::fs;
use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use nix::sched::CloneFlags;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::reexec;
use runcage_shared::{RuncageError, RuncageResult};

/// clone3-only flag; nix's CloneFlags does not carry it.
const CLONE_INTO_CGROUP: u64 = 0x200000000;

/// The namespace set whose refusal usually means a seccomp-filtered clone
/// on the host (container-in-container setups).
const FULL_ISOLATION: &[CloneFlags] = &[
    CloneFlags::CLONE_NEWUSER,
    CloneFlags::CLONE_NEWPID,
    CloneFlags::CLONE_NEWNS,
    CloneFlags::CLONE_NEWNET,
    CloneFlags::CLONE_NEWUTS,
    CloneFlags::CLONE_NEWIPC,
];

/// Everything the clone consumes. Built by the supervisor once the root
/// and the cgroup are ready.
pub struct SpawnSpec {
    /// argv for the re-exec; argv[0] must be the `setup` sentinel.
    pub argv: Vec<String>,
    /// Raw configuration bytes, delivered on the jailer's stdin.
    pub config: Vec<u8>,
    /// Root to chroot into on the child side; `None` when the jailer
    /// pivots instead.
    pub chroot: Option<PathBuf>,
    /// Namespace bitmask from the configuration.
    pub flags: CloneFlags,
    /// O_PATH descriptor of the cgroup directory.
    pub cgroup_fd: RawFd,
    /// Container-side uid/gid for the single-entry id maps.
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

pub struct SpawnOutcome {
    /// The jailer's exit code (which is the target's, on a clean run).
    pub exit_code: i32,
    /// Everything the jailer wrote to stdout — the report JSON.
    pub stdout: Vec<u8>,
}

/// A running jailer. The clone has happened and the cgroup descriptor has
/// been consumed; the caller may (and should) close it before waiting.
pub struct SpawnedJailer {
    pid: Pid,
    config: Vec<u8>,
    stdin_w: OwnedFd,
    stdout_r: OwnedFd,
}

#[repr(C)]
#[derive(Default)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
    set_tid: u64,
    set_tid_size: u64,
    cgroup: u64,
}

pub fn spawn(spec: SpawnSpec) -> RuncageResult<SpawnedJailer> {
    // Exec arrays are prepared before the clone; the child does as little
    // as possible between clone and execve.
    let exe = CString::new(reexec::SELF_EXE).expect("static path");
    let argv_c: Vec<CString> = spec
        .argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<_, _>>()
        .map_err(|_| RuncageError::Spawn("argv contains a NUL byte".into()))?;
    let mut argv_ptrs: Vec<*const libc::c_char> = argv_c.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());
    // The jailer wipes the environment anyway; start it empty.
    let envp_ptrs: [*const libc::c_char; 1] = [std::ptr::null()];
    let chroot_c = match &spec.chroot {
        Some(path) => Some(
            CString::new(path.as_os_str().as_encoded_bytes())
                .map_err(|_| RuncageError::Spawn("root path contains a NUL byte".into()))?,
        ),
        None => None,
    };

    let (stdin_r, stdin_w) = pipe()?;
    let (stdout_r, stdout_w) = pipe()?;
    let (sync_r, sync_w) = pipe()?;

    let mut args = CloneArgs {
        flags: spec.flags.bits() as u64 | CLONE_INTO_CGROUP,
        exit_signal: libc::SIGCHLD as u64,
        cgroup: spec.cgroup_fd as u64,
        ..CloneArgs::default()
    };

    let pid = unsafe { libc::syscall(libc::SYS_clone3, &mut args, mem::size_of::<CloneArgs>()) };

    if pid < 0 {
        let err = io::Error::last_os_error();
        if FULL_ISOLATION.iter().all(|f| spec.flags.contains(*f)) {
            tracing::warn!(
                "clone3 with full namespace isolation refused; the host may \
                 filter clone itself (nested container?)"
            );
        }
        return Err(RuncageError::Spawn(format!("clone3 failed: {}", err)));
    }

    if pid == 0 {
        // Child. Nothing here returns; any failure is an immediate _exit.
        child_after_clone(
            &sync_r,
            &stdin_r,
            &stdout_w,
            chroot_c.as_deref(),
            &exe,
            &argv_ptrs,
            &envp_ptrs,
        );
    }

    // Parent: drop the child-side ends first so EOFs propagate.
    drop(sync_r);
    drop(stdin_r);
    drop(stdout_w);

    let pid = Pid::from_raw(pid as libc::pid_t);

    if spec.flags.contains(CloneFlags::CLONE_NEWUSER) {
        write_id_maps(pid, spec.uid, spec.gid)?;
    }

    // Unblock the child: the maps are in place.
    release_child(sync_w)?;

    Ok(SpawnedJailer {
        pid,
        config: spec.config,
        stdin_w,
        stdout_r,
    })
}

impl SpawnedJailer {
    /// Feed the configuration, drain the report and reap the jailer.
    ///
    /// The config goes in from a side thread and stdout is drained before
    /// the reap; the EOF arrives when the jailer exits, so a report of any
    /// size cannot deadlock against a full pipe.
    pub fn wait(self) -> RuncageResult<SpawnOutcome> {
        let config = self.config;
        let stdin_w = self.stdin_w;
        let writer = std::thread::spawn(move || {
            let mut stdin_w = fs::File::from(stdin_w);
            let _ = stdin_w.write_all(&config);
            // dropped: EOF on the jailer's stdin
        });

        let mut stdout = Vec::new();
        fs::File::from(self.stdout_r)
            .read_to_end(&mut stdout)
            .map_err(|e| RuncageError::Spawn(format!("reading jailer output: {}", e)))?;

        let status = waitpid(self.pid, None)?;
        let _ = writer.join();

        let exit_code = match status {
            WaitStatus::Exited(_, code) => code,
            WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
            other => {
                return Err(RuncageError::Spawn(format!(
                    "unexpected wait status: {:?}",
                    other
                )));
            }
        };

        Ok(SpawnOutcome { exit_code, stdout })
    }
}

/// Everything the child runs between clone3 and execve.
fn child_after_clone(
    sync_r: &OwnedFd,
    stdin_r: &OwnedFd,
    stdout_w: &OwnedFd,
    chroot: Option<&std::ffi::CStr>,
    exe: &std::ffi::CStr,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
) -> ! {
    unsafe {
        // Block until the parent has written the id maps.
        let mut byte = 0u8;
        if libc::read(sync_r.as_raw_fd(), &mut byte as *mut u8 as *mut libc::c_void, 1) != 1 {
            libc::_exit(127);
        }

        // Die with the supervisor.
        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM, 0, 0, 0) != 0 {
            libc::_exit(127);
        }

        // Config in, report out. dup2 clears CLOEXEC on the new fds; the
        // pipe originals close at exec.
        if libc::dup2(stdin_r.as_raw_fd(), 0) < 0 || libc::dup2(stdout_w.as_raw_fd(), 1) < 0 {
            libc::_exit(127);
        }

        if let Some(root) = chroot {
            if libc::chroot(root.as_ptr()) != 0 {
                libc::_exit(127);
            }
            if libc::chdir(c"/".as_ptr()) != 0 {
                libc::_exit(127);
            }
        }

        libc::execve(exe.as_ptr(), argv.as_ptr(), envp.as_ptr());
        // Only reached when execve failed.
        libc::_exit(127);
    }
}

/// Write the single-entry uid/gid maps for the child's new user namespace,
/// enabling setgroups first so the jailer keeps the privilege-drop path.
fn write_id_maps(pid: Pid, uid: libc::uid_t, gid: libc::gid_t) -> RuncageResult<()> {
    let proc_dir = format!("/proc/{}", pid.as_raw());
    let host_uid = nix::unistd::geteuid();
    let host_gid = nix::unistd::getegid();

    fs::write(format!("{}/setgroups", proc_dir), "allow")
        .map_err(|e| RuncageError::Spawn(format!("write setgroups: {}", e)))?;
    fs::write(
        format!("{}/uid_map", proc_dir),
        format_id_map(uid as u64, host_uid.as_raw() as u64),
    )
    .map_err(|e| RuncageError::Spawn(format!("write uid_map: {}", e)))?;
    fs::write(
        format!("{}/gid_map", proc_dir),
        format_id_map(gid as u64, host_gid.as_raw() as u64),
    )
    .map_err(|e| RuncageError::Spawn(format!("write gid_map: {}", e)))?;

    Ok(())
}

/// One map line: container id, host id, extent of exactly 1.
fn format_id_map(container: u64, host: u64) -> String {
    format!("{} {} 1\n", container, host)
}

fn release_child(sync_w: OwnedFd) -> RuncageResult<()> {
    let mut file = fs::File::from(sync_w);
    file.write_all(&[0])
        .map_err(|e| RuncageError::Spawn(format!("sync pipe write: {}", e)))
}

fn pipe() -> RuncageResult<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(RuncageError::Spawn(format!(
            "pipe2 failed: {}",
            io::Error::last_os_error()
        )));
    }
    // SAFETY: pipe2 returned two fresh descriptors we now own.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_map_is_single_entry() {
        assert_eq!(format_id_map(1000, 0), "1000 0 1\n");
        assert_eq!(format_id_map(0, 1000), "0 1000 1\n");
    }

    #[test]
    fn test_clone_into_cgroup_bit() {
        // Bit 33, per linux/sched.h; must not collide with any namespace flag.
        assert_eq!(CLONE_INTO_CGROUP, 1u64 << 33);
        let all = crate::sandbox::namespaces::clone_flags(&[
            crate::sandbox::namespaces::Namespace::Cgroup,
            crate::sandbox::namespaces::Namespace::Uts,
            crate::sandbox::namespaces::Namespace::Ipc,
            crate::sandbox::namespaces::Namespace::Mnt,
            crate::sandbox::namespaces::Namespace::User,
            crate::sandbox::namespaces::Namespace::Pid,
            crate::sandbox::namespaces::Namespace::Net,
            crate::sandbox::namespaces::Namespace::Time,
        ]);
        assert_eq!(all.bits() as u64 & CLONE_INTO_CGROUP, 0);
    }

    #[test]
    fn test_pipe_pair_transfers() {
        let (r, w) = pipe().unwrap();
        let mut wf = fs::File::from(w);
        wf.write_all(b"ok").unwrap();
        drop(wf);
        let mut buf = Vec::new();
        fs::File::from(r).read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"ok");
    }
}
