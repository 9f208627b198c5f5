//! Seccomp-BPF policy enforcement.
//!
//! The configuration carries a default action plus per-syscall action
//! groups. A seccompiler filter expresses exactly one action pair
//! (match/mismatch), so the policy compiles to a small stack of filters:
//! one per non-allow group (match = the group's action, mismatch = allow)
//! and a trailing default filter (match = allow over every named syscall,
//! mismatch = the default action). The kernel runs all attached filters
//! and acts on the most restrictive verdict, which composes these into the
//! intended per-syscall semantics.
//!
//! Loading is the last restriction step: `no_new_privs` first, then every
//! program with TSYNC so the filter covers all threads.

use std::collections::BTreeMap;

use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};
use serde::{Deserialize, Serialize};

use runcage_shared::{RuncageError, RuncageResult};

/// Per-syscall (or default) verdicts. `errno` denies with EPERM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Allow,
    Errno,
    Trap,
    KillThread,
    KillProcess,
    Log,
}

impl Action {
    fn to_seccompiler(self) -> SeccompAction {
        match self {
            Action::Allow => SeccompAction::Allow,
            Action::Errno => SeccompAction::Errno(libc::EPERM as u32),
            Action::Trap => SeccompAction::Trap,
            Action::KillThread => SeccompAction::KillThread,
            Action::KillProcess => SeccompAction::KillProcess,
            Action::Log => SeccompAction::Log,
        }
    }
}

/// Syscalls sharing one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallGroup {
    pub names: Vec<String>,
    pub action: Action,
}

/// The whole policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub default_action: Action,
    #[serde(default)]
    pub syscalls: Vec<SyscallGroup>,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            default_action: Action::Allow,
            syscalls: Vec::new(),
        }
    }
}

/// Whether this kernel exposes seccomp at all.
pub fn supported() -> bool {
    std::path::Path::new("/proc/sys/kernel/seccomp").exists()
}

/// Compile the policy into the filter stack, in load order.
pub fn compile(policy: &Policy) -> RuncageResult<Vec<BpfProgram>> {
    let arch = target_arch();
    let mut programs = Vec::new();
    let mut named: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();

    for group in &policy.syscalls {
        let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
        for name in &group.names {
            let nr = syscall_nr(name).ok_or_else(|| {
                RuncageError::Seccomp(format!("unknown syscall {:?} in policy", name))
            })?;
            // Empty rule list = unconditional match on the syscall number.
            rules.insert(nr, vec![]);
            named.insert(nr, vec![]);
        }

        if group.action == Action::Allow {
            // Expressed through the default filter below.
            continue;
        }
        if rules.is_empty() {
            continue;
        }

        let filter = SeccompFilter::new(
            rules,
            SeccompAction::Allow,
            group.action.to_seccompiler(),
            arch,
        )
        .map_err(|e| RuncageError::Seccomp(format!("filter construction failed: {}", e)))?;
        programs.push(bpf(filter)?);
    }

    if policy.default_action != Action::Allow {
        // Named syscalls pass this filter; everything else gets the
        // default action.
        let filter = SeccompFilter::new(
            named,
            policy.default_action.to_seccompiler(),
            SeccompAction::Allow,
            arch,
        )
        .map_err(|e| RuncageError::Seccomp(format!("filter construction failed: {}", e)))?;
        programs.push(bpf(filter)?);
    }

    Ok(programs)
}

/// Load the policy onto the current process and all its threads.
pub fn enforce(policy: &Policy) -> RuncageResult<()> {
    if !supported() {
        return Err(RuncageError::Seccomp("seccomp is not supported".into()));
    }

    let programs = compile(policy)?;
    if programs.is_empty() {
        tracing::debug!("seccomp policy is allow-all, nothing to load");
        return Ok(());
    }

    // seccompiler sets no_new_privs itself; setting it here as well keeps
    // the invariant visible and independent of the library version.
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(RuncageError::Seccomp(format!(
            "PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    for program in &programs {
        seccompiler::apply_filter_all_threads(program)
            .map_err(|e| RuncageError::Seccomp(format!("filter load failed: {}", e)))?;
    }

    tracing::debug!(filters = programs.len(), "seccomp enforced");
    Ok(())
}

fn bpf(filter: SeccompFilter) -> RuncageResult<BpfProgram> {
    filter
        .try_into()
        .map_err(|e: seccompiler::BackendError| {
            RuncageError::Seccomp(format!("BPF compilation failed: {}", e))
        })
}

fn target_arch() -> TargetArch {
    #[cfg(target_arch = "x86_64")]
    {
        TargetArch::x86_64
    }
    #[cfg(target_arch = "aarch64")]
    {
        TargetArch::aarch64
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        compile_error!("unsupported architecture for seccomp")
    }
}

/// Syscall name to number for the target architecture.
///
/// `None` for names that do not exist here; the policy compiler turns that
/// into a hard error, since a silently dropped rule would weaken the cage.
fn syscall_nr(name: &str) -> Option<i64> {
    Some(match name {
        // process lifecycle
        "clone" => libc::SYS_clone,
        "clone3" => libc::SYS_clone3,
        "execve" => libc::SYS_execve,
        "execveat" => libc::SYS_execveat,
        "exit" => libc::SYS_exit,
        "exit_group" => libc::SYS_exit_group,
        "wait4" => libc::SYS_wait4,
        "waitid" => libc::SYS_waitid,
        "kill" => libc::SYS_kill,
        "tkill" => libc::SYS_tkill,
        "tgkill" => libc::SYS_tgkill,
        #[cfg(target_arch = "x86_64")]
        "fork" => libc::SYS_fork,
        #[cfg(target_arch = "x86_64")]
        "vfork" => libc::SYS_vfork,

        // process info and identity
        "getpid" => libc::SYS_getpid,
        "getppid" => libc::SYS_getppid,
        "gettid" => libc::SYS_gettid,
        "getuid" => libc::SYS_getuid,
        "geteuid" => libc::SYS_geteuid,
        "getgid" => libc::SYS_getgid,
        "getegid" => libc::SYS_getegid,
        "getgroups" => libc::SYS_getgroups,
        "setgroups" => libc::SYS_setgroups,
        "setresuid" => libc::SYS_setresuid,
        "setresgid" => libc::SYS_setresgid,
        "setuid" => libc::SYS_setuid,
        "setgid" => libc::SYS_setgid,
        "capget" => libc::SYS_capget,
        "capset" => libc::SYS_capset,
        "umask" => libc::SYS_umask,
        "prctl" => libc::SYS_prctl,
        #[cfg(target_arch = "x86_64")]
        "arch_prctl" => libc::SYS_arch_prctl,
        "uname" => libc::SYS_uname,
        "getcwd" => libc::SYS_getcwd,

        // memory
        "brk" => libc::SYS_brk,
        "mmap" => libc::SYS_mmap,
        "munmap" => libc::SYS_munmap,
        "mremap" => libc::SYS_mremap,
        "mprotect" => libc::SYS_mprotect,
        "madvise" => libc::SYS_madvise,
        "mlock" => libc::SYS_mlock,
        "munlock" => libc::SYS_munlock,
        "mincore" => libc::SYS_mincore,
        "msync" => libc::SYS_msync,
        "membarrier" => libc::SYS_membarrier,

        // files
        "open" => {
            #[cfg(target_arch = "x86_64")]
            {
                libc::SYS_open
            }
            #[cfg(not(target_arch = "x86_64"))]
            {
                return None;
            }
        }
        "openat" => libc::SYS_openat,
        "openat2" => libc::SYS_openat2,
        "close" => libc::SYS_close,
        "read" => libc::SYS_read,
        "write" => libc::SYS_write,
        "readv" => libc::SYS_readv,
        "writev" => libc::SYS_writev,
        "pread64" => libc::SYS_pread64,
        "pwrite64" => libc::SYS_pwrite64,
        "lseek" => libc::SYS_lseek,
        "fstat" => libc::SYS_fstat,
        "newfstatat" => libc::SYS_newfstatat,
        "statx" => libc::SYS_statx,
        "faccessat" => libc::SYS_faccessat,
        "faccessat2" => libc::SYS_faccessat2,
        "readlinkat" => libc::SYS_readlinkat,
        "getdents64" => libc::SYS_getdents64,
        "fcntl" => libc::SYS_fcntl,
        "dup" => libc::SYS_dup,
        "dup3" => libc::SYS_dup3,
        "pipe2" => libc::SYS_pipe2,
        "ftruncate" => libc::SYS_ftruncate,
        "fallocate" => libc::SYS_fallocate,
        "fsync" => libc::SYS_fsync,
        "fdatasync" => libc::SYS_fdatasync,
        "mkdirat" => libc::SYS_mkdirat,
        "unlinkat" => libc::SYS_unlinkat,
        "renameat" => libc::SYS_renameat,
        "renameat2" => libc::SYS_renameat2,
        "symlinkat" => libc::SYS_symlinkat,
        "linkat" => libc::SYS_linkat,
        "fchmod" => libc::SYS_fchmod,
        "fchmodat" => libc::SYS_fchmodat,
        "fchown" => libc::SYS_fchown,
        "fchownat" => libc::SYS_fchownat,
        "chdir" => libc::SYS_chdir,
        "fchdir" => libc::SYS_fchdir,
        "umount2" => libc::SYS_umount2,
        "mount" => libc::SYS_mount,
        "pivot_root" => libc::SYS_pivot_root,
        "chroot" => libc::SYS_chroot,

        // polling and events
        "poll" => {
            #[cfg(target_arch = "x86_64")]
            {
                libc::SYS_poll
            }
            #[cfg(not(target_arch = "x86_64"))]
            {
                return None;
            }
        }
        "ppoll" => libc::SYS_ppoll,
        "pselect6" => libc::SYS_pselect6,
        "epoll_create1" => libc::SYS_epoll_create1,
        "epoll_ctl" => libc::SYS_epoll_ctl,
        "epoll_pwait" => libc::SYS_epoll_pwait,
        "eventfd2" => libc::SYS_eventfd2,
        "timerfd_create" => libc::SYS_timerfd_create,
        "timerfd_settime" => libc::SYS_timerfd_settime,
        "signalfd4" => libc::SYS_signalfd4,
        "inotify_init1" => libc::SYS_inotify_init1,
        "inotify_add_watch" => libc::SYS_inotify_add_watch,

        // signals and threads
        "rt_sigaction" => libc::SYS_rt_sigaction,
        "rt_sigprocmask" => libc::SYS_rt_sigprocmask,
        "rt_sigreturn" => libc::SYS_rt_sigreturn,
        "rt_sigsuspend" => libc::SYS_rt_sigsuspend,
        "rt_sigtimedwait" => libc::SYS_rt_sigtimedwait,
        "sigaltstack" => libc::SYS_sigaltstack,
        "futex" => libc::SYS_futex,
        "set_tid_address" => libc::SYS_set_tid_address,
        "set_robust_list" => libc::SYS_set_robust_list,
        "get_robust_list" => libc::SYS_get_robust_list,
        "rseq" => libc::SYS_rseq,
        "sched_yield" => libc::SYS_sched_yield,
        "sched_getaffinity" => libc::SYS_sched_getaffinity,
        "sched_setaffinity" => libc::SYS_sched_setaffinity,
        "getpriority" => libc::SYS_getpriority,
        "setpriority" => libc::SYS_setpriority,

        // time
        "clock_gettime" => libc::SYS_clock_gettime,
        "clock_getres" => libc::SYS_clock_getres,
        "clock_nanosleep" => libc::SYS_clock_nanosleep,
        "nanosleep" => libc::SYS_nanosleep,
        "gettimeofday" => libc::SYS_gettimeofday,

        // networking
        "socket" => libc::SYS_socket,
        "socketpair" => libc::SYS_socketpair,
        "connect" => libc::SYS_connect,
        "accept4" => libc::SYS_accept4,
        "bind" => libc::SYS_bind,
        "listen" => libc::SYS_listen,
        "sendto" => libc::SYS_sendto,
        "recvfrom" => libc::SYS_recvfrom,
        "sendmsg" => libc::SYS_sendmsg,
        "recvmsg" => libc::SYS_recvmsg,
        "shutdown" => libc::SYS_shutdown,
        "getsockname" => libc::SYS_getsockname,
        "getpeername" => libc::SYS_getpeername,
        "getsockopt" => libc::SYS_getsockopt,
        "setsockopt" => libc::SYS_setsockopt,

        // resources and randomness
        "getrlimit" => libc::SYS_getrlimit,
        "setrlimit" => libc::SYS_setrlimit,
        "prlimit64" => libc::SYS_prlimit64,
        "getrusage" => libc::SYS_getrusage,
        "getrandom" => libc::SYS_getrandom,
        "ioctl" => libc::SYS_ioctl,

        // namespace and module manipulation (typically denied)
        "setns" => libc::SYS_setns,
        "unshare" => libc::SYS_unshare,
        "ptrace" => libc::SYS_ptrace,
        "process_vm_readv" => libc::SYS_process_vm_readv,
        "process_vm_writev" => libc::SYS_process_vm_writev,
        "init_module" => libc::SYS_init_module,
        "finit_module" => libc::SYS_finit_module,
        "delete_module" => libc::SYS_delete_module,
        "kexec_load" => libc::SYS_kexec_load,
        "reboot" => libc::SYS_reboot,
        "bpf" => libc::SYS_bpf,
        "userfaultfd" => libc::SYS_userfaultfd,
        "perf_event_open" => libc::SYS_perf_event_open,
        "keyctl" => libc::SYS_keyctl,
        "add_key" => libc::SYS_add_key,
        "request_key" => libc::SYS_request_key,

        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(default_action: Action, groups: &[(&[&str], Action)]) -> Policy {
        Policy {
            default_action,
            syscalls: groups
                .iter()
                .map(|(names, action)| SyscallGroup {
                    names: names.iter().map(|n| n.to_string()).collect(),
                    action: *action,
                })
                .collect(),
        }
    }

    #[test]
    fn test_actions_decode_snake_case() {
        assert_eq!(
            serde_yaml::from_str::<Action>("kill_process").unwrap(),
            Action::KillProcess
        );
        assert_eq!(serde_yaml::from_str::<Action>("errno").unwrap(), Action::Errno);
        assert!(serde_yaml::from_str::<Action>("maim").is_err());
    }

    #[test]
    fn test_policy_decode() {
        let policy: Policy = serde_yaml::from_str(
            "default_action: allow\nsyscalls:\n  - names: [getpid]\n    action: errno\n",
        )
        .unwrap();
        assert_eq!(policy.default_action, Action::Allow);
        assert_eq!(policy.syscalls[0].names, vec!["getpid"]);
        assert_eq!(policy.syscalls[0].action, Action::Errno);
    }

    #[test]
    fn test_allow_all_compiles_to_nothing() {
        let programs = compile(&Policy::default()).unwrap();
        assert!(programs.is_empty());
    }

    #[test]
    fn test_deny_group_compiles_to_one_filter() {
        let p = policy(Action::Allow, &[(&["getpid"], Action::Errno)]);
        let programs = compile(&p).unwrap();
        assert_eq!(programs.len(), 1);
        assert!(!programs[0].is_empty());
    }

    #[test]
    fn test_restrictive_default_adds_trailing_filter() {
        let p = policy(
            Action::KillProcess,
            &[(&["read", "write", "exit_group", "execve"], Action::Allow)],
        );
        let programs = compile(&p).unwrap();
        // allow-group folds into the default filter
        assert_eq!(programs.len(), 1);

        let p = policy(
            Action::KillProcess,
            &[
                (&["read", "write", "exit_group", "execve"], Action::Allow),
                (&["getpid"], Action::Trap),
            ],
        );
        let programs = compile(&p).unwrap();
        assert_eq!(programs.len(), 2);
    }

    #[test]
    fn test_unknown_syscall_is_fatal() {
        let p = policy(Action::Allow, &[(&["frobnicate"], Action::Errno)]);
        let err = compile(&p).unwrap_err();
        assert!(err.to_string().contains("frobnicate"));
    }

    #[test]
    fn test_syscall_table_basics() {
        assert_eq!(syscall_nr("read"), Some(libc::SYS_read));
        assert_eq!(syscall_nr("getpid"), Some(libc::SYS_getpid));
        assert_eq!(syscall_nr("landlocked"), None);
    }
}
