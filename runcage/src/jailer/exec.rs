//! Target execution under the wall-clock deadline.
//!
//! The target's stdout and stderr share one pipe, so the report carries a
//! single combined output stream in write order. The deadline is a
//! watchdog thread parked on a channel: normal completion cancels it,
//! expiry SIGKILLs the target's process group (the target may have forked;
//! the group catches the stragglers the cgroup would otherwise hold).
//!
//! The reap goes through `wait4` rather than the std wait so the kernel's
//! rusage accounting comes back with the exit status.

use std::fs::File;
use std::io::Read;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use runcage_shared::{Metrics, Report, RuncageError, RuncageResult};

/// Tag recorded when the deadline fires.
pub const TIME_LIMIT_EXCEEDED: &str = "time limit exceeded";

/// Tag recorded when the watchdog is cancelled without a completion.
pub const CANCELED: &str = "canceled";

/// Tag recorded when the target died of SIGSYS (seccomp verdict).
pub const SECCOMP_VIOLATION: &str = "security restriction violated";

enum WatchdogVerdict {
    Completed,
    Expired,
    Canceled,
}

/// Run the target to completion and assemble its report.
///
/// Returns the report and the exit code the jailer should propagate
/// (the target's own, or -1 when it died of a signal).
pub fn run_target(argv: &[String], time_limit: u64) -> RuncageResult<(Report, i32)> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| RuncageError::Exec("empty target command line".into()))?;

    let (read_fd, write_fd) = output_pipe()?;
    let write_clone = write_fd
        .try_clone()
        .map_err(|e| RuncageError::Exec(format!("fd clone failed: {}", e)))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(write_fd))
        .stderr(Stdio::from(write_clone));

    // Own process group, so the deadline kill reaches forked children too.
    unsafe {
        use std::os::unix::process::CommandExt;
        command.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let start = Instant::now();
    let child = command
        .spawn()
        .map_err(|e| RuncageError::Exec(format!("failed to start {}: {}", program, e)))?;
    let pid = child.id() as libc::pid_t;

    // Our copies of the write end must go away or the drain never sees EOF.
    drop(command);

    let drain = std::thread::spawn(move || {
        let mut output = Vec::new();
        let _ = File::from(read_fd).read_to_end(&mut output);
        output
    });

    let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
    let watchdog = (time_limit > 0).then(|| {
        std::thread::spawn(move || {
            match cancel_rx.recv_timeout(Duration::from_secs(time_limit)) {
                Ok(()) => WatchdogVerdict::Completed,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
                    WatchdogVerdict::Expired
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => WatchdogVerdict::Canceled,
            }
        })
    });

    let (status, usage) = wait_for(pid)?;
    let wall_time = start.elapsed();

    let verdict = match watchdog {
        Some(handle) => {
            let _ = cancel_tx.send(());
            handle.join().unwrap_or(WatchdogVerdict::Canceled)
        }
        None => WatchdogVerdict::Completed,
    };

    let output = drain
        .join()
        .map_err(|_| RuncageError::Exec("output drain thread panicked".into()))?;

    // The child was reaped by wait4; the std handle is just a pid now.
    drop(child);

    let mut metrics = Metrics {
        signal: None,
        exit_code: -1,
        sys_time: timeval_ns(usage.ru_stime),
        user_time: timeval_ns(usage.ru_utime),
        wall_time: wall_time.as_nanos() as i64,
        memory: usage.ru_maxrss,
    };

    let mut message = Vec::new();
    match verdict {
        WatchdogVerdict::Expired => message.push(TIME_LIMIT_EXCEEDED.to_string()),
        WatchdogVerdict::Canceled => message.push(CANCELED.to_string()),
        WatchdogVerdict::Completed => {}
    }

    if libc::WIFEXITED(status) {
        metrics.exit_code = libc::WEXITSTATUS(status);
    } else if libc::WIFSIGNALED(status) {
        let signal = libc::WTERMSIG(status);
        metrics.signal = Some(signal);
        if signal == libc::SIGSYS {
            message.push(SECCOMP_VIOLATION.to_string());
        }
    }

    let exit_code = metrics.exit_code;
    let report = Report {
        output: String::from_utf8_lossy(&output).into_owned(),
        message,
        metric: metrics,
    };

    Ok((report, exit_code))
}

/// Reap the target, retrying on EINTR, and return status plus rusage.
fn wait_for(pid: libc::pid_t) -> RuncageResult<(libc::c_int, libc::rusage)> {
    let mut status: libc::c_int = 0;
    // SAFETY: zeroed rusage is a valid out-param for wait4.
    let mut usage: libc::rusage = unsafe { mem::zeroed() };

    loop {
        let ret = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if ret == pid {
            return Ok((status, usage));
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(RuncageError::Exec(format!("wait4 failed: {}", err)));
        }
    }
}

fn timeval_ns(tv: libc::timeval) -> i64 {
    tv.tv_sec as i64 * 1_000_000_000 + tv.tv_usec as i64 * 1_000
}

fn output_pipe() -> RuncageResult<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(RuncageError::Exec(format!(
            "pipe2 failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: pipe2 returned two fresh descriptors we now own.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_output_in_write_order() {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo out; echo err 1>&2; echo out2".to_string(),
        ];
        let (report, exit_code) = run_target(&argv, 10).unwrap();
        assert_eq!(exit_code, 0);
        assert_eq!(report.output, "out\nerr\nout2\n");
        assert!(report.message.is_empty());
        assert_eq!(report.metric.exit_code, 0);
        assert_eq!(report.metric.signal, None);
        assert!(report.metric.wall_time > 0);
    }

    #[test]
    fn test_exit_code_propagates() {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), "exit 3".to_string()];
        let (report, exit_code) = run_target(&argv, 10).unwrap();
        assert_eq!(exit_code, 3);
        assert_eq!(report.metric.exit_code, 3);
    }

    #[test]
    fn test_deadline_kills_and_tags() {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "sleep 30".to_string(),
        ];
        let start = Instant::now();
        let (report, exit_code) = run_target(&argv, 1).unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(exit_code, -1);
        assert!(report.message.contains(&TIME_LIMIT_EXCEEDED.to_string()));
        assert_eq!(report.metric.signal, Some(libc::SIGKILL));
        assert!(report.metric.wall_time >= 1_000_000_000);
    }

    #[test]
    fn test_zero_time_limit_means_no_deadline() {
        let argv = vec!["/bin/true".to_string()];
        let (report, exit_code) = run_target(&argv, 0).unwrap();
        assert_eq!(exit_code, 0);
        assert!(report.message.is_empty());
    }

    #[test]
    fn test_missing_program_is_an_error() {
        let argv = vec!["/no/such/binary".to_string()];
        assert!(run_target(&argv, 1).is_err());
    }

    #[test]
    fn test_timeval_conversion() {
        let tv = libc::timeval {
            tv_sec: 2,
            tv_usec: 500,
        };
        assert_eq!(timeval_ns(tv), 2_000_000_500_000);
    }
}
