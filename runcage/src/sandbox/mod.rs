//! Supervisor side of the sandbox.
//!
//! One invocation is one [`execute`] call: prepare the private root, build
//! the cgroup cage, clone the jailer into the new namespaces with the
//! cgroup descriptor attached, collect its report, fold in any violations
//! the kernel counted, and tear everything down. Teardown is guaranteed by
//! a drop guard so a failure half-way through still unwinds the mounts and
//! the cgroup.

pub mod cgroup;
pub mod namespaces;
pub mod rootfs;
pub mod spawn;

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::reexec;
use cgroup::CgroupV2;
use rootfs::RootFs;
use runcage_shared::{Report, RuncageError, RuncageResult};

/// Everything the CLI hands over for one run.
pub struct ExecuteRequest {
    /// Host path that becomes the sandbox root.
    pub root: PathBuf,
    /// Optional host directory to populate the root from.
    pub rootfs: Option<PathBuf>,
    /// Raw configuration document, re-fed to the jailer on stdin.
    pub config: Vec<u8>,
    /// The full CLI argument vector after the binary name; forwarded to
    /// the re-exec so the jailer re-parses an identical command line.
    pub forward_args: Vec<String>,
}

/// Outcome of one supervised run: the stdout payload (exactly one JSON
/// line) and the process exit code to propagate.
pub struct ExecuteOutcome {
    pub output: String,
    pub exit_code: i32,
}

/// Run the whole supervised lifecycle.
pub fn execute(req: ExecuteRequest) -> RuncageResult<ExecuteOutcome> {
    let config = Config::from_slice(&req.config)?;

    let mut guard = Teardown::default();

    let fs_state = RootFs::prepare(&req.root, req.rootfs.as_deref(), &config)?;
    let guard_fs = guard.fs.insert(fs_state);

    let mut cage = CgroupV2::create(&cgroup_name(&req.root))?;
    cage.apply(&config.cgroup)?;
    let cgroup_fd = cage.fd()?;
    let cage = guard.cgroup.insert(cage);

    let (uid, gid) = resolve_ids(&config)?;

    let spec = spawn::SpawnSpec {
        argv: sentinel_argv(&req.forward_args),
        config: req.config,
        chroot: if config.pivot {
            None
        } else {
            Some(guard_fs.root().to_path_buf())
        },
        flags: namespaces::clone_flags(&config.namespaces),
        cgroup_fd,
        uid,
        gid,
    };

    tracing::debug!(
        root = %req.root.display(),
        namespaces = ?config.namespaces,
        uid = uid,
        gid = gid,
        "spawning jailer"
    );

    let jailer = spawn::spawn(spec)?;
    // The clone consumed the descriptor; drop it before the wait.
    cage.close_fd();
    let outcome = jailer.wait()?;

    let violations = cage.violations();
    let output = merge_violations(&outcome.stdout, violations)?;

    guard.run();

    Ok(ExecuteOutcome {
        output,
        exit_code: outcome.exit_code,
    })
}

/// The jailer's argv: the sentinel consumed by the re-exec dispatcher,
/// then the original command line so the second parse sees the same thing.
fn sentinel_argv(forward_args: &[String]) -> Vec<String> {
    let mut argv = Vec::with_capacity(forward_args.len() + 1);
    argv.push(reexec::SETUP_SENTINEL.to_string());
    argv.extend(forward_args.iter().cloned());
    argv
}

/// `/sys/fs/cgroup/<name>` is derived from the root path, so concurrent
/// invocations with distinct roots never collide and a stale leftover
/// fails creation loudly.
fn cgroup_name(root: &Path) -> String {
    let base = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    format!("runcage-{}", base)
}

/// Resolve the configured user/group names to host ids for the id maps.
/// Unset names fall back to the supervisor's own effective ids (an
/// identity mapping).
fn resolve_ids(config: &Config) -> RuncageResult<(libc::uid_t, libc::gid_t)> {
    let uid = if config.user.is_empty() {
        nix::unistd::geteuid().as_raw()
    } else {
        nix::unistd::User::from_name(&config.user)?
            .ok_or_else(|| RuncageError::Config(format!("unknown user {:?}", config.user)))?
            .uid
            .as_raw()
    };

    let gid = if config.group.is_empty() {
        nix::unistd::getegid().as_raw()
    } else {
        nix::unistd::Group::from_name(&config.group)?
            .ok_or_else(|| RuncageError::Config(format!("unknown group {:?}", config.group)))?
            .gid
            .as_raw()
    };

    Ok((uid, gid))
}

/// With no violations the jailer's JSON passes through untouched; with
/// violations it is decoded, the tags appended, and re-emitted.
fn merge_violations(stdout: &[u8], violations: Vec<String>) -> RuncageResult<String> {
    if violations.is_empty() {
        return Ok(String::from_utf8_lossy(stdout).into_owned());
    }

    let mut report: Report = serde_json::from_slice(stdout).map_err(|e| {
        RuncageError::Internal(format!("jailer emitted an unparsable report: {}", e))
    })?;
    report.append_messages(violations);
    Ok(report.to_json_line()?)
}

/// Unwinds whatever was set up, in reverse. Runs at most once; also fires
/// from Drop so early returns still clean up.
#[derive(Default)]
struct Teardown {
    fs: Option<RootFs>,
    cgroup: Option<CgroupV2>,
}

impl Teardown {
    fn run(&mut self) {
        if let Some(mut fs_state) = self.fs.take()
            && let Err(e) = fs_state.teardown()
        {
            tracing::warn!(error = %e, "root teardown failed");
        }
        if let Some(mut cage) = self.cgroup.take()
            && let Err(e) = cage.remove()
        {
            tracing::warn!(error = %e, "cgroup removal failed");
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runcage_shared::Metrics;

    #[test]
    fn test_sentinel_argv_prepends_setup() {
        let argv = sentinel_argv(&[
            "execute".to_string(),
            "--root".to_string(),
            "/srv/cage".to_string(),
        ]);
        assert_eq!(argv[0], "setup");
        assert_eq!(argv[1], "execute");
        assert_eq!(argv.len(), 4);
    }

    #[test]
    fn test_cgroup_name_derived_from_root() {
        assert_eq!(cgroup_name(Path::new("/srv/judge-42")), "runcage-judge-42");
        assert_eq!(cgroup_name(Path::new("/")), "runcage-root");
    }

    #[test]
    fn test_merge_without_violations_passes_through() {
        let raw = b"{\"output\":\"hi\\n\",\"message\":[],\"metric\":{}} \n";
        let merged = merge_violations(raw, Vec::new()).unwrap();
        assert_eq!(merged.as_bytes(), raw);
    }

    #[test]
    fn test_merge_appends_violation_tags() {
        let report = Report {
            output: "".into(),
            message: vec!["time limit exceeded".into()],
            metric: Metrics::default(),
        };
        let raw = report.to_json_line().unwrap();

        let merged = merge_violations(
            raw.as_bytes(),
            vec![cgroup::MEMORY_VIOLATION.to_string()],
        )
        .unwrap();

        let back: Report = serde_json::from_str(&merged).unwrap();
        assert_eq!(
            back.message,
            vec![
                "time limit exceeded".to_string(),
                cgroup::MEMORY_VIOLATION.to_string()
            ]
        );
    }

    #[test]
    fn test_merge_with_garbage_report_is_an_error() {
        let err = merge_violations(b"oops", vec!["x".to_string()]).unwrap_err();
        assert!(matches!(err, RuncageError::Internal(_)));
    }
}
