//! The jailed half of the binary.
//!
//! Entered via the `setup` re-exec sentinel, already inside the new
//! namespaces and the cgroup, with the configuration on stdin. What is
//! left is the in-process restriction sequence and the target itself.
//!
//! The sequence is once-only and order-sensitive — each later step would
//! break an earlier one's syscalls if flipped (seccomp before Landlock
//! would have to allow the landlock syscalls; privilege drop after
//! seccomp would need setresuid in every policy). The stages are encoded
//! in the type of [`Setup`], so a step out of order is a compile error:
//!
//! ```text
//! Entered → EnvSet → Limited → Deprivileged → Landlocked → Seccomped → exec
//! ```

pub mod exec;
pub mod landlock;
pub mod rlimit;
pub mod seccomp;

use std::io::Read;
use std::marker::PhantomData;
use std::path::Path;

use crate::config::Config;
use crate::sandbox::namespaces::Namespace;
use crate::sandbox::rootfs;
use runcage_shared::report::INTERNAL_ERROR;
use runcage_shared::{Report, RuncageError, RuncageResult};

/// Jailer entry point. Emits the report (or the folded error report) on
/// stdout and returns the process exit code.
pub fn run(root: &Path, target: &[String]) -> i32 {
    match run_inner(root, target) {
        Ok((report, exit_code)) => {
            emit(&report);
            exit_code
        }
        Err(err) => {
            tracing::error!(error = %err, "jailer setup failed");
            emit(&Report::internal_error(err.to_string()));
            INTERNAL_ERROR
        }
    }
}

fn run_inner(root: &Path, target: &[String]) -> RuncageResult<(Report, i32)> {
    let mut raw = Vec::new();
    std::io::stdin()
        .read_to_end(&mut raw)
        .map_err(|e| RuncageError::Config(format!("reading configuration: {}", e)))?;
    let config = Config::from_slice(&raw)?;

    if config.pivot {
        // The supervisor skipped the chroot attachment; swap roots here,
        // inside our own mount namespace.
        rootfs::pivot_into(root)?;
    }

    let staged = Setup::enter(config)
        .set_environment()
        .apply_rlimits()?
        .drop_privileges()?
        .enforce_landlock()?
        .enforce_seccomp()?;

    staged.exec_target(target)
}

fn emit(report: &Report) {
    use std::io::Write;
    if let Ok(line) = report.to_json_line() {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = lock.write_all(line.as_bytes());
        let _ = lock.flush();
    }
}

// ---------------------------------------------------------------------------
// Setup stages
// ---------------------------------------------------------------------------

pub struct Entered;
pub struct EnvSet;
pub struct Limited;
pub struct Deprivileged;
pub struct Landlocked;
pub struct Seccomped;

/// The restriction sequence, staged in its type parameter. Every
/// transition consumes the previous stage; there is no way back and no
/// way to skip ahead.
pub struct Setup<Stage> {
    config: Config,
    _stage: PhantomData<Stage>,
}

impl<Stage> Setup<Stage> {
    fn advance<Next>(self) -> Setup<Next> {
        Setup {
            config: self.config,
            _stage: PhantomData,
        }
    }
}

impl Setup<Entered> {
    pub fn enter(config: Config) -> Self {
        Setup {
            config,
            _stage: PhantomData,
        }
    }

    /// Replace the inherited environment with the configured one.
    pub fn set_environment(self) -> Setup<EnvSet> {
        // SAFETY: the jailer is single-threaded until the target spawns;
        // nothing reads the environment concurrently.
        unsafe {
            libc::clearenv();
            for (key, value) in &self.config.envs {
                std::env::set_var(key, value);
            }
        }
        self.advance()
    }
}

impl Setup<EnvSet> {
    pub fn apply_rlimits(self) -> RuncageResult<Setup<Limited>> {
        rlimit::apply_all(&self.config.rlimits)?;
        Ok(self.advance())
    }
}

impl Setup<Limited> {
    /// Explicit privilege drop, used only when no user-namespace mapping
    /// is in effect — with a USER namespace the id maps already decide
    /// who the jailer is.
    pub fn drop_privileges(self) -> RuncageResult<Setup<Deprivileged>> {
        if self.config.namespaces.contains(&Namespace::User) || self.config.user.is_empty() {
            return Ok(self.advance());
        }

        let user = nix::unistd::User::from_name(&self.config.user)?
            .ok_or_else(|| {
                RuncageError::Config(format!("unknown user {:?}", self.config.user))
            })?;
        let gid = if self.config.group.is_empty() {
            user.gid
        } else {
            nix::unistd::Group::from_name(&self.config.group)?
                .ok_or_else(|| {
                    RuncageError::Config(format!("unknown group {:?}", self.config.group))
                })?
                .gid
        };

        privilege_drop(user.uid, gid)?;
        Ok(self.advance())
    }
}

impl Setup<Deprivileged> {
    pub fn enforce_landlock(self) -> RuncageResult<Setup<Landlocked>> {
        landlock::enforce(&self.config.files, &self.config.landlock)?;
        Ok(self.advance())
    }
}

impl Setup<Landlocked> {
    pub fn enforce_seccomp(self) -> RuncageResult<Setup<Seccomped>> {
        seccomp::enforce(&self.config.seccomp)?;
        Ok(self.advance())
    }
}

impl Setup<Seccomped> {
    /// All restrictions hold; run the target.
    pub fn exec_target(self, target: &[String]) -> RuncageResult<(Report, i32)> {
        exec::run_target(target, self.config.time_limit)
    }
}

/// Groups first — once the ids are gone so is CAP_SETGID.
fn privilege_drop(uid: nix::unistd::Uid, gid: nix::unistd::Gid) -> RuncageResult<()> {
    if uid.is_root() {
        return Err(RuncageError::Config("uid 0 is not allowed".into()));
    }

    nix::unistd::setgroups(&[gid])
        .map_err(|e| RuncageError::Spawn(format!("setgroups failed: {}", e)))?;
    nix::unistd::setresgid(gid, gid, gid)
        .map_err(|e| RuncageError::Spawn(format!("setresgid failed: {}", e)))?;
    nix::unistd::setresuid(uid, uid, uid)
        .map_err(|e| RuncageError::Spawn(format!("setresuid failed: {}", e)))?;

    Ok(())
}
