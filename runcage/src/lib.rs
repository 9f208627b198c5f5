//! runcage core library.
//!
//! A single-shot Linux sandbox: the supervisor prepares a private root,
//! a cgroup-v2 cage and the namespace attachments, then re-executes this
//! binary as the jailer inside the new namespaces; the jailer applies the
//! in-process restrictions (rlimits, Landlock, seccomp) and runs the target
//! under a wall-clock deadline. Linux is the only supported platform —
//! everything here is built on namespaces, cgroup v2, seccomp-bpf and
//! Landlock.
//!
//! Crate layout:
//!
//! ```text
//! runcage/
//! ├── config.rs    (configuration document)
//! ├── reexec.rs    (argv[0] sentinel dispatch)
//! ├── sandbox/     (supervisor side: cgroup, rootfs, namespaces, spawn)
//! └── jailer/      (jailed side: rlimit, landlock, seccomp, target exec)
//! ```

pub mod config;
pub mod jailer;
pub mod reexec;
pub mod sandbox;

pub use config::Config;
pub use runcage_shared::{Metrics, Report, RuncageError, RuncageResult};
