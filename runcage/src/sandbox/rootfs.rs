//! Private root construction and teardown.
//!
//! The supervisor assembles the chroot root on the host side, before the
//! jailer is cloned: populate the directory (copy tree or tmpfs), then the
//! bind mounts, `/proc`, the device nodes, the cgroup2 view and `/tmp`,
//! in that order. Every mount is recorded so teardown can detach them in
//! reverse; detach (lazy) unmounts keep a busy mount from wedging cleanup.

use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt, symlink};
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use walkdir::WalkDir;

use crate::config::{BindMount, Config};
use runcage_shared::{RuncageError, RuncageResult};

/// Size of the tmpfs mounted on the root when no rootfs source is given.
const ROOT_TMPFS_OPTS: &str = "size=128M,mode=755";

/// Device nodes bound from the host, with their target modes.
const DEVICES: &[(&str, u32)] = &[
    ("/dev/null", 0o666),
    ("/dev/zero", 0o666),
    ("/dev/full", 0o666),
    ("/dev/urandom", 0o444),
];

pub struct RootFs {
    root: PathBuf,
    mounts_made: Vec<PathBuf>,
}

impl RootFs {
    /// Build the root per the configuration. `rootfs` is the host directory
    /// to copy from; without one, a fresh tmpfs is mounted on `root`.
    pub fn prepare(root: &Path, rootfs: Option<&Path>, config: &Config) -> RuncageResult<Self> {
        let mut fs_state = RootFs {
            root: root.to_path_buf(),
            mounts_made: Vec::new(),
        };

        fs_state.populate(rootfs)?;

        for bind in &config.binds {
            fs_state.mount_bind(bind)?;
        }
        fs_state.mount_proc()?;
        fs_state.mount_dev()?;
        fs_state.mount_cgroup()?;
        fs_state.mount_tmp(&config.tmp_size)?;

        tracing::debug!(
            root = %root.display(),
            mounts = fs_state.mounts_made.len(),
            "root prepared"
        );

        Ok(fs_state)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn populate(&mut self, rootfs: Option<&Path>) -> RuncageResult<()> {
        match rootfs {
            Some(source) => {
                fs::create_dir_all(&self.root)?;
                copy_tree(source, &self.root)
                    .map_err(|e| RuncageError::Mount(format!("rootfs copy failed: {}", e)))
            }
            None => {
                // No source: treat the root as a mountable image and give it
                // a writable tmpfs.
                fs::create_dir_all(&self.root)?;
                mount(
                    Some("tmpfs"),
                    &self.root,
                    Some("tmpfs"),
                    MsFlags::empty(),
                    Some(ROOT_TMPFS_OPTS),
                )
                .map_err(|e| RuncageError::Mount(format!("failed to create tmpfs: {}", e)))?;
                self.mounts_made.push(self.root.clone());
                Ok(())
            }
        }
    }

    fn mount_bind(&mut self, bind: &BindMount) -> RuncageResult<()> {
        let target = self.join_inside(&bind.target);
        make_dir_mode(&target, 0o755)?;

        let fstype = if bind.fstype.is_empty() {
            None
        } else {
            Some(bind.fstype.as_str())
        };
        let data = if bind.data.is_empty() {
            None
        } else {
            Some(bind.data.as_str())
        };

        mount(
            Some(bind.source.as_str()),
            &target,
            fstype,
            MsFlags::MS_BIND | MsFlags::MS_NODEV | MsFlags::MS_NOSUID | MsFlags::MS_PRIVATE,
            data,
        )
        .map_err(|e| {
            RuncageError::Mount(format!(
                "failed to bind {} to {}: {}",
                bind.source,
                target.display(),
                e
            ))
        })?;

        self.mounts_made.push(target);
        Ok(())
    }

    fn mount_proc(&mut self) -> RuncageResult<()> {
        let target = self.root.join("proc");
        make_dir_mode(&target, 0o555)?;

        mount(
            Some("/proc"),
            &target,
            Some("procfs"),
            MsFlags::MS_REC | MsFlags::MS_BIND | MsFlags::MS_PRIVATE,
            Some("remount,hidepid=2"),
        )
        .map_err(|e| RuncageError::Mount(format!("failed to mount proc: {}", e)))?;

        self.mounts_made.push(target);
        Ok(())
    }

    fn mount_dev(&mut self) -> RuncageResult<()> {
        make_dir_mode(&self.root.join("dev"), 0o755)?;

        for (dev, mode) in DEVICES {
            let target = self.join_inside(dev);
            fs::File::create(&target)?;
            fs::set_permissions(&target, fs::Permissions::from_mode(*mode))?;

            mount(
                Some(*dev),
                &target,
                Option::<&str>::None,
                MsFlags::MS_BIND,
                Option::<&str>::None,
            )
            .map_err(|e| {
                RuncageError::Mount(format!(
                    "device: failed to bind {} to {}: {}",
                    dev,
                    target.display(),
                    e
                ))
            })?;

            self.mounts_made.push(target);
        }

        make_dir_mode(&self.root.join("dev/shm"), 0o1777)?;
        Ok(())
    }

    fn mount_cgroup(&mut self) -> RuncageResult<()> {
        let target = self.root.join("sys/fs/cgroup");
        fs::create_dir_all(&target)?;

        mount(
            Some("cgroup"),
            &target,
            Some("cgroup2"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            Option::<&str>::None,
        )
        .map_err(|e| RuncageError::Mount(format!("failed to mount cgroup2: {}", e)))?;

        self.mounts_made.push(target);
        Ok(())
    }

    fn mount_tmp(&mut self, size: &str) -> RuncageResult<()> {
        let target = self.root.join("tmp");
        make_dir_mode(&target, 0o1777)?;

        let data = format!("size={},mode=1777", if size.is_empty() { "64m" } else { size });
        mount(
            Some("tmpfs"),
            &target,
            Some("tmpfs"),
            MsFlags::MS_NODEV | MsFlags::MS_NOSUID,
            Some(data.as_str()),
        )
        .map_err(|e| RuncageError::Mount(format!("failed to mount /tmp tmpfs: {}", e)))?;

        self.mounts_made.push(target);
        Ok(())
    }

    /// Detach every recorded mount in reverse order and remove the root.
    /// Safe to call twice: a vanished root is a no-op.
    pub fn teardown(&mut self) -> RuncageResult<()> {
        while let Some(target) = self.mounts_made.pop() {
            if let Err(e) = umount2(&target, MntFlags::MNT_DETACH) {
                tracing::warn!(
                    target = %target.display(),
                    error = %e,
                    "detach unmount failed"
                );
            }
        }

        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(RuncageError::Mount(format!(
                    "failed to remove root {}: {}",
                    self.root.display(),
                    e
                )));
            }
        }

        Ok(())
    }

    fn join_inside(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

/// Swap the process root for `root` and discard the old one. Runs inside
/// the jailer's mount namespace; preferred over chroot when available.
pub fn pivot_into(root: &Path) -> RuncageResult<()> {
    // pivot_root demands a mount point; a recursive self-bind makes one out
    // of a plain directory.
    mount(
        Some(root),
        root,
        Option::<&str>::None,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        Option::<&str>::None,
    )
    .map_err(|e| RuncageError::Mount(format!("self-bind of {} failed: {}", root.display(), e)))?;

    let put_old = root.join(".pivot");
    fs::create_dir_all(&put_old)?;

    nix::unistd::pivot_root(root, &put_old)
        .map_err(|e| RuncageError::Mount(format!("pivot_root failed: {}", e)))?;
    nix::unistd::chdir("/")
        .map_err(|e| RuncageError::Mount(format!("chdir / failed: {}", e)))?;

    umount2("/.pivot", MntFlags::MNT_DETACH)
        .map_err(|e| RuncageError::Mount(format!("detach of old root failed: {}", e)))?;
    let _ = fs::remove_dir("/.pivot");

    Ok(())
}

/// Copy a directory tree, preserving permissions and symlinks. Ownership
/// is carried over where the caller has the privilege; failures to chown
/// are ignored.
fn copy_tree(source: &Path, target: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(std::io::Error::other)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = target.join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            let meta = entry.metadata().map_err(std::io::Error::other)?;
            fs::DirBuilder::new()
                .mode(meta.permissions().mode())
                .create(&dest)?;
            let _ = std::os::unix::fs::chown(
                &dest,
                Some(std::os::unix::fs::MetadataExt::uid(&meta)),
                Some(std::os::unix::fs::MetadataExt::gid(&meta)),
            );
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            symlink(&link, &dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
            let meta = entry.metadata().map_err(std::io::Error::other)?;
            let _ = std::os::unix::fs::chown(
                &dest,
                Some(std::os::unix::fs::MetadataExt::uid(&meta)),
                Some(std::os::unix::fs::MetadataExt::gid(&meta)),
            );
        }
    }
    Ok(())
}

fn make_dir_mode(path: &Path, mode: u32) -> RuncageResult<()> {
    match fs::DirBuilder::new().recursive(true).mode(mode).create(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => {
            return Err(RuncageError::Mount(format!(
                "failed to create {}: {}",
                path.display(),
                e
            )));
        }
    }
    // DirBuilder modes pass through the umask; force the requested bits.
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}
