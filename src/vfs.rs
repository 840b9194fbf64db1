//! Virtual filesystems inside the new root.
//!
//! A filesystem is mounted only when its flag is set and its mount point
//! already exists. A missing mount point is skipped silently; a failed
//! mount is fatal.

use crate::{
    config::{RuntimeLink, VfsFlags},
    error::{OperationContext, Result},
    hardener, utils,
};
use nix::{
    mount::{MsFlags, mount},
    unistd::{Gid, Uid},
};
use std::{
    os::unix::fs::{chown, lchown, symlink},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

struct VirtualFs {
    fstype: &'static str,
    source: &'static str,
    /// Relative to the root.
    target: &'static str,
    flags: MsFlags,
    data: Option<&'static str>,
}

const NOSUID_NODEV_NOEXEC: MsFlags = MsFlags::MS_NOSUID
    .union(MsFlags::MS_NODEV)
    .union(MsFlags::MS_NOEXEC);

const PROC: VirtualFs = VirtualFs {
    fstype: "proc",
    source: "proc",
    target: "proc",
    flags: NOSUID_NODEV_NOEXEC,
    data: None,
};

const DEV: VirtualFs = VirtualFs {
    fstype: "devtmpfs",
    source: "devtmpfs",
    target: "dev",
    flags: MsFlags::MS_NOSUID,
    data: Some("mode=0755"),
};

const DEVPTS: VirtualFs = VirtualFs {
    fstype: "devpts",
    source: "devpts",
    target: "dev/pts",
    flags: MsFlags::MS_NOSUID.union(MsFlags::MS_NOEXEC),
    data: Some("newinstance,ptmxmode=0666,mode=0620"),
};

const SYS: VirtualFs = VirtualFs {
    fstype: "sysfs",
    source: "sysfs",
    target: "sys",
    flags: NOSUID_NODEV_NOEXEC.union(MsFlags::MS_RDONLY),
    data: None,
};

const TMP: VirtualFs = VirtualFs {
    fstype: "tmpfs",
    source: "tmpfs",
    target: "tmp",
    flags: MsFlags::MS_NOSUID.union(MsFlags::MS_NODEV),
    data: Some("mode=1777"),
};

const RUN: VirtualFs = VirtualFs {
    fstype: "tmpfs",
    source: "tmpfs",
    target: "run",
    flags: MsFlags::MS_NOSUID.union(MsFlags::MS_NODEV),
    data: Some("mode=0755"),
};

/// Directory under the new `/tmp` that backs `/run` when both are enabled.
const RUN_BACKING_DIR: &str = "tmp/.rootbox-run";

/// Mounts the enabled filesystems under `root` and, when `/run` was
/// provisioned, creates the runtime directory of `uid`.
///
/// Returns the runtime directory as seen from inside `root`.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn provision(
    root: &Path,
    flags: VfsFlags,
    uid: Uid,
    gid: Gid,
    links: &[RuntimeLink],
) -> Result<Option<PathBuf>> {
    let requested = [
        (flags.proc, &PROC),
        (flags.dev, &DEV),
        (flags.devpts, &DEVPTS),
        (flags.sys, &SYS),
    ];

    for (enabled, fs) in requested {
        if enabled {
            mount_if_present(root, fs)?;
        }
    }

    let tmp = flags.tmp && mount_if_present(root, &TMP)?;

    if !flags.run || !provision_run(root, tmp)? {
        if !links.is_empty() {
            debug!("no /run, skipping runtime links");
        }
        return Ok(None);
    }

    let runtime_dir = runtime_dir_of(uid);
    let host_dir = root.join(runtime_dir.strip_prefix("/").unwrap_or(&runtime_dir));

    create_runtime_dir(&host_dir, uid, gid)?;
    create_runtime_links(&host_dir, links, uid, gid)?;

    Ok(Some(runtime_dir))
}

/// `/run/user/<uid>`
pub fn runtime_dir_of(uid: Uid) -> PathBuf {
    PathBuf::from(format!("/run/user/{uid}"))
}

fn mount_if_present(root: &Path, fs: &VirtualFs) -> Result<bool> {
    let target = root.join(fs.target);

    if !target.is_dir() {
        debug!(path = %target.display(), "mount point absent, skipping {}", fs.fstype);
        return Ok(false);
    }

    mount::<str, Path, str, str>(Some(fs.source), &target, Some(fs.fstype), fs.flags, fs.data)
        .with_op(|| format!("mount({}) {}", fs.fstype, target.display()))?;

    debug!(path = %target.display(), "mounted {}", fs.fstype);
    Ok(true)
}

/// Puts a writable filesystem on `/run`: a directory of the fresh `/tmp`
/// when there is one, its own tmpfs otherwise.
fn provision_run(root: &Path, tmp_mounted: bool) -> Result<bool> {
    let run = root.join(RUN.target);

    if !run.is_dir() {
        debug!(path = %run.display(), "mount point absent, skipping /run");
        return Ok(false);
    }

    if !tmp_mounted {
        return mount_if_present(root, &RUN);
    }

    let backing = root.join(RUN_BACKING_DIR);
    utils::ensure_directory(&backing, 0o755)
        .with_op(|| format!("mkdir {}", backing.display()))?;
    hardener::bind_mount(&backing, &run)?;
    hardener::make_private(&run)?;

    debug!(backing = %backing.display(), "bound /run onto /tmp");
    Ok(true)
}

fn create_runtime_dir(dir: &Path, uid: Uid, gid: Gid) -> Result<()> {
    if let Some(parent) = dir.parent() {
        utils::ensure_directory(parent, 0o755)
            .with_op(|| format!("mkdir {}", parent.display()))?;
    }

    utils::ensure_directory(dir, 0o700).with_op(|| format!("mkdir {}", dir.display()))?;
    chown(dir, Some(uid.as_raw()), Some(gid.as_raw()))
        .with_op(|| format!("chown {}", dir.display()))?;

    debug!(dir = %dir.display(), "created runtime directory");
    Ok(())
}

fn create_runtime_links(dir: &Path, links: &[RuntimeLink], uid: Uid, gid: Gid) -> Result<()> {
    for link in links {
        let path = dir.join(&link.name);

        symlink(&link.target, &path).with_op(|| format!("symlink {}", path.display()))?;
        lchown(&path, Some(uid.as_raw()), Some(gid.as_raw()))
            .with_op(|| format!("chown {}", path.display()))?;

        debug!(link = %path.display(), points_to = %link.target.display(), "linked runtime resource");
    }

    Ok(())
}
