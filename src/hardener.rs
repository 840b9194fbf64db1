//! Mount-table and root primitives, plus the root transition built on them.

use crate::error::{OperationContext, OperationError};
use nix::{
    mount::{MsFlags, mount},
    unistd,
};
use std::path::Path;
use tracing::{debug, instrument};

/// The process and its children are prevented from gaining new privileges via `execve()`
pub(crate) fn apply_no_new_privs() -> Result<(), OperationError> {
    nix::sys::prctl::set_no_new_privs().op("prctl(PR_SET_NO_NEW_PRIVS)")
}

/// Recursively marks `path` private: mount events no longer cross between
/// this subtree and any peer, in either direction.
pub fn make_private_recursive(path: &Path) -> Result<(), OperationError> {
    let flags = MsFlags::MS_REC | MsFlags::MS_PRIVATE;
    mount::<str, Path, str, str>(None, path, None, flags, None)
        .with_op(|| format!("mount(rprivate) {}", path.display()))
}

/// Marks the single mount at `path` private.
pub fn make_private(path: &Path) -> Result<(), OperationError> {
    mount::<str, Path, str, str>(None, path, None, MsFlags::MS_PRIVATE, None)
        .with_op(|| format!("mount(private) {}", path.display()))
}

/// Recursive bind of `source` onto `target`.
pub fn bind_mount(source: &Path, target: &Path) -> Result<(), OperationError> {
    let flags = MsFlags::MS_BIND | MsFlags::MS_REC;
    mount::<Path, Path, str, str>(Some(source), target, None, flags, None)
        .with_op(|| format!("mount(bind) {} -> {}", source.display(), target.display()))
}

/// Bind `path` onto itself so it becomes a mount point of its own.
pub fn bind_mount_self(path: &Path) -> Result<(), OperationError> {
    bind_mount(path, path)
}

pub fn change_root(path: &Path) -> Result<(), OperationError> {
    unistd::chroot(path).with_op(|| format!("chroot {}", path.display()))
}

pub fn chdir(path: &Path) -> Result<(), OperationError> {
    unistd::chdir(path).with_op(|| format!("chdir {}", path.display()))
}

/// Makes `root` the process root.
///
/// `root` becomes a private mount point first, so nothing mounted under it
/// from here on reaches the host. The working directory is reset to the new
/// `/` in the same step: a directory opened before `chroot` would otherwise
/// still point outside the new root.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn enter_root(root: &Path) -> Result<(), OperationError> {
    if root == Path::new("/") {
        debug!("root unchanged");
        return chdir(Path::new("/"));
    }

    bind_mount_self(root)?;
    make_private_recursive(root)?;
    change_root(root)?;
    chdir(Path::new("/"))?;

    debug!("entered new root");
    Ok(())
}
