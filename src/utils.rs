use anyhow::{Result, anyhow};
use nix::unistd::{SysconfVar, sysconf};
use std::{
    fs::{DirBuilder, OpenOptions},
    io,
    os::unix::fs::{DirBuilderExt, OpenOptionsExt},
    path::Path,
};

/// Returns the system page size.
pub fn page_size() -> Result<usize> {
    match sysconf(SysconfVar::PAGE_SIZE)? {
        Some(size) if size > 0 => Ok(size as usize),
        Some(_) => Err(anyhow!("PAGE_SIZE returned non-positive value")),
        None => Err(anyhow!("PAGE_SIZE is not defined on this system")),
    }
}

/// Creates `path` and any missing parents with `mode`.
///
/// Existing directories are left untouched, including their mode.
pub fn create_directory_recursive(path: &Path, mode: u32) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(mode).create(path)
}

/// Creates a single directory with `mode` unless it already exists.
pub fn ensure_directory(path: &Path, mode: u32) -> io::Result<()> {
    match DirBuilder::new().mode(mode).create(path) {
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        other => other,
    }
}

/// Creates an empty file with `mode` (and its parents with `dir_mode`)
/// unless something already exists at `path`.
pub fn ensure_file(path: &Path, mode: u32, dir_mode: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        create_directory_recursive(parent, dir_mode)?;
    }

    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(mode)
        .open(path)
        .map(drop)
}

/// Whether anything, including a dangling symlink, exists at `path`.
pub fn path_exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

/// Runs `f` in a forked child and returns its exit code, so tests can
/// unshare, chroot or change identity without touching the test harness.
#[cfg(test)]
pub(crate) fn in_child<F>(f: F) -> i32
where
    F: FnOnce() -> i32,
{
    use nix::{
        sys::wait::{WaitStatus, waitpid},
        unistd::{ForkResult, fork},
    };

    match unsafe { fork() }.expect("fork") {
        ForkResult::Child => {
            let code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).unwrap_or(101);
            unsafe { nix::libc::_exit(code) }
        }
        ForkResult::Parent { child } => match waitpid(child, None).expect("waitpid") {
            WaitStatus::Exited(_, code) => code,
            status => panic!("unexpected child status: {status:?}"),
        },
    }
}
