use crate::{
    config::BindSpec,
    error::{ConfigError, OperationContext, Result},
    hardener, utils,
};
use std::{fs, path::Path};
use tracing::{debug, instrument};

const MOUNT_POINT_DIR_MODE: u32 = 0o700;
const MOUNT_POINT_FILE_MODE: u32 = 0o600;

/// Binds every spec under `root`, in order. Stops at the first failure;
/// whatever was already mounted vanishes with the namespace.
#[instrument(skip_all, fields(root = %root.display(), count = binds.len()))]
pub fn mount_binds(root: &Path, binds: &[BindSpec]) -> Result<()> {
    for bind in binds {
        mount_bind(root, bind)?;
    }

    Ok(())
}

fn mount_bind(root: &Path, bind: &BindSpec) -> Result<()> {
    let target = bind.resolve(root);

    if bind.create_missing() && !utils::path_exists(&target) {
        // Creation follows symlinks, so the part that already exists is checked first
        if let Some(existing) = target.ancestors().find(|path| utils::path_exists(path)) {
            ensure_within_root(root, existing, &target)?;
        }
        create_mount_point(bind.source(), &target)?;
    }

    ensure_within_root(root, &target, &target)?;

    // MS_PRIVATE is ignored when combined with MS_BIND, so it takes a second call
    hardener::bind_mount(bind.source(), &target)?;
    hardener::make_private(&target)?;

    debug!(
        source = %bind.source().display(),
        destination = %bind.destination().display(),
        mount_point = %target.display(),
        "bind mounted"
    );
    Ok(())
}

/// Creates a missing runtime mount point shaped like its source: a
/// directory for a directory, an empty file for anything else.
fn create_mount_point(source: &Path, target: &Path) -> Result<()> {
    let created = if source.is_dir() {
        utils::create_directory_recursive(target, MOUNT_POINT_DIR_MODE)
    } else {
        utils::ensure_file(target, MOUNT_POINT_FILE_MODE, MOUNT_POINT_DIR_MODE)
    };

    created.with_op(|| format!("create mount point {}", target.display()))?;
    debug!(path = %target.display(), "created mount point");
    Ok(())
}

/// Rejects `target` when `path`, the target itself or an existing ancestor
/// of it, only lands outside `root` by following a symlink inside it.
fn ensure_within_root(root: &Path, path: &Path, target: &Path) -> Result<()> {
    let resolved =
        fs::canonicalize(path).with_op(|| format!("resolve mount point {}", path.display()))?;

    if !resolved.starts_with(root) {
        return Err(ConfigError::DestinationEscapesRoot(target.to_path_buf()).into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::LaunchError, utils::in_child};
    use nix::{
        sched::{CloneFlags, unshare},
        unistd::geteuid,
    };
    use std::{os::unix::fs::PermissionsExt, path::PathBuf};

    fn root() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = fs::canonicalize(dir.path()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_create_mount_point_follows_source_type() {
        let (_dir, root) = root();

        let target = root.join("run/user/1000");
        create_mount_point(Path::new("/"), &target).unwrap();
        assert!(target.is_dir());
        let mode = target.metadata().unwrap().permissions().mode();
        assert_eq!(mode & 0o777, MOUNT_POINT_DIR_MODE);

        let target = root.join("tmp/app/config");
        create_mount_point(Path::new("/etc/hostname"), &target).unwrap();
        assert!(target.is_file());
    }

    #[test]
    fn test_symlinked_destination_cannot_escape_root() {
        let (_dir, root) = root();
        std::os::unix::fs::symlink("/etc", root.join("work")).unwrap();

        let bind: BindSpec = "/usr:/work".parse().unwrap();
        let error = mount_bind(&root, &bind).unwrap_err();
        assert!(matches!(
            error,
            LaunchError::Config(ConfigError::DestinationEscapesRoot(_))
        ));
    }

    #[test]
    fn test_runtime_mount_point_is_not_created_through_escaping_symlink() {
        let (_base_dir, base) = root();
        let root = base.join("root");
        let outside = base.join("outside");
        fs::create_dir(&root).unwrap();
        fs::create_dir(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("run")).unwrap();

        let bind: BindSpec = "/usr:/run/evil".parse().unwrap();
        let error = mount_bind(&root, &bind).unwrap_err();

        assert!(matches!(
            error,
            LaunchError::Config(ConfigError::DestinationEscapesRoot(_))
        ));
        assert!(!utils::path_exists(&outside.join("evil")));
    }

    #[test]
    fn test_missing_destination_fails() {
        let (_dir, root) = root();

        let bind: BindSpec = "/usr:/opt/missing".parse().unwrap();
        let error = mount_binds(&root, &[bind]).unwrap_err();
        assert!(matches!(error, LaunchError::Operation(_)));
    }

    #[test]
    fn test_bind_shows_source_contents() {
        if !geteuid().is_root() {
            return;
        }

        let (_source_dir, source) = root();
        fs::write(source.join("hello.txt"), "hello").unwrap();
        let (_root_dir, root) = root();
        fs::create_dir(root.join("work")).unwrap();

        let binds: Vec<BindSpec> = vec![
            format!("{}:/work", source.display()).parse().unwrap(),
            format!("{}:/run/project", source.display()).parse().unwrap(),
        ];

        let code = in_child(|| {
            if unshare(CloneFlags::CLONE_NEWNS).is_err()
                || hardener::make_private_recursive(Path::new("/")).is_err()
            {
                return 1;
            }
            if mount_binds(&root, &binds).is_err() {
                return 2;
            }
            let work = fs::read_to_string(root.join("work/hello.txt")).ok();
            let run = fs::read_to_string(root.join("run/project/hello.txt")).ok();
            match (work.as_deref(), run.as_deref()) {
                (Some("hello"), Some("hello")) => 0,
                _ => 3,
            }
        });
        assert_eq!(code, 0);
        assert!(!root.join("work/hello.txt").exists());
    }
}
