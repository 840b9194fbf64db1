use crate::{
    checks::is_namespace_supported,
    config::LaunchConfig,
    context::InvocationContext,
    error::{ConfigError, OperationContext, OperationError, Result},
    hardener,
    pipeline::Isolated,
};
use nix::{
    errno::Errno,
    sched::{CloneFlags, unshare},
};
use std::path::Path;
use tracing::{debug, instrument};

/// Namespaces a launch detaches from, fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceSet(CloneFlags);

impl NamespaceSet {
    pub fn sandbox() -> Self {
        Self(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_FS)
    }

    #[inline]
    pub fn flags(&self) -> CloneFlags {
        self.0
    }

    fn ensure_supported(&self) -> Result<(), OperationError> {
        for flag in self.0.iter() {
            if !is_namespace_supported(flag) {
                return Err(OperationError::new(
                    format!("unshare {flag:?} (unsupported by kernel)"),
                    Errno::EINVAL,
                ));
            }
        }

        Ok(())
    }
}

/// Detaches the calling process from the host's mount, pid and filesystem
/// attribute namespaces.
///
/// This is the first stage and the only one that runs in the supervisor.
/// The pid namespace applies to children only, so the next process forked
/// becomes pid 1 of the new namespace. `/` is made recursively private
/// right away: the copied mount table may still share peer groups with the
/// host, and any mount made before that would propagate back.
#[instrument(skip_all, fields(root = %config.root.display()))]
pub fn isolate<'a>(
    config: &'a LaunchConfig,
    context: &'a InvocationContext,
) -> Result<Isolated<'a>> {
    match config.root.metadata() {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => return Err(ConfigError::RootNotDirectory(config.root.clone()).into()),
        Err(_) => return Err(ConfigError::RootMissing(config.root.clone()).into()),
    }

    let namespaces = NamespaceSet::sandbox();
    namespaces.ensure_supported()?;

    unshare(namespaces.flags()).op("unshare")?;
    hardener::make_private_recursive(Path::new("/"))?;
    hardener::chdir(Path::new("/"))?;

    debug!(flags = ?namespaces.flags(), "detached from host namespaces");
    Ok(Isolated::new(config, context))
}
