//! The launch as a chain of stages.
//!
//! Each stage is a type that can only be produced by the stage before it,
//! so the order namespace -> binds -> root -> virtual filesystems ->
//! identity and environment -> exec is fixed at compile time:
//!
//! ```text
//! namespace::isolate -> Isolated -> Bound -> Rooted -> Provisioned -> Sanitized -> exec
//! ```

use crate::{
    config::LaunchConfig,
    context::InvocationContext,
    environment::{self, Environment, UserDefaults},
    error::{LaunchError, Result},
    exec, hardener, mount, privilege, vfs,
};
use std::{
    convert::Infallible,
    path::{Path, PathBuf},
};
use tracing::debug;

/// The process is in private mount and pid namespaces and `/` no longer
/// propagates to the host.
#[derive(Debug)]
pub struct Isolated<'a> {
    config: &'a LaunchConfig,
    context: &'a InvocationContext,
}

impl<'a> Isolated<'a> {
    pub(crate) fn new(config: &'a LaunchConfig, context: &'a InvocationContext) -> Self {
        Self { config, context }
    }

    /// Mounts every bind under the root directory, in configuration order.
    /// Destinations are resolved against the host path of the root, before
    /// any root change.
    pub fn bind_mounts(self) -> Result<Bound<'a>> {
        mount::mount_binds(&self.config.root, &self.config.binds)?;

        Ok(Bound {
            config: self.config,
            context: self.context,
        })
    }
}

/// All binds are in place under the root directory.
#[derive(Debug)]
pub struct Bound<'a> {
    config: &'a LaunchConfig,
    context: &'a InvocationContext,
}

impl<'a> Bound<'a> {
    /// Switches to the root directory. Afterwards `/` is the new root and
    /// so is the working directory.
    pub fn enter_root(self) -> Result<Rooted<'a>> {
        hardener::enter_root(&self.config.root)?;

        Ok(Rooted {
            config: self.config,
            context: self.context,
        })
    }
}

/// The process root is the configured root directory.
#[derive(Debug)]
pub struct Rooted<'a> {
    config: &'a LaunchConfig,
    context: &'a InvocationContext,
}

impl<'a> Rooted<'a> {
    /// Mounts the enabled virtual filesystems whose mount points exist. Runs
    /// with full privileges since the runtime directory is chowned here.
    pub fn provision(self) -> Result<Provisioned<'a>> {
        let runtime_dir = vfs::provision(
            Path::new("/"),
            self.config.vfs,
            self.config.uid,
            self.config.gid,
            &self.config.runtime_links,
        )?;

        Ok(Provisioned {
            config: self.config,
            context: self.context,
            runtime_dir,
        })
    }
}

/// The mount table is final; no later stage mounts anything.
#[derive(Debug)]
pub struct Provisioned<'a> {
    config: &'a LaunchConfig,
    context: &'a InvocationContext,
    runtime_dir: Option<PathBuf>,
}

impl<'a> Provisioned<'a> {
    /// Drops to the target identity, then rebuilds the environment for it.
    pub fn sanitize(self) -> Result<Sanitized<'a>> {
        privilege::drop_privileges(self.config.uid, self.config.gid)?;

        let user = UserDefaults::lookup(self.config.uid);
        let environment = environment::build(
            self.config,
            self.context,
            &user,
            self.runtime_dir.as_deref(),
        );
        user.ensure_home();

        if self.config.no_new_privs {
            hardener::apply_no_new_privs()?;
        }

        Ok(Sanitized {
            config: self.config,
            environment,
        })
    }
}

/// Running as the target identity with the final environment.
#[derive(Debug)]
pub struct Sanitized<'a> {
    config: &'a LaunchConfig,
    environment: Environment,
}

impl Sanitized<'_> {
    /// Enters the working directory and replaces the process with the
    /// command, or with `sh` when there is none. Returns only on failure.
    pub fn exec(self) -> Result<Infallible> {
        hardener::chdir(&self.config.working_dir)?;
        debug!(cwd = %self.config.working_dir.display(), "starting command");

        Ok(exec::replace_process(
            self.config.command.as_ref(),
            &self.environment,
        )?)
    }
}

/// Runs every stage after isolation. A successful launch never returns, so
/// the only value that comes back is the error that stopped it.
pub fn run(isolated: Isolated<'_>) -> LaunchError {
    let launched = isolated
        .bind_mounts()
        .and_then(Bound::enter_root)
        .and_then(Rooted::provision)
        .and_then(Provisioned::sanitize)
        .and_then(Sanitized::exec);

    match launched {
        Ok(never) => match never {},
        Err(error) => error,
    }
}
