//! The environment handed to the command.
//!
//! rootbox never edits its own process environment. The inherited
//! variables are captured at startup, a fresh [`Environment`] is built from
//! them here, and it is passed to `execve` explicitly.

use crate::{
    config::{EnvAssignment, LaunchConfig},
    context::InvocationContext,
    utils,
};
use nix::unistd::{Uid, User};
use std::{
    collections::BTreeMap,
    ffi::{CString, NulError, OsStr, OsString},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
pub const DEFAULT_SHELL: &str = "/bin/sh";
pub const DEFAULT_HOME: &str = "/";
pub const RUNTIME_DIR_VAR: &str = "XDG_RUNTIME_DIR";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<OsString, OsString>,
}

impl Environment {
    pub fn get(&self, name: &str) -> Option<&OsStr> {
        self.vars.get(OsStr::new(name)).map(OsString::as_os_str)
    }

    pub fn set(&mut self, name: impl Into<OsString>, value: impl Into<OsString>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Sets `name` only if it is absent. Returns whether it was set.
    pub fn set_default(&mut self, name: &str, value: impl Into<OsString>) -> bool {
        if self.vars.contains_key(OsStr::new(name)) {
            return false;
        }

        self.vars.insert(name.into(), value.into());
        true
    }

    pub fn apply(&mut self, assignment: &EnvAssignment) {
        self.set(assignment.name(), assignment.value());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(name, value)| (name.as_os_str(), value.as_os_str()))
    }

    /// `NAME=VALUE` strings in the form `execve` expects.
    pub fn to_cstrings(&self) -> Result<Vec<CString>, NulError> {
        self.iter()
            .map(|(name, value)| {
                let mut entry = Vec::with_capacity(name.len() + value.len() + 1);
                entry.extend_from_slice(name.as_bytes());
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                CString::new(entry)
            })
            .collect()
    }
}

impl FromIterator<(OsString, OsString)> for Environment {
    fn from_iter<I: IntoIterator<Item = (OsString, OsString)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

/// What the user database says about the target uid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserDefaults {
    pub name: Option<String>,
    pub home: Option<PathBuf>,
    pub shell: Option<PathBuf>,
}

impl UserDefaults {
    /// Looks `uid` up in the user database of the current root.
    pub fn lookup(uid: Uid) -> Self {
        match User::from_uid(uid) {
            Ok(Some(user)) => Self {
                name: Some(user.name),
                home: Some(user.dir).filter(|dir| !dir.as_os_str().is_empty()),
                shell: Some(user.shell).filter(|shell| !shell.as_os_str().is_empty()),
            },
            Ok(None) => {
                debug!(%uid, "no user database entry");
                Self::default()
            }
            Err(errno) => {
                warn!(%uid, %errno, "user database lookup failed");
                Self::default()
            }
        }
    }

    /// Creates the home directory from the user database if it is missing.
    /// Not being able to is reported and otherwise ignored.
    pub fn ensure_home(&self) {
        let Some(home) = self.home.as_deref() else {
            return;
        };

        if utils::path_exists(home) {
            return;
        }

        match utils::create_directory_recursive(home, 0o700) {
            Ok(()) => debug!(home = %home.display(), "created home directory"),
            Err(error) => warn!(home = %home.display(), %error, "cannot create home directory"),
        }
    }
}

/// Builds the command's environment, in order: the inherited variables
/// unless `clear_env` is set, every explicit assignment, defaults for
/// whatever is still missing, and the runtime directory.
///
/// Defaults never replace a value that is already present.
pub fn build(
    config: &LaunchConfig,
    context: &InvocationContext,
    user: &UserDefaults,
    runtime_dir: Option<&Path>,
) -> Environment {
    let mut environment = if config.clear_env {
        Environment::default()
    } else {
        context.environment().iter().cloned().collect()
    };

    for assignment in &config.env {
        environment.apply(assignment);
    }

    environment.set_default("HOME", user.home.as_deref().unwrap_or(Path::new(DEFAULT_HOME)));
    environment.set_default(
        "USER",
        user.name.clone().unwrap_or_else(|| config.uid.to_string()),
    );
    environment.set_default("SHELL", user.shell.as_deref().unwrap_or(Path::new(DEFAULT_SHELL)));
    environment.set_default("PATH", DEFAULT_PATH);

    if let Some(term) = context.term() {
        environment.set_default("TERM", term);
    }

    if let Some(dir) = runtime_dir {
        environment.set_default(RUNTIME_DIR_VAR, dir);
    }

    environment
}
