use crate::capabilities::CapabilityManager;
use anyhow::{Context, Result, bail};
use nix::unistd::{Gid, Uid, geteuid, getgid, getuid};
use std::{
    env,
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeLevel {
    Root,
    Setuid,
    Capabilities,
    Unprivileged,
}

/// Everything rootbox reads about its invoker, captured once at startup.
///
/// The launch never consults the live process state for these values again:
/// by the time the environment is rebuilt the process has already chrooted
/// and changed identity.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    ruid: Uid,
    euid: Uid,
    rgid: Gid,
    level: PrivilegeLevel,
    cwd: PathBuf,
    environment: Vec<(OsString, OsString)>,
}

impl InvocationContext {
    pub fn capture() -> Result<Self> {
        let ruid = getuid();
        let euid = geteuid();
        let rgid = getgid();

        let level = if ruid != euid {
            if !euid.is_root() {
                bail!(
                    "FATAL: setuid binary must elevate to root (euid=0), but got euid={}",
                    euid
                );
            }
            PrivilegeLevel::Setuid
        } else if euid.is_root() {
            PrivilegeLevel::Root
        } else if CapabilityManager::has_any_permitted()? {
            PrivilegeLevel::Capabilities
        } else {
            PrivilegeLevel::Unprivileged
        };

        let cwd = env::current_dir().context("Failed to read the current directory")?;

        Ok(Self {
            ruid,
            euid,
            rgid,
            level,
            cwd,
            environment: env::vars_os().collect(),
        })
    }

    /// Builds a context without consulting the process, for tests.
    #[cfg(test)]
    pub fn fixed(uid: u32, gid: u32, cwd: &str, environment: &[(&str, &str)]) -> Self {
        Self {
            ruid: Uid::from_raw(uid),
            euid: Uid::from_raw(uid),
            rgid: Gid::from_raw(gid),
            level: PrivilegeLevel::Unprivileged,
            cwd: PathBuf::from(cwd),
            environment: environment
                .iter()
                .map(|(name, value)| (OsString::from(name), OsString::from(value)))
                .collect(),
        }
    }

    /// Real uid of the invoker; the default target identity.
    #[inline]
    pub fn ruid(&self) -> Uid {
        self.ruid
    }

    #[inline]
    pub fn euid(&self) -> Uid {
        self.euid
    }

    /// Real gid of the invoker; the default target group.
    #[inline]
    pub fn rgid(&self) -> Gid {
        self.rgid
    }

    #[inline]
    pub fn privilege_level(&self) -> PrivilegeLevel {
        self.level
    }

    /// Directory rootbox was started from.
    #[inline]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// The environment rootbox was started with.
    pub fn environment(&self) -> &[(OsString, OsString)] {
        &self.environment
    }

    /// `TERM` of the invoking shell.
    pub fn term(&self) -> Option<&OsStr> {
        self.environment
            .iter()
            .find(|(name, _)| name == "TERM")
            .map(|(_, value)| value.as_os_str())
    }
}
