use crate::error::OperationError;
use anyhow::{Context, Result};
use caps::{CapsHashSet, errors::CapsError};
use nix::errno::Errno;

pub(crate) use caps::{CapSet, Capability};

/// What building a sandbox needs when rootbox is not running as root.
pub const SANDBOX_CAPABILITIES: [Capability; 5] = [
    Capability::CAP_SYS_ADMIN,
    Capability::CAP_SYS_CHROOT,
    Capability::CAP_SETUID,
    Capability::CAP_SETGID,
    Capability::CAP_CHOWN,
];

pub(crate) struct CapabilityManager;

impl CapabilityManager {
    const UNPRIVILEGED_SETS: [CapSet; 3] =
        [CapSet::Permitted, CapSet::Inheritable, CapSet::Effective];

    /// Get the current snapshot of the capability sets that matter for a launch
    pub fn current() -> Result<CapabilitySnapshot> {
        Ok(CapabilitySnapshot {
            effective: Self::read_capability_set(CapSet::Effective)?,
            permitted: Self::read_capability_set(CapSet::Permitted)?,
            inheritable: Self::read_capability_set(CapSet::Inheritable)?,
            bounding: Self::read_capability_set(CapSet::Bounding)?,
        })
    }

    /// Capabilities from [`SANDBOX_CAPABILITIES`] missing from the permitted set.
    pub fn missing_sandbox_capabilities() -> Result<CapsHashSet> {
        let permitted = Self::read_capability_set(CapSet::Permitted)?;

        Ok(SANDBOX_CAPABILITIES
            .into_iter()
            .filter(|capability| !permitted.contains(capability))
            .collect())
    }

    pub fn has_any_permitted() -> Result<bool> {
        let capabilities = Self::read_capability_set(CapSet::Permitted)?;
        Ok(!capabilities.is_empty())
    }

    pub fn has_effective(capability: Capability) -> bool {
        caps::has_cap(None, CapSet::Effective, capability).unwrap_or(false)
    }

    /// Empties the permitted, inheritable and effective sets. Once the
    /// permitted set is empty nothing short of `execve` of a privileged
    /// binary can bring a capability back.
    pub fn clear_unprivileged_capabilities() -> Result<(), OperationError> {
        for cap_set in Self::UNPRIVILEGED_SETS {
            caps::clear(None, cap_set).map_err(|error| clear_failed(cap_set, &error))?;
        }

        Ok(())
    }

    fn read_capability_set(cap_set: CapSet) -> Result<CapsHashSet> {
        caps::read(None, cap_set).context(format!("Failed to read {:?} capability set", cap_set))
    }
}

/// `caps` reports failures as text only; capset(2) can only refuse with EPERM.
fn clear_failed(cap_set: CapSet, error: &CapsError) -> OperationError {
    OperationError::new(format!("clear {cap_set:?} capabilities ({error})"), Errno::EPERM)
}

/// Represents the current state of process capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    pub effective: CapsHashSet,
    pub permitted: CapsHashSet,
    pub inheritable: CapsHashSet,
    pub bounding: CapsHashSet,
}

impl std::fmt::Display for CapabilitySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Capabilities - ")?;
        write!(f, "Effective: {}, ", self.effective.len())?;
        write!(f, "Permitted: {}, ", self.permitted.len())?;
        write!(f, "Inheritable: {}, ", self.inheritable.len())?;
        write!(f, "Bounding: {}", self.bounding.len())
    }
}
