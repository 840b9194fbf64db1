use crate::{
    capabilities::{Capability, CapabilityManager},
    error::{OperationContext, OperationError},
};
use nix::{
    errno::Errno,
    unistd::{Gid, Uid, getresgid, getresuid, setgroups, setresgid, setresuid},
};
use tracing::{debug, instrument};

/// Switches real, effective and saved ids to `uid`/`gid`.
///
/// The group is changed first: once the uid is dropped the process no
/// longer has the right to change its group, and a group id left behind
/// could be used to get the user id back. For any target other than root,
/// the capability sets are emptied afterwards so a process that started
/// with file capabilities keeps none of them.
#[instrument(skip_all, fields(uid = %uid, gid = %gid))]
pub fn drop_privileges(uid: Uid, gid: Gid) -> Result<(), OperationError> {
    if CapabilityManager::has_effective(Capability::CAP_SETGID) {
        setgroups(&[gid]).op("setgroups")?;
    }

    setresgid(gid, gid, gid).op("setresgid")?;
    setresuid(uid, uid, uid).op("setresuid")?;

    verify_identity(uid, gid)?;

    if !uid.is_root() {
        CapabilityManager::clear_unprivileged_capabilities()?;
    }

    debug!("dropped privileges");
    Ok(())
}

fn verify_identity(uid: Uid, gid: Gid) -> Result<(), OperationError> {
    let uids = getresuid().op("getresuid")?;
    if [uids.real, uids.effective, uids.saved] != [uid; 3] {
        return Err(OperationError::new(format!("verify uid {uid}"), Errno::EPERM));
    }

    let gids = getresgid().op("getresgid")?;
    if [gids.real, gids.effective, gids.saved] != [gid; 3] {
        return Err(OperationError::new(format!("verify gid {gid}"), Errno::EPERM));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::in_child;
    use nix::unistd::{getegid, geteuid, getgid, getgroups, getuid};

    #[test]
    fn test_drop_to_current_identity() {
        let (uid, gid) = (getuid(), getgid());

        let code = in_child(move || match drop_privileges(uid, gid) {
            Ok(()) if geteuid() == uid && getegid() == gid => 0,
            _ => 1,
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn test_root_cannot_be_regained() {
        if !geteuid().is_root() {
            return;
        }

        let code = in_child(|| {
            let (uid, gid) = (Uid::from_raw(65534), Gid::from_raw(65534));
            if drop_privileges(uid, gid).is_err() {
                return 1;
            }
            if getgroups().ok() != Some(vec![gid]) {
                return 2;
            }

            let root = Uid::from_raw(0);
            let regained = setresuid(root, root, root).is_ok()
                || setresgid(Gid::from_raw(0), Gid::from_raw(0), Gid::from_raw(0)).is_ok();
            match (regained, CapabilityManager::has_any_permitted()) {
                (false, Ok(false)) => 0,
                _ => 3,
            }
        });
        assert_eq!(code, 0);
    }
}
