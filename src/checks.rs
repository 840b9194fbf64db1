use nix::sched::CloneFlags;
use std::path::Path;

/// Namespace flags and their entries under `/proc/self/ns`.
const NAMESPACES: [(CloneFlags, &str); 2] = [
    (CloneFlags::CLONE_NEWNS, "mnt"),
    (CloneFlags::CLONE_NEWPID, "pid"),
];

/// Whether the running kernel can create the namespace behind `flag`.
pub fn is_namespace_supported(flag: CloneFlags) -> bool {
    // Not a namespace: unsharing fs attributes has been possible since 2.6.16
    if flag == CloneFlags::CLONE_FS {
        return true;
    }

    NAMESPACES
        .iter()
        .find(|(namespace, _)| *namespace == flag)
        .is_some_and(|(_, name)| Path::new("/proc/self/ns").join(name).exists())
}
