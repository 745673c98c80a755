/// Network and mount isolation through namespaces
///
/// Unprivileged callers need a user namespace to be allowed to create
/// network or mount namespaces; root creates them directly.
use nix::sched::{unshare, CloneFlags};
use std::fs;
use std::io;

/// Flags to unshare for a run, `None` when it needs no namespace.
pub fn isolation_flags(running_as_root: bool, network: bool, mounts: bool) -> Option<CloneFlags> {
    let mut flags = CloneFlags::empty();
    if network {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    if mounts {
        flags |= CloneFlags::CLONE_NEWNS;
    }
    if flags.is_empty() {
        return None;
    }
    if !running_as_root {
        flags |= CloneFlags::CLONE_NEWUSER;
    }
    Some(flags)
}

/// Move the calling process into fresh namespaces. Async-signal-safe.
pub fn unshare_namespaces(flags: CloneFlags) -> io::Result<()> {
    unshare(flags).map_err(io::Error::from)
}

/// Maps the caller's own uid and gid into its fresh user namespace. Without
/// a mapping the kernel refuses to create files there, which building a
/// private filesystem root needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityMap {
    uid_line: Vec<u8>,
    gid_line: Vec<u8>,
}

impl IdentityMap {
    pub fn current() -> Self {
        // SAFETY: geteuid and getegid cannot fail.
        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
        Self {
            uid_line: format!("{uid} {uid} 1\n").into_bytes(),
            gid_line: format!("{gid} {gid} 1\n").into_bytes(),
        }
    }

    /// Write the maps for the calling process. Async-signal-safe.
    pub fn write(&self) -> io::Result<()> {
        // gid_map is only writable once setgroups is denied.
        write_proc(b"/proc/self/setgroups\0", b"deny")?;
        write_proc(b"/proc/self/uid_map\0", &self.uid_line)?;
        write_proc(b"/proc/self/gid_map\0", &self.gid_line)
    }
}

fn write_proc(path: &[u8], content: &[u8]) -> io::Result<()> {
    // SAFETY: `path` is NUL-terminated; the descriptor is closed below.
    let fd = unsafe { libc::open(path.as_ptr().cast(), libc::O_WRONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: writes `content.len()` bytes from a live slice.
    let written = unsafe { libc::write(fd, content.as_ptr().cast(), content.len()) };
    let err = io::Error::last_os_error();
    // SAFETY: fd was opened above and is owned here.
    unsafe { libc::close(fd) };
    if written != content.len() as isize {
        return Err(err);
    }
    Ok(())
}

/// Namespace inode of `pid` ("self" for the caller), e.g. `net:[4026531993]`.
pub fn namespace_id(pid: &str, kind: &str) -> Option<String> {
    fs::read_link(format!("/proc/{}/ns/{}", pid, kind))
        .ok()
        .map(|link| link.to_string_lossy().into_owned())
}

/// Whether `pid` lives in a different network namespace than the caller.
/// `None` when either side cannot be read.
pub fn network_isolated(pid: u32) -> Option<bool> {
    let own = namespace_id("self", "net")?;
    let child = namespace_id(&pid.to_string(), "net")?;
    Some(own != child)
}

/// Best-effort check that this host lets the caller create the namespaces
/// a run needs.
pub fn namespaces_supported(running_as_root: bool) -> bool {
    if fs::read_dir("/proc/self/ns").is_err() {
        return false;
    }
    if running_as_root {
        return true;
    }
    let max_userns = fs::read_to_string("/proc/sys/user/max_user_namespaces")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(1);
    let unprivileged_clone = fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone")
        .map(|s| s.trim() != "0")
        .unwrap_or(true);
    max_userns > 0 && unprivileged_clone
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_skips_user_namespace() {
        let root = isolation_flags(true, true, true).unwrap();
        assert!(!root.contains(CloneFlags::CLONE_NEWUSER));
        assert!(root.contains(CloneFlags::CLONE_NEWNET | CloneFlags::CLONE_NEWNS));

        let user = isolation_flags(false, true, false).unwrap();
        assert!(user.contains(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET));
        assert!(!user.contains(CloneFlags::CLONE_NEWNS));
    }

    #[test]
    fn no_namespace_requested() {
        assert_eq!(isolation_flags(false, false, false), None);
        let mounts_only = isolation_flags(false, false, true).unwrap();
        assert!(mounts_only.contains(CloneFlags::CLONE_NEWNS));
        assert!(!mounts_only.contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn identity_map_maps_only_the_caller() {
        let map = IdentityMap::current();
        let uid = unsafe { libc::geteuid() };
        assert_eq!(map.uid_line, format!("{uid} {uid} 1\n").into_bytes());
        assert!(map.gid_line.ends_with(b" 1\n"));
    }

    #[test]
    fn own_namespace_is_not_isolated() {
        let pid = std::process::id();
        if let Some(isolated) = network_isolated(pid) {
            assert!(!isolated);
        }
        if let Some(id) = namespace_id("self", "net") {
            assert!(id.starts_with("net:["));
        }
    }
}
