// Privilege minimization for the interpreter process
// Child-side functions are async-signal-safe; ProcStatus is read by the parent.

use crate::config::types::{Result, SandboxError};
use std::fs;
use std::io;

/// Highest capability number tried when clearing the bounding set.
const CAP_LAST_CAP: libc::c_ulong = 40;

/// Set PR_SET_NO_NEW_PRIVS so exec can never gain privileges.
pub fn set_no_new_privs() -> io::Result<()> {
    // SAFETY: prctl with integer arguments only.
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Drop every capability from the bounding and ambient sets. Unknown
/// capability numbers are ignored.
pub fn drop_bounding_set() {
    for cap in 0..=CAP_LAST_CAP {
        // SAFETY: prctl with integer arguments only.
        unsafe {
            libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0);
        }
    }
    // SAFETY: as above. Fails harmlessly on kernels without ambient caps.
    unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_CLEAR_ALL as libc::c_ulong,
            0,
            0,
            0,
        );
    }
}

/// Switch to an unprivileged identity: clear groups, then gid, then uid,
/// then verify nothing was left behind.
pub fn drop_credentials(uid: u32, gid: u32) -> io::Result<()> {
    // SAFETY: setgroups with a zero-length list does not read the pointer.
    if unsafe { libc::setgroups(0, std::ptr::null()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // gid first: after setresuid we could no longer change it.
    // SAFETY: plain integer arguments.
    if unsafe { libc::setresgid(gid, gid, gid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: plain integer arguments.
    if unsafe { libc::setresuid(uid, uid, uid) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let (mut ruid, mut euid, mut suid) = (0, 0, 0);
    // SAFETY: getresuid writes the three out-pointers only.
    if unsafe { libc::getresuid(&mut ruid, &mut euid, &mut suid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if ruid != uid || euid != uid || suid != uid {
        return Err(io::Error::from_raw_os_error(libc::EPERM));
    }
    Ok(())
}

pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no failure modes.
    unsafe { libc::geteuid() == 0 }
}

/// Security-relevant fields of `/proc/<pid>/status`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcStatus {
    pub no_new_privs: bool,
    /// 0 disabled, 1 strict, 2 filter.
    pub seccomp_mode: u8,
    pub effective_uid: Option<u32>,
    pub effective_gid: Option<u32>,
}

impl ProcStatus {
    pub fn read(pid: u32) -> Result<Self> {
        let path = format!("/proc/{}/status", pid);
        let content = fs::read_to_string(&path)
            .map_err(|e| SandboxError::Process(format!("Failed to read {}: {}", path, e)))?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut status = ProcStatus::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key {
                "NoNewPrivs" => status.no_new_privs = value == "1",
                "Seccomp" => status.seccomp_mode = value.parse().unwrap_or(0),
                // Real, effective, saved, filesystem.
                "Uid" => status.effective_uid = nth_field(value, 1),
                "Gid" => status.effective_gid = nth_field(value, 1),
                _ => {}
            }
        }
        status
    }

    pub fn seccomp_filtered(&self) -> bool {
        self.seccomp_mode == 2
    }
}

fn nth_field(value: &str, n: usize) -> Option<u32> {
    value.split_whitespace().nth(n).and_then(|f| f.parse().ok())
}
