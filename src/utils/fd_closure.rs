/// File descriptor hygiene for the child between fork and exec
///
/// Descriptors are marked close-on-exec rather than closed, so the spawn
/// machinery's own exec-status pipe keeps working until exec. Prefers
/// close_range(2) with CLOSE_RANGE_CLOEXEC and falls back to fcntl on every
/// descriptor below the soft RLIMIT_NOFILE. Both paths allocate nothing.
use crate::config::types::{Result, SandboxError};
use std::fs;
use std::io;

const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;

/// Make every descriptor `>= lowest` close on exec.
pub fn cloexec_from(lowest: libc::c_int) -> io::Result<()> {
    // SAFETY: close_range only changes descriptor flags.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            lowest as libc::c_uint,
            libc::c_uint::MAX,
            CLOSE_RANGE_CLOEXEC,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    cloexec_by_iteration(lowest)
}

fn cloexec_by_iteration(lowest: libc::c_int) -> io::Result<()> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit writes into the provided struct only.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // RLIM_INFINITY would make this loop unbounded.
    let upper = limit.rlim_cur.min(65_536) as libc::c_int;
    for fd in lowest..upper {
        // SAFETY: fcntl on a descriptor that may not exist fails with EBADF.
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
    Ok(())
}

/// Place `fd` at `target` with close-on-exec cleared.
pub fn install_at(fd: libc::c_int, target: libc::c_int) -> io::Result<()> {
    if fd == target {
        // SAFETY: clears FD_CLOEXEC on a descriptor we own.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, 0) } != 0 {
            return Err(io::Error::last_os_error());
        }
        return Ok(());
    }
    // SAFETY: dup2 onto a fixed slot; the new descriptor never has FD_CLOEXEC.
    if unsafe { libc::dup2(fd, target) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Open descriptors of `pid` ("self" for the current process), sorted.
pub fn open_fds(pid: &str) -> Result<Vec<i32>> {
    let fd_dir = format!("/proc/{}/fd", pid);
    let entries = fs::read_dir(&fd_dir)
        .map_err(|e| SandboxError::Process(format!("Failed to read {}: {}", fd_dir, e)))?;

    let mut fds: Vec<i32> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| name.parse::<i32>().ok())
        .collect();
    fds.sort_unstable();
    Ok(fds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_streams_are_open() {
        let fds = open_fds("self").unwrap();
        assert!(fds.contains(&0));
        assert!(fds.contains(&1));
        assert!(fds.contains(&2));
    }

    #[test]
    fn unknown_process_is_an_error() {
        assert!(open_fds("not-a-pid").is_err());
    }
}
