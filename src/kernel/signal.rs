// Signal plumbing for the interpreter's process group
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io;

/// Have the kernel SIGKILL the child when the thread that spawned it
/// exits. Async-signal-safe.
///
/// `parent` is the supervisor pid captured before fork; if it already
/// exited the child is orphaned and refuses to run.
pub fn set_parent_death_signal(parent: libc::pid_t) -> io::Result<()> {
    // SAFETY: prctl with integer arguments only.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: getppid has no failure modes.
    if unsafe { libc::getppid() } != parent {
        return Err(io::Error::from_raw_os_error(libc::ESRCH));
    }
    Ok(())
}

/// Send `signal` to every process in group `pgid`. Returns false when the
/// group no longer exists.
pub fn signal_group(pgid: u32, signal: Signal) -> bool {
    match killpg(Pid::from_raw(pgid as libc::pid_t), signal) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(e) => {
            log::warn!("Failed to send {} to process group {}: {}", signal, pgid, e);
            false
        }
    }
}

/// Human-readable signal name, e.g. `SIGKILL`.
pub fn signal_name(signal: i32) -> String {
    Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {}", signal))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_known_signals() {
        assert_eq!(signal_name(libc::SIGKILL), "SIGKILL");
        assert_eq!(signal_name(libc::SIGXCPU), "SIGXCPU");
        assert_eq!(signal_name(250), "signal 250");
    }

    #[test]
    fn missing_group_reports_false() {
        // pid_max is far below this on every supported kernel.
        assert!(!signal_group(4_000_000, Signal::SIGTERM));
    }
}
