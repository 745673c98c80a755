/// Child-side setup between fork and exec
///
/// The sequence is fixed:
/// 1. parent-death signal, report fd installed at 3, every other fd close-on-exec
/// 2. namespaces (unshare), identity map, private filesystem root
/// 3. credential drop, when the supervisor runs as root
/// 4. rlimits
/// 5. no_new_privs, then the seccomp filter
/// 6. exec (performed by the caller)
///
/// Everything here runs in the forked child of a possibly multithreaded
/// parent: no allocation, no locks, no logging. The plan is computed in the
/// parent and only read here. Each step consumes the previous state, so an
/// out-of-order sequence does not compile.
use crate::exec::harness::REPORT_FD;
use crate::kernel::mount::FilesystemView;
use crate::kernel::namespace::IdentityMap;
use crate::kernel::rlimit::RlimitPlan;
use crate::kernel::seccomp::SeccompFilter;
use crate::kernel::{capabilities, namespace, signal};
use crate::utils::fd_closure;
use nix::sched::CloneFlags;
use std::io;
use std::marker::PhantomData;
use std::os::unix::io::RawFd;

/// Everything the child needs, resolved before fork.
pub struct ChildPlan {
    /// Supervisor pid, for the orphan check after PR_SET_PDEATHSIG.
    pub parent_pid: libc::pid_t,
    /// Write end of the report pipe, moved to fd 3.
    pub report_write_fd: RawFd,
    pub strict_mode: bool,
    pub unshare_flags: Option<CloneFlags>,
    /// Written right after unshare when a user namespace is created.
    pub identity: Option<IdentityMap>,
    /// Built once the mount namespace exists.
    pub filesystem: Option<FilesystemView>,
    pub rlimits: RlimitPlan,
    /// Target (uid, gid) when running as root.
    pub credentials: Option<(u32, u32)>,
    pub seccomp: Option<SeccompFilter>,
}

/// Type-state marker: fresh child, nothing applied yet
pub struct FreshChild;
/// Type-state marker: lifecycle bound to the supervisor, descriptors settled
pub struct Detached;
/// Type-state marker: namespaces applied
pub struct Isolated;
/// Type-state marker: unprivileged identity
pub struct CredsDropped;
/// Type-state marker: rlimits applied
pub struct Limited;
/// Type-state marker: no_new_privs and seccomp in place
pub struct Locked;

pub struct Sandbox<'a, S> {
    plan: &'a ChildPlan,
    _state: PhantomData<S>,
}

impl<'a, S> Sandbox<'a, S> {
    fn advance<T>(self) -> Sandbox<'a, T> {
        Sandbox {
            plan: self.plan,
            _state: PhantomData,
        }
    }

    /// Strict mode propagates a failed control; permissive mode carries on
    /// and the parent reports the gap from /proc.
    fn tolerate(&self, result: io::Result<()>) -> io::Result<()> {
        match result {
            Err(e) if self.plan.strict_mode => Err(e),
            _ => Ok(()),
        }
    }
}

impl<'a> Sandbox<'a, FreshChild> {
    pub fn new(plan: &'a ChildPlan) -> Self {
        Self {
            plan,
            _state: PhantomData,
        }
    }

    /// Death signal and report fd are never optional: without them the
    /// supervisor can neither reap nor trust the run.
    pub fn detach(self) -> io::Result<Sandbox<'a, Detached>> {
        signal::set_parent_death_signal(self.plan.parent_pid)?;
        fd_closure::install_at(self.plan.report_write_fd, REPORT_FD)?;
        self.tolerate(fd_closure::cloexec_from(REPORT_FD + 1))?;
        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, Detached> {
    pub fn isolate(self) -> io::Result<Sandbox<'a, Isolated>> {
        let Some(flags) = self.plan.unshare_flags else {
            return Ok(self.advance());
        };
        if let Err(e) = namespace::unshare_namespaces(flags) {
            // Still in the host's mount namespace: leave mounts alone.
            self.tolerate(Err(e))?;
            return Ok(self.advance());
        }
        if let Some(identity) = self.plan.identity.as_ref() {
            self.tolerate(identity.write())?;
        }
        if let Some(view) = self.plan.filesystem.as_ref() {
            self.tolerate(view.enter())?;
        }
        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, Isolated> {
    pub fn drop_credentials(self) -> io::Result<Sandbox<'a, CredsDropped>> {
        if let Some((uid, gid)) = self.plan.credentials {
            capabilities::drop_bounding_set();
            self.tolerate(capabilities::drop_credentials(uid, gid))?;
            // Changing the effective uid clears the parent-death signal.
            signal::set_parent_death_signal(self.plan.parent_pid)?;
        }
        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, CredsDropped> {
    /// RLIMIT_NPROC must be lowered after setresuid: lowering it first makes
    /// the kernel flag the uid switch as over the limit and execve then
    /// fails with EAGAIN.
    pub fn apply_limits(self) -> io::Result<Sandbox<'a, Limited>> {
        self.plan.rlimits.apply(self.plan.strict_mode)?;
        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, Limited> {
    pub fn lock(self) -> io::Result<Sandbox<'a, Locked>> {
        self.tolerate(capabilities::set_no_new_privs())?;
        if let Some(filter) = self.plan.seccomp.as_ref() {
            self.tolerate(filter.install())?;
        }
        Ok(self.advance())
    }
}

/// Run the whole sequence. Called from `CommandExt::pre_exec`.
pub fn run(plan: &ChildPlan) -> io::Result<()> {
    Sandbox::new(plan)
        .detach()?
        .isolate()?
        .drop_credentials()?
        .apply_limits()?
        .lock()?;
    Ok(())
}
