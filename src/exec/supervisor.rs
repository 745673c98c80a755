/// Sandboxed run lifecycle
///
/// `IsolationContext<Idle>` → `prepare` → `IsolationContext<Prepared>` →
/// `start` → `RunningExecution` → `wait` → `ExecutionResult`.
///
/// Threads per run:
/// - reaper: spawns the interpreter and stays alive until it is reaped, so
///   the child's parent-death signal is tied to the run and not to the
///   caller's thread
/// - watchdog: wall deadline and cancellation, owned by the reaper
/// - stdin writer, stdout/stderr collectors, report reader
///
/// The interpreter leads its own process group. The group is only signalled
/// while the leader is unreaped, so its id cannot have been recycled.
use crate::config::presets::PYTHON_ENVELOPE;
use crate::config::types::*;
use crate::config::validator;
use crate::exec::harness::{self, ProgramHeader};
use crate::exec::preexec::{self, ChildPlan};
use crate::kernel::capabilities::{self, ProcStatus};
use crate::kernel::mount::{self, FilesystemView};
use crate::kernel::namespace::{self, IdentityMap};
use crate::kernel::rlimit::RlimitPlan;
use crate::kernel::seccomp::SeccompFilter;
use crate::kernel::signal::signal_group;
use crate::observability::audit::{self, CorrelationIds};
use crate::observability::metrics;
use crate::utils::env_hygiene;
use crate::utils::output::{self, CapturedStream};
use crate::verdict::{Evidence, TerminalState, VerdictClassifier, WaitOutcome, WatchdogAction};
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Harness reports are a few hundred bytes; anything past this is noise.
const REPORT_LIMIT: usize = 64 * 1024;

/// Type-state marker: limits known, nothing resolved yet
pub struct Idle;

/// Type-state marker: launch plan built, ready to spawn
pub struct Prepared {
    launch: LaunchPlan,
}

struct LaunchPlan {
    nonce: String,
    payload: Vec<u8>,
    fingerprint: String,
    argv: Vec<OsString>,
    env: BTreeMap<String, String>,
    cwd: PathBuf,
    unshare_flags: Option<CloneFlags>,
    identity: Option<IdentityMap>,
    filesystem: Option<FilesystemView>,
    credentials: Option<(u32, u32)>,
    rlimits: RlimitPlan,
    seccomp: Option<SeccompFilter>,
}

/// One execution's isolation settings, consumed by each transition.
pub struct IsolationContext<S> {
    config: SandboxConfig,
    limits: ExecutionLimits,
    correlation: CorrelationIds,
    state: S,
}

impl<S> IsolationContext<S> {
    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    pub fn run_id(&self) -> &str {
        &self.correlation.run_id
    }
}

impl IsolationContext<Idle> {
    pub fn new(config: SandboxConfig, limits: ExecutionLimits) -> Self {
        Self {
            config,
            limits,
            correlation: CorrelationIds::new(),
            state: Idle,
        }
    }

    /// Validate limits and resolve everything the child will need.
    pub fn prepare(self, program: &str) -> Result<IsolationContext<Prepared>> {
        if !self.config.interpreter.is_file() {
            return Err(SandboxError::Interpreter(format!(
                "{} not found",
                self.config.interpreter.display()
            )));
        }
        validator::validate(&self.limits, &self.config)?;

        let nonce = Uuid::new_v4().to_string();
        let payload = ProgramHeader::new(nonce.clone(), &self.limits, self.config.recursion_limit)
            .encode(program)
            .map_err(|e| SandboxError::Config(format!("Failed to encode program header: {}", e)))?;

        let root = capabilities::running_as_root();
        let filesystem = if self.config.filesystem_isolation {
            let scratch = self
                .limits
                .scratch_dir
                .as_deref()
                .filter(|_| self.limits.allows(Capability::Filesystem));
            match FilesystemView::plan(&self.config.mount_stage, &self.config.interpreter, scratch) {
                Ok(view) => Some(view),
                Err(e) if self.config.strict_mode => return Err(e),
                Err(e) => {
                    log::warn!("Running without filesystem isolation: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let isolate_network = self.config.network_namespace && !self.limits.allows(Capability::Network);
        let unshare_flags = namespace::isolation_flags(root, isolate_network, filesystem.is_some());
        let identity = unshare_flags
            .filter(|flags| flags.contains(CloneFlags::CLONE_NEWUSER))
            .map(|_| IdentityMap::current());
        let credentials = root.then_some((self.config.drop_to_uid, self.config.drop_to_gid));

        let seccomp = if self.config.syscall_filter && !self.limits.allows(Capability::RawSyscall) {
            match SeccompFilter::for_capabilities(&self.limits.capabilities) {
                Ok(filter) => Some(filter),
                Err(e) if self.config.strict_mode => return Err(e),
                Err(e) => {
                    log::warn!("Running without syscall filter: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let env = if self.limits.allows(Capability::Environment) {
            env_hygiene::sanitized_host_environment()
        } else {
            env_hygiene::baseline_environment()
        };
        let cwd = match (&self.limits.scratch_dir, self.limits.allows(Capability::Filesystem)) {
            (Some(dir), true) => dir.clone(),
            _ => PathBuf::from("/"),
        };

        let launch = LaunchPlan {
            nonce,
            payload,
            fingerprint: audit::program_fingerprint(program),
            argv: PYTHON_ENVELOPE.argv(&self.config, &harness::harness_script()),
            env,
            cwd,
            unshare_flags,
            identity,
            filesystem,
            credentials,
            rlimits: RlimitPlan::for_run(&self.limits, &self.config),
            seccomp,
        };

        log::debug!(
            "Prepared run {}: {} byte payload, namespaces {:?}, private root {}, credential drop {}, seccomp {}",
            self.correlation.run_id,
            launch.payload.len(),
            launch.unshare_flags,
            launch.filesystem.is_some(),
            launch.credentials.is_some(),
            launch.seccomp.is_some()
        );

        Ok(IsolationContext {
            config: self.config,
            limits: self.limits,
            correlation: self.correlation,
            state: Prepared { launch },
        })
    }
}

impl IsolationContext<Prepared> {
    pub fn nonce(&self) -> &str {
        &self.state.launch.nonce
    }

    /// Spawn the interpreter, verify its controls and deliver the program.
    pub fn start(self) -> Result<RunningExecution> {
        let IsolationContext {
            config,
            limits,
            correlation,
            state: Prepared { launch },
        } = self;

        let grants = grants_label(&limits.capabilities);
        audit::execution_start(&correlation, PYTHON_ENVELOPE.id, &launch.fingerprint, &grants);

        let (report_read, report_write) = report_pipe()?;
        let expected = ExpectedControls {
            network_namespace: launch
                .unshare_flags
                .is_some_and(|flags| flags.contains(CloneFlags::CLONE_NEWNET)),
            filesystem: launch.filesystem.is_some(),
            seccomp: launch.seccomp.is_some(),
            credentials: launch.credentials,
            address_space: launch.rlimits.get("RLIMIT_AS").map(|v| v.soft),
        };
        let child_plan = ChildPlan {
            parent_pid: std::process::id() as libc::pid_t,
            report_write_fd: report_write.as_raw_fd(),
            strict_mode: config.strict_mode,
            unshare_flags: launch.unshare_flags,
            identity: launch.identity,
            filesystem: launch.filesystem,
            rlimits: launch.rlimits,
            credentials: launch.credentials,
            seccomp: launch.seccomp,
        };
        let spawn = SpawnSpec {
            argv: launch.argv,
            env: launch.env,
            cwd: launch.cwd,
            plan: child_plan,
            report_write,
        };
        let timing = Timing {
            wall: limits.wall_time(),
            grace: Duration::from_millis(config.kill_grace_ms),
        };

        let (launched_tx, launched_rx) = bounded(1);
        let (cancel_tx, cancel_rx) = bounded(1);
        let reaper_correlation = correlation.clone();
        let reaper = thread::Builder::new()
            .name("twibox-reaper".to_string())
            .spawn(move || reaper_main(spawn, launched_tx, cancel_rx, timing, reaper_correlation))?;

        let launched = match launched_rx.recv() {
            Ok(Ok(launched)) => launched,
            Ok(Err(e)) => {
                let _ = reaper.join();
                return Err(spawn_error(&config, e));
            }
            Err(_) => {
                let _ = reaper.join();
                return Err(SandboxError::Process(
                    "reaper thread exited before launch".to_string(),
                ));
            }
        };

        let correlation = correlation.with_root_pid(launched.pid);
        metrics::get_metrics().active_executions.inc();
        let mut running = RunningExecution {
            correlation,
            limits,
            nonce: launch.nonce,
            pid: launched.pid,
            launch_evidence: LaunchEvidence::collect(launched.pid, &expected),
            cancel_tx,
            reaper: Some(reaper),
            writer: None,
            stdout: None,
            stderr: None,
            report: None,
            started: Instant::now(),
        };

        for control in &running.launch_evidence.degraded {
            metrics::get_metrics().degraded_controls.inc();
            let consequence = if config.strict_mode {
                "aborting in strict mode"
            } else {
                "continuing in permissive mode"
            };
            audit::control_degraded(&running.correlation, control, consequence);
        }
        if config.strict_mode && running.launch_evidence.is_degraded() {
            let degraded = running.launch_evidence.degraded.join(", ");
            // Dropping cancels and reaps; the program was never delivered.
            drop(running);
            return Err(SandboxError::Privilege(format!(
                "kernel controls not in effect: {}",
                degraded
            )));
        }

        let Launched {
            stdin,
            stdout,
            stderr,
            ..
        } = launched;
        running.report = Some(output::spawn_collector(
            "report",
            File::from(report_read),
            REPORT_LIMIT,
        )?);
        if let Some(stdout) = stdout {
            running.stdout = Some(output::spawn_collector("stdout", stdout, running.limits.max_output_bytes)?);
        }
        if let Some(stderr) = stderr {
            running.stderr = Some(output::spawn_collector("stderr", stderr, running.limits.max_output_bytes)?);
        }
        if let Some(stdin) = stdin {
            running.writer = Some(spawn_writer(stdin, launch.payload)?);
        }

        log::info!(
            "Started run {} as pid {}",
            running.correlation.run_id,
            running.pid
        );
        Ok(running)
    }
}

fn grants_label(capabilities: &CapabilitySet) -> String {
    if capabilities.is_empty() {
        return "none".to_string();
    }
    capabilities
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn spawn_error(config: &SandboxConfig, e: io::Error) -> SandboxError {
    if e.kind() == io::ErrorKind::NotFound {
        SandboxError::Interpreter(format!("{}: {}", config.interpreter.display(), e))
    } else {
        SandboxError::Process(format!("Failed to start interpreter: {}", e))
    }
}

fn report_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: pipe2 writes two descriptors into `fds`.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and are owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn spawn_writer(mut stdin: ChildStdin, payload: Vec<u8>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("twibox-stdin".to_string())
        .spawn(move || {
            if let Err(e) = stdin.write_all(&payload) {
                log::debug!("Program delivery stopped early: {}", e);
            }
        })
}

/// Which kernel controls the plan asked for.
struct ExpectedControls {
    network_namespace: bool,
    filesystem: bool,
    seccomp: bool,
    credentials: Option<(u32, u32)>,
    address_space: Option<u64>,
}

/// Controls verified from /proc right after spawn, before the program is
/// delivered. `None` means the control was not requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LaunchEvidence {
    pub network_isolated: Option<bool>,
    pub filesystem_isolated: Option<bool>,
    pub no_new_privs: Option<bool>,
    pub seccomp_filtered: Option<bool>,
    pub credentials_dropped: Option<bool>,
    pub address_space_limited: Option<bool>,
    /// Requested controls that are not in effect.
    pub degraded: Vec<String>,
}

impl LaunchEvidence {
    fn collect(pid: u32, expected: &ExpectedControls) -> Self {
        let mut evidence = LaunchEvidence::default();

        if expected.network_namespace {
            let isolated = namespace::network_isolated(pid).unwrap_or(false);
            evidence.network_isolated = Some(isolated);
            if !isolated {
                evidence.degraded.push("network namespace".to_string());
            }
        }

        if expected.filesystem {
            let isolated = mount::filesystem_isolated(pid).unwrap_or(false);
            evidence.filesystem_isolated = Some(isolated);
            if !isolated {
                evidence.degraded.push("filesystem isolation".to_string());
            }
        }

        match ProcStatus::read(pid) {
            Ok(status) => {
                evidence.no_new_privs = Some(status.no_new_privs);
                if !status.no_new_privs {
                    evidence.degraded.push("no_new_privs".to_string());
                }
                if expected.seccomp {
                    evidence.seccomp_filtered = Some(status.seccomp_filtered());
                    if !status.seccomp_filtered() {
                        evidence.degraded.push("seccomp filter".to_string());
                    }
                }
                if let Some((uid, gid)) = expected.credentials {
                    let dropped = status.effective_uid == Some(uid) && status.effective_gid == Some(gid);
                    evidence.credentials_dropped = Some(dropped);
                    if !dropped {
                        evidence.degraded.push("credential drop".to_string());
                    }
                }
            }
            Err(e) => evidence.degraded.push(format!("process status ({})", e)),
        }

        if let Some(expected_bytes) = expected.address_space {
            let limited = read_address_space_limit(pid)
                .map(|applied| applied <= expected_bytes)
                .unwrap_or(false);
            evidence.address_space_limited = Some(limited);
            if !limited {
                evidence.degraded.push("address space rlimit".to_string());
            }
        }

        evidence
    }

    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

/// Soft RLIMIT_AS from /proc/<pid>/limits; `None` when unlimited or unreadable.
fn read_address_space_limit(pid: u32) -> Option<u64> {
    let content = fs::read_to_string(format!("/proc/{}/limits", pid)).ok()?;
    parse_address_space_limit(&content)
}

fn parse_address_space_limit(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("Max address space"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|soft| soft.parse().ok())
}

struct SpawnSpec {
    argv: Vec<OsString>,
    env: BTreeMap<String, String>,
    cwd: PathBuf,
    plan: ChildPlan,
    /// Parent's copy of the report pipe's write end, closed right after spawn.
    report_write: OwnedFd,
}

impl SpawnSpec {
    fn into_command(self) -> io::Result<(Command, OwnedFd)> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty interpreter argv"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(&self.env)
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let plan = self.plan;
        // SAFETY: preexec::run performs only async-signal-safe syscalls and
        // does not allocate.
        unsafe {
            command.pre_exec(move || preexec::run(&plan));
        }
        Ok((command, self.report_write))
    }
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    wall: Duration,
    grace: Duration,
}

struct Launched {
    pid: u32,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

struct ReapOutcome {
    watchdog: WatchdogAction,
    wait_outcome: WaitOutcome,
    elapsed: Duration,
    cpu_time_ms: u64,
    peak_memory_bytes: u64,
}

fn reaper_main(
    spawn: SpawnSpec,
    launched_tx: Sender<io::Result<Launched>>,
    cancel_rx: Receiver<()>,
    timing: Timing,
    correlation: CorrelationIds,
) -> io::Result<ReapOutcome> {
    let spawned = spawn.into_command().and_then(|(mut command, report_write)| {
        let child = command.spawn();
        drop(report_write);
        child
    });
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            let message = e.to_string();
            let _ = launched_tx.send(Err(e));
            return Err(io::Error::other(message));
        }
    };

    let pid = child.id();
    let started = Instant::now();
    let correlation = correlation.with_root_pid(pid);
    let (done_tx, done_rx) = bounded(1);
    let watchdog = match thread::Builder::new()
        .name("twibox-watchdog".to_string())
        .spawn(move || watchdog(pid, timing, done_rx, cancel_rx, correlation))
    {
        Ok(handle) => handle,
        Err(e) => {
            // Nothing would enforce the deadline.
            signal_group(pid, Signal::SIGKILL);
            let _ = reap(pid);
            let message = e.to_string();
            let _ = launched_tx.send(Err(e));
            return Err(io::Error::other(message));
        }
    };

    let _ = launched_tx.send(Ok(Launched {
        pid,
        stdin: child.stdin.take(),
        stdout: child.stdout.take(),
        stderr: child.stderr.take(),
    }));

    let exited = wait_for_exit(pid);
    let elapsed = started.elapsed();
    let _ = done_tx.send(());
    let action = watchdog.join().unwrap_or_else(|_| {
        log::error!("Watchdog thread panicked");
        WatchdogAction::None
    });

    // Stragglers die while the leader's zombie still pins the group id.
    signal_group(pid, Signal::SIGKILL);
    if let Err(e) = exited {
        log::error!("waitid on pid {} failed: {}", pid, e);
    }
    let (status, usage) = reap(pid)?;
    drop(child);

    Ok(ReapOutcome {
        watchdog: action,
        wait_outcome: decode_status(status),
        elapsed,
        cpu_time_ms: timeval_ms(&usage.ru_utime) + timeval_ms(&usage.ru_stime),
        peak_memory_bytes: (usage.ru_maxrss.max(0) as u64).saturating_mul(1024),
    })
}

fn watchdog(
    pgid: u32,
    timing: Timing,
    done_rx: Receiver<()>,
    cancel_rx: Receiver<()>,
    correlation: CorrelationIds,
) -> WatchdogAction {
    let deadline = Instant::now() + timing.wall;
    let action = select! {
        recv(done_rx) -> _ => WatchdogAction::None,
        recv(cancel_rx) -> msg => match msg {
            Ok(()) => WatchdogAction::Cancelled,
            // Every cancel handle is gone; only the deadline is left.
            Err(_) => match done_rx.recv_deadline(deadline) {
                Err(RecvTimeoutError::Timeout) => WatchdogAction::TimedOut,
                _ => WatchdogAction::None,
            },
        },
        default(timing.wall) => WatchdogAction::TimedOut,
    };

    if action != WatchdogAction::None {
        let reason = match action {
            WatchdogAction::TimedOut => "wall time limit",
            _ => "cancelled",
        };
        terminate_group(pgid, timing.grace, &done_rx, &correlation, reason);
    }
    action
}

/// SIGTERM, a grace period, then SIGKILL unless the leader exited first.
fn terminate_group(pgid: u32, grace: Duration, done_rx: &Receiver<()>, correlation: &CorrelationIds, reason: &str) {
    metrics::get_metrics().forced_kills.inc();
    audit::forced_kill(correlation, reason);

    if !signal_group(pgid, Signal::SIGTERM) {
        return;
    }
    if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(grace) {
        log::debug!("Process group {} ignored SIGTERM; sending SIGKILL", pgid);
        signal_group(pgid, Signal::SIGKILL);
    }
}

/// Block until `pid` has exited, leaving it unreaped.
fn wait_for_exit(pid: u32) -> io::Result<()> {
    loop {
        // SAFETY: siginfo_t is plain data; zeroed is a valid value.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: waitid writes into `info` only.
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn reap(pid: u32) -> io::Result<(libc::c_int, libc::rusage)> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: rusage is plain data; zeroed is a valid value.
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        // SAFETY: wait4 writes into `status` and `usage` only.
        let rc = unsafe { libc::wait4(pid as libc::pid_t, &mut status, 0, &mut usage) };
        if rc == pid as libc::pid_t {
            return Ok((status, usage));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn decode_status(status: libc::c_int) -> WaitOutcome {
    if libc::WIFEXITED(status) {
        WaitOutcome {
            exit_code: Some(libc::WEXITSTATUS(status)),
            terminating_signal: None,
        }
    } else if libc::WIFSIGNALED(status) {
        WaitOutcome {
            exit_code: None,
            terminating_signal: Some(libc::WTERMSIG(status)),
        }
    } else {
        WaitOutcome::default()
    }
}

fn timeval_ms(tv: &libc::timeval) -> u64 {
    (tv.tv_sec.max(0) as u64) * 1000 + (tv.tv_usec.max(0) as u64) / 1000
}

/// Cancels a run from any thread. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Sender<()>,
}

impl CancelHandle {
    /// Ask the watchdog to tear the run down. Returns false when a cancel
    /// was already pending or the run is over.
    pub fn cancel(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

/// A started run. Dropping it without `wait` cancels, kills and reaps.
pub struct RunningExecution {
    correlation: CorrelationIds,
    limits: ExecutionLimits,
    nonce: String,
    pid: u32,
    launch_evidence: LaunchEvidence,
    cancel_tx: Sender<()>,
    reaper: Option<JoinHandle<io::Result<ReapOutcome>>>,
    writer: Option<JoinHandle<()>>,
    stdout: Option<JoinHandle<CapturedStream>>,
    stderr: Option<JoinHandle<CapturedStream>>,
    report: Option<JoinHandle<CapturedStream>>,
    started: Instant,
}

impl RunningExecution {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn run_id(&self) -> &str {
        &self.correlation.run_id
    }

    pub fn launch_evidence(&self) -> &LaunchEvidence {
        &self.launch_evidence
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    /// Block until the run is over and classify it.
    pub fn wait(mut self) -> ExecutionResult {
        self.finish()
    }

    fn finish(&mut self) -> ExecutionResult {
        let reaped = match self.reaper.take().map(JoinHandle::join) {
            Some(Ok(Ok(reaped))) => Ok(reaped),
            Some(Ok(Err(e))) => Err(format!("failed to reap interpreter: {}", e)),
            Some(Err(_)) => Err("reaper thread panicked".to_string()),
            None => Err("run already collected".to_string()),
        };

        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                log::error!("stdin writer thread panicked");
            }
        }
        let stdout = output::join_collector(self.stdout.take());
        let stderr = output::join_collector(self.stderr.take());
        let report = output::join_collector(self.report.take());
        metrics::get_metrics().active_executions.dec();

        let result = match reaped {
            Ok(reaped) => self.classify(reaped, stdout, stderr, report),
            Err(message) => {
                log::error!("Run {}: {}", self.correlation.run_id, message);
                ExecutionResult::InternalError { message }
            }
        };

        let wall_time_ms = result.stats().map(|s| s.wall_time_ms).unwrap_or(0);
        metrics::get_metrics().record_execution(&result, self.started.elapsed());
        audit::execution_end(&self.correlation, result.outcome(), wall_time_ms);
        result
    }

    fn classify(
        &self,
        reaped: ReapOutcome,
        stdout: CapturedStream,
        stderr: CapturedStream,
        report: CapturedStream,
    ) -> ExecutionResult {
        let report = harness::find_report(&report.data, &self.nonce);
        if report.is_none() && !stderr.data.is_empty() {
            log::debug!(
                "Run {} stderr: {}",
                self.correlation.run_id,
                String::from_utf8_lossy(&stderr.data)
            );
        }
        if let Some(error) = stdout.read_error.as_ref() {
            log::warn!("Run {}: stdout read failed: {}", self.correlation.run_id, error);
        }

        let evidence = Evidence {
            watchdog: reaped.watchdog,
            report,
            wait_outcome: reaped.wait_outcome,
            wall_elapsed_ms: reaped.elapsed.as_millis().min(u64::MAX as u128) as u64,
            cpu_time_ms: reaped.cpu_time_ms,
            peak_memory_bytes: reaped.peak_memory_bytes,
            stdout: stdout.render(self.limits.max_output_bytes),
            output_truncated: stdout.truncated,
        };
        let (state, result) = VerdictClassifier::classify(&evidence, &self.limits);

        match &result {
            ExecutionResult::LimitExceeded {
                limit,
                limit_value,
                observed,
                ..
            } => audit::limit_breach(&self.correlation, *limit, *observed, *limit_value),
            ExecutionResult::SandboxViolation {
                capability, detail, ..
            } => audit::sandbox_violation(&self.correlation, *capability, detail),
            _ => {}
        }
        if state == TerminalState::Crashed {
            log::warn!(
                "Run {} ended without a harness report: {:?}",
                self.correlation.run_id,
                evidence.wait_outcome
            );
        }
        log::info!(
            "Run {} finished: {:?} in {} ms",
            self.correlation.run_id,
            state,
            evidence.wall_elapsed_ms
        );
        result
    }
}

impl Drop for RunningExecution {
    fn drop(&mut self) {
        if self.reaper.is_none() {
            return;
        }
        log::debug!("Run {} dropped before wait; cancelling", self.correlation.run_id);
        let _ = self.cancel_tx.try_send(());
        let _ = self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_address_space_line() {
        let content = "Limit                     Soft Limit           Hard Limit           Units\n\
                       Max cpu time              5                    6                    seconds\n\
                       Max address space         268435456            268435456            bytes\n";
        assert_eq!(parse_address_space_limit(content), Some(268_435_456));
    }

    #[test]
    fn unlimited_address_space_is_none() {
        let content = "Max address space         unlimited            unlimited            bytes\n";
        assert_eq!(parse_address_space_limit(content), None);
    }

    #[test]
    fn decodes_wait_status() {
        assert_eq!(
            decode_status(3 << 8),
            WaitOutcome {
                exit_code: Some(3),
                terminating_signal: None
            }
        );
        assert_eq!(
            decode_status(libc::SIGKILL),
            WaitOutcome {
                exit_code: None,
                terminating_signal: Some(libc::SIGKILL)
            }
        );
    }

    #[test]
    fn grants_label_lists_capabilities() {
        assert_eq!(grants_label(&CapabilitySet::none()), "none");
        let set: CapabilitySet = [Capability::Network, Capability::Filesystem].into_iter().collect();
        assert_eq!(grants_label(&set), "filesystem,network");
    }

    #[test]
    fn missing_interpreter_fails_prepare() {
        let config = SandboxConfig {
            interpreter: PathBuf::from("/nonexistent/python3"),
            ..SandboxConfig::default()
        };
        let result = IsolationContext::new(config, ExecutionLimits::default()).prepare("pass\n");
        assert!(matches!(result, Err(SandboxError::Interpreter(_))));
    }

    #[test]
    fn cancel_handle_reports_pending_cancel() {
        let (tx, rx) = bounded(1);
        let handle = CancelHandle { tx };
        let clone = handle.clone();
        assert!(handle.cancel());
        assert!(!clone.cancel());
        rx.recv().unwrap();
        drop(rx);
        assert!(!handle.cancel());
    }
}
