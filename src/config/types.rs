/// Core types shared by the sandbox executor and its callers
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A discrete permission the sandbox can grant or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Opening, listing or modifying files.
    Filesystem,
    /// Creating sockets or using network clients.
    Network,
    /// Spawning, replacing or signalling processes.
    Subprocess,
    /// Seeing the host environment variables.
    Environment,
    /// Loading host modules that were not preloaded by the harness.
    ModuleImport,
    /// Frame, GC and tracing hooks into the interpreter itself.
    Introspection,
    /// System calls killed by the kernel syscall filter.
    RawSyscall,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::Filesystem,
        Capability::Network,
        Capability::Subprocess,
        Capability::Environment,
        Capability::ModuleImport,
        Capability::Introspection,
        Capability::RawSyscall,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Filesystem => "filesystem",
            Capability::Network => "network",
            Capability::Subprocess => "subprocess",
            Capability::Environment => "environment",
            Capability::ModuleImport => "module_import",
            Capability::Introspection => "introspection",
            Capability::RawSyscall => "raw_syscall",
        }
    }

    pub fn parse(name: &str) -> Option<Capability> {
        Self::ALL
            .into_iter()
            .find(|cap| cap.as_str() == name.trim().to_ascii_lowercase().replace('-', "_"))
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of granted capabilities. Empty means everything is denied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn grant(&mut self, capability: Capability) {
        self.0.insert(capability);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Per-invocation execution limits. Never mutated while a run is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    /// Hard wall-clock deadline enforced by the watchdog.
    pub wall_time_ms: u64,
    /// CPU time ceiling; derived from the wall time when unset.
    pub cpu_time_ms: Option<u64>,
    /// Address-space ceiling for the interpreter process.
    pub memory_bytes: u64,
    /// Bytes kept per output stream before truncation.
    pub max_output_bytes: usize,
    /// Granted capabilities, empty by default.
    pub capabilities: CapabilitySet,
    /// Read-only directory reachable when `filesystem` is granted.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            wall_time_ms: 4_000,
            cpu_time_ms: None,
            memory_bytes: 256 * 1024 * 1024,
            max_output_bytes: 20_000,
            capabilities: CapabilitySet::none(),
            scratch_dir: None,
        }
    }
}

impl ExecutionLimits {
    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.wall_time_ms)
    }

    /// Effective CPU ceiling: explicit value, else the wall time rounded up
    /// to whole seconds plus one, so the watchdog normally fires first.
    pub fn cpu_time(&self) -> Duration {
        match self.cpu_time_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(self.wall_time_ms.div_ceil(1000) + 1),
        }
    }

    pub fn with_wall_time(mut self, wall_time: Duration) -> Self {
        self.wall_time_ms = wall_time.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory_bytes = bytes;
        self
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn granting(mut self, capability: Capability) -> Self {
        self.capabilities.grant(capability);
        self
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.capabilities.allows(capability)
    }
}

/// Host-side sandbox settings, shared by every execution of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Python 3.8+ interpreter used to run generated programs.
    pub interpreter: PathBuf,
    /// Fail the run when a kernel control cannot be applied.
    pub strict_mode: bool,
    /// Unshare a network namespace unless `network` is granted.
    pub network_namespace: bool,
    /// Run inside a private mount namespace whose root only holds the
    /// interpreter's install tree and the scratch directory.
    pub filesystem_isolation: bool,
    /// Empty host directory the private root is mounted on.
    pub mount_stage: PathBuf,
    /// Install the seccomp syscall filter.
    pub syscall_filter: bool,
    /// Identity the payload drops to when the supervisor runs as root.
    pub drop_to_uid: u32,
    pub drop_to_gid: u32,
    pub recursion_limit: u32,
    pub fd_limit: u64,
    pub stack_limit_bytes: u64,
    /// Time between SIGTERM and SIGKILL when the watchdog tears a run down.
    pub kill_grace_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from("/usr/bin/python3"),
            strict_mode: false,
            network_namespace: true,
            filesystem_isolation: true,
            mount_stage: crate::kernel::mount::default_stage(),
            syscall_filter: true,
            drop_to_uid: 65534,
            drop_to_gid: 65534,
            recursion_limit: 4_000,
            fd_limit: 64,
            stack_limit_bytes: 8 * 1024 * 1024,
            kill_grace_ms: 100,
        }
    }
}

/// Which limit a run breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    WallTime,
    CpuTime,
    Memory,
}

impl LimitKind {
    /// Unit of `limit_value` and `observed` for this limit.
    pub fn unit(self) -> &'static str {
        match self {
            LimitKind::WallTime | LimitKind::CpuTime => "ms",
            LimitKind::Memory => "bytes",
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::WallTime => write!(f, "wall time"),
            LimitKind::CpuTime => write!(f, "cpu time"),
            LimitKind::Memory => write!(f, "memory"),
        }
    }
}

/// Resource usage observed for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub peak_memory_bytes: u64,
    pub output_truncated: bool,
}

/// Outcome of one execution. Returned exactly once per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success {
        stdout: String,
        return_value: Option<String>,
        stats: ExecutionStats,
    },
    RuntimeFailure {
        error: String,
        /// Generated-code line that raised, when known.
        line: Option<u32>,
        stdout: String,
        stats: ExecutionStats,
    },
    LimitExceeded {
        limit: LimitKind,
        limit_value: u64,
        observed: u64,
        stdout: String,
        stats: ExecutionStats,
    },
    SandboxViolation {
        capability: Capability,
        detail: String,
        stdout: String,
        stats: ExecutionStats,
    },
    Cancelled {
        stdout: String,
        stats: ExecutionStats,
    },
    InternalError {
        message: String,
    },
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    /// Short outcome label, matching the serialized tag.
    pub fn outcome(&self) -> &'static str {
        match self {
            ExecutionResult::Success { .. } => "success",
            ExecutionResult::RuntimeFailure { .. } => "runtime_failure",
            ExecutionResult::LimitExceeded { .. } => "limit_exceeded",
            ExecutionResult::SandboxViolation { .. } => "sandbox_violation",
            ExecutionResult::Cancelled { .. } => "cancelled",
            ExecutionResult::InternalError { .. } => "internal_error",
        }
    }

    /// Captured standard output, empty for internal errors.
    pub fn stdout(&self) -> &str {
        match self {
            ExecutionResult::Success { stdout, .. }
            | ExecutionResult::RuntimeFailure { stdout, .. }
            | ExecutionResult::LimitExceeded { stdout, .. }
            | ExecutionResult::SandboxViolation { stdout, .. }
            | ExecutionResult::Cancelled { stdout, .. } => stdout,
            ExecutionResult::InternalError { .. } => "",
        }
    }

    pub fn stats(&self) -> Option<&ExecutionStats> {
        match self {
            ExecutionResult::Success { stats, .. }
            | ExecutionResult::RuntimeFailure { stats, .. }
            | ExecutionResult::LimitExceeded { stats, .. }
            | ExecutionResult::SandboxViolation { stats, .. }
            | ExecutionResult::Cancelled { stats, .. } => Some(stats),
            ExecutionResult::InternalError { .. } => None,
        }
    }
}

/// Errors raised while setting up or supervising a sandboxed run.
///
/// These never describe the untrusted program's own behaviour; that is
/// always an [`ExecutionResult`].
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Namespace isolation error: {0}")]
    Namespace(String),

    #[error("Resource limit error: {0}")]
    ResourceLimit(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("Seccomp error: {0}")]
    Seccomp(String),

    #[error("Interpreter unavailable: {0}")]
    Interpreter(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_are_conservative() {
        let limits = ExecutionLimits::default();
        assert!(limits.capabilities.is_empty());
        assert_eq!(limits.wall_time(), Duration::from_secs(4));
        assert_eq!(limits.cpu_time(), Duration::from_secs(5));
        assert!(limits.scratch_dir.is_none());
    }

    #[test]
    fn cpu_time_rounds_wall_time_up() {
        let limits = ExecutionLimits::default().with_wall_time(Duration::from_millis(1500));
        assert_eq!(limits.cpu_time(), Duration::from_secs(3));
    }

    #[test]
    fn capability_names_round_trip() {
        for cap in Capability::ALL {
            assert_eq!(Capability::parse(cap.as_str()), Some(cap));
        }
        assert_eq!(Capability::parse("Module-Import"), Some(Capability::ModuleImport));
        assert_eq!(Capability::parse("root"), None);
    }

    #[test]
    fn limits_deserialize_with_defaults() {
        let limits: ExecutionLimits =
            serde_json::from_str(r#"{"wall_time_ms": 2000, "capabilities": ["network"]}"#)
                .unwrap();
        assert_eq!(limits.wall_time_ms, 2000);
        assert_eq!(limits.memory_bytes, ExecutionLimits::default().memory_bytes);
        assert!(limits.allows(Capability::Network));
        assert!(!limits.allows(Capability::Filesystem));
    }

    #[test]
    fn results_serialize_with_outcome_tag() {
        let result = ExecutionResult::LimitExceeded {
            limit: LimitKind::WallTime,
            limit_value: 2000,
            observed: 2104,
            stdout: String::new(),
            stats: ExecutionStats::default(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"], "limit_exceeded");
        assert_eq!(json["limit"], "wall_time");
        assert_eq!(result.outcome(), "limit_exceeded");
    }
}
