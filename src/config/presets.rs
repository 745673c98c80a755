/// Limit profiles and the interpreter runtime envelope
///
/// A profile is an immutable, named set of execution limits. The envelope
/// describes how the interpreter is launched; it is versioned so results
/// can record which launch recipe produced them.
use crate::config::types::{ExecutionLimits, SandboxConfig};
use std::collections::HashMap;
use std::ffi::OsString;

/// How the host interpreter is started for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEnvelope {
    /// Envelope ID recorded in audit events (e.g. "python3-harness-v1").
    pub id: &'static str,
    /// Flags placed before `-c <harness>`.
    pub args: &'static [&'static str],
    /// Interpreter startup cost, used by the latency bench budget.
    pub startup_overhead_ms: u64,
}

/// Isolated mode, no `site`, no bytecode files, unbuffered, UTF-8 I/O.
pub const PYTHON_ENVELOPE: RuntimeEnvelope = RuntimeEnvelope {
    id: "python3-harness-v1",
    args: &["-I", "-S", "-B", "-u", "-X", "utf8"],
    startup_overhead_ms: 40,
};

impl RuntimeEnvelope {
    /// Full argv for running `harness` under `config.interpreter`.
    pub fn argv(&self, config: &SandboxConfig, harness: &str) -> Vec<OsString> {
        let mut argv = Vec::with_capacity(self.args.len() + 3);
        argv.push(config.interpreter.clone().into_os_string());
        argv.extend(self.args.iter().map(OsString::from));
        argv.push(OsString::from("-c"));
        argv.push(OsString::from(harness));
        argv
    }
}

/// Named limit profile.
#[derive(Debug, Clone)]
pub struct LimitProfile {
    pub name: &'static str,
    pub description: &'static str,
    pub limits: ExecutionLimits,
}

impl ExecutionLimits {
    /// Default classroom profile: 4 s wall, 256 MiB, 20 000 output bytes.
    pub fn classroom() -> Self {
        Self::default()
    }

    /// Tight profile for shared playground hosts.
    pub fn tight() -> Self {
        Self {
            wall_time_ms: 1_000,
            memory_bytes: 96 * 1024 * 1024,
            max_output_bytes: 4_096,
            ..Self::default()
        }
    }

    /// Generous profile for longer exercises.
    pub fn generous() -> Self {
        Self {
            wall_time_ms: 15_000,
            memory_bytes: 512 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            ..Self::default()
        }
    }
}

/// Registry of limit profiles selectable by name.
pub struct LimitPresets {
    profiles: HashMap<&'static str, LimitProfile>,
}

impl LimitPresets {
    pub fn new() -> Self {
        let mut presets = Self {
            profiles: HashMap::new(),
        };
        presets.register(LimitProfile {
            name: "classroom",
            description: "4s wall time, 256 MiB, 20000 bytes of output",
            limits: ExecutionLimits::classroom(),
        });
        presets.register(LimitProfile {
            name: "tight",
            description: "1s wall time, 96 MiB, 4 KiB of output",
            limits: ExecutionLimits::tight(),
        });
        presets.register(LimitProfile {
            name: "generous",
            description: "15s wall time, 512 MiB, 1 MiB of output",
            limits: ExecutionLimits::generous(),
        });
        presets
    }

    fn register(&mut self, profile: LimitProfile) {
        self.profiles.insert(profile.name, profile);
    }

    pub fn get(&self, name: &str) -> Option<&LimitProfile> {
        self.profiles.get(name)
    }

    /// Profiles sorted by name.
    pub fn list(&self) -> Vec<&LimitProfile> {
        let mut profiles: Vec<_> = self.profiles.values().collect();
        profiles.sort_by_key(|p| p.name);
        profiles
    }
}

impl Default for LimitPresets {
    fn default() -> Self {
        Self::new()
    }
}
