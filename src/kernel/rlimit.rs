//! Resource limits applied between fork and exec.
//!
//! Values are computed in the parent; the child only issues setrlimit calls.

use crate::config::types::{Capability, ExecutionLimits, SandboxConfig};
use std::io;

/// One rlimit to apply in the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitValue {
    pub name: &'static str,
    pub resource: libc::__rlimit_resource_t,
    pub soft: u64,
    pub hard: u64,
}

/// Full set of rlimits for one run, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RlimitPlan {
    pub values: Vec<RlimitValue>,
}

impl RlimitPlan {
    pub fn for_run(limits: &ExecutionLimits, config: &SandboxConfig) -> Self {
        // RLIMIT_CPU is whole seconds; round up so a fractional limit is never shortened.
        let cpu_ms = limits.cpu_time().as_millis().min(u64::MAX as u128) as u64;
        let cpu_secs = cpu_ms.div_ceil(1000).max(1);
        let nproc = if limits.allows(Capability::Subprocess) {
            64
        } else {
            0
        };

        let values = vec![
            value("RLIMIT_AS", libc::RLIMIT_AS, limits.memory_bytes, limits.memory_bytes),
            // SIGXCPU at the soft limit, SIGKILL one second later.
            value("RLIMIT_CPU", libc::RLIMIT_CPU, cpu_secs, cpu_secs + 1),
            value("RLIMIT_NPROC", libc::RLIMIT_NPROC, nproc, nproc),
            value("RLIMIT_FSIZE", libc::RLIMIT_FSIZE, 0, 0),
            value("RLIMIT_CORE", libc::RLIMIT_CORE, 0, 0),
            value("RLIMIT_MEMLOCK", libc::RLIMIT_MEMLOCK, 0, 0),
            value("RLIMIT_NOFILE", libc::RLIMIT_NOFILE, config.fd_limit, config.fd_limit),
            value(
                "RLIMIT_STACK",
                libc::RLIMIT_STACK,
                config.stack_limit_bytes,
                config.stack_limit_bytes,
            ),
        ];
        Self { values }
    }

    /// Apply every limit. Async-signal-safe.
    ///
    /// In permissive mode a failing limit is skipped; the parent reports
    /// degraded controls from its own verification.
    pub fn apply(&self, strict_mode: bool) -> io::Result<()> {
        for limit in &self.values {
            if let Err(e) = apply_rlimit_value(limit.resource, limit.soft, limit.hard) {
                if strict_mode {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RlimitValue> {
        self.values.iter().find(|v| v.name == name)
    }
}

fn value(name: &'static str, resource: libc::__rlimit_resource_t, soft: u64, hard: u64) -> RlimitValue {
    RlimitValue {
        name,
        resource,
        soft,
        hard,
    }
}

/// setrlimit with the hard value clamped to the current hard limit, so an
/// unprivileged caller can only ever tighten.
pub fn apply_rlimit_value(resource: libc::__rlimit_resource_t, soft: u64, hard: u64) -> io::Result<()> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit writes into the provided struct only.
    if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let hard = (hard as libc::rlim_t).min(current.rlim_max);
    let limit = libc::rlimit {
        rlim_cur: (soft as libc::rlim_t).min(hard),
        rlim_max: hard,
    };

    // SAFETY: setrlimit reads the provided struct only.
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn plan_reflects_limits() {
        let limits = ExecutionLimits::default()
            .with_wall_time(Duration::from_millis(2_500))
            .with_memory(128 * 1024 * 1024);
        let plan = RlimitPlan::for_run(&limits, &SandboxConfig::default());

        let cpu = plan.get("RLIMIT_CPU").unwrap();
        assert_eq!((cpu.soft, cpu.hard), (4, 5));
        assert_eq!(plan.get("RLIMIT_AS").unwrap().soft, 128 * 1024 * 1024);
        assert_eq!(plan.get("RLIMIT_NPROC").unwrap().soft, 0);
        assert_eq!(plan.get("RLIMIT_FSIZE").unwrap().hard, 0);
    }

    #[test]
    fn fractional_cpu_limit_rounds_up() {
        let limits = ExecutionLimits {
            cpu_time_ms: Some(1_900),
            ..ExecutionLimits::default()
        };
        let plan = RlimitPlan::for_run(&limits, &SandboxConfig::default());
        let cpu = plan.get("RLIMIT_CPU").unwrap();
        assert_eq!((cpu.soft, cpu.hard), (2, 3));

        let limits = ExecutionLimits {
            cpu_time_ms: Some(200),
            ..ExecutionLimits::default()
        };
        let plan = RlimitPlan::for_run(&limits, &SandboxConfig::default());
        assert_eq!(plan.get("RLIMIT_CPU").unwrap().soft, 1);

        let limits = ExecutionLimits {
            cpu_time_ms: Some(3_000),
            ..ExecutionLimits::default()
        };
        let plan = RlimitPlan::for_run(&limits, &SandboxConfig::default());
        assert_eq!(plan.get("RLIMIT_CPU").unwrap().soft, 3);
    }

    #[test]
    fn subprocess_grant_lifts_nproc() {
        let limits = ExecutionLimits::default().granting(Capability::Subprocess);
        let plan = RlimitPlan::for_run(&limits, &SandboxConfig::default());
        assert!(plan.get("RLIMIT_NPROC").unwrap().soft > 0);
    }
}
