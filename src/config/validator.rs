// Config validation
// Runs before a context is prepared so bad limits fail fast with an
// actionable message instead of surfacing as a confusing run outcome.

use crate::config::types::{Capability, ExecutionLimits, Result, SandboxConfig, SandboxError};

/// Smallest address space the interpreter reliably starts in.
const MIN_MEMORY_BYTES: u64 = 32 * 1024 * 1024;
const MAX_WALL_TIME_MS: u64 = 10 * 60 * 1000;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate limits against the sandbox settings they will run under.
///
/// Errors are always fatal. In strict mode warnings are fatal too.
pub fn validate(limits: &ExecutionLimits, config: &SandboxConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_limits(limits, &mut result);
    validate_capabilities(limits, &mut result);
    validate_sandbox(config, &mut result);

    for warning in &result.warnings {
        log::warn!("Config warning: {}", warning);
    }

    if config.strict_mode && !result.warnings.is_empty() {
        let mut problems = result.errors.clone();
        problems.extend(result.warnings.iter().cloned());
        return Err(SandboxError::Config(format!(
            "Config validation failed in strict mode:\n{}",
            problems.join("\n")
        )));
    }

    if !result.is_valid() {
        return Err(SandboxError::Config(format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn validate_limits(limits: &ExecutionLimits, result: &mut ValidationResult) {
    if limits.wall_time_ms == 0 {
        result.add_error("wall_time_ms cannot be zero".to_string());
    }
    if limits.wall_time_ms > MAX_WALL_TIME_MS {
        result.add_error(format!(
            "wall_time_ms {} exceeds the {} ms ceiling",
            limits.wall_time_ms, MAX_WALL_TIME_MS
        ));
    }
    if limits.cpu_time_ms == Some(0) {
        result.add_error("cpu_time_ms cannot be zero".to_string());
    }
    if limits.memory_bytes == 0 {
        result.add_error("memory_bytes cannot be zero".to_string());
    } else if limits.memory_bytes < MIN_MEMORY_BYTES {
        result.add_warning(format!(
            "memory_bytes {} is below {} bytes, the interpreter may fail to start",
            limits.memory_bytes, MIN_MEMORY_BYTES
        ));
    }
    if limits.max_output_bytes == 0 {
        result.add_error("max_output_bytes cannot be zero".to_string());
    }
}

fn validate_capabilities(limits: &ExecutionLimits, result: &mut ValidationResult) {
    if limits.allows(Capability::Filesystem) {
        match &limits.scratch_dir {
            None => result.add_error(
                "the filesystem capability requires a scratch_dir to expose".to_string(),
            ),
            Some(dir) if !dir.is_absolute() => {
                result.add_error(format!("scratch_dir must be an absolute path: {:?}", dir))
            }
            Some(dir) if !dir.is_dir() => {
                result.add_error(format!("scratch_dir is not a directory: {:?}", dir))
            }
            Some(_) => {}
        }
    } else if limits.scratch_dir.is_some() {
        result.add_warning(
            "scratch_dir is set but the filesystem capability is not granted".to_string(),
        );
    }

    for capability in [
        Capability::ModuleImport,
        Capability::Introspection,
        Capability::RawSyscall,
    ] {
        if limits.allows(capability) {
            result.add_warning(format!(
                "granting `{}` lets programs bypass the interpreter guard",
                capability
            ));
        }
    }
}

fn validate_sandbox(config: &SandboxConfig, result: &mut ValidationResult) {
    if !config.interpreter.is_absolute() {
        result.add_error(format!(
            "interpreter must be an absolute path: {:?}",
            config.interpreter
        ));
    } else if !config.interpreter.exists() {
        result.add_error(format!(
            "interpreter does not exist: {:?}",
            config.interpreter
        ));
    }
    if config.fd_limit < 8 {
        result.add_error(format!(
            "fd_limit {} is too low for the interpreter",
            config.fd_limit
        ));
    }
    if config.recursion_limit < 100 {
        result.add_error(format!(
            "recursion_limit {} is too low",
            config.recursion_limit
        ));
    }
    if config.drop_to_uid == 0 || config.drop_to_gid == 0 {
        result.add_error("drop_to_uid/drop_to_gid cannot be root".to_string());
    }
    if !config.syscall_filter {
        result.add_warning("syscall filter disabled".to_string());
    }
    if !config.network_namespace {
        result.add_warning("network namespace disabled".to_string());
    }
    if !config.filesystem_isolation {
        result.add_warning("filesystem isolation disabled".to_string());
    } else if !config.mount_stage.is_absolute() {
        result.add_error(format!(
            "mount_stage must be an absolute path: {:?}",
            config.mount_stage
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_shell_interpreter() -> SandboxConfig {
        SandboxConfig {
            interpreter: "/bin/sh".into(),
            ..SandboxConfig::default()
        }
    }

    #[test]
    fn defaults_validate() {
        let result = validate(&ExecutionLimits::default(), &config_with_shell_interpreter());
        assert!(result.unwrap().is_valid());
    }

    #[test]
    fn zero_wall_time_is_rejected() {
        let limits = ExecutionLimits {
            wall_time_ms: 0,
            ..ExecutionLimits::default()
        };
        let err = validate(&limits, &config_with_shell_interpreter()).unwrap_err();
        assert!(err.to_string().contains("wall_time_ms cannot be zero"));
    }

    #[test]
    fn filesystem_grant_needs_scratch_dir() {
        let limits = ExecutionLimits::default().granting(Capability::Filesystem);
        assert!(validate(&limits, &config_with_shell_interpreter()).is_err());

        let dir = tempfile::tempdir().unwrap();
        let limits = ExecutionLimits {
            scratch_dir: Some(dir.path().to_path_buf()),
            ..limits
        };
        assert!(validate(&limits, &config_with_shell_interpreter()).is_ok());
    }

    #[test]
    fn strict_mode_escalates_warnings() {
        let limits = ExecutionLimits::default().granting(Capability::ModuleImport);
        assert!(validate(&limits, &config_with_shell_interpreter()).is_ok());

        let strict = SandboxConfig {
            strict_mode: true,
            ..config_with_shell_interpreter()
        };
        assert!(validate(&limits, &strict).is_err());
    }

    #[test]
    fn mount_stage_must_be_absolute() {
        let config = SandboxConfig {
            mount_stage: "twibox-root".into(),
            ..config_with_shell_interpreter()
        };
        let err = validate(&ExecutionLimits::default(), &config).unwrap_err();
        assert!(err.to_string().contains("mount_stage must be an absolute path"));

        let disabled = SandboxConfig {
            filesystem_isolation: false,
            ..config
        };
        let result = validate(&ExecutionLimits::default(), &disabled).unwrap();
        assert!(result.warnings.iter().any(|w| w.contains("filesystem isolation disabled")));
    }

    #[test]
    fn missing_interpreter_is_an_error() {
        let config = SandboxConfig {
            interpreter: "/nonexistent/python3".into(),
            ..SandboxConfig::default()
        };
        let err = validate(&ExecutionLimits::default(), &config).unwrap_err();
        assert!(err.to_string().contains("interpreter does not exist"));
    }
}
