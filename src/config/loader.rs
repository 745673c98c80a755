/// Configuration loading from twibox.json
use crate::config::presets::LimitPresets;
use crate::config::types::{ExecutionLimits, Result, SandboxConfig, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_CONFIG_FILE: &str = "twibox.json";

/// Full twibox.json structure. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwiboxConfig {
    pub sandbox: SandboxConfig,
    /// Named profile the `limits` section is layered over.
    pub profile: Option<String>,
    pub limits: Option<ExecutionLimits>,
}

impl TwiboxConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config: TwiboxConfig = serde_json::from_str(&content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse config JSON: {}", e)))?;

        log::debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load default configuration from ./twibox.json
    pub fn load_default() -> Result<Self> {
        let config_path = std::env::current_dir()
            .map_err(|e| SandboxError::Config(format!("Failed to get current directory: {}", e)))?
            .join(DEFAULT_CONFIG_FILE);

        Self::load_from_file(config_path)
    }

    /// Like [`load_default`](Self::load_default), but a missing file yields
    /// the built-in defaults. A file that exists and fails to parse is
    /// still an error.
    pub fn load_or_default() -> Result<Self> {
        let exists = std::env::current_dir()
            .map(|dir| dir.join(DEFAULT_CONFIG_FILE).is_file())
            .unwrap_or(false);
        if exists {
            Self::load_default()
        } else {
            log::debug!("No {} found, using built-in defaults", DEFAULT_CONFIG_FILE);
            Ok(Self::default())
        }
    }

    /// Limits after applying the named profile and the explicit section.
    pub fn effective_limits(&self) -> Result<ExecutionLimits> {
        if let Some(limits) = &self.limits {
            return Ok(limits.clone());
        }
        match &self.profile {
            Some(name) => LimitPresets::new()
                .get(name)
                .map(|profile| profile.limits.clone())
                .ok_or_else(|| SandboxError::Config(format!("Unknown limit profile: {}", name))),
            None => Ok(ExecutionLimits::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::Capability;
    use std::io::Write;

    #[test]
    fn loads_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"sandbox": {{"strict_mode": true}}, "limits": {{"wall_time_ms": 1500, "capabilities": ["subprocess"]}}}}"#
        )
        .unwrap();

        let config = TwiboxConfig::load_from_file(file.path()).unwrap();
        assert!(config.sandbox.strict_mode);
        assert_eq!(config.sandbox.recursion_limit, 4_000);

        let limits = config.effective_limits().unwrap();
        assert_eq!(limits.wall_time_ms, 1500);
        assert!(limits.allows(Capability::Subprocess));
    }

    #[test]
    fn profile_selects_preset() {
        let config = TwiboxConfig {
            profile: Some("tight".to_string()),
            ..TwiboxConfig::default()
        };
        assert_eq!(config.effective_limits().unwrap(), ExecutionLimits::tight());

        let config = TwiboxConfig {
            profile: Some("lenient".to_string()),
            ..TwiboxConfig::default()
        };
        assert!(config.effective_limits().is_err());
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = TwiboxConfig::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
    }
}
