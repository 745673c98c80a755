/// Security event logging for sandboxed runs
///
/// Every run emits a start and an end event sharing one correlation id;
/// degraded controls, limit breaches, violations and forced kills are
/// recorded in between. Events go to the `log` facade and, once
/// `init_security_logger` has been called, to a JSON-lines audit file.
use crate::config::types::{Capability, LimitKind, Result, SandboxError};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecuritySeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityEventType {
    ExecutionStart,
    ExecutionEnd,
    ControlDegraded,
    LimitBreach,
    SandboxViolation,
    ForcedKill,
}

impl SecurityEventType {
    pub fn default_severity(&self) -> SecuritySeverity {
        match self {
            SecurityEventType::ExecutionStart | SecurityEventType::ExecutionEnd => SecuritySeverity::Low,
            SecurityEventType::LimitBreach => SecuritySeverity::Medium,
            SecurityEventType::ForcedKill => SecuritySeverity::Medium,
            SecurityEventType::ControlDegraded => SecuritySeverity::High,
            SecurityEventType::SandboxViolation => SecuritySeverity::High,
        }
    }
}

/// Identifiers tying the events of one run together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationIds {
    pub run_id: String,
    /// Interpreter pid, also its process group id.
    pub root_pid: Option<u32>,
}

impl CorrelationIds {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            root_pid: None,
        }
    }

    pub fn with_root_pid(mut self, pid: u32) -> Self {
        self.root_pid = Some(pid);
        self
    }
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self::new()
    }
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_type: SecurityEventType,
    pub severity: SecuritySeverity,
    pub timestamp: DateTime<Utc>,
    pub details: String,
    pub correlation: Option<CorrelationIds>,
    /// Short SHA-256 of the executed program.
    pub program_fingerprint: Option<String>,
    pub envelope_id: Option<String>,
    pub capability: Option<Capability>,
    pub outcome: Option<String>,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, details: String) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: Utc::now(),
            details,
            correlation: None,
            program_fingerprint: None,
            envelope_id: None,
            capability: None,
            outcome: None,
        }
    }

    pub fn with_severity(mut self, severity: SecuritySeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_correlation(mut self, correlation: &CorrelationIds) -> Self {
        self.correlation = Some(correlation.clone());
        self
    }

    pub fn with_program_fingerprint(mut self, fingerprint: String) -> Self {
        self.program_fingerprint = Some(fingerprint);
        self
    }

    pub fn with_envelope_id(mut self, envelope_id: &str) -> Self {
        self.envelope_id = Some(envelope_id.to_string());
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }

    pub fn with_outcome(mut self, outcome: &str) -> Self {
        self.outcome = Some(outcome.to_string());
        self
    }
}

/// First 16 hex digits of the program's SHA-256.
pub fn program_fingerprint(program: &str) -> String {
    let digest = Sha256::digest(program.as_bytes());
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

/// Writes events to the log facade and an append-only audit file.
pub struct SecurityLogger {
    audit_file: Mutex<File>,
    audit_path: PathBuf,
}

impl SecurityLogger {
    pub fn new(audit_path: Option<PathBuf>) -> Result<Self> {
        let audit_path = audit_path.unwrap_or_else(|| std::env::temp_dir().join("twibox").join("audit.log"));

        if let Some(parent) = audit_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SandboxError::Config(format!("Failed to create audit log directory: {}", e)))?;
        }

        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&audit_path)
            .map_err(|e| SandboxError::Config(format!("Failed to open audit log: {}", e)))?;

        Ok(Self {
            audit_file: Mutex::new(audit_file),
            audit_path,
        })
    }

    pub fn log_security_event(&self, event: &SecurityEvent) {
        emit_to_log(event);

        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        match self.audit_file.lock() {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
                    error!("Failed to write audit log: {}", e);
                }
            }
            Err(_) => error!("Audit log lock poisoned"),
        }
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }
}

fn emit_to_log(event: &SecurityEvent) {
    let run_id = event
        .correlation
        .as_ref()
        .map(|c| c.run_id.as_str())
        .unwrap_or("-");
    match event.severity {
        SecuritySeverity::Critical | SecuritySeverity::High => {
            error!("SECURITY {:?} [{}]: {}", event.event_type, run_id, event.details)
        }
        SecuritySeverity::Medium => warn!("SECURITY {:?} [{}]: {}", event.event_type, run_id, event.details),
        SecuritySeverity::Low => info!("SECURITY {:?} [{}]: {}", event.event_type, run_id, event.details),
    }
}

static SECURITY_LOGGER: OnceLock<SecurityLogger> = OnceLock::new();

/// Enable the audit file. Without it events only reach the log facade.
pub fn init_security_logger(audit_path: Option<PathBuf>) -> Result<()> {
    let logger = SecurityLogger::new(audit_path)?;
    let path = logger.audit_path().display().to_string();
    if SECURITY_LOGGER.set(logger).is_err() {
        warn!("Security logger already initialized");
    } else {
        info!("Security audit log at {}", path);
    }
    Ok(())
}

pub fn log_security_event(event: SecurityEvent) {
    match SECURITY_LOGGER.get() {
        Some(logger) => logger.log_security_event(&event),
        None => emit_to_log(&event),
    }
}

pub fn execution_start(correlation: &CorrelationIds, envelope_id: &str, fingerprint: &str, grants: &str) {
    let event = SecurityEvent::new(
        SecurityEventType::ExecutionStart,
        format!("Execution started, grants: {}", grants),
    )
    .with_correlation(correlation)
    .with_envelope_id(envelope_id)
    .with_program_fingerprint(fingerprint.to_string());
    log_security_event(event);
}

pub fn execution_end(correlation: &CorrelationIds, outcome: &str, wall_time_ms: u64) {
    let event = SecurityEvent::new(
        SecurityEventType::ExecutionEnd,
        format!("Execution ended: {} after {} ms", outcome, wall_time_ms),
    )
    .with_correlation(correlation)
    .with_outcome(outcome);
    log_security_event(event);
}

pub fn control_degraded(correlation: &CorrelationIds, control: &str, reason: &str) {
    let event = SecurityEvent::new(
        SecurityEventType::ControlDegraded,
        format!("Control degraded: {} ({})", control, reason),
    )
    .with_correlation(correlation);
    log_security_event(event);
}

pub fn limit_breach(correlation: &CorrelationIds, limit: LimitKind, observed: u64, limit_value: u64) {
    let event = SecurityEvent::new(
        SecurityEventType::LimitBreach,
        format!(
            "{} limit exceeded: observed {} {}, limit {} {}",
            limit,
            observed,
            limit.unit(),
            limit_value,
            limit.unit()
        ),
    )
    .with_correlation(correlation);
    log_security_event(event);
}

pub fn sandbox_violation(correlation: &CorrelationIds, capability: Capability, detail: &str) {
    let event = SecurityEvent::new(
        SecurityEventType::SandboxViolation,
        format!("Denied {} access: {}", capability, detail),
    )
    .with_correlation(correlation)
    .with_capability(capability);
    log_security_event(event);
}

pub fn forced_kill(correlation: &CorrelationIds, reason: &str) {
    let event = SecurityEvent::new(
        SecurityEventType::ForcedKill,
        format!("Process group killed: {}", reason),
    )
    .with_correlation(correlation);
    log_security_event(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_ids_are_unique() {
        let a = CorrelationIds::new();
        let b = CorrelationIds::new().with_root_pid(1234);
        assert_ne!(a.run_id, b.run_id);
        assert_eq!(b.root_pid, Some(1234));
    }

    #[test]
    fn test_event_type_severity() {
        assert_eq!(
            SecurityEventType::ExecutionStart.default_severity(),
            SecuritySeverity::Low
        );
        assert_eq!(
            SecurityEventType::SandboxViolation.default_severity(),
            SecuritySeverity::High
        );
    }

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        let a = program_fingerprint("print(1)\n");
        assert_eq!(a.len(), 16);
        assert_eq!(a, program_fingerprint("print(1)\n"));
        assert_ne!(a, program_fingerprint("print(2)\n"));
    }

    #[test]
    fn test_logger_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let logger = SecurityLogger::new(Some(path.clone())).unwrap();

        let correlation = CorrelationIds::new();
        logger.log_security_event(
            &SecurityEvent::new(SecurityEventType::ForcedKill, "wall time".to_string())
                .with_correlation(&correlation),
        );
        logger.log_security_event(
            &SecurityEvent::new(SecurityEventType::SandboxViolation, "open".to_string())
                .with_capability(Capability::Filesystem),
        );

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event_type"], "ForcedKill");
        assert_eq!(lines[0]["correlation"]["run_id"], correlation.run_id.as_str());
        assert_eq!(lines[1]["capability"], "filesystem");
    }
}
