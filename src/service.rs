//! Request/response surface of the playground.
//!
//! Every call returns one of the serializable shapes below; nothing here
//! panics or propagates an error to the caller. Requests carry their own
//! limits, which are clamped to the playground's ceiling before use.

use crate::config::types::{CapabilitySet, ExecutionLimits, ExecutionResult, SandboxConfig};
use crate::exec;
use crate::translate::{self, ErrorReport, LineMapping, Translation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message returned in place of host details when the sandbox fails.
const SANDBOX_UNAVAILABLE: &str = "the sandbox could not run this program";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TranslateResponse {
    Translated {
        generated_code: String,
        line_map: Vec<LineMapping>,
    },
    Rejected {
        error: ErrorReport,
    },
}

impl From<Translation> for TranslateResponse {
    fn from(translation: Translation) -> Self {
        TranslateResponse::Translated {
            generated_code: translation.code,
            line_map: translation.line_map,
        }
    }
}

/// Result of translate-then-execute. Runtime failure lines in `result`
/// are DSL lines.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RunResponse {
    Executed {
        generated_code: String,
        line_map: Vec<LineMapping>,
        result: ExecutionResult,
    },
    Rejected {
        error: ErrorReport,
    },
}

/// One playground request: DSL `source` or already generated `code`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub limits: Option<ExecutionLimits>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PlaygroundResponse {
    Run(RunResponse),
    Execute(ExecutionResult),
    Invalid { error: ErrorReport },
}

pub struct Playground {
    config: SandboxConfig,
    defaults: ExecutionLimits,
    ceiling: ExecutionLimits,
}

impl Playground {
    /// Requests may not exceed `defaults` unless a wider ceiling is set.
    pub fn new(config: SandboxConfig, defaults: ExecutionLimits) -> Self {
        Self {
            config,
            ceiling: defaults.clone(),
            defaults,
        }
    }

    pub fn with_ceiling(mut self, ceiling: ExecutionLimits) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn translate(&self, source: &str) -> TranslateResponse {
        match translate::translate(source) {
            Ok(translation) => translation.into(),
            Err(e) => TranslateResponse::Rejected { error: e.report() },
        }
    }

    pub fn execute(&self, code: &str, limits: Option<ExecutionLimits>) -> ExecutionResult {
        let limits = self.effective_limits(limits);
        conceal_internal(exec::execute(code, &limits, &self.config))
    }

    pub fn run(&self, source: &str, limits: Option<ExecutionLimits>) -> RunResponse {
        let translation = match translate::translate(source) {
            Ok(translation) => translation,
            Err(e) => return RunResponse::Rejected { error: e.report() },
        };
        let result = self.execute(&translation.code, limits);
        RunResponse::Executed {
            result: map_failure_line(result, &translation),
            generated_code: translation.code,
            line_map: translation.line_map,
        }
    }

    pub fn handle(&self, request: ExecuteRequest) -> PlaygroundResponse {
        match (request.source, request.code) {
            (Some(source), None) => PlaygroundResponse::Run(self.run(&source, request.limits)),
            (None, Some(code)) => PlaygroundResponse::Execute(self.execute(&code, request.limits)),
            (Some(_), Some(_)) => invalid("send either source or code, not both"),
            (None, None) => invalid("request needs source or code"),
        }
    }

    /// Request limits clamped to the ceiling; omitted limits use the defaults.
    pub fn effective_limits(&self, requested: Option<ExecutionLimits>) -> ExecutionLimits {
        let Some(requested) = requested else {
            return self.defaults.clone();
        };
        let ceiling = &self.ceiling;
        let capabilities: CapabilitySet = requested
            .capabilities
            .iter()
            .filter(|cap| ceiling.allows(*cap))
            .collect();
        if capabilities != requested.capabilities {
            log::info!("Dropping capabilities not granted by this playground");
        }
        ExecutionLimits {
            wall_time_ms: requested.wall_time_ms.min(ceiling.wall_time_ms),
            cpu_time_ms: match requested.cpu_time_ms {
                Some(asked) => Some(asked.min(millis(ceiling.cpu_time()))),
                None => ceiling.cpu_time_ms,
            },
            memory_bytes: requested.memory_bytes.min(ceiling.memory_bytes),
            max_output_bytes: requested.max_output_bytes.min(ceiling.max_output_bytes),
            capabilities,
            scratch_dir: ceiling.scratch_dir.clone(),
        }
    }
}

impl Default for Playground {
    fn default() -> Self {
        Self::new(SandboxConfig::default(), ExecutionLimits::default())
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

fn invalid(message: &str) -> PlaygroundResponse {
    PlaygroundResponse::Invalid {
        error: ErrorReport {
            kind: "request",
            message: message.to_string(),
            line: 0,
            column: 0,
            offset: 0,
        },
    }
}

fn conceal_internal(result: ExecutionResult) -> ExecutionResult {
    match result {
        ExecutionResult::InternalError { message } => {
            log::error!("Sandbox failure hidden from caller: {}", message);
            ExecutionResult::InternalError {
                message: SANDBOX_UNAVAILABLE.to_string(),
            }
        }
        other => other,
    }
}

fn map_failure_line(result: ExecutionResult, translation: &Translation) -> ExecutionResult {
    match result {
        ExecutionResult::RuntimeFailure {
            error,
            line,
            stdout,
            stats,
        } => ExecutionResult::RuntimeFailure {
            error,
            line: line.and_then(|l| translation.source_line_for(l)),
            stdout,
            stats,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{Capability, ExecutionStats};
    use std::path::PathBuf;

    #[test]
    fn translate_response_shapes() {
        let playground = Playground::default();
        let ok = serde_json::to_value(playground.translate("x = 1 + 2; print(x)")).unwrap();
        assert_eq!(ok["generated_code"], "v_x = _rt_add(1, 2)\n_rt_print(v_x)\n");
        assert_eq!(ok["line_map"][0]["source_line"], 1);

        let err = serde_json::to_value(playground.translate("x = ")).unwrap();
        assert_eq!(err["error"]["kind"], "parse");
        assert_eq!(err["error"]["line"], 1);
    }

    #[test]
    fn requests_cannot_exceed_the_ceiling() {
        let ceiling = ExecutionLimits::default().granting(Capability::Network);
        let playground = Playground::new(SandboxConfig::default(), ExecutionLimits::tight()).with_ceiling(ceiling);

        let mut asked = ExecutionLimits::generous()
            .granting(Capability::Network)
            .granting(Capability::Subprocess);
        asked.scratch_dir = Some(PathBuf::from("/etc"));
        let limits = playground.effective_limits(Some(asked));

        assert_eq!(limits.wall_time_ms, ExecutionLimits::default().wall_time_ms);
        assert_eq!(limits.memory_bytes, ExecutionLimits::default().memory_bytes);
        assert!(limits.allows(Capability::Network));
        assert!(!limits.allows(Capability::Subprocess));
        assert!(limits.scratch_dir.is_none());

        assert_eq!(playground.effective_limits(None), ExecutionLimits::tight());
    }

    #[test]
    fn cpu_requests_are_clamped_to_the_derived_ceiling() {
        let ceiling = ExecutionLimits::default().with_wall_time(Duration::from_millis(2_000));
        assert_eq!(ceiling.cpu_time_ms, None);
        let playground = Playground::new(SandboxConfig::default(), ceiling);

        let asked = ExecutionLimits {
            cpu_time_ms: Some(60_000),
            ..ExecutionLimits::default()
        };
        assert_eq!(playground.effective_limits(Some(asked)).cpu_time_ms, Some(3_000));

        let asked = ExecutionLimits {
            cpu_time_ms: Some(500),
            ..ExecutionLimits::default()
        };
        assert_eq!(playground.effective_limits(Some(asked)).cpu_time_ms, Some(500));

        let unset = playground.effective_limits(Some(ExecutionLimits::default()));
        assert_eq!(unset.cpu_time_ms, None);
        assert!(unset.cpu_time() <= Duration::from_secs(3));
    }

    #[test]
    fn run_responses_carry_the_line_map() {
        let playground = Playground::new(
            SandboxConfig {
                interpreter: PathBuf::from("/nonexistent/python3"),
                ..SandboxConfig::default()
            },
            ExecutionLimits::default(),
        );
        let response = playground.run("x = 1\n\nprint(x)", None);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["generated_code"], "v_x = 1\n_rt_print(v_x)\n");
        assert_eq!(json["line_map"][0]["generated_line"], 1);
        assert_eq!(json["line_map"][0]["source_line"], 1);
        assert_eq!(json["line_map"][1]["generated_line"], 2);
        assert_eq!(json["line_map"][1]["source_line"], 3);
        assert_eq!(json["result"]["outcome"], "internal_error");
    }

    #[test]
    fn malformed_requests_are_rejected() {
        let playground = Playground::default();
        let response = playground.handle(ExecuteRequest::default());
        let json = serde_json::to_value(response).unwrap();
        assert_eq!(json["error"]["kind"], "request");

        let both = ExecuteRequest {
            source: Some("print(1)".to_string()),
            code: Some("_rt_print(1)".to_string()),
            limits: None,
        };
        assert!(matches!(playground.handle(both), PlaygroundResponse::Invalid { .. }));
    }

    #[test]
    fn syntax_errors_never_reach_the_sandbox() {
        let playground = Playground::new(
            SandboxConfig {
                interpreter: PathBuf::from("/nonexistent/python3"),
                ..SandboxConfig::default()
            },
            ExecutionLimits::default(),
        );
        match playground.run("print(\"open", None) {
            RunResponse::Rejected { error } => assert_eq!(error.kind, "lex"),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn internal_errors_are_generic() {
        let playground = Playground::new(
            SandboxConfig {
                interpreter: PathBuf::from("/nonexistent/python3"),
                ..SandboxConfig::default()
            },
            ExecutionLimits::default(),
        );
        let result = playground.execute("_rt_print(1)\n", None);
        assert_eq!(
            result,
            ExecutionResult::InternalError {
                message: SANDBOX_UNAVAILABLE.to_string()
            }
        );
    }

    #[test]
    fn failure_lines_map_to_source_lines() {
        let translation = translate::translate("x = 1\n\nfn f(d) {\n  return x / d\n}\nprint(f(0))").unwrap();
        let failure = ExecutionResult::RuntimeFailure {
            error: "division by zero".to_string(),
            line: Some(3),
            stdout: String::new(),
            stats: ExecutionStats::default(),
        };
        match map_failure_line(failure, &translation) {
            ExecutionResult::RuntimeFailure { line, .. } => assert_eq!(line, Some(4)),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
