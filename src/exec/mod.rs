//! Execution control
//!
//! Runs generated programs under the harness with kernel controls applied
//! in a type-state enforced order.

pub mod harness;
pub mod preexec;
pub mod supervisor;

pub use supervisor::{CancelHandle, IsolationContext, LaunchEvidence, RunningExecution};

use crate::config::types::{ExecutionLimits, ExecutionResult, Result, SandboxConfig};
use crate::observability::metrics;
use std::time::Duration;

/// Start `code` in the background. The caller may cancel it through
/// [`RunningExecution::cancel_handle`] and must `wait` for the result.
pub fn launch(code: &str, limits: &ExecutionLimits, config: &SandboxConfig) -> Result<RunningExecution> {
    IsolationContext::new(config.clone(), limits.clone())
        .prepare(code)?
        .start()
}

/// Run `code` to completion. Never fails: setup errors become
/// [`ExecutionResult::InternalError`].
pub fn execute(code: &str, limits: &ExecutionLimits, config: &SandboxConfig) -> ExecutionResult {
    match launch(code, limits, config) {
        Ok(running) => running.wait(),
        Err(e) => {
            log::error!("Execution setup failed: {}", e);
            let result = ExecutionResult::InternalError {
                message: e.to_string(),
            };
            metrics::get_metrics().record_execution(&result, Duration::ZERO);
            result
        }
    }
}
