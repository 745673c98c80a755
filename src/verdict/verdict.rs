/// Verdict classification
///
/// A run is classified from the evidence the supervisor collected after the
/// process group is gone. The classifier is a pure function: the same
/// evidence and limits always give the same result.
use crate::config::types::*;
use crate::exec::harness::{HarnessReport, ReportStatus};
use serde::{Deserialize, Serialize};

/// What the watchdog did before the child exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogAction {
    None,
    TimedOut,
    Cancelled,
}

/// How the interpreter process ended, from wait4.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitOutcome {
    pub exit_code: Option<i32>,
    pub terminating_signal: Option<i32>,
}

/// Everything the classifier looks at.
#[derive(Debug, Clone)]
pub struct Evidence {
    pub watchdog: WatchdogAction,
    /// Nonce-matched report from fd 3, if any.
    pub report: Option<HarnessReport>,
    pub wait_outcome: WaitOutcome,
    pub wall_elapsed_ms: u64,
    /// utime + stime from rusage.
    pub cpu_time_ms: u64,
    /// ru_maxrss converted to bytes.
    pub peak_memory_bytes: u64,
    /// Rendered stdout, truncation marker included.
    pub stdout: String,
    pub output_truncated: bool,
}

impl Evidence {
    pub fn stats(&self) -> ExecutionStats {
        ExecutionStats {
            wall_time_ms: self.wall_elapsed_ms,
            cpu_time_ms: self.cpu_time_ms,
            peak_memory_bytes: self.peak_memory_bytes,
            output_truncated: self.output_truncated,
        }
    }
}

/// Terminal state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    /// The harness finished and reported, with or without a program error.
    Completed,
    TimedOut,
    OutOfMemory,
    Violation,
    /// The interpreter died without a usable report.
    Crashed,
    Cancelled,
}

pub struct VerdictClassifier;

impl VerdictClassifier {
    /// Classify a finished run.
    ///
    /// Precedence: watchdog timeout, watchdog cancel, harness report, CPU
    /// limit, syscall filter kill, anything else.
    pub fn classify(evidence: &Evidence, limits: &ExecutionLimits) -> (TerminalState, ExecutionResult) {
        match evidence.watchdog {
            WatchdogAction::TimedOut => return Self::classify_wall_timeout(evidence, limits),
            WatchdogAction::Cancelled => {
                return (
                    TerminalState::Cancelled,
                    ExecutionResult::Cancelled {
                        stdout: evidence.stdout.clone(),
                        stats: evidence.stats(),
                    },
                )
            }
            WatchdogAction::None => {}
        }

        if let Some(report) = evidence.report.as_ref() {
            if let Some(verdict) = Self::classify_report(evidence, limits, report) {
                return verdict;
            }
            log::warn!("Harness report with status {:?} is incomplete; ignoring it", report.status);
        }

        let signal = evidence.wait_outcome.terminating_signal;
        let cpu_limit_ms = duration_ms(limits.cpu_time());
        if signal == Some(libc::SIGXCPU) || evidence.cpu_time_ms >= cpu_limit_ms {
            return (
                TerminalState::TimedOut,
                Self::limit_exceeded(evidence, LimitKind::CpuTime, cpu_limit_ms, evidence.cpu_time_ms),
            );
        }

        if signal == Some(libc::SIGSYS) {
            return (
                TerminalState::Violation,
                ExecutionResult::SandboxViolation {
                    capability: Capability::RawSyscall,
                    detail: "system call blocked by the syscall filter".to_string(),
                    stdout: evidence.stdout.clone(),
                    stats: evidence.stats(),
                },
            );
        }

        Self::classify_crash(evidence)
    }

    fn classify_wall_timeout(evidence: &Evidence, limits: &ExecutionLimits) -> (TerminalState, ExecutionResult) {
        (
            TerminalState::TimedOut,
            Self::limit_exceeded(
                evidence,
                LimitKind::WallTime,
                limits.wall_time_ms,
                evidence.wall_elapsed_ms,
            ),
        )
    }

    /// `None` when the report lacks the fields its status requires.
    fn classify_report(
        evidence: &Evidence,
        limits: &ExecutionLimits,
        report: &HarnessReport,
    ) -> Option<(TerminalState, ExecutionResult)> {
        let verdict = match report.status {
            ReportStatus::Ok => (
                TerminalState::Completed,
                ExecutionResult::Success {
                    stdout: evidence.stdout.clone(),
                    return_value: report.value.clone(),
                    stats: evidence.stats(),
                },
            ),
            ReportStatus::Error => {
                let error = report.error.as_ref()?;
                (
                    TerminalState::Completed,
                    ExecutionResult::RuntimeFailure {
                        error: error.message.clone(),
                        line: error.line,
                        stdout: evidence.stdout.clone(),
                        stats: evidence.stats(),
                    },
                )
            }
            ReportStatus::Memory => (
                TerminalState::OutOfMemory,
                Self::limit_exceeded(
                    evidence,
                    LimitKind::Memory,
                    limits.memory_bytes,
                    evidence.peak_memory_bytes,
                ),
            ),
            ReportStatus::Violation => {
                let capability = report.capability?;
                let detail = match report.event.as_deref() {
                    Some(event) => format!("'{}' is not permitted", event),
                    None => format!("{} access is not permitted", capability),
                };
                (
                    TerminalState::Violation,
                    ExecutionResult::SandboxViolation {
                        capability,
                        detail,
                        stdout: evidence.stdout.clone(),
                        stats: evidence.stats(),
                    },
                )
            }
        };
        Some(verdict)
    }

    fn classify_crash(evidence: &Evidence) -> (TerminalState, ExecutionResult) {
        let error = match evidence.wait_outcome {
            WaitOutcome {
                terminating_signal: Some(signal),
                ..
            } => format!(
                "interpreter terminated by {}",
                crate::kernel::signal::signal_name(signal)
            ),
            WaitOutcome {
                exit_code: Some(code),
                ..
            } => format!("interpreter exited with status {} without a result", code),
            _ => "interpreter ended in an unknown state".to_string(),
        };
        (
            TerminalState::Crashed,
            ExecutionResult::RuntimeFailure {
                error,
                line: None,
                stdout: evidence.stdout.clone(),
                stats: evidence.stats(),
            },
        )
    }

    fn limit_exceeded(evidence: &Evidence, limit: LimitKind, limit_value: u64, observed: u64) -> ExecutionResult {
        ExecutionResult::LimitExceeded {
            limit,
            limit_value,
            observed,
            stdout: evidence.stdout.clone(),
            stats: evidence.stats(),
        }
    }
}

fn duration_ms(duration: std::time::Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::harness::ReportedError;

    fn report(status: ReportStatus) -> HarnessReport {
        HarnessReport {
            nonce: "n".to_string(),
            status,
            value: None,
            error: None,
            capability: None,
            event: None,
        }
    }

    fn evidence() -> Evidence {
        Evidence {
            watchdog: WatchdogAction::None,
            report: None,
            wait_outcome: WaitOutcome {
                exit_code: Some(0),
                terminating_signal: None,
            },
            wall_elapsed_ms: 120,
            cpu_time_ms: 80,
            peak_memory_bytes: 9 * 1024 * 1024,
            stdout: "3\n".to_string(),
            output_truncated: false,
        }
    }

    fn limits() -> ExecutionLimits {
        ExecutionLimits::default()
    }

    #[test]
    fn test_ok_report_is_success() {
        let mut ev = evidence();
        let mut ok = report(ReportStatus::Ok);
        ok.value = Some("42".to_string());
        ev.report = Some(ok);

        let (state, result) = VerdictClassifier::classify(&ev, &limits());
        assert_eq!(state, TerminalState::Completed);
        match result {
            ExecutionResult::Success {
                stdout,
                return_value,
                stats,
            } => {
                assert_eq!(stdout, "3\n");
                assert_eq!(return_value.as_deref(), Some("42"));
                assert_eq!(stats.cpu_time_ms, 80);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_report_keeps_line_and_output() {
        let mut ev = evidence();
        let mut failed = report(ReportStatus::Error);
        failed.error = Some(ReportedError {
            message: "division by zero".to_string(),
            line: Some(4),
        });
        ev.report = Some(failed);

        let (_, result) = VerdictClassifier::classify(&ev, &limits());
        assert_eq!(
            result,
            ExecutionResult::RuntimeFailure {
                error: "division by zero".to_string(),
                line: Some(4),
                stdout: "3\n".to_string(),
                stats: ev.stats(),
            }
        );
    }

    #[test]
    fn test_timeout_precedes_report() {
        let mut ev = evidence();
        ev.watchdog = WatchdogAction::TimedOut;
        ev.wall_elapsed_ms = 2_110;
        ev.report = Some(report(ReportStatus::Ok));
        ev.wait_outcome = WaitOutcome {
            exit_code: None,
            terminating_signal: Some(libc::SIGTERM),
        };

        let limits = limits().with_wall_time(std::time::Duration::from_secs(2));
        let (state, result) = VerdictClassifier::classify(&ev, &limits);
        assert_eq!(state, TerminalState::TimedOut);
        match result {
            ExecutionResult::LimitExceeded {
                limit,
                limit_value,
                observed,
                ..
            } => {
                assert_eq!(limit, LimitKind::WallTime);
                assert_eq!(limit_value, 2_000);
                assert_eq!(observed, 2_110);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cancel_keeps_partial_output() {
        let mut ev = evidence();
        ev.watchdog = WatchdogAction::Cancelled;
        let (state, result) = VerdictClassifier::classify(&ev, &limits());
        assert_eq!(state, TerminalState::Cancelled);
        assert_eq!(result.outcome(), "cancelled");
        assert_eq!(result.stdout(), "3\n");
    }

    #[test]
    fn test_memory_report_observes_peak_rss() {
        let mut ev = evidence();
        ev.report = Some(report(ReportStatus::Memory));
        let (state, result) = VerdictClassifier::classify(&ev, &limits());
        assert_eq!(state, TerminalState::OutOfMemory);
        match result {
            ExecutionResult::LimitExceeded {
                limit,
                limit_value,
                observed,
                ..
            } => {
                assert_eq!(limit, LimitKind::Memory);
                assert_eq!(limit_value, 256 * 1024 * 1024);
                assert_eq!(observed, 9 * 1024 * 1024);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_violation_report_names_event() {
        let mut ev = evidence();
        let mut denied = report(ReportStatus::Violation);
        denied.capability = Some(Capability::Filesystem);
        denied.event = Some("open".to_string());
        ev.report = Some(denied);

        let (state, result) = VerdictClassifier::classify(&ev, &limits());
        assert_eq!(state, TerminalState::Violation);
        match result {
            ExecutionResult::SandboxViolation {
                capability, detail, ..
            } => {
                assert_eq!(capability, Capability::Filesystem);
                assert_eq!(detail, "'open' is not permitted");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_incomplete_report_falls_through() {
        let mut ev = evidence();
        ev.report = Some(report(ReportStatus::Violation));
        ev.wait_outcome = WaitOutcome {
            exit_code: Some(0),
            terminating_signal: None,
        };
        let (state, result) = VerdictClassifier::classify(&ev, &limits());
        assert_eq!(state, TerminalState::Crashed);
        assert_eq!(result.outcome(), "runtime_failure");
    }

    #[test]
    fn test_sigxcpu_is_cpu_limit() {
        let mut ev = evidence();
        ev.wait_outcome = WaitOutcome {
            exit_code: None,
            terminating_signal: Some(libc::SIGXCPU),
        };
        ev.cpu_time_ms = 1_000;
        let limits = limits().with_wall_time(std::time::Duration::from_secs(1));

        let (state, result) = VerdictClassifier::classify(&ev, &limits);
        assert_eq!(state, TerminalState::TimedOut);
        match result {
            ExecutionResult::LimitExceeded {
                limit, limit_value, ..
            } => {
                assert_eq!(limit, LimitKind::CpuTime);
                assert_eq!(limit_value, 2_000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cpu_usage_at_limit_without_signal() {
        let mut ev = evidence();
        ev.wait_outcome = WaitOutcome {
            exit_code: None,
            terminating_signal: Some(libc::SIGKILL),
        };
        ev.cpu_time_ms = 5_000;
        let (_, result) = VerdictClassifier::classify(&ev, &limits());
        assert_eq!(result.outcome(), "limit_exceeded");
    }

    #[test]
    fn test_sigsys_is_raw_syscall_violation() {
        let mut ev = evidence();
        ev.wait_outcome = WaitOutcome {
            exit_code: None,
            terminating_signal: Some(libc::SIGSYS),
        };
        let (_, result) = VerdictClassifier::classify(&ev, &limits());
        match result {
            ExecutionResult::SandboxViolation { capability, .. } => {
                assert_eq!(capability, Capability::RawSyscall)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_silent_exit_is_runtime_failure() {
        let mut ev = evidence();
        ev.wait_outcome = WaitOutcome {
            exit_code: Some(1),
            terminating_signal: None,
        };
        let (state, result) = VerdictClassifier::classify(&ev, &limits());
        assert_eq!(state, TerminalState::Crashed);
        match result {
            ExecutionResult::RuntimeFailure { error, line, .. } => {
                assert_eq!(error, "interpreter exited with status 1 without a result");
                assert_eq!(line, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_segfault_is_runtime_failure() {
        let mut ev = evidence();
        ev.wait_outcome = WaitOutcome {
            exit_code: None,
            terminating_signal: Some(libc::SIGSEGV),
        };
        let (_, result) = VerdictClassifier::classify(&ev, &limits());
        match result {
            ExecutionResult::RuntimeFailure { error, .. } => {
                assert_eq!(error, "interpreter terminated by SIGSEGV")
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
