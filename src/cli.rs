use crate::config::loader::TwiboxConfig;
use crate::config::presets::{LimitPresets, PYTHON_ENVELOPE};
use crate::config::types::{Capability, ExecutionLimits, ExecutionResult, SandboxConfig};
use crate::exec;
use crate::kernel::{capabilities, namespace};
use crate::observability::audit;
use crate::service::{Playground, RunResponse, TranslateResponse};
use crate::translate;
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./twibox.json when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Append audit events as JSON lines to this file
    #[arg(long, global = true)]
    audit_log: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Translate a DSL program and print the generated code
    Translate {
        /// Source file, or - for stdin
        input: String,
        /// Print the service response as JSON
        #[arg(long)]
        json: bool,
    },
    /// Translate a DSL program and run it in the sandbox
    Run {
        /// Source file, or - for stdin
        input: String,
        #[command(flatten)]
        limits: LimitArgs,
    },
    /// Run already generated code in the sandbox
    Exec {
        /// Generated code file, or - for stdin
        input: String,
        #[command(flatten)]
        limits: LimitArgs,
    },
    /// Report interpreter and kernel feature availability
    Check {
        /// Show interpreter version and metrics
        #[arg(long)]
        verbose: bool,
    },
}

#[derive(Args)]
struct LimitArgs {
    /// Named limit profile (classroom, tight, generous)
    #[arg(long)]
    preset: Option<String>,
    /// Wall time limit in milliseconds
    #[arg(long)]
    wall_ms: Option<u64>,
    /// CPU time limit in milliseconds
    #[arg(long)]
    cpu_ms: Option<u64>,
    /// Memory limit in MB
    #[arg(long)]
    memory_mb: Option<u64>,
    /// Captured output limit in bytes, per stream
    #[arg(long)]
    output_bytes: Option<usize>,
    /// Grant a capability (repeatable)
    #[arg(long = "allow", value_name = "CAPABILITY")]
    allow: Vec<String>,
    /// Directory readable when filesystem is granted
    #[arg(long)]
    scratch_dir: Option<PathBuf>,
    /// Fail when a kernel control cannot be applied
    #[arg(long)]
    strict: bool,
    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

impl LimitArgs {
    fn resolve(&self, file: &TwiboxConfig) -> Result<ExecutionLimits> {
        let mut limits = match &self.preset {
            Some(name) => LimitPresets::new()
                .get(name)
                .map(|profile| profile.limits.clone())
                .ok_or_else(|| anyhow!("unknown limit preset: {}", name))?,
            None => file.effective_limits()?,
        };
        if let Some(ms) = self.wall_ms {
            limits.wall_time_ms = ms;
        }
        if self.cpu_ms.is_some() {
            limits.cpu_time_ms = self.cpu_ms;
        }
        if let Some(mb) = self.memory_mb {
            limits.memory_bytes = mb.saturating_mul(1024 * 1024);
        }
        if let Some(bytes) = self.output_bytes {
            limits.max_output_bytes = bytes;
        }
        for name in &self.allow {
            let capability =
                Capability::parse(name).ok_or_else(|| anyhow!("unknown capability: {}", name))?;
            limits.capabilities.grant(capability);
        }
        if self.scratch_dir.is_some() {
            limits.scratch_dir = self.scratch_dir.clone();
        }
        Ok(limits)
    }

    fn sandbox(&self, file: &TwiboxConfig) -> SandboxConfig {
        let mut sandbox = file.sandbox.clone();
        sandbox.strict_mode |= self.strict;
        sandbox
    }
}

pub fn run() -> Result<ExitCode> {
    env_logger::init();

    let cli = Cli::parse();
    if let Some(path) = cli.audit_log.clone() {
        audit::init_security_logger(Some(path)).context("failed to open audit log")?;
    }
    let file = match &cli.config {
        Some(path) => TwiboxConfig::load_from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => TwiboxConfig::load_or_default()?,
    };

    match cli.command {
        Commands::Translate { input, json } => {
            let source = read_input(&input)?;
            let response = Playground::new(file.sandbox.clone(), file.effective_limits()?).translate(&source);
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                match &response {
                    TranslateResponse::Translated { generated_code, .. } => print!("{}", generated_code),
                    TranslateResponse::Rejected { error } => eprintln!(
                        "{}:{}:{}: {} error: {}",
                        input, error.line, error.column, error.kind, error.message
                    ),
                }
            }
            Ok(exit_code(matches!(response, TranslateResponse::Translated { .. })))
        }
        Commands::Run { input, limits } => {
            let source = read_input(&input)?;
            let resolved = limits.resolve(&file)?;
            let config = limits.sandbox(&file);
            let translation = match translate::translate(&source) {
                Ok(translation) => translation,
                Err(e) => {
                    if limits.json {
                        let response = RunResponse::Rejected { error: e.report() };
                        println!("{}", serde_json::to_string_pretty(&response)?);
                    } else {
                        eprintln!("{}: {}", input, e);
                    }
                    return Ok(ExitCode::FAILURE);
                }
            };
            let mut result = exec::execute(&translation.code, &resolved, &config);
            if let ExecutionResult::RuntimeFailure { line, .. } = &mut result {
                *line = line.and_then(|l| translation.source_line_for(l));
            }
            if limits.json {
                let response = RunResponse::Executed {
                    generated_code: translation.code,
                    line_map: translation.line_map,
                    result: result.clone(),
                };
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_result(&result);
            }
            Ok(exit_code(result.is_success()))
        }
        Commands::Exec { input, limits } => {
            let code = read_input(&input)?;
            let resolved = limits.resolve(&file)?;
            let result = exec::execute(&code, &resolved, &limits.sandbox(&file));
            if limits.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
            Ok(exit_code(result.is_success()))
        }
        Commands::Check { verbose } => Ok(exit_code(check(&file.sandbox, verbose))),
    }
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read stdin")?;
        return Ok(buffer);
    }
    std::fs::read_to_string(Path::new(input)).with_context(|| format!("failed to read {}", input))
}

/// Program output on stdout, everything else on stderr.
fn print_result(result: &ExecutionResult) {
    print!("{}", result.stdout());
    match result {
        ExecutionResult::Success { return_value, .. } => {
            if let Some(value) = return_value {
                eprintln!("=> {}", value);
            }
        }
        ExecutionResult::RuntimeFailure { error, line, .. } => match line {
            Some(line) => eprintln!("runtime error on line {}: {}", line, error),
            None => eprintln!("runtime error: {}", error),
        },
        ExecutionResult::LimitExceeded {
            limit,
            limit_value,
            observed,
            ..
        } => eprintln!(
            "{} limit exceeded: {} {} (limit {} {})",
            limit,
            observed,
            limit.unit(),
            limit_value,
            limit.unit()
        ),
        ExecutionResult::SandboxViolation {
            capability, detail, ..
        } => eprintln!("sandbox violation ({}): {}", capability, detail),
        ExecutionResult::Cancelled { .. } => eprintln!("execution cancelled"),
        ExecutionResult::InternalError { message } => eprintln!("internal error: {}", message),
    }
    if let Some(stats) = result.stats() {
        log::info!(
            "wall {} ms, cpu {} ms, peak memory {} bytes{}",
            stats.wall_time_ms,
            stats.cpu_time_ms,
            stats.peak_memory_bytes,
            if stats.output_truncated { ", output truncated" } else { "" }
        );
    }
}

/// Prints the feature report; false when the interpreter is unusable.
fn check(config: &SandboxConfig, verbose: bool) -> bool {
    let root = capabilities::running_as_root();
    println!("🔍 Checking sandbox prerequisites...");
    println!();

    let interpreter_ok = match Command::new(&config.interpreter).arg("--version").output() {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(if output.stdout.is_empty() {
                &output.stderr
            } else {
                &output.stdout
            })
            .trim()
            .to_string();
            let supported = python_supported(&version);
            if supported {
                println!("✅ interpreter {} ({})", config.interpreter.display(), version);
            } else {
                println!("❌ interpreter {} is {}; 3.8 or newer is required", config.interpreter.display(), version);
            }
            supported
        }
        Ok(_) => {
            println!("❌ interpreter {} failed to report a version", config.interpreter.display());
            false
        }
        Err(e) => {
            println!("❌ interpreter {} not usable: {}", config.interpreter.display(), e);
            false
        }
    };
    if verbose {
        println!("   envelope {}", PYTHON_ENVELOPE.id);
    }

    if namespace::namespaces_supported(root) {
        println!("✅ network namespace isolation available");
    } else {
        println!("⚠️  network namespace isolation unavailable; network is denied by the interpreter guard only");
    }
    if root {
        println!("✅ running as root: interpreter drops to {}:{}", config.drop_to_uid, config.drop_to_gid);
    } else {
        println!("⚠️  not running as root: interpreter keeps the caller's identity");
    }
    if Path::new("/proc/self/status").exists() {
        println!("✅ /proc available for launch verification");
    } else {
        println!("⚠️  /proc unavailable: kernel controls cannot be verified after launch");
    }
    println!(
        "{} syscall filter {}",
        if config.syscall_filter { "✅" } else { "⚠️ " },
        if config.syscall_filter { "enabled" } else { "disabled" }
    );
    println!("   mode: {}", if config.strict_mode { "strict" } else { "permissive" });

    if verbose {
        println!();
        print!("{}", crate::observability::metrics::get_metrics().export_prometheus());
    }
    interpreter_ok
}

/// True for "Python 3.N..." with N >= 8.
fn python_supported(version: &str) -> bool {
    let Some(numbers) = version.strip_prefix("Python ") else {
        return false;
    };
    let mut parts = numbers.split('.').map(|p| p.parse::<u32>().ok());
    match (parts.next().flatten(), parts.next().flatten()) {
        (Some(major), Some(minor)) => major > 3 || (major == 3 && minor >= 8),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_python_versions() {
        assert!(python_supported("Python 3.8.10"));
        assert!(python_supported("Python 3.12.1"));
        assert!(!python_supported("Python 3.7.3"));
        assert!(!python_supported("Python 2.7.18"));
        assert!(!python_supported("pypy"));
    }

    #[test]
    fn limit_flags_override_the_file() {
        let args = LimitArgs {
            preset: None,
            wall_ms: Some(1500),
            cpu_ms: None,
            memory_mb: Some(64),
            output_bytes: None,
            allow: vec!["network".to_string(), "Module-Import".to_string()],
            scratch_dir: None,
            strict: true,
            json: false,
        };
        let file = TwiboxConfig::default();
        let limits = args.resolve(&file).unwrap();
        assert_eq!(limits.wall_time_ms, 1500);
        assert_eq!(limits.memory_bytes, 64 * 1024 * 1024);
        assert!(limits.allows(Capability::Network));
        assert!(limits.allows(Capability::ModuleImport));
        assert!(args.sandbox(&file).strict_mode);
    }

    #[test]
    fn unknown_names_are_rejected() {
        let args = LimitArgs {
            preset: Some("lenient".to_string()),
            wall_ms: None,
            cpu_ms: None,
            memory_mb: None,
            output_bytes: None,
            allow: Vec::new(),
            scratch_dir: None,
            strict: false,
            json: false,
        };
        assert!(args.resolve(&TwiboxConfig::default()).is_err());

        let args = LimitArgs {
            preset: None,
            allow: vec!["root".to_string()],
            ..args
        };
        assert!(args.resolve(&TwiboxConfig::default()).is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
