//! twibox: translator and sandboxed runner for a small Twi-flavoured
//! teaching language
//!
//! Learners' programs are translated to Python and executed in a fresh,
//! resource-limited interpreter process that cannot reach the host's files,
//! network or processes.
//!
//! # Architecture
//!
//! ## Translation ([`translate`])
//! - [`translate::lexer`]: source text to tokens with positions
//! - [`translate::parser`]: recursive descent to the AST in [`translate::ast`]
//! - [`translate::codegen`]: AST to Python plus a line map back to the source
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::namespace`]: user, network and mount namespaces
//! - [`kernel::mount`]: private read-only filesystem root per run
//! - [`kernel::rlimit`]: memory, CPU, process and file ceilings
//! - [`kernel::capabilities`]: credential drop, no_new_privs, /proc verification
//! - [`kernel::seccomp`]: syscall filter compiled per capability grant
//! - [`kernel::signal`]: parent-death signal and process group signalling
//!
//! ## Execution Control ([`exec`])
//! - [`exec::supervisor`]: run lifecycle, watchdog and reaping
//! - [`exec::preexec`]: type-state enforced child setup between fork and exec
//! - [`exec::harness`]: the Python harness, its runtime helpers and reports
//!
//! ## Evidence & Verdict ([`verdict`])
//! - [`verdict::verdict`]: pure classification of evidence into results
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: structured audit events
//! - [`observability::metrics`]: Prometheus metrics export
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: limits, capabilities, results and errors
//! - [`config::presets`]: limit profiles and the interpreter envelope
//! - [`config::validator`]: limit and host checks before a run
//! - [`config::loader`]: `twibox.json` loading
//!
//! ## Surfaces
//! - [`service`]: the playground request/response API
//! - [`cli`]: the `twibox` command line
//!
//! # Design Principles
//!
//! 1. **Fresh process per run** - no interpreter state outlives a request
//! 2. **Kernel as truth** - evidence from `/proc`, wait status and rusage
//! 3. **Types prevent errors** - setup steps cannot run out of order
//! 4. **Outcomes are values** - the program's behaviour is never a Rust error

// Translation
pub mod translate;

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// Evidence & Verdict
pub mod verdict;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// Reference interpreter
pub mod testing;

// Playground API
pub mod service;

// CLI entrypoint wiring for the twibox binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use exec::{execute, launch, CancelHandle, RunningExecution};
pub use service::{ExecuteRequest, Playground};
pub use translate::{translate, TranslateError, Translation};
