//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Functions called between fork and exec allocate nothing and never log;
//! they return `io::Result` and leave reporting to the parent.

pub mod capabilities;
pub mod mount;
pub mod namespace;
pub mod rlimit;
pub mod seccomp;
pub mod signal;
