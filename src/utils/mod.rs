//! Utilities
//!
//! Cross-cutting utilities for FD hygiene, environment hygiene, and output collection.

pub mod env_hygiene;
pub mod fd_closure;
pub mod output;
