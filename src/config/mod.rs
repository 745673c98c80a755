//! Configuration
//!
//! Limits, capabilities, sandbox settings, presets and validation.

pub mod loader;
pub mod presets;
pub mod types;
pub mod validator;
