//! Testing infrastructure
//!
//! In-process reference interpreter used as the oracle for translation
//! equivalence tests.

pub mod reference;

pub use reference::{format_float, Interpreter, Outcome, RuntimeError};
