//! Evidence-backed verdict classification
//!
//! Derives execution results as pure functions over collected evidence.

pub mod verdict;

pub use verdict::{Evidence, TerminalState, VerdictClassifier, WaitOutcome, WatchdogAction};
