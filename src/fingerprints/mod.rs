//! Rule-based technology fingerprinting over HTTP responses.
//!
//! Rules follow the FingerprintHub shape: each carries `http` probes
//! whose matchers are `word`, `regex`, or `favicon` checks against the
//! body, headers, or favicon hash. The compiled engine is cached in a
//! process-wide singleton keyed by the rule-file path; tests reset it
//! explicitly.

pub mod engine;
pub mod loader;

pub use engine::{FingerprintEngine, MatchResult};
pub use loader::{global, load_rules, reset_global};
