//! Shared domain types for the CodeSentinel job engine.
//!
//! Everything here is plain data plus the pure rules that govern it
//! (status ordering, merge-patch of discovered facts, suggested-fix caps),
//! so both the engine and its HTTP/CLI front ends agree on one vocabulary.

pub mod fixes;
pub mod models;

pub use fixes::{FixError, FixKind, FixLimits, SuggestedFix, validate_fixes};
pub use models::*;
