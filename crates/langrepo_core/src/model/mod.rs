//! Domain model for language records.
//!
//! # Invariants
//! - Every language is identified by a stable `IdentifierValue`.
//! - Writes go through `Language::validate()` before reaching storage.

pub mod identifier;
pub mod language;
