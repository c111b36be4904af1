//! Repository layer over entity managers.
//!
//! # Responsibility
//! - Define use-case oriented data access contracts.
//! - Normalize entity-manager failures into one domain error.
//!
//! # Invariants
//! - Repository writes are flushed before returning.
//! - Lookup misses are absent results, not errors.

pub mod language_repo;
