//! Language repository core.
//! Repositories here forward to an injected entity manager and surface one
//! domain error type to callers.

pub mod db;
pub mod logging;
pub mod model;
pub mod orm;
pub mod repo;

pub use logging::{default_log_level, init_logging, init_logging_with, logging_status, LogSettings};
pub use model::identifier::IdentifierValue;
pub use model::language::{Language, LanguageId, LanguageValidationError};
pub use orm::{
    Comparison, Criteria, CriteriaValue, Direction, Entity, EntityManager, EntityManagerOptions,
    Expr, SqliteEntityManager, StoreError, StoreResult,
};
pub use repo::language_repo::{
    DefaultLanguageRepository, LanguageMatches, LanguageRepository, PersistenceError,
    PersistenceResult, SqliteLanguageRepository,
};

/// Minimal health-check API for embedding hosts.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
