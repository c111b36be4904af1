//! Entity manager contract consumed by repositories.
//!
//! # Responsibility
//! - Define the unit-of-work handle (`EntityManager`) repositories delegate to.
//! - Own the store-level error taxonomy (`StoreError`).
//!
//! # Invariants
//! - `persist`/`remove` only schedule work; nothing reaches storage before `flush`.
//! - `flush` is all-or-nothing for the scheduled batch.
//! - `clear` detaches every tracked entity and drops unflushed work.
//! - Entity managers are single-threaded handles; methods take `&self` and use
//!   interior mutability so a live cursor and a write can coexist.

use crate::db::DbError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod criteria;
pub mod sqlite;

pub use criteria::{Comparison, Criteria, CriteriaValue, Direction, Expr};
pub use sqlite::{EntityManagerOptions, SqliteCursor, SqliteEntityManager, SqliteMapped};

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures raised by entity manager implementations.
#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Db(DbError),
    /// Row version changed (or row vanished) since the entity was loaded.
    OptimisticLock {
        entity: &'static str,
        key: String,
        expected_version: i64,
    },
    /// Entity rejected its own state before being scheduled.
    Validation(String),
    /// Persisted data could not be mapped onto the entity.
    Mapping(String),
    /// Criteria could not be translated into a store query.
    Query(String),
}

impl StoreError {
    /// Numeric code carried into domain errors.
    ///
    /// SQLite failures report the extended result code; everything raised by
    /// the entity manager itself reports `0`.
    pub fn code(&self) -> i64 {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => i64::from(err.extended_code),
            Self::Db(err) => err.code(),
            _ => 0,
        }
    }

    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, Self::OptimisticLock { .. })
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::OptimisticLock {
                entity,
                key,
                expected_version,
            } => write!(
                f,
                "optimistic lock failed for {entity} `{key}`: expected version {expected_version}"
            ),
            Self::Validation(message) => write!(f, "entity validation failed: {message}"),
            Self::Mapping(message) => write!(f, "entity mapping failed: {message}"),
            Self::Query(message) => write!(f, "invalid criteria: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::OptimisticLock { .. }
            | Self::Validation(_)
            | Self::Mapping(_)
            | Self::Query(_) => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

/// A record type an entity manager can track.
pub trait Entity: Clone {
    /// Short entity name used in logs and error messages.
    const NAME: &'static str;

    /// Identity key in the store's native representation.
    fn key(&self) -> String;

    /// Checked by `persist` before any work is scheduled.
    fn validate(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Unit-of-work handle for one entity type.
pub trait EntityManager<E: Entity> {
    /// Forward-only result cursor yielding `(index, entity)` pairs.
    ///
    /// The index is an ordinal assigned by the implementation.
    type Cursor<'a>: Iterator<Item = StoreResult<(usize, E)>>
    where
        Self: 'a;

    /// Looks an entity up by key. A miss is `Ok(None)`.
    fn find(&self, key: &str) -> StoreResult<Option<E>>;

    /// Schedules a write keyed by identity: inserted when the key is not yet
    /// stored, updated otherwise.
    fn persist(&self, entity: &E) -> StoreResult<()>;

    /// Schedules a delete.
    fn remove(&self, entity: &E) -> StoreResult<()>;

    /// Writes all scheduled work to the store.
    fn flush(&self) -> StoreResult<()>;

    /// Evaluates criteria and returns a lazy cursor over the matches.
    fn matching(&self, criteria: &Criteria) -> StoreResult<Self::Cursor<'_>>;

    /// Detaches every tracked entity.
    fn clear(&self);
}
