//! Language repository contract and its entity-manager backed implementation.
//!
//! # Responsibility
//! - Expose get/add/update/remove/match for `Language` records.
//! - Translate every entity-manager failure into `PersistenceError`.
//!
//! # Invariants
//! - add/update/remove commit immediately; nothing stays scheduled after a call.
//! - A lookup miss is `Ok(None)`, never an error.
//! - Match results clear the manager's identity map exactly once, when the
//!   sequence is exhausted or dropped.

use crate::model::language::{Language, LanguageId};
use crate::orm::{
    Criteria, Entity, EntityManager, SqliteEntityManager, SqliteMapped, StoreError, StoreResult,
};
use log::{debug, warn};
use rusqlite::types::Value;
use rusqlite::{Connection, Row};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Domain-level persistence failure.
///
/// Carries the store error's message and code; the store error itself is the
/// `source()`.
#[derive(Debug)]
pub struct PersistenceError {
    message: String,
    code: i64,
    cause: StoreError,
}

impl PersistenceError {
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> i64 {
        self.code
    }

    pub fn cause(&self) -> &StoreError {
        &self.cause
    }

    pub fn into_cause(self) -> StoreError {
        self.cause
    }
}

impl Display for PersistenceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for PersistenceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.cause)
    }
}

impl From<StoreError> for PersistenceError {
    fn from(value: StoreError) -> Self {
        Self {
            message: value.to_string(),
            code: value.code(),
            cause: value,
        }
    }
}

impl Entity for Language {
    const NAME: &'static str = "language";

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn validate(&self) -> StoreResult<()> {
        Language::validate(self).map_err(|err| StoreError::Validation(err.to_string()))
    }
}

impl SqliteMapped for Language {
    const TABLE: &'static str = "languages";
    const ID_COLUMN: &'static str = "id";
    const COLUMNS: &'static [&'static str] = &["name", "native_name", "enabled", "position"];
    const TOUCH_COLUMN: Option<&'static str> = Some("updated_at");

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.name.clone()),
            self.native_name.clone().map_or(Value::Null, Value::Text),
            Value::Integer(i64::from(self.enabled)),
            Value::Integer(self.position),
        ]
    }

    fn from_row(row: &Row<'_>) -> StoreResult<Self> {
        let id: String = row.get("id")?;
        let enabled = match row.get::<_, i64>("enabled")? {
            0 => false,
            1 => true,
            other => {
                return Err(StoreError::Mapping(format!(
                    "invalid enabled value `{other}` in languages.enabled"
                )));
            }
        };

        let language = Language {
            id: LanguageId::new(id),
            name: row.get("name")?,
            native_name: row.get("native_name")?,
            enabled,
            position: row.get("position")?,
        };
        Language::validate(&language).map_err(|err| {
            StoreError::Mapping(format!("invalid persisted language `{}`: {err}", language.id))
        })?;
        Ok(language)
    }
}

/// Repository interface for language persistence.
pub trait LanguageRepository {
    /// Lazy `(index, language)` sequence returned by `match_criteria`.
    type Matches<'a>: Iterator<Item = PersistenceResult<(usize, Language)>>
    where
        Self: 'a;

    fn get(&self, id: &LanguageId) -> PersistenceResult<Option<Language>>;
    fn add(&self, language: &Language) -> PersistenceResult<()>;
    fn update(&self, language: &Language) -> PersistenceResult<()>;
    fn remove(&self, language: &Language) -> PersistenceResult<()>;
    fn match_criteria(&self, criteria: &Criteria) -> PersistenceResult<Self::Matches<'_>>;
}

/// Language repository delegating to an injected entity manager.
pub struct DefaultLanguageRepository<M> {
    manager: M,
}

/// Repository over the SQLite entity manager.
pub type SqliteLanguageRepository<'conn> =
    DefaultLanguageRepository<SqliteEntityManager<'conn, Language>>;

impl<M: EntityManager<Language>> DefaultLanguageRepository<M> {
    pub fn new(manager: M) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    fn commit(
        &self,
        operation: &'static str,
        language: &Language,
        schedule: impl FnOnce(&M) -> StoreResult<()>,
    ) -> PersistenceResult<()> {
        schedule(&self.manager)
            .and_then(|()| self.manager.flush())
            .map_err(|err| {
                warn!(
                    "event=language_{} module=repo status=error id={} code={} error={}",
                    operation,
                    language.id,
                    err.code(),
                    err
                );
                PersistenceError::from(err)
            })
    }
}

impl<'conn> SqliteLanguageRepository<'conn> {
    /// Builds a repository on a connection returned by `db::open_db*`.
    pub fn from_connection(conn: &'conn Connection) -> Self {
        Self::new(SqliteEntityManager::new(conn))
    }
}

impl<M: EntityManager<Language>> LanguageRepository for DefaultLanguageRepository<M> {
    type Matches<'a>
        = LanguageMatches<'a, M>
    where
        Self: 'a;

    fn get(&self, id: &LanguageId) -> PersistenceResult<Option<Language>> {
        Ok(self.manager.find(id.as_str())?)
    }

    fn add(&self, language: &Language) -> PersistenceResult<()> {
        self.commit("add", language, |manager| manager.persist(language))
    }

    fn update(&self, language: &Language) -> PersistenceResult<()> {
        self.commit("update", language, |manager| manager.persist(language))
    }

    fn remove(&self, language: &Language) -> PersistenceResult<()> {
        self.commit("remove", language, |manager| manager.remove(language))
    }

    fn match_criteria(&self, criteria: &Criteria) -> PersistenceResult<Self::Matches<'_>> {
        let cursor = self.manager.matching(criteria).map_err(|err| {
            warn!(
                "event=language_match module=repo status=error code={} error={}",
                err.code(),
                err
            );
            PersistenceError::from(err)
        })?;

        Ok(LanguageMatches {
            manager: &self.manager,
            cursor: Some(cursor),
            yielded: 0,
        })
    }
}

/// Single-pass match results.
///
/// Entities yielded here are detached from the entity manager once the
/// sequence ends or is dropped.
pub struct LanguageMatches<'a, M: EntityManager<Language> + 'a> {
    manager: &'a M,
    cursor: Option<M::Cursor<'a>>,
    yielded: usize,
}

impl<'a, M: EntityManager<Language> + 'a> LanguageMatches<'a, M> {
    fn finish(&mut self) {
        if self.cursor.take().is_some() {
            self.manager.clear();
            debug!(
                "event=language_match module=repo status=ok yielded={}",
                self.yielded
            );
        }
    }
}

impl<'a, M: EntityManager<Language> + 'a> Iterator for LanguageMatches<'a, M> {
    type Item = PersistenceResult<(usize, Language)>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.cursor.as_mut()?.next();
        match next {
            Some(Ok(pair)) => {
                self.yielded += 1;
                Some(Ok(pair))
            }
            Some(Err(err)) => {
                warn!(
                    "event=language_match module=repo status=error yielded={} code={} error={}",
                    self.yielded,
                    err.code(),
                    err
                );
                Some(Err(err.into()))
            }
            None => {
                self.finish();
                None
            }
        }
    }
}

impl<'a, M: EntityManager<Language> + 'a> Drop for LanguageMatches<'a, M> {
    fn drop(&mut self) {
        self.finish();
    }
}
