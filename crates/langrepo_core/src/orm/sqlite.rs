//! SQLite-backed entity manager.
//!
//! # Responsibility
//! - Track loaded entities in an identity map keyed by primary key.
//! - Queue persist/remove calls and apply them transactionally on `flush`.
//! - Translate `Criteria` into parameterized SQL and page through results.
//!
//! # Invariants
//! - Every mapped table has an integer `version` column; updates bump it and
//!   are guarded by the version observed when the entity was loaded.
//! - The identity map only changes after a successful commit, on `find`/cursor
//!   hydration, or on `clear`. A cursor page is hydrated only once every row in
//!   it has mapped.
//! - Writes for untracked keys resolve insert vs update against the stored row
//!   at flush time.
//! - Cursor pages after the first are keyed on the last row read, so writes
//!   made during iteration never shift unread rows.
//! - Criteria field names are resolved against the mapping; raw caller input
//!   never reaches the SQL text.

use super::criteria::{Comparison, Criteria, CriteriaValue, Direction, Expr};
use super::{Entity, EntityManager, StoreError, StoreResult};
use log::{debug, error, warn};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::iter;
use std::time::Instant;

const VERSION_COLUMN: &str = "version";
const LIKE_ESCAPE: char = '\\';

pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// Tuning options for `SqliteEntityManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityManagerOptions {
    /// Rows fetched per cursor page. Zero is treated as one.
    pub batch_size: u32,
}

impl Default for EntityManagerOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Table mapping for an entity stored through `SqliteEntityManager`.
pub trait SqliteMapped: Entity {
    const TABLE: &'static str;
    const ID_COLUMN: &'static str;
    /// Data columns, in the order produced by `to_values`. Excludes the id and
    /// `version` columns.
    const COLUMNS: &'static [&'static str];
    /// Column set to the current epoch milliseconds on every update.
    const TOUCH_COLUMN: Option<&'static str> = None;

    fn to_values(&self) -> Vec<Value>;

    fn from_row(row: &Row<'_>) -> StoreResult<Self>;
}

struct Tracked<E> {
    entity: E,
    version: i64,
}

enum PendingOp<E> {
    /// Untracked key: updated when the row exists at flush, inserted otherwise.
    Save {
        key: String,
        entity: E,
    },
    Update {
        key: String,
        entity: E,
        expected_version: i64,
    },
    Delete {
        key: String,
    },
}

impl<E> PendingOp<E> {
    fn key(&self) -> &str {
        match self {
            Self::Save { key, .. } | Self::Update { key, .. } | Self::Delete { key } => key,
        }
    }
}

struct MappedSql {
    select: String,
    select_by_id: String,
    select_version: String,
    insert: String,
    update: String,
    delete: String,
}

impl MappedSql {
    fn build<E: SqliteMapped>() -> Self {
        let select_columns = iter::once(E::ID_COLUMN)
            .chain(E::COLUMNS.iter().copied())
            .chain(iter::once(VERSION_COLUMN))
            .collect::<Vec<_>>()
            .join(", ");
        let select = format!("SELECT {select_columns} FROM {}", E::TABLE);

        let insert_columns = iter::once(E::ID_COLUMN)
            .chain(E::COLUMNS.iter().copied())
            .collect::<Vec<_>>();
        let insert = format!(
            "INSERT INTO {} ({}, {VERSION_COLUMN}) VALUES ({}, 1)",
            E::TABLE,
            insert_columns.join(", "),
            vec!["?"; insert_columns.len()].join(", ")
        );

        let mut assignments = E::COLUMNS
            .iter()
            .map(|column| format!("{column} = ?"))
            .collect::<Vec<_>>();
        assignments.push(format!("{VERSION_COLUMN} = {VERSION_COLUMN} + 1"));
        if let Some(touch) = E::TOUCH_COLUMN {
            assignments.push(format!("{touch} = (strftime('%s', 'now') * 1000)"));
        }
        let update = format!(
            "UPDATE {} SET {} WHERE {} = ? AND {VERSION_COLUMN} = ?",
            E::TABLE,
            assignments.join(", "),
            E::ID_COLUMN
        );

        Self {
            select_by_id: format!("{select} WHERE {} = ?1", E::ID_COLUMN),
            select_version: format!(
                "SELECT {VERSION_COLUMN} FROM {} WHERE {} = ?1",
                E::TABLE,
                E::ID_COLUMN
            ),
            delete: format!("DELETE FROM {} WHERE {} = ?1", E::TABLE, E::ID_COLUMN),
            select,
            insert,
            update,
        }
    }
}

/// Unit-of-work entity manager over a borrowed SQLite connection.
///
/// Not thread-safe; one manager serves one caller at a time.
pub struct SqliteEntityManager<'conn, E: SqliteMapped> {
    conn: &'conn Connection,
    options: EntityManagerOptions,
    sql: MappedSql,
    identity_map: RefCell<HashMap<String, Tracked<E>>>,
    pending: RefCell<Vec<PendingOp<E>>>,
}

impl<'conn, E: SqliteMapped> SqliteEntityManager<'conn, E> {
    /// Builds a manager on a connection returned by `db::open_db*`.
    pub fn new(conn: &'conn Connection) -> Self {
        Self::with_options(conn, EntityManagerOptions::default())
    }

    pub fn with_options(conn: &'conn Connection, options: EntityManagerOptions) -> Self {
        Self {
            conn,
            options,
            sql: MappedSql::build::<E>(),
            identity_map: RefCell::new(HashMap::new()),
            pending: RefCell::new(Vec::new()),
        }
    }

    pub fn options(&self) -> EntityManagerOptions {
        self.options
    }

    /// Number of entities currently held in the identity map.
    pub fn tracked_count(&self) -> usize {
        self.identity_map.borrow().len()
    }

    pub fn is_tracked(&self, key: &str) -> bool {
        self.identity_map.borrow().contains_key(key)
    }

    /// Number of scheduled writes not yet flushed.
    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Registers a freshly read row, returning the tracked copy when the key
    /// is already managed.
    fn hydrate(&self, entity: E, version: i64) -> E {
        self.identity_map
            .borrow_mut()
            .entry(entity.key())
            .or_insert(Tracked { entity, version })
            .entity
            .clone()
    }

    /// Runs `ops` in one transaction and returns the committed version of each
    /// written row (`None` for deletes).
    fn apply(&self, ops: &[PendingOp<E>]) -> StoreResult<Vec<Option<i64>>> {
        let tx = self.conn.unchecked_transaction()?;
        let mut versions = Vec::with_capacity(ops.len());
        for op in ops {
            let version = match op {
                PendingOp::Save { key, entity } => {
                    let stored = tx
                        .query_row(&self.sql.select_version, [key], |row| row.get::<_, i64>(0))
                        .optional()?;
                    match stored {
                        Some(stored_version) => {
                            self.update_row(&tx, key, entity, stored_version)?;
                            Some(stored_version + 1)
                        }
                        None => {
                            let values =
                                iter::once(Value::Text(key.clone())).chain(entity.to_values());
                            tx.execute(&self.sql.insert, params_from_iter(values))?;
                            Some(1)
                        }
                    }
                }
                PendingOp::Update {
                    key,
                    entity,
                    expected_version,
                } => {
                    self.update_row(&tx, key, entity, *expected_version)?;
                    Some(expected_version + 1)
                }
                PendingOp::Delete { key } => {
                    tx.execute(&self.sql.delete, [key])?;
                    None
                }
            };
            versions.push(version);
        }
        tx.commit()?;
        Ok(versions)
    }

    fn update_row(
        &self,
        conn: &Connection,
        key: &str,
        entity: &E,
        expected_version: i64,
    ) -> StoreResult<()> {
        let values = entity.to_values().into_iter().chain([
            Value::Text(key.to_string()),
            Value::Integer(expected_version),
        ]);
        let changed = conn.execute(&self.sql.update, params_from_iter(values))?;
        if changed == 0 {
            return Err(StoreError::OptimisticLock {
                entity: E::NAME,
                key: key.to_string(),
                expected_version,
            });
        }
        Ok(())
    }

    fn record_committed(&self, ops: Vec<PendingOp<E>>, versions: Vec<Option<i64>>) {
        let mut identity_map = self.identity_map.borrow_mut();
        for (op, version) in ops.into_iter().zip(versions) {
            match op {
                PendingOp::Save { key, entity } | PendingOp::Update { key, entity, .. } => {
                    if let Some(version) = version {
                        identity_map.insert(key, Tracked { entity, version });
                    }
                }
                PendingOp::Delete { key } => {
                    identity_map.remove(&key);
                }
            }
        }
    }
}

impl<'conn, E: SqliteMapped> EntityManager<E> for SqliteEntityManager<'conn, E> {
    type Cursor<'a>
        = SqliteCursor<'a, 'conn, E>
    where
        Self: 'a;

    fn find(&self, key: &str) -> StoreResult<Option<E>> {
        if let Some(tracked) = self.identity_map.borrow().get(key) {
            return Ok(Some(tracked.entity.clone()));
        }

        let mut stmt = self.conn.prepare_cached(&self.sql.select_by_id)?;
        let mut rows = stmt.query([key])?;
        if let Some(row) = rows.next()? {
            let (entity, version) = read_row::<E>(row)?;
            return Ok(Some(self.hydrate(entity, version)));
        }

        Ok(None)
    }

    fn persist(&self, entity: &E) -> StoreResult<()> {
        entity.validate()?;
        let key = entity.key();
        let mut pending = self.pending.borrow_mut();

        // Persisting cancels a scheduled removal of the same key.
        pending.retain(|op| !(matches!(op, PendingOp::Delete { .. }) && op.key() == key));

        for op in pending.iter_mut() {
            match op {
                PendingOp::Save { key: queued, entity: slot }
                | PendingOp::Update {
                    key: queued,
                    entity: slot,
                    ..
                } if *queued == key => {
                    *slot = entity.clone();
                    return Ok(());
                }
                _ => {}
            }
        }

        let op = match self.identity_map.borrow().get(&key) {
            Some(tracked) => PendingOp::Update {
                key,
                entity: entity.clone(),
                expected_version: tracked.version,
            },
            None => PendingOp::Save {
                key,
                entity: entity.clone(),
            },
        };
        pending.push(op);
        Ok(())
    }

    fn remove(&self, entity: &E) -> StoreResult<()> {
        let key = entity.key();
        let mut pending = self.pending.borrow_mut();
        // Queued saves may target an existing row; replace them with the delete.
        pending.retain(|op| op.key() != key);
        pending.push(PendingOp::Delete { key });
        Ok(())
    }

    fn flush(&self) -> StoreResult<()> {
        let ops = std::mem::take(&mut *self.pending.borrow_mut());
        if ops.is_empty() {
            return Ok(());
        }

        let started_at = Instant::now();
        let op_count = ops.len();
        match self.apply(&ops) {
            Ok(versions) => {
                self.record_committed(ops, versions);
                debug!(
                    "event=em_flush module=orm status=ok entity={} ops={} duration_ms={}",
                    E::NAME,
                    op_count,
                    started_at.elapsed().as_millis()
                );
                Ok(())
            }
            Err(err) if err.is_lock_conflict() => {
                warn!(
                    "event=em_flush module=orm status=conflict entity={} ops={} error_code=optimistic_lock",
                    E::NAME,
                    op_count
                );
                Err(err)
            }
            Err(err) => {
                error!(
                    "event=em_flush module=orm status=error entity={} ops={} code={} error={}",
                    E::NAME,
                    op_count,
                    err.code(),
                    err
                );
                Err(err)
            }
        }
    }

    fn matching(&self, criteria: &Criteria) -> StoreResult<Self::Cursor<'_>> {
        let query = compile_query::<E>(&self.sql.select, criteria)?;
        let mut cursor = SqliteCursor {
            manager: self,
            skip: u64::from(criteria.first_result().unwrap_or(0)),
            remaining: criteria.max_results().map(u64::from),
            query,
            last_key: None,
            buffer: VecDeque::new(),
            position: 0,
            exhausted: false,
        };
        // First page is read eagerly so evaluation failures surface here.
        cursor.fill()?;
        debug!(
            "event=em_match module=orm status=ok entity={} first_page_rows={}",
            E::NAME,
            cursor.buffer.len()
        );
        Ok(cursor)
    }

    fn clear(&self) {
        let tracked = {
            let mut identity_map = self.identity_map.borrow_mut();
            let count = identity_map.len();
            identity_map.clear();
            count
        };
        let dropped = {
            let mut pending = self.pending.borrow_mut();
            let count = pending.len();
            pending.clear();
            count
        };
        debug!(
            "event=em_clear module=orm status=ok entity={} detached={} pending_dropped={}",
            E::NAME,
            tracked,
            dropped
        );
    }
}

/// Paged cursor over a compiled criteria query.
///
/// The first page honors `first_result`; later pages continue after the
/// ordering key of the last row read. Index values are zero-based positions
/// within the matched window.
pub struct SqliteCursor<'a, 'conn, E: SqliteMapped> {
    manager: &'a SqliteEntityManager<'conn, E>,
    query: CompiledQuery,
    skip: u64,
    remaining: Option<u64>,
    last_key: Option<Vec<Value>>,
    buffer: VecDeque<E>,
    position: usize,
    exhausted: bool,
}

impl<E: SqliteMapped> SqliteCursor<'_, '_, E> {
    fn fill(&mut self) -> StoreResult<()> {
        let batch = u64::from(self.manager.options.batch_size.max(1));
        let limit = match self.remaining {
            Some(0) => {
                self.exhausted = true;
                return Ok(());
            }
            Some(remaining) => remaining.min(batch),
            None => batch,
        };

        let manager = self.manager;
        let (mut sql, binds) = self.query.page_sql(self.last_key.as_deref());
        sql.push_str(" LIMIT ? OFFSET ?");
        let binds = binds
            .into_iter()
            .chain([to_sql_integer(limit), to_sql_integer(self.skip)]);

        let mut page = Vec::new();
        let mut last_key = None;
        {
            let mut stmt = manager.conn.prepare_cached(&sql)?;
            let mut rows = stmt.query(params_from_iter(binds))?;
            while let Some(row) = rows.next()? {
                page.push(read_row::<E>(row)?);
                last_key = Some(self.query.key_of(row)?);
            }
        }

        let fetched = page.len() as u64;
        for (entity, version) in page {
            self.buffer.push_back(manager.hydrate(entity, version));
        }
        if last_key.is_some() {
            self.last_key = last_key;
            self.skip = 0;
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= fetched;
        }
        if fetched < limit {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl<E: SqliteMapped> Iterator for SqliteCursor<'_, '_, E> {
    type Item = StoreResult<(usize, E)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.buffer.clear();
                self.exhausted = true;
                return Some(Err(err));
            }
        }

        let entity = self.buffer.pop_front()?;
        let index = self.position;
        self.position += 1;
        Some(Ok((index, entity)))
    }
}

#[derive(Debug)]
struct CompiledQuery {
    select: String,
    filter: Option<String>,
    binds: Vec<Value>,
    /// Always ends in a unique column, so it totally orders the rows.
    order: Vec<(&'static str, Direction)>,
}

impl CompiledQuery {
    /// SQL and binds for one page, restricted to rows after `after` in query
    /// order when given.
    fn page_sql(&self, after: Option<&[Value]>) -> (String, Vec<Value>) {
        let mut sql = self.select.clone();
        let mut binds = self.binds.clone();

        match (&self.filter, after) {
            (Some(filter), Some(key)) => {
                let keyset = self.keyset_clause(key, &mut binds);
                sql.push_str(&format!(" WHERE ({filter}) AND {keyset}"));
            }
            (Some(filter), None) => {
                sql.push_str(" WHERE ");
                sql.push_str(filter);
            }
            (None, Some(key)) => {
                let keyset = self.keyset_clause(key, &mut binds);
                sql.push_str(&format!(" WHERE {keyset}"));
            }
            (None, None) => {}
        }

        let terms = self
            .order
            .iter()
            .map(|(column, direction)| match direction {
                Direction::Asc => format!("{column} ASC"),
                Direction::Desc => format!("{column} DESC"),
            })
            .collect::<Vec<_>>();
        sql.push_str(" ORDER BY ");
        sql.push_str(&terms.join(", "));

        (sql, binds)
    }

    /// Lexicographic "comes after `key`" over the ordering columns. SQLite
    /// sorts NULL first ascending and last descending.
    fn keyset_clause(&self, key: &[Value], binds: &mut Vec<Value>) -> String {
        let mut branches = Vec::with_capacity(self.order.len());
        for (depth, ((column, direction), value)) in self.order.iter().zip(key).enumerate() {
            let after = match (direction, value) {
                (Direction::Asc, Value::Null) => format!("{column} IS NOT NULL"),
                (Direction::Asc, _) => format!("{column} > ?"),
                (Direction::Desc, Value::Null) => continue,
                (Direction::Desc, _) => format!("({column} < ? OR {column} IS NULL)"),
            };

            let mut parts = Vec::with_capacity(depth + 1);
            for ((prefix, _), prefix_value) in self.order.iter().zip(key).take(depth) {
                if *prefix_value == Value::Null {
                    parts.push(format!("{prefix} IS NULL"));
                } else {
                    parts.push(format!("{prefix} = ?"));
                    binds.push(prefix_value.clone());
                }
            }
            if *value != Value::Null {
                binds.push(value.clone());
            }
            parts.push(after);
            branches.push(format!("({})", parts.join(" AND ")));
        }

        if branches.is_empty() {
            return "0 = 1".to_string();
        }
        format!("({})", branches.join(" OR "))
    }

    fn key_of(&self, row: &Row<'_>) -> StoreResult<Vec<Value>> {
        self.order
            .iter()
            .map(|(column, _)| row.get::<_, Value>(*column).map_err(StoreError::from))
            .collect()
    }
}

fn read_row<E: SqliteMapped>(row: &Row<'_>) -> StoreResult<(E, i64)> {
    let entity = E::from_row(row)?;
    let version = row.get::<_, i64>(VERSION_COLUMN)?;
    Ok((entity, version))
}

fn to_sql_integer(value: u64) -> Value {
    Value::Integer(i64::try_from(value).unwrap_or(i64::MAX))
}

fn compile_query<E: SqliteMapped>(select: &str, criteria: &Criteria) -> StoreResult<CompiledQuery> {
    let mut binds = Vec::new();
    let filter = match criteria.filter() {
        Some(expr) => {
            let mut sql = String::new();
            write_expr::<E>(expr, &mut sql, &mut binds)?;
            Some(sql)
        }
        None => None,
    };

    let mut order = Vec::with_capacity(criteria.orderings().len() + 1);
    for (field, direction) in criteria.orderings() {
        order.push((resolve_column::<E>(field)?, *direction));
    }
    if !order.iter().any(|(column, _)| *column == E::ID_COLUMN) {
        order.push((E::ID_COLUMN, Direction::Asc));
    }

    Ok(CompiledQuery {
        select: select.to_string(),
        filter,
        binds,
        order,
    })
}

fn resolve_column<E: SqliteMapped>(field: &str) -> StoreResult<&'static str> {
    iter::once(E::ID_COLUMN)
        .chain(E::COLUMNS.iter().copied())
        .chain(iter::once(VERSION_COLUMN))
        .find(|column| *column == field)
        .ok_or_else(|| StoreError::Query(format!("unknown field `{field}` for {}", E::NAME)))
}

fn write_expr<E: SqliteMapped>(
    expr: &Expr,
    sql: &mut String,
    binds: &mut Vec<Value>,
) -> StoreResult<()> {
    match expr {
        Expr::Compare { field, op, value } => {
            let column = resolve_column::<E>(field)?;
            write_comparison(column, *op, value, sql, binds)
        }
        Expr::In { field, values } => {
            let column = resolve_column::<E>(field)?;
            if values.is_empty() {
                sql.push_str("0 = 1");
                return Ok(());
            }
            if values.iter().any(|value| *value == CriteriaValue::Null) {
                return Err(StoreError::Query(format!(
                    "`{field}` IN list cannot contain null"
                )));
            }
            sql.push_str(&format!(
                "{column} IN ({})",
                vec!["?"; values.len()].join(", ")
            ));
            binds.extend(values.iter().map(to_sql_value));
            Ok(())
        }
        Expr::IsNull(field) => {
            let column = resolve_column::<E>(field)?;
            sql.push_str(&format!("{column} IS NULL"));
            Ok(())
        }
        Expr::And(terms) => write_junction::<E>(terms, " AND ", "1 = 1", sql, binds),
        Expr::Or(terms) => write_junction::<E>(terms, " OR ", "0 = 1", sql, binds),
        Expr::Not(inner) => {
            sql.push_str("NOT (");
            write_expr::<E>(inner, sql, binds)?;
            sql.push(')');
            Ok(())
        }
    }
}

fn write_junction<E: SqliteMapped>(
    terms: &[Expr],
    separator: &str,
    empty: &str,
    sql: &mut String,
    binds: &mut Vec<Value>,
) -> StoreResult<()> {
    if terms.is_empty() {
        sql.push_str(empty);
        return Ok(());
    }
    sql.push('(');
    for (index, term) in terms.iter().enumerate() {
        if index > 0 {
            sql.push_str(separator);
        }
        write_expr::<E>(term, sql, binds)?;
    }
    sql.push(')');
    Ok(())
}

fn write_comparison(
    column: &str,
    op: Comparison,
    value: &CriteriaValue,
    sql: &mut String,
    binds: &mut Vec<Value>,
) -> StoreResult<()> {
    let operator = match (op, value) {
        (Comparison::Eq, CriteriaValue::Null) => {
            sql.push_str(&format!("{column} IS NULL"));
            return Ok(());
        }
        (Comparison::Neq, CriteriaValue::Null) => {
            sql.push_str(&format!("{column} IS NOT NULL"));
            return Ok(());
        }
        (_, CriteriaValue::Null) => {
            return Err(StoreError::Query(format!(
                "`{column}` cannot be compared with null using {op:?}"
            )));
        }
        (Comparison::Contains | Comparison::StartsWith | Comparison::EndsWith, value) => {
            let CriteriaValue::Text(text) = value else {
                return Err(StoreError::Query(format!(
                    "`{column}` {op:?} requires a text operand"
                )));
            };
            let escaped = escape_like(text);
            let pattern = match op {
                Comparison::Contains => format!("%{escaped}%"),
                Comparison::StartsWith => format!("{escaped}%"),
                _ => format!("%{escaped}"),
            };
            sql.push_str(&format!("{column} LIKE ? ESCAPE '{LIKE_ESCAPE}'"));
            binds.push(Value::Text(pattern));
            return Ok(());
        }
        (Comparison::Eq, _) => "=",
        (Comparison::Neq, _) => "<>",
        (Comparison::Lt, _) => "<",
        (Comparison::Lte, _) => "<=",
        (Comparison::Gt, _) => ">",
        (Comparison::Gte, _) => ">=",
    };

    sql.push_str(&format!("{column} {operator} ?"));
    binds.push(to_sql_value(value));
    Ok(())
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch == '%' || ch == '_' || ch == LIKE_ESCAPE {
            escaped.push(LIKE_ESCAPE);
        }
        escaped.push(ch);
    }
    escaped
}

fn to_sql_value(value: &CriteriaValue) -> Value {
    match value {
        CriteriaValue::Null => Value::Null,
        CriteriaValue::Bool(flag) => Value::Integer(i64::from(*flag)),
        CriteriaValue::Integer(number) => Value::Integer(*number),
        CriteriaValue::Real(number) => Value::Real(*number),
        CriteriaValue::Text(text) => Value::Text(text.clone()),
    }
}
