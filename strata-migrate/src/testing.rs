//! An in-process database for tests.
//!
//! [`MemoryDatabase`] implements [`Database`] well enough to drive the
//! migrator without a server:
//!
//! - It models schemas and history tables, and understands the catalog
//!   queries, DDL, ledger reads and writes, and lock statements the
//!   [`HistoryStore`](crate::HistoryStore) issues. Tables must be referenced
//!   by quoted identifiers.
//! - Any other statement is treated as a migration statement: it is recorded
//!   when it commits and has no other effect.
//! - Writes inside a transaction are buffered per connection and applied
//!   atomically on commit. Reads see committed state plus the connection's
//!   own pending writes.
//! - Table locks are real async mutexes held until the transaction ends, so
//!   concurrent migrators serialize exactly as they would on a server. Every
//!   statement yields to the scheduler first, so runners joined on one task
//!   interleave and contend for those locks.
//! - `SET LOCAL search_path` is honoured for the rest of the transaction and
//!   recorded next to each migration statement.
//! - Failures can be injected for statements containing a pattern.
//!
//! Clones share the same state, which is how several migrators can be
//! pointed at "the same" database.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::database::{Connection, Database, Executor};
use crate::error::{MigrateResult, MigrationError};
use crate::history::AppliedMigration;
use crate::value::{Row, SqlValue};

type TableKey = (String, String);

#[derive(Debug, Clone, Default)]
struct Table {
    rows: Vec<AppliedMigration>,
    indexes: Vec<String>,
}

#[derive(Debug, Clone)]
struct State {
    schemas: BTreeSet<String>,
    tables: BTreeMap<TableKey, Table>,
    executed: Vec<Executed>,
}

#[derive(Debug, Clone)]
struct Executed {
    search_path: Option<String>,
    sql: String,
}

impl Default for State {
    fn default() -> Self {
        Self {
            schemas: BTreeSet::from(["public".to_string()]),
            tables: BTreeMap::new(),
            executed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    CreateSchema(String),
    CreateTable(TableKey),
    CreateIndex(TableKey, String),
    Insert(TableKey, AppliedMigration),
    Delete {
        table: TableKey,
        version: String,
        failed_with_description: Option<String>,
    },
    Other(Executed),
}

impl State {
    fn table(&self, key: &TableKey) -> MigrateResult<&Table> {
        self.tables.get(key).ok_or_else(|| missing_relation(key))
    }

    fn table_mut(&mut self, key: &TableKey) -> MigrateResult<&mut Table> {
        self.tables.get_mut(key).ok_or_else(|| missing_relation(key))
    }

    fn apply(&mut self, op: &Op) -> MigrateResult<u64> {
        match op {
            Op::CreateSchema(name) => {
                if !self.schemas.insert(name.clone()) {
                    return Err(MigrationError::database(format!(
                        "schema \"{}\" already exists",
                        name
                    )));
                }
                Ok(0)
            }
            Op::CreateTable(key) => {
                if !self.schemas.contains(&key.0) {
                    return Err(MigrationError::database(format!(
                        "schema \"{}\" does not exist",
                        key.0
                    )));
                }
                if self.tables.contains_key(key) {
                    return Err(MigrationError::database(format!(
                        "relation \"{}\" already exists",
                        key.1
                    )));
                }
                self.tables.insert(key.clone(), Table::default());
                Ok(0)
            }
            Op::CreateIndex(key, name) => {
                self.table_mut(key)?.indexes.push(name.clone());
                Ok(0)
            }
            Op::Insert(key, row) => {
                let table = self.table_mut(key)?;
                if table
                    .rows
                    .iter()
                    .any(|r| r.installed_rank == row.installed_rank)
                {
                    return Err(MigrationError::database(format!(
                        "duplicate key value violates unique constraint \"{}_pkey\" (installed_rank)=({})",
                        key.1, row.installed_rank
                    )));
                }
                table.rows.push(row.clone());
                table.rows.sort_by_key(|r| r.installed_rank);
                Ok(1)
            }
            Op::Delete {
                table,
                version,
                failed_with_description,
            } => {
                let table = self.table_mut(table)?;
                let before = table.rows.len();
                table.rows.retain(|r| {
                    let matches = r.version == *version
                        && match failed_with_description {
                            Some(description) => r.description == *description && !r.success,
                            None => true,
                        };
                    !matches
                });
                Ok((before - table.rows.len()) as u64)
            }
            Op::Other(statement) => {
                self.executed.push(statement.clone());
                Ok(0)
            }
        }
    }
}

fn missing_relation(key: &TableKey) -> MigrationError {
    MigrationError::database(format!("relation \"{}.{}\" does not exist", key.0, key.1))
}

/// A statement after recognition, with its parameters bound.
enum Statement {
    SchemaExists(String),
    TableExists(TableKey),
    SelectLedger(TableKey, i64),
    Lock { table: TableKey, only_rows: bool },
    SetSearchPath(String),
    Write(Op),
}

/// The shape of a recognized statement, before parameters are bound.
enum Shape {
    SchemaExists,
    TableExists,
    CreateSchema(String),
    CreateTable(TableKey),
    CreateIndex(TableKey, String),
    Insert(TableKey),
    Delete(TableKey, bool),
    LockTable(TableKey),
    LockRows(TableKey),
    SelectLedger(TableKey),
    SetSearchPath(String),
}

fn normalize(sql: &str) -> String {
    let mut s = sql.trim();
    if s.starts_with("/*") {
        if let Some(end) = s.find("*/") {
            s = s[end + 2..].trim_start();
        }
    }
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_quoted(input: &str) -> Option<(String, &str)> {
    let body = input.strip_prefix('"')?;
    let mut name = String::new();
    let mut chars = body.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        if c == '"' {
            if matches!(chars.peek(), Some((_, '"'))) {
                chars.next();
                name.push('"');
            } else {
                return Some((name, &body[idx + 1..]));
            }
        } else {
            name.push(c);
        }
    }
    None
}

fn parse_table(input: &str) -> Option<(TableKey, &str)> {
    let (first, rest) = parse_quoted(input)?;
    match rest.strip_prefix('.') {
        Some(rest) => {
            let (second, rest) = parse_quoted(rest)?;
            Some(((first, second), rest))
        }
        None => Some((("public".to_string(), first), rest)),
    }
}

fn recognize(sql: &str) -> Option<Shape> {
    if sql.starts_with("SELECT EXISTS") {
        if sql.contains("pg_catalog.pg_class") {
            return Some(Shape::TableExists);
        }
        if sql.contains("pg_catalog.pg_namespace") {
            return Some(Shape::SchemaExists);
        }
        return None;
    }
    if let Some(rest) = sql.strip_prefix("CREATE SCHEMA ") {
        return parse_quoted(rest).map(|(name, _)| Shape::CreateSchema(name));
    }
    if let Some(rest) = sql.strip_prefix("CREATE TABLE ") {
        return parse_table(rest).map(|(key, _)| Shape::CreateTable(key));
    }
    if let Some(rest) = sql.strip_prefix("CREATE INDEX ") {
        let (name, rest) = parse_quoted(rest)?;
        let rest = rest.trim_start().strip_prefix("ON ")?;
        return parse_table(rest).map(|(key, _)| Shape::CreateIndex(key, name));
    }
    if let Some(rest) = sql.strip_prefix("INSERT INTO ") {
        return parse_table(rest).map(|(key, _)| Shape::Insert(key));
    }
    if let Some(rest) = sql.strip_prefix("DELETE FROM ") {
        let (key, rest) = parse_table(rest)?;
        return Some(Shape::Delete(key, rest.contains("description = $2")));
    }
    if let Some(rest) = sql.strip_prefix("LOCK TABLE ") {
        return parse_table(rest).map(|(key, _)| Shape::LockTable(key));
    }
    if let Some(rest) = sql.strip_prefix("SELECT * FROM ") {
        let (key, rest) = parse_table(rest)?;
        return rest
            .trim_end()
            .ends_with("FOR UPDATE")
            .then_some(Shape::LockRows(key));
    }
    if let Some(rest) = sql.strip_prefix("SET LOCAL search_path TO ") {
        return parse_quoted(rest).map(|(name, _)| Shape::SetSearchPath(name));
    }
    if sql.starts_with("SELECT installed_rank") {
        let from = sql.find(" FROM ")?;
        return parse_table(&sql[from + 6..]).map(|(key, _)| Shape::SelectLedger(key));
    }
    None
}

fn text_param(params: &[SqlValue], idx: usize) -> MigrateResult<String> {
    match params.get(idx) {
        Some(SqlValue::Text(s)) => Ok(s.clone()),
        other => Err(MigrationError::database(format!(
            "parameter ${} must be text, got {:?}",
            idx + 1,
            other
        ))),
    }
}

fn classify(
    sql: &str,
    params: &[SqlValue],
    search_path: Option<String>,
) -> MigrateResult<Statement> {
    let Some(shape) = recognize(&normalize(sql)) else {
        return Ok(Statement::Write(Op::Other(Executed {
            search_path,
            sql: sql.trim().to_string(),
        })));
    };

    Ok(match shape {
        Shape::SchemaExists => Statement::SchemaExists(text_param(params, 0)?),
        Shape::TableExists => {
            Statement::TableExists((text_param(params, 0)?, text_param(params, 1)?))
        }
        Shape::CreateSchema(name) => Statement::Write(Op::CreateSchema(name)),
        Shape::CreateTable(key) => Statement::Write(Op::CreateTable(key)),
        Shape::CreateIndex(key, name) => Statement::Write(Op::CreateIndex(key, name)),
        Shape::Insert(key) => {
            let row = AppliedMigration::from_row(&Row::new(params.to_vec()))?;
            Statement::Write(Op::Insert(key, row))
        }
        Shape::Delete(table, with_description) => Statement::Write(Op::Delete {
            table,
            version: text_param(params, 0)?,
            failed_with_description: if with_description {
                Some(text_param(params, 1)?)
            } else {
                None
            },
        }),
        Shape::LockTable(table) => Statement::Lock {
            table,
            only_rows: false,
        },
        Shape::LockRows(table) => Statement::Lock {
            table,
            only_rows: true,
        },
        Shape::SelectLedger(key) => {
            let since = match params.first() {
                Some(SqlValue::Int(rank)) => *rank,
                _ => 0,
            };
            Statement::SelectLedger(key, since)
        }
        Shape::SetSearchPath(schema) => Statement::SetSearchPath(schema),
    })
}

fn ledger_row(row: &AppliedMigration) -> Row {
    Row::new(vec![
        SqlValue::Int(row.installed_rank),
        SqlValue::Text(row.version.clone()),
        SqlValue::Text(row.description.clone()),
        SqlValue::Text(row.checksum.clone()),
        SqlValue::Timestamp(row.installed_on),
        SqlValue::Int(row.execution_time_ms),
        SqlValue::Bool(row.success),
    ])
}

#[derive(Debug)]
struct Fault {
    pattern: String,
    remaining: Option<usize>,
    hits: usize,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    table_locks: Mutex<HashMap<TableKey, Arc<AsyncMutex<()>>>>,
    faults: Mutex<Vec<Fault>>,
    statements: AtomicUsize,
    lock_waits: AtomicUsize,
    open: AtomicUsize,
}

#[derive(Default)]
struct Outcome {
    affected: u64,
    rows: Vec<Row>,
}

impl Outcome {
    fn affected(affected: u64) -> Self {
        Self {
            affected,
            rows: Vec::new(),
        }
    }

    fn flag(value: bool) -> Self {
        Self {
            affected: 1,
            rows: vec![Row::new(vec![SqlValue::Bool(value)])],
        }
    }
}

impl Inner {
    fn inject(&self, sql: &str) -> MigrateResult<()> {
        let mut faults = self.faults.lock();
        for fault in faults.iter_mut() {
            if fault.remaining == Some(0) || !sql.contains(&fault.pattern) {
                continue;
            }
            if let Some(remaining) = fault.remaining.as_mut() {
                *remaining -= 1;
            }
            fault.hits += 1;
            return Err(MigrationError::database(format!(
                "injected failure for statement: {}",
                sql.trim()
            )));
        }
        Ok(())
    }

    /// Committed state with `pending` replayed on top.
    fn view(&self, pending: Option<&[Op]>) -> State {
        let mut view = self.state.lock().clone();
        for op in pending.unwrap_or_default() {
            let _ = view.apply(op);
        }
        view
    }

    fn commit(&self, ops: &[Op]) -> MigrateResult<()> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        for op in ops {
            next.apply(op)?;
        }
        *state = next;
        Ok(())
    }

    fn table_lock(&self, key: &TableKey) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.table_locks.lock().entry(key.clone()).or_default())
    }

    async fn run(
        &self,
        conn: Option<&MemoryConnection>,
        sql: &str,
        params: &[SqlValue],
    ) -> MigrateResult<Outcome> {
        tokio::task::yield_now().await;
        self.statements.fetch_add(1, Ordering::SeqCst);
        self.inject(sql)?;

        let pending = conn.and_then(MemoryConnection::pending);
        let search_path = conn.and_then(|c| c.search_path.lock().clone());
        let statement = classify(sql, params, search_path)?;

        match statement {
            Statement::SchemaExists(name) => {
                Ok(Outcome::flag(self.view(pending.as_deref()).schemas.contains(&name)))
            }
            Statement::TableExists(key) => Ok(Outcome::flag(
                self.view(pending.as_deref()).tables.contains_key(&key),
            )),
            Statement::SelectLedger(key, since) => {
                let view = self.view(pending.as_deref());
                let rows: Vec<Row> = view
                    .table(&key)?
                    .rows
                    .iter()
                    .filter(|r| r.installed_rank > since)
                    .map(ledger_row)
                    .collect();
                Ok(Outcome {
                    affected: rows.len() as u64,
                    rows,
                })
            }
            Statement::Lock { table, only_rows } => {
                let conn = conn.filter(|c| pending.is_some() && c.in_transaction()).ok_or_else(
                    || MigrationError::database("lock statements can only be used in transaction blocks"),
                )?;
                let count = self.view(pending.as_deref()).table(&table)?.rows.len();
                if only_rows && count == 0 {
                    return Ok(Outcome::affected(0));
                }
                conn.lock_table(table).await;
                Ok(Outcome::affected(count as u64))
            }
            Statement::SetSearchPath(schema) => {
                // Outside a transaction SET LOCAL has no effect.
                if let Some(conn) = conn.filter(|c| c.in_transaction()) {
                    *conn.search_path.lock() = Some(schema);
                }
                Ok(Outcome::affected(0))
            }
            Statement::Write(op) => match (conn, pending) {
                (Some(conn), Some(pending)) => {
                    let affected = self.view(Some(&pending)).apply(&op)?;
                    conn.push(op);
                    Ok(Outcome::affected(affected))
                }
                _ => self.state.lock().apply(&op).map(Outcome::affected),
            },
        }
    }
}

/// An in-process database. See the [module documentation](self).
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("open_connections", &self.open_connections())
            .finish_non_exhaustive()
    }
}

impl MemoryDatabase {
    /// Create an empty database holding only the `public` schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every statement containing `pattern`.
    pub fn fail_on(&self, pattern: &str) {
        self.add_fault(pattern, None);
    }

    /// Fail the next `times` statements containing `pattern`.
    pub fn fail_times(&self, pattern: &str, times: usize) {
        self.add_fault(pattern, Some(times));
    }

    fn add_fault(&self, pattern: &str, remaining: Option<usize>) {
        self.inner.faults.lock().push(Fault {
            pattern: pattern.to_string(),
            remaining,
            hits: 0,
        });
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.inner.faults.lock().clear();
    }

    /// How many statements failed because of `pattern`.
    pub fn failures(&self, pattern: &str) -> usize {
        self.inner
            .faults
            .lock()
            .iter()
            .filter(|f| f.pattern == pattern)
            .map(|f| f.hits)
            .sum()
    }

    /// Committed migration statements, in commit order.
    pub fn executed(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .executed
            .iter()
            .map(|e| e.sql.clone())
            .collect()
    }

    /// Committed migration statements with the `search_path` they ran under.
    pub fn executed_with_search_path(&self) -> Vec<(Option<String>, String)> {
        self.inner
            .state
            .lock()
            .executed
            .iter()
            .map(|e| (e.search_path.clone(), e.sql.clone()))
            .collect()
    }

    /// How many lock statements had to wait for another connection.
    pub fn lock_waits(&self) -> usize {
        self.inner.lock_waits.load(Ordering::SeqCst)
    }

    /// Committed rows of a history table, in rank order.
    pub fn ledger(&self, schema: &str, table: &str) -> Vec<AppliedMigration> {
        self.inner
            .state
            .lock()
            .tables
            .get(&(schema.to_string(), table.to_string()))
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Names of the indexes on a table.
    pub fn index_names(&self, schema: &str, table: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .tables
            .get(&(schema.to_string(), table.to_string()))
            .map(|t| t.indexes.clone())
            .unwrap_or_default()
    }

    /// Check if a schema exists.
    pub fn has_schema(&self, schema: &str) -> bool {
        self.inner.state.lock().schemas.contains(schema)
    }

    /// Connections handed out and not yet released.
    pub fn open_connections(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Number of statements received, including failed ones.
    pub fn statement_count(&self) -> usize {
        self.inner.statements.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for MemoryDatabase {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> MigrateResult<u64> {
        Ok(self.inner.run(None, sql, params).await?.affected)
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> MigrateResult<Vec<Row>> {
        Ok(self.inner.run(None, sql, params).await?.rows)
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn connect(&self) -> MigrateResult<Box<dyn Connection>> {
        let id = self.inner.open.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(open = id, "Opened memory connection");
        Ok(Box::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
            pending: Mutex::new(None),
            search_path: Mutex::new(None),
            guards: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        }))
    }
}

/// A dedicated connection to a [`MemoryDatabase`].
pub struct MemoryConnection {
    inner: Arc<Inner>,
    pending: Mutex<Option<Vec<Op>>>,
    search_path: Mutex<Option<String>>,
    guards: Mutex<Vec<(TableKey, OwnedMutexGuard<()>)>>,
    released: AtomicBool,
}

impl MemoryConnection {
    fn pending(&self) -> Option<Vec<Op>> {
        self.pending.lock().clone()
    }

    fn in_transaction(&self) -> bool {
        self.pending.lock().is_some()
    }

    fn push(&self, op: Op) {
        if let Some(pending) = self.pending.lock().as_mut() {
            pending.push(op);
        }
    }

    async fn lock_table(&self, table: TableKey) {
        if self.guards.lock().iter().any(|(held, _)| *held == table) {
            return;
        }
        let lock = self.inner.table_lock(&table);
        let guard = match Arc::clone(&lock).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                self.inner.lock_waits.fetch_add(1, Ordering::SeqCst);
                debug!(table = %table.1, "Waiting for table lock");
                lock.lock_owned().await
            }
        };
        self.guards.lock().push((table, guard));
    }

    fn end_transaction(&self) -> Option<Vec<Op>> {
        let ops = self.pending.lock().take();
        *self.search_path.lock() = None;
        self.guards.lock().clear();
        ops
    }
}

#[async_trait]
impl Executor for MemoryConnection {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> MigrateResult<u64> {
        Ok(self.inner.run(Some(self), sql, params).await?.affected)
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> MigrateResult<Vec<Row>> {
        Ok(self.inner.run(Some(self), sql, params).await?.rows)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn begin(&self) -> MigrateResult<()> {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            return Err(MigrationError::database("transaction already in progress"));
        }
        *pending = Some(Vec::new());
        Ok(())
    }

    async fn commit(&self) -> MigrateResult<()> {
        match self.end_transaction() {
            Some(ops) => self.inner.commit(&ops),
            None => Ok(()),
        }
    }

    async fn rollback(&self) -> MigrateResult<()> {
        self.end_transaction();
        Ok(())
    }

    async fn release(&self) -> MigrateResult<()> {
        self.end_transaction();
        if !self.released.swap(true, Ordering::SeqCst) {
            self.inner.open.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.inner.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
