//! Embedded database engine, owned by the worker thread.
//!
//! The engine holds at most one open SQLite database for the lifetime of the
//! worker. Opening a second, different file while one is open is refused with
//! [`EngineError::FileMismatch`]; close the current one first.

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Batch, Connection, Row, ToSql};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use super::protocol::{codes, ErrorInfo, RowBatch, RowSet, SqlValue};
use crate::loader::ProgressThrottle;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Callback run on a freshly opened connection (pragmas, custom functions).
pub type InitHook = Box<dyn Fn(&Connection) -> rusqlite::Result<()> + Send>;

/// Errors raised inside the worker. They never cross the thread boundary as
/// values; [`EngineError::to_info`] turns them into the error slot of the
/// terminal event.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("no database is open")]
    NotOpen,

    #[error("database '{open}' is already open; close it before opening '{requested}'")]
    FileMismatch { open: String, requested: String },

    #[error("statement {index} failed: {source}")]
    Statement {
        index: usize,
        #[source]
        source: rusqlite::Error,
    },
}

impl EngineError {
    /// Wire form of this error.
    pub fn to_info(&self) -> ErrorInfo {
        match self {
            Self::Sqlite(err) => ErrorInfo::new(codes::SQLITE, err.to_string()),
            Self::NotOpen => ErrorInfo::new(codes::NOT_OPEN, self.to_string()),
            Self::FileMismatch { .. } => ErrorInfo::new(codes::FILE_MISMATCH, self.to_string()),
            Self::Statement { index, source } => ErrorInfo {
                code: codes::STATEMENT_FAILED.to_string(),
                message: source.to_string(),
                statement_index: Some(*index),
            },
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            SqlValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            SqlValue::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(v) => Self::Integer(v),
            ValueRef::Real(v) => Self::Real(v),
            ValueRef::Text(v) => Self::Text(String::from_utf8_lossy(v).into_owned()),
            ValueRef::Blob(v) => Self::Blob(v.to_vec()),
        }
    }
}

/// Statements of one backup import and how many have been applied.
#[derive(Debug)]
pub struct BulkLoadJob {
    statements: Vec<String>,
    applied: usize,
}

impl BulkLoadJob {
    pub fn new(statements: Vec<String>) -> Self {
        Self {
            statements,
            applied: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.statements.len()
    }

    pub fn applied(&self) -> usize {
        self.applied
    }

    /// Apply statements in order, stopping at the first failure. Statements
    /// already applied stay applied.
    fn run(&mut self, conn: &Connection, mut on_progress: impl FnMut(u8)) -> EngineResult<usize> {
        let mut throttle = ProgressThrottle::new(self.total());
        for (index, statement) in self.statements.iter().enumerate() {
            if let Some(percent) = throttle.observe(index) {
                on_progress(percent);
            }
            conn.execute_batch(statement)
                .map_err(|source| EngineError::Statement { index, source })?;
            self.applied += 1;
        }
        Ok(self.applied)
    }
}

struct OpenDatabase {
    file_name: String,
    conn: Connection,
}

/// The single embedded database instance of a worker.
#[derive(Default)]
pub struct Engine {
    db: Option<OpenDatabase>,
    init_hook: Option<InitHook>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine that runs `hook` on every connection it opens.
    pub fn with_init_hook(hook: InitHook) -> Self {
        Self {
            db: None,
            init_hook: Some(hook),
        }
    }

    pub fn is_open(&self) -> bool {
        self.db.is_some()
    }

    /// Name of the open database file, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.db.as_ref().map(|db| db.file_name.as_str())
    }

    /// Open the database, or do nothing if `file_name` is already open.
    ///
    /// With `durable = false` the database lives in memory only.
    pub fn init(&mut self, file_name: &str, durable: bool) -> EngineResult<()> {
        if let Some(open) = &self.db {
            if open.file_name == file_name {
                return Ok(());
            }
            return Err(EngineError::FileMismatch {
                open: open.file_name.clone(),
                requested: file_name.to_string(),
            });
        }

        let conn = if durable {
            Connection::open(file_name)?
        } else {
            Connection::open_in_memory()?
        };
        if let Some(hook) = &self.init_hook {
            hook(&conn)?;
        }

        info!(file_name, durable, "engine: database opened");
        self.db = Some(OpenDatabase {
            file_name: file_name.to_string(),
            conn,
        });
        Ok(())
    }

    fn connection(&self) -> EngineResult<&Connection> {
        self.db
            .as_ref()
            .map(|db| &db.conn)
            .ok_or(EngineError::NotOpen)
    }

    /// Run SQL. Row-returning statements are fully materialized; mutating
    /// SQL reports last insert id and affected row count.
    pub fn exec(&self, is_select: bool, sql: &str, params: &[SqlValue]) -> EngineResult<RowSet> {
        let conn = self.connection()?;
        if !is_select {
            return exec_mutation(conn, sql, params);
        }

        let mut stmt = conn.prepare(sql)?;
        let columns = column_names(&stmt);
        let width = columns.len();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_row(row, width)?);
        }

        Ok(RowSet {
            columns,
            rows: out,
            ..Default::default()
        })
    }

    /// Step through a query one row at a time. `on_row` returns `false` to
    /// stop early. Returns the number of rows delivered.
    pub fn stream(
        &self,
        sql: &str,
        params: &[SqlValue],
        mut on_row: impl FnMut(RowBatch) -> bool,
    ) -> EngineResult<usize> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(sql)?;
        let columns = column_names(&stmt);
        let width = columns.len();

        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut delivered = 0;
        while let Some(row) = rows.next()? {
            let batch = RowBatch {
                columns: columns.clone(),
                rows: vec![read_row(row, width)?],
            };
            delivered += 1;
            if !on_row(batch) {
                debug!(delivered, "engine: stream stopped early");
                break;
            }
        }
        Ok(delivered)
    }

    /// Apply a bulk load, opening `file_name` first if nothing is open.
    pub fn load_bulk(
        &mut self,
        file_name: &str,
        durable: bool,
        statements: Vec<String>,
        on_progress: impl FnMut(u8),
    ) -> EngineResult<usize> {
        if self.db.is_none() {
            self.init(file_name, durable)?;
        }
        let conn = self.connection()?;
        let mut job = BulkLoadJob::new(statements);
        let result = job.run(conn, on_progress);
        info!(
            applied = job.applied(),
            total = job.total(),
            ok = result.is_ok(),
            "engine: bulk load finished"
        );
        result
    }

    /// SHA-256 over the schema and every table's rows, hex encoded.
    pub fn fingerprint(&self) -> EngineResult<String> {
        let conn = self.connection()?;
        let mut hasher = Sha256::new();

        let mut tables = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT type, name, sql FROM sqlite_master ORDER BY type, name",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let kind: String = row.get(0)?;
                let name: String = row.get(1)?;
                let sql: Option<String> = row.get(2)?;
                hasher.update(kind.as_bytes());
                hasher.update([0]);
                hasher.update(name.as_bytes());
                hasher.update([0]);
                hasher.update(sql.unwrap_or_default().as_bytes());
                hasher.update([0]);
                if kind == "table" && !name.starts_with("sqlite_") {
                    tables.push(name);
                }
            }
        }

        for table in tables {
            let mut stmt = conn.prepare(&format!(
                "SELECT * FROM \"{}\"",
                table.replace('"', "\"\"")
            ))?;
            let width = stmt.column_count();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                for idx in 0..width {
                    hash_value(&mut hasher, row.get_ref(idx)?);
                }
            }
        }

        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Close the database. Closing when nothing is open is a no-op.
    pub fn close(&mut self) -> EngineResult<()> {
        let Some(db) = self.db.take() else {
            return Ok(());
        };
        db.conn.close().map_err(|(_, err)| EngineError::Sqlite(err))?;
        info!(file_name = %db.file_name, "engine: database closed");
        Ok(())
    }
}

/// Mutating SQL may hold several statements. Rows produced by `RETURNING`
/// clauses are discarded, and parameters bind to every statement that
/// declares placeholders.
fn exec_mutation(conn: &Connection, sql: &str, params: &[SqlValue]) -> EngineResult<RowSet> {
    let mut batch = Batch::new(conn, sql);
    let mut changed = 0u64;
    while let Some(mut stmt) = batch.next()? {
        let readonly = stmt.readonly();
        let mut rows = if stmt.parameter_count() > 0 {
            stmt.query(params_from_iter(params.iter()))?
        } else {
            stmt.query([])?
        };
        while rows.next()?.is_some() {}
        drop(rows);
        if !readonly {
            changed += conn.changes();
        }
    }
    Ok(RowSet {
        insert_id: Some(conn.last_insert_rowid()),
        rows_affected: Some(changed),
        ..Default::default()
    })
}

fn column_names(stmt: &rusqlite::Statement<'_>) -> Vec<String> {
    stmt.column_names().into_iter().map(String::from).collect()
}

fn read_row(row: &Row<'_>, width: usize) -> rusqlite::Result<Vec<SqlValue>> {
    (0..width)
        .map(|idx| row.get_ref(idx).map(SqlValue::from))
        .collect()
}

fn hash_value(hasher: &mut Sha256, value: ValueRef<'_>) {
    match value {
        ValueRef::Null => hasher.update([0u8]),
        ValueRef::Integer(v) => {
            hasher.update([1u8]);
            hasher.update(v.to_le_bytes());
        }
        ValueRef::Real(v) => {
            hasher.update([2u8]);
            hasher.update(v.to_le_bytes());
        }
        ValueRef::Text(v) => {
            hasher.update([3u8]);
            hasher.update((v.len() as u64).to_le_bytes());
            hasher.update(v);
        }
        ValueRef::Blob(v) => {
            hasher.update([4u8]);
            hasher.update((v.len() as u64).to_le_bytes());
            hasher.update(v);
        }
    }
}
