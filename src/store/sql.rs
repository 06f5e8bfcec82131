//! Relational data sources.
//!
//! The persistence core only needs a narrow slice of SQL: parameterized
//! queries and statements plus column type introspection. [`DataSource`]
//! hands out one [`SqlConnection`] per transaction.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use tracing::debug;

use crate::error::{Result, StoreError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A value bound to or read from a SQL statement.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Integer.
    Int(i64),
    /// Floating point number.
    Real(f64),
    /// Text.
    Text(String),
    /// Binary data.
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Whether this is SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Textual form, `None` for NULL and blobs.
    pub fn to_text(&self) -> Option<String> {
        match self {
            SqlValue::Null | SqlValue::Blob(_) => None,
            SqlValue::Int(i) => Some(i.to_string()),
            SqlValue::Real(f) => Some(f.to_string()),
            SqlValue::Text(s) => Some(s.clone()),
        }
    }

    fn to_sqlite(&self) -> SqliteValue {
        match self {
            SqlValue::Null => SqliteValue::Null,
            SqlValue::Int(i) => SqliteValue::Integer(*i),
            SqlValue::Real(f) => SqliteValue::Real(*f),
            SqlValue::Text(s) => SqliteValue::Text(s.clone()),
            SqlValue::Blob(b) => SqliteValue::Blob(b.clone()),
        }
    }

    fn from_sqlite(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Int(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }
}

/// One result row.
#[derive(Clone, Debug)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Row over `values` labelled by `columns`.
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// Column labels.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Value at position `index`.
    pub fn value(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// Value of `column`, matched case-insensitively.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|i| self.values.get(i))
    }

    /// Labels paired with values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

/// Storage class of a column, derived from its declared type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    /// Integer numbers.
    Integer,
    /// Floating point numbers.
    Real,
    /// Booleans stored as 0/1.
    Boolean,
    /// Points in time stored as milliseconds since the epoch.
    Timestamp,
    /// Text.
    Text,
    /// Binary data.
    Blob,
}

impl ColumnType {
    /// Classifies a declared SQL type name by its first recognized word, so
    /// `VARCHAR(64)` is text and `DOUBLE PRECISION` is real.
    pub fn from_declared(decl: &str) -> Self {
        decl.split(|c: char| !c.is_ascii_alphanumeric())
            .find_map(|word| Self::from_word(&word.to_ascii_uppercase()))
            .unwrap_or(ColumnType::Text)
    }

    fn from_word(word: &str) -> Option<Self> {
        Some(match word {
            "BOOL" | "BOOLEAN" => ColumnType::Boolean,
            "DATE" | "DATETIME" | "TIME" | "TIMESTAMP" | "TIMESTAMPTZ" => ColumnType::Timestamp,
            "INT" | "INTEGER" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "BIGINT" | "INT2" | "INT4"
            | "INT8" => ColumnType::Integer,
            "REAL" | "FLOAT" | "FLOAT4" | "FLOAT8" | "DOUBLE" | "NUMERIC" | "DECIMAL" => ColumnType::Real,
            "BLOB" | "BINARY" | "VARBINARY" | "BYTEA" => ColumnType::Blob,
            "TEXT" | "CHAR" | "VARCHAR" | "CLOB" => ColumnType::Text,
            _ => return None,
        })
    }
}

/// Name and type of a table column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name as declared.
    pub name: String,
    /// Storage class.
    pub column_type: ColumnType,
}

/// An open connection to a data source.
pub trait SqlConnection: Send {
    /// Runs a query and collects its rows.
    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Runs a statement, returning the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize>;

    /// Column layout of `table`.
    fn columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>>;
}

/// A named relational backend.
pub trait DataSource: Send + Sync {
    /// Name types refer to in their `datasource` field.
    fn name(&self) -> &str;

    /// Opens a connection.
    fn connect(&self) -> Result<Box<dyn SqlConnection>>;
}

/// SQLite database file used as a data source.
#[derive(Clone, Debug)]
pub struct SqliteDataSource {
    name: String,
    path: PathBuf,
}

impl SqliteDataSource {
    /// Data source `name` backed by the file at `url` (an optional
    /// `sqlite:` prefix is accepted).
    pub fn new(name: impl Into<String>, url: &str) -> Self {
        let path = url.strip_prefix("sqlite:").unwrap_or(url);
        Self {
            name: name.into(),
            path: PathBuf::from(path),
        }
    }

    /// Database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DataSource for SqliteDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> Result<Box<dyn SqlConnection>> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        debug!(source = %self.name, path = %self.path.display(), "sqlite connection opened");
        Ok(Box::new(SqliteConnection { conn }))
    }
}

/// Connection handed out by [`SqliteDataSource`].
pub struct SqliteConnection {
    conn: Connection,
}

impl SqlConnection for SqliteConnection {
    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        debug!(sql, params = params.len(), "query");
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(str::to_owned)
            .collect();
        let width = columns.len();
        let mut rows = stmt.query(params_from_iter(params.iter().map(SqlValue::to_sqlite)))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(SqlValue::from_sqlite(row.get_ref(i)?));
            }
            out.push(Row::new(Arc::clone(&columns), values));
        }
        Ok(out)
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        debug!(sql, params = params.len(), "execute");
        let changed = self
            .conn
            .execute(sql, params_from_iter(params.iter().map(SqlValue::to_sqlite)))?;
        Ok(changed)
    }

    fn columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows = self.query(
            "SELECT name, type FROM pragma_table_info(?1)",
            &[SqlValue::Text(table.to_owned())],
        )?;
        if rows.is_empty() {
            return Err(StoreError::Sql(format!("table {table} does not exist")));
        }
        Ok(rows
            .iter()
            .filter_map(|row| {
                let name = row.value(0)?.to_text()?;
                let decl = row.value(1).and_then(SqlValue::to_text).unwrap_or_default();
                Some(ColumnInfo {
                    name,
                    column_type: ColumnType::from_declared(&decl),
                })
            })
            .collect())
    }
}
