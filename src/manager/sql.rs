//! SQL text builders. Values are always bound as parameters; only names
//! from the schema and its `order`/`filter` fragments are spliced in.

use crate::store::sql::SqlValue;

/// Conjunction of conditions with their bound values.
#[derive(Debug, Default)]
pub(crate) struct Filter {
    clauses: Vec<String>,
    params: Vec<SqlValue>,
}

impl Filter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// `column = value`, or `column IS NULL` for a NULL value.
    pub(crate) fn eq(&mut self, column: &str, value: SqlValue) -> &mut Self {
        if value.is_null() {
            self.clauses.push(format!("{column} IS NULL"));
        } else {
            self.clauses.push(format!("{column} = ?"));
            self.params.push(value);
        }
        self
    }

    /// A literal SQL condition from the schema.
    pub(crate) fn raw(&mut self, fragment: &str) -> &mut Self {
        let fragment = fragment.trim();
        if !fragment.is_empty() {
            self.clauses.push(format!("({fragment})"));
        }
        self
    }

    /// `(a > ? OR a < ? OR b > ? ...)`: rows past either watermark of any
    /// column. Each bound is `(column, lowest, highest)`.
    pub(crate) fn outside(&mut self, bounds: Vec<(String, Option<SqlValue>, Option<SqlValue>)>) -> &mut Self {
        let mut parts = Vec::new();
        for (column, low, high) in bounds {
            if let Some(high) = high {
                parts.push(format!("{column} > ?"));
                self.params.push(high);
            }
            if let Some(low) = low {
                parts.push(format!("{column} < ?"));
                self.params.push(low);
            }
        }
        if !parts.is_empty() {
            self.clauses.push(format!("({})", parts.join(" OR ")));
        }
        self
    }

    fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

/// A rendered statement.
#[derive(Debug)]
pub(crate) struct Statement {
    pub(crate) sql: String,
    pub(crate) params: Vec<SqlValue>,
}

/// `SELECT <what> FROM <table> WHERE ... ORDER BY ... LIMIT ... OFFSET ...`.
pub(crate) fn select(
    what: &str,
    table: &str,
    filter: Filter,
    order: Option<&str>,
    range: Option<(usize, usize)>,
) -> Statement {
    let mut sql = format!("SELECT {what} FROM {table}{}", filter.where_clause());
    if let Some(order) = order.filter(|o| !o.trim().is_empty()) {
        sql.push_str(" ORDER BY ");
        sql.push_str(order.trim());
    }
    if let Some((offset, limit)) = range {
        sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
    }
    Statement {
        sql,
        params: filter.params,
    }
}

/// `INSERT INTO <table> (<cols>) VALUES (?, ...)`.
pub(crate) fn insert(table: &str, columns: &[String], params: Vec<SqlValue>) -> Statement {
    let marks = vec!["?"; columns.len()].join(", ");
    Statement {
        sql: format!("INSERT INTO {table} ({}) VALUES ({marks})", columns.join(", ")),
        params,
    }
}

/// `UPDATE <table> SET a = ?, ... WHERE <id> = ?`; the id value comes last.
pub(crate) fn update(
    table: &str,
    columns: &[String],
    mut params: Vec<SqlValue>,
    id_column: &str,
    id: SqlValue,
) -> Statement {
    let sets: Vec<String> = columns.iter().map(|c| format!("{c} = ?")).collect();
    params.push(id);
    Statement {
        sql: format!("UPDATE {table} SET {} WHERE {id_column} = ?", sets.join(", ")),
        params,
    }
}

/// `DELETE FROM <table> WHERE <id> = ?`.
pub(crate) fn delete(table: &str, id_column: &str, id: SqlValue) -> Statement {
    Statement {
        sql: format!("DELETE FROM {table} WHERE {id_column} = ?"),
        params: vec![id],
    }
}
