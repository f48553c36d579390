// Parameterized SQL for the generic CRUD verbs

use crate::error::{Error, Result};
use crate::identifier::{id_column, sanitize_column, SanitizedIdentifier};
use crate::statement::PreparedStatement;
use crate::value::{JsonRow, RecordId, SqlValue};
use std::fmt;

pub const DEFAULT_LIMIT: i64 = 100;
pub const MAX_LIMIT: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => f.write_str("ASC"),
            SortDirection::Desc => f.write_str("DESC"),
        }
    }
}

/// `ORDER BY` target: one sanitized column and a direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    column: SanitizedIdentifier,
    direction: SortDirection,
}

impl OrderBy {
    pub fn new(column: SanitizedIdentifier, direction: SortDirection) -> Self {
        Self { column, direction }
    }

    /// Parse `"column"` or `"column ASC|DESC"`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.split_whitespace();
        let column = parts
            .next()
            .ok_or_else(|| Error::InvalidRequest("order_by is empty".to_string()))?;
        let direction = match parts.next().map(|d| d.to_ascii_uppercase()) {
            None => SortDirection::Asc,
            Some(d) if d == "ASC" => SortDirection::Asc,
            Some(d) if d == "DESC" => SortDirection::Desc,
            Some(d) => {
                return Err(Error::InvalidRequest(format!(
                    "order_by direction must be ASC or DESC, got '{}'",
                    d
                )))
            }
        };
        if parts.next().is_some() {
            return Err(Error::InvalidRequest(
                "order_by takes a column and an optional direction".to_string(),
            ));
        }
        Ok(Self::new(sanitize_column(column)?, direction))
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.column, self.direction)
    }
}

/// Conjunction of `column = value` predicates. Values are always bound.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WhereClause {
    conditions: Vec<(SanitizedIdentifier, SqlValue)>,
}

impl WhereClause {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column_equals(column: SanitizedIdentifier, value: SqlValue) -> Self {
        Self::new().and(column, value)
    }

    pub fn id_equals(id: &RecordId) -> Self {
        Self::new().and(id_column(), id.to_sql_value())
    }

    pub fn and(mut self, column: SanitizedIdentifier, value: SqlValue) -> Self {
        self.conditions.push((column, value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    // Render starting at placeholder `$first`, pushing bound values.
    fn render(&self, first: usize, params: &mut Vec<SqlValue>) -> String {
        let mut parts = Vec::with_capacity(self.conditions.len());
        for (i, (column, value)) in self.conditions.iter().enumerate() {
            parts.push(format!("{} = ${}", column, first + i));
            params.push(value.clone());
        }
        parts.join(" AND ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// Empty selects `*`.
    pub columns: Vec<SanitizedIdentifier>,
    pub where_clause: Option<WhereClause>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn qualified(schema: &SanitizedIdentifier, table: &SanitizedIdentifier) -> String {
    format!("{}.{}", schema, table)
}

fn append_where(sql: &mut String, clause: Option<&WhereClause>, params: &mut Vec<SqlValue>) {
    if let Some(clause) = clause.filter(|c| !c.is_empty()) {
        let rendered = clause.render(params.len() + 1, params);
        sql.push_str(" WHERE ");
        sql.push_str(&rendered);
    }
}

pub fn validate_limit(limit: i64) -> Result<i64> {
    if (1..=MAX_LIMIT).contains(&limit) {
        Ok(limit)
    } else {
        Err(Error::InvalidRequest(format!(
            "limit must be between 1 and {}",
            MAX_LIMIT
        )))
    }
}

pub fn validate_offset(offset: i64) -> Result<i64> {
    if offset >= 0 {
        Ok(offset)
    } else {
        Err(Error::InvalidRequest("offset must be non-negative".to_string()))
    }
}

pub fn build_select(
    schema: &SanitizedIdentifier,
    table: &SanitizedIdentifier,
    options: &SelectOptions,
) -> Result<PreparedStatement> {
    let columns = if options.columns.is_empty() {
        "*".to_string()
    } else {
        options
            .columns
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut params = Vec::new();
    let mut sql = format!("SELECT {} FROM {}", columns, qualified(schema, table));
    append_where(&mut sql, options.where_clause.as_ref(), &mut params);

    if let Some(order_by) = &options.order_by {
        sql.push_str(&format!(" ORDER BY {}", order_by));
    }
    if let Some(limit) = options.limit {
        params.push(SqlValue::Int(validate_limit(limit)?));
        sql.push_str(&format!(" LIMIT ${}", params.len()));
    }
    if let Some(offset) = options.offset {
        params.push(SqlValue::Int(validate_offset(offset)?));
        sql.push_str(&format!(" OFFSET ${}", params.len()));
    }

    Ok(PreparedStatement::from_parts(sql, params))
}

pub fn build_select_by_id(
    schema: &SanitizedIdentifier,
    table: &SanitizedIdentifier,
    id: &RecordId,
) -> PreparedStatement {
    PreparedStatement::from_parts(
        format!("SELECT * FROM {} WHERE id = $1", qualified(schema, table)),
        vec![id.to_sql_value()],
    )
}

pub fn build_count(
    schema: &SanitizedIdentifier,
    table: &SanitizedIdentifier,
    where_clause: Option<&WhereClause>,
) -> PreparedStatement {
    let mut params = Vec::new();
    let mut sql = format!("SELECT COUNT(*) FROM {}", qualified(schema, table));
    append_where(&mut sql, where_clause, &mut params);
    PreparedStatement::from_parts(sql, params)
}

/// `INSERT ... RETURNING *`, columns in the map's iteration order.
pub fn build_insert(
    schema: &SanitizedIdentifier,
    table: &SanitizedIdentifier,
    data: &JsonRow,
) -> Result<PreparedStatement> {
    if data.is_empty() {
        return Ok(PreparedStatement::from_parts(
            format!("INSERT INTO {} DEFAULT VALUES RETURNING *", qualified(schema, table)),
            Vec::new(),
        ));
    }

    let mut columns = Vec::with_capacity(data.len());
    let mut placeholders = Vec::with_capacity(data.len());
    let mut params = Vec::with_capacity(data.len());
    for (i, (key, value)) in data.iter().enumerate() {
        columns.push(sanitize_column(key)?.into_inner());
        placeholders.push(format!("${}", i + 1));
        params.push(SqlValue::from_json(value));
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
        qualified(schema, table),
        columns.join(", "),
        placeholders.join(", ")
    );
    Ok(PreparedStatement::from_parts(sql, params))
}

/// `UPDATE ... SET c = $2, ... WHERE id = $1 RETURNING *`.
pub fn build_update(
    schema: &SanitizedIdentifier,
    table: &SanitizedIdentifier,
    id: &RecordId,
    data: &JsonRow,
) -> Result<PreparedStatement> {
    if data.is_empty() {
        return Err(Error::InvalidRequest("No fields to update".to_string()));
    }

    let mut assignments = Vec::with_capacity(data.len());
    let mut params = Vec::with_capacity(data.len() + 1);
    params.push(id.to_sql_value());
    for (key, value) in data {
        let column = sanitize_column(key)?;
        params.push(SqlValue::from_json(value));
        assignments.push(format!("{} = ${}", column, params.len()));
    }

    let sql = format!(
        "UPDATE {} SET {} WHERE id = $1 RETURNING *",
        qualified(schema, table),
        assignments.join(", ")
    );
    Ok(PreparedStatement::from_parts(sql, params))
}

pub fn build_delete(
    schema: &SanitizedIdentifier,
    table: &SanitizedIdentifier,
    id: &RecordId,
) -> PreparedStatement {
    PreparedStatement::from_parts(
        format!("DELETE FROM {} WHERE id = $1 RETURNING *", qualified(schema, table)),
        vec![id.to_sql_value()],
    )
}

pub fn build_exists(
    schema: &SanitizedIdentifier,
    table: &SanitizedIdentifier,
    id: &RecordId,
) -> PreparedStatement {
    PreparedStatement::from_parts(
        format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE id = $1)",
            qualified(schema, table)
        ),
        vec![id.to_sql_value()],
    )
}

pub fn build_table_exists(
    schema: &SanitizedIdentifier,
    table: &SanitizedIdentifier,
) -> PreparedStatement {
    PreparedStatement::from_parts(
        "SELECT EXISTS(SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2)"
            .to_string(),
        vec![
            SqlValue::Text(schema.as_str().to_string()),
            SqlValue::Text(table.as_str().to_string()),
        ],
    )
}
