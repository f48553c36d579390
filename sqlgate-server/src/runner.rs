// Statement runner: the seam between the executor and the database driver

use crate::pool::PooledConnection;
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use sqlgate_core::{Row, SqlValue};
use sqlx::postgres::types::{PgInterval, PgMoney, PgTimeTz};
use sqlx::postgres::{PgArguments, PgConnection, PgRow, PgTypeInfo, PgValueFormat};
use sqlx::query::Query;
use sqlx::types::ipnetwork::IpNetwork;
use sqlx::types::mac_address::MacAddress;
use sqlx::types::BitVec;
use sqlx::{Column, Executor, Postgres, Row as _, Statement, TypeInfo, ValueRef};
use std::str::FromStr;
use uuid::Uuid;

/// Runs SQL on one connection.
///
/// Implemented for pooled database connections; tests substitute their own.
#[async_trait]
pub trait StatementRunner: Send {
    /// Prepare `sql` server-side and return its parameter count.
    async fn prepare(&mut self, sql: &str) -> anyhow::Result<usize>;

    async fn fetch(&mut self, sql: &str, params: &[SqlValue]) -> anyhow::Result<Vec<Row>>;

    /// Execute without reading rows, returning the affected-row count.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> anyhow::Result<u64>;

    /// Mark the underlying connection unusable (e.g. after a timeout).
    fn invalidate(&mut self);
}

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

#[async_trait]
impl StatementRunner for PooledConnection {
    async fn prepare(&mut self, sql: &str) -> anyhow::Result<usize> {
        let conn = self.connection()?;
        Ok(parameter_types(conn, sql).await?.len())
    }

    async fn fetch(&mut self, sql: &str, params: &[SqlValue]) -> anyhow::Result<Vec<Row>> {
        let conn = self.connection()?;
        let query = bind_all(conn, sql, params).await?;
        let rows = query.fetch_all(&mut *conn).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> anyhow::Result<u64> {
        let conn = self.connection()?;
        let query = bind_all(conn, sql, params).await?;
        Ok(query.execute(&mut *conn).await?.rows_affected())
    }

    fn invalidate(&mut self) {
        self.mark_broken();
    }
}

// The driver caches the prepared form per connection, so describing a
// statement that already ran is local.
async fn parameter_types(conn: &mut PgConnection, sql: &str) -> anyhow::Result<Vec<PgTypeInfo>> {
    let stmt = Executor::prepare(&mut *conn, sql).await?;
    match stmt.parameters() {
        Some(params) => params.either(
            |types| Ok(types.to_vec()),
            |n| Err(anyhow!("driver reported {} untyped parameters", n)),
        ),
        None => Ok(Vec::new()),
    }
}

// Bind each value as the type the server inferred for its placeholder.
async fn bind_all<'q>(
    conn: &mut PgConnection,
    sql: &'q str,
    params: &[SqlValue],
) -> anyhow::Result<PgQuery<'q>> {
    let types = parameter_types(conn, sql).await?;
    if types.len() != params.len() {
        bail!(
            "statement expects {} parameters but {} were bound",
            types.len(),
            params.len()
        );
    }

    let mut query = sqlx::query(sql);
    for (i, (value, ty)) in params.iter().zip(&types).enumerate() {
        query = bind_value(query, value, ty).with_context(|| {
            format!(
                "cannot bind {} to parameter ${} of type {}",
                value.type_name(),
                i + 1,
                ty.name()
            )
        })?;
    }
    Ok(query)
}

fn bind_value<'q>(query: PgQuery<'q>, value: &SqlValue, ty: &PgTypeInfo) -> anyhow::Result<PgQuery<'q>> {
    // NULL carries no bytes, its declared type is irrelevant
    if value.is_null() {
        return Ok(query.bind(None::<String>));
    }

    let query = match ty.name() {
        "BOOL" => query.bind(as_bool(value)?),
        "INT2" => query.bind(i16::try_from(as_i64(value)?)?),
        "INT4" => query.bind(i32::try_from(as_i64(value)?)?),
        "INT8" => query.bind(as_i64(value)?),
        "FLOAT4" => query.bind(as_f64(value)? as f32),
        "FLOAT8" => query.bind(as_f64(value)?),
        "NUMERIC" => query.bind(as_decimal(value)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => query.bind(as_text(value)),
        "UUID" => query.bind(as_uuid(value)?),
        "JSON" | "JSONB" => query.bind(sqlx::types::Json(value.to_json())),
        "TIMESTAMPTZ" => query.bind(as_timestamptz(value)?),
        "TIMESTAMP" => query.bind(as_timestamp(value)?),
        "DATE" => query.bind(as_date(value)?),
        "TIME" => query.bind(as_time(value)?),
        "BOOL[]" => query.bind(list_of(value, as_bool)?),
        "INT2[]" => query.bind(list_of(value, |v| Ok(i16::try_from(as_i64(v)?)?))?),
        "INT4[]" => query.bind(list_of(value, |v| Ok(i32::try_from(as_i64(v)?)?))?),
        "INT8[]" => query.bind(list_of(value, as_i64)?),
        "FLOAT8[]" => query.bind(list_of(value, as_f64)?),
        "NUMERIC[]" => query.bind(list_of(value, as_decimal)?),
        "TEXT[]" | "VARCHAR[]" | "BPCHAR[]" | "NAME[]" => query.bind(list_of(value, |v| Ok(as_text(v)))?),
        "UUID[]" => query.bind(list_of(value, as_uuid)?),
        "TIMESTAMPTZ[]" => query.bind(list_of(value, as_timestamptz)?),
        "DATE[]" => query.bind(list_of(value, as_date)?),
        other => bail!("unsupported parameter type {}", other),
    };
    Ok(query)
}

fn list_of<T>(
    value: &SqlValue,
    convert: impl Fn(&SqlValue) -> anyhow::Result<T>,
) -> anyhow::Result<Vec<Option<T>>> {
    let items = match value {
        SqlValue::List(items) => items,
        other => bail!("expected a list, got {}", other.type_name()),
    };
    items
        .iter()
        .map(|item| match item {
            SqlValue::Null => Ok(None),
            v => convert(v).map(Some),
        })
        .collect()
}

fn as_bool(value: &SqlValue) -> anyhow::Result<bool> {
    match value {
        SqlValue::Bool(b) => Ok(*b),
        SqlValue::Int(0) => Ok(false),
        SqlValue::Int(1) => Ok(true),
        SqlValue::Text(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "1" => Ok(true),
            "false" | "f" | "no" | "0" => Ok(false),
            _ => bail!("'{}' is not a boolean", s),
        },
        other => bail!("expected a boolean, got {}", other.type_name()),
    }
}

fn as_i64(value: &SqlValue) -> anyhow::Result<i64> {
    match value {
        SqlValue::Int(i) => Ok(*i),
        SqlValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Ok(*f as i64),
        SqlValue::Text(s) => Ok(s.trim().parse()?),
        other => bail!("expected an integer, got {}", other.type_name()),
    }
}

fn as_f64(value: &SqlValue) -> anyhow::Result<f64> {
    match value {
        SqlValue::Float(f) => Ok(*f),
        SqlValue::Int(i) => Ok(*i as f64),
        SqlValue::Text(s) => Ok(s.trim().parse()?),
        other => bail!("expected a number, got {}", other.type_name()),
    }
}

fn as_decimal(value: &SqlValue) -> anyhow::Result<Decimal> {
    match value {
        SqlValue::Int(i) => Ok(Decimal::from(*i)),
        SqlValue::Float(f) => Ok(Decimal::try_from(*f)?),
        SqlValue::Text(s) => Ok(Decimal::from_str(s.trim())?),
        other => bail!("expected a decimal, got {}", other.type_name()),
    }
}

fn as_text(value: &SqlValue) -> String {
    match value {
        SqlValue::Text(s) => s.clone(),
        other => match other.to_json() {
            serde_json::Value::String(s) => s,
            json => json.to_string(),
        },
    }
}

fn as_uuid(value: &SqlValue) -> anyhow::Result<Uuid> {
    match value {
        SqlValue::Text(s) => Ok(Uuid::parse_str(s.trim())?),
        other => bail!("expected a uuid string, got {}", other.type_name()),
    }
}

fn parse_naive_timestamp(s: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn as_timestamptz(value: &SqlValue) -> anyhow::Result<DateTime<Utc>> {
    match value {
        SqlValue::Timestamp(ts) => Ok(*ts),
        SqlValue::LocalTimestamp(ts) => Ok(ts.and_utc()),
        SqlValue::Text(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|ts| ts.with_timezone(&Utc))
            .ok()
            .or_else(|| parse_naive_timestamp(s.trim()).map(|ts| ts.and_utc()))
            .ok_or_else(|| anyhow!("'{}' is not a timestamp", s)),
        other => bail!("expected a timestamp, got {}", other.type_name()),
    }
}

fn as_timestamp(value: &SqlValue) -> anyhow::Result<NaiveDateTime> {
    match value {
        SqlValue::LocalTimestamp(ts) => Ok(*ts),
        SqlValue::Timestamp(ts) => Ok(ts.naive_utc()),
        SqlValue::Text(s) => parse_naive_timestamp(s.trim())
            .or_else(|| DateTime::parse_from_rfc3339(s.trim()).ok().map(|ts| ts.naive_utc()))
            .ok_or_else(|| anyhow!("'{}' is not a timestamp", s)),
        other => bail!("expected a timestamp, got {}", other.type_name()),
    }
}

fn as_date(value: &SqlValue) -> anyhow::Result<NaiveDate> {
    match value {
        SqlValue::Date(d) => Ok(*d),
        SqlValue::Text(s) => Ok(NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")?),
        other => bail!("expected a date, got {}", other.type_name()),
    }
}

fn as_time(value: &SqlValue) -> anyhow::Result<NaiveTime> {
    match value {
        SqlValue::Time(t) => Ok(*t),
        SqlValue::Text(s) => Ok(NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")?),
        other => bail!("expected a time, got {}", other.type_name()),
    }
}

fn decode_row(row: &PgRow) -> anyhow::Result<Row> {
    let mut out = Row::with_capacity(row.columns().len());
    for column in row.columns() {
        let value = decode_column(row, column.ordinal(), column.type_info().name())
            .with_context(|| format!("cannot decode column '{}'", column.name()))?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn scalar<'r, T, F>(row: &'r PgRow, idx: usize, wrap: F) -> anyhow::Result<SqlValue>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
    F: FnOnce(T) -> SqlValue,
{
    Ok(row.try_get::<Option<T>, _>(idx)?.map(wrap).unwrap_or(SqlValue::Null))
}

fn array<'r, T, F>(row: &'r PgRow, idx: usize, wrap: F) -> anyhow::Result<SqlValue>
where
    Vec<Option<T>>: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
    F: Fn(T) -> SqlValue,
{
    Ok(row
        .try_get::<Option<Vec<Option<T>>>, _>(idx)?
        .map(|items| {
            SqlValue::List(
                items
                    .into_iter()
                    .map(|item| item.map(&wrap).unwrap_or(SqlValue::Null))
                    .collect(),
            )
        })
        .unwrap_or(SqlValue::Null))
}

fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> anyhow::Result<SqlValue> {
    match type_name {
        "BOOL" => scalar(row, idx, SqlValue::Bool),
        "INT2" => scalar(row, idx, |v: i16| SqlValue::Int(v.into())),
        "INT4" => scalar(row, idx, |v: i32| SqlValue::Int(v.into())),
        "INT8" => scalar(row, idx, SqlValue::Int),
        "OID" => scalar(row, idx, |v: sqlx::postgres::types::Oid| SqlValue::Int(v.0.into())),
        "FLOAT4" => scalar(row, idx, |v: f32| SqlValue::Float(v.into())),
        "FLOAT8" => scalar(row, idx, SqlValue::Float),
        "NUMERIC" => scalar(row, idx, |v: Decimal| SqlValue::Text(v.to_string())),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "UNKNOWN" => scalar(row, idx, SqlValue::Text),
        "UUID" => scalar(row, idx, |v: Uuid| SqlValue::Text(v.to_string())),
        "JSON" | "JSONB" => scalar(row, idx, SqlValue::Json),
        "TIMESTAMPTZ" => scalar(row, idx, SqlValue::Timestamp),
        "TIMESTAMP" => scalar(row, idx, SqlValue::LocalTimestamp),
        "DATE" => scalar(row, idx, SqlValue::Date),
        "TIME" => scalar(row, idx, SqlValue::Time),
        "BYTEA" => scalar(row, idx, |v: Vec<u8>| {
            SqlValue::Text(v.iter().fold(String::from("\\x"), |mut s, b| {
                s.push_str(&format!("{:02x}", b));
                s
            }))
        }),
        "VOID" => Ok(SqlValue::Null),
        "BOOL[]" => array(row, idx, SqlValue::Bool),
        "INT2[]" => array(row, idx, |v: i16| SqlValue::Int(v.into())),
        "INT4[]" => array(row, idx, |v: i32| SqlValue::Int(v.into())),
        "INT8[]" => array(row, idx, SqlValue::Int),
        "FLOAT4[]" => array(row, idx, |v: f32| SqlValue::Float(v.into())),
        "FLOAT8[]" => array(row, idx, SqlValue::Float),
        "NUMERIC[]" => array(row, idx, |v: Decimal| SqlValue::Text(v.to_string())),
        "TEXT[]" | "VARCHAR[]" | "BPCHAR[]" | "NAME[]" => array(row, idx, SqlValue::Text),
        "UUID[]" => array(row, idx, |v: Uuid| SqlValue::Text(v.to_string())),
        "JSONB[]" => array(row, idx, SqlValue::Json),
        "TIMESTAMPTZ[]" => array(row, idx, SqlValue::Timestamp),
        "TIMESTAMP[]" => array(row, idx, SqlValue::LocalTimestamp),
        "DATE[]" => array(row, idx, SqlValue::Date),
        "INTERVAL" => scalar(row, idx, |v: PgInterval| SqlValue::Text(format_interval(&v))),
        "TIMETZ" => scalar(row, idx, |v: PgTimeTz| SqlValue::Text(format!("{}{}", v.time, v.offset))),
        "MONEY" => scalar(row, idx, |v: PgMoney| SqlValue::Text(v.to_decimal(2).to_string())),
        "INET" => scalar(row, idx, |v: IpNetwork| SqlValue::Text(format_inet(&v))),
        "CIDR" => scalar(row, idx, |v: IpNetwork| SqlValue::Text(v.to_string())),
        "MACADDR" => scalar(row, idx, |v: MacAddress| SqlValue::Text(v.to_string().to_lowercase())),
        "BIT" | "VARBIT" => scalar(row, idx, |v: BitVec| {
            SqlValue::Text(v.iter().map(|b| if b { '1' } else { '0' }).collect())
        }),
        other if BINARY_ONLY_TYPES.contains(&other) => bail!("unsupported column type {}", other),
        // Enums and other text-encoded types
        other => {
            let raw = row.try_get_raw(idx)?;
            if raw.is_null() {
                return Ok(SqlValue::Null);
            }
            let bytes = raw.as_bytes().map_err(|e| anyhow!(e))?;
            match text_payload(bytes, raw.format()) {
                Some(text) => Ok(SqlValue::Text(text)),
                None => bail!("unsupported column type {}", other),
            }
        }
    }
}

/// Built-in types whose binary encoding is never readable text.
const BINARY_ONLY_TYPES: &[&str] = &[
    "POINT", "LINE", "LSEG", "BOX", "PATH", "POLYGON", "CIRCLE", "MACADDR8", "TSVECTOR",
    "TSQUERY", "INT4RANGE", "INT8RANGE", "NUMRANGE", "TSRANGE", "TSTZRANGE", "DATERANGE",
    "PG_LSN", "TXID_SNAPSHOT",
];

/// Text behind a column of an unrecognised type. Binary payloads are accepted
/// only when they read as printable UTF-8, which is how enum labels arrive.
fn text_payload(bytes: &[u8], format: PgValueFormat) -> Option<String> {
    let text = std::str::from_utf8(bytes).ok()?;
    match format {
        PgValueFormat::Text => Some(text.to_string()),
        PgValueFormat::Binary if !text.chars().any(char::is_control) => Some(text.to_string()),
        PgValueFormat::Binary => None,
    }
}

/// Host addresses print without their full-length prefix, as PostgreSQL does.
fn format_inet(net: &IpNetwork) -> String {
    let full = if net.is_ipv4() { 32 } else { 128 };
    if net.prefix() == full {
        net.ip().to_string()
    } else {
        net.to_string()
    }
}

/// PostgreSQL's default interval output, e.g. `1 year 2 mons 3 days 04:05:06.5`.
fn format_interval(interval: &PgInterval) -> String {
    fn unit(n: i64, name: &str) -> String {
        format!("{} {}{}", n, name, if n == 1 { "" } else { "s" })
    }

    let mut parts = Vec::new();
    let years = i64::from(interval.months / 12);
    let months = i64::from(interval.months % 12);
    if years != 0 {
        parts.push(unit(years, "year"));
    }
    if months != 0 {
        parts.push(unit(months, "mon"));
    }
    if interval.days != 0 {
        parts.push(unit(interval.days.into(), "day"));
    }

    let micros = interval.microseconds;
    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 { "-" } else { "" };
        let abs = micros.unsigned_abs();
        let secs = abs / 1_000_000;
        let mut time = format!(
            "{}{:02}:{:02}:{:02}",
            sign,
            secs / 3600,
            (secs / 60) % 60,
            secs % 60
        );
        let frac = abs % 1_000_000;
        if frac != 0 {
            time.push_str(format!(".{:06}", frac).trim_end_matches('0'));
        }
        parts.push(time);
    }
    parts.join(" ")
}
