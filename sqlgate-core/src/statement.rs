// Prepared statement model and caller parameter handling

use crate::error::{Error, Result};
use crate::value::SqlValue;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$(\d+)").expect("Invalid regex pattern"))
}

fn returning_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        RegexBuilder::new(r"\bRETURNING\b")
            .case_insensitive(true)
            .build()
            .expect("Invalid regex pattern")
    })
}

fn literal_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"'(?:[^']|'')*'|"(?:[^"]|"")*""#).expect("Invalid regex pattern"))
}

/// Number of positional parameters `sql` expects: the highest `$N` index,
/// or 0 when there are none.
pub fn placeholder_count(sql: &str) -> usize {
    placeholder_regex()
        .captures_iter(sql)
        .filter_map(|c| c.get(1)?.as_str().parse::<usize>().ok())
        .max()
        .unwrap_or(0)
}

/// Parameters as supplied by a caller: a JSON array in placeholder order,
/// or an object keyed `"1".."n"` (or `"$1".."$n"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterSet {
    Positional(Vec<Value>),
    Numbered(Map<String, Value>),
}

impl Default for ParameterSet {
    fn default() -> Self {
        ParameterSet::Positional(Vec::new())
    }
}

impl ParameterSet {
    pub fn len(&self) -> usize {
        match self {
            ParameterSet::Positional(values) => values.len(),
            ParameterSet::Numbered(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve into bind values in placeholder order.
    ///
    /// Numbered keys must be exactly `1..=n`; they are bound in numeric order
    /// whatever order the object lists them in.
    pub fn into_values(self) -> Result<Vec<SqlValue>> {
        match self {
            ParameterSet::Positional(values) => Ok(values.iter().map(SqlValue::from_json).collect()),
            ParameterSet::Numbered(map) => {
                let mut ordered = BTreeMap::new();
                for (key, value) in map {
                    let digits = key.strip_prefix('$').unwrap_or(&key);
                    let index = digits
                        .parse::<usize>()
                        .ok()
                        .filter(|i| *i >= 1 && digits.chars().all(|c| c.is_ascii_digit()))
                        .ok_or_else(|| {
                            Error::InvalidRequest(format!(
                                "parameter key '{}' is not a positional index",
                                key
                            ))
                        })?;
                    if ordered.insert(index, value).is_some() {
                        return Err(Error::InvalidRequest(format!(
                            "parameter ${} given more than once",
                            index
                        )));
                    }
                }
                let n = ordered.len();
                if let Some((&last, _)) = ordered.iter().next_back() {
                    if last != n {
                        return Err(Error::InvalidRequest(format!(
                            "parameter keys must be 1..{} without gaps",
                            n
                        )));
                    }
                }
                Ok(ordered.values().map(SqlValue::from_json).collect())
            }
        }
    }
}

impl From<Vec<Value>> for ParameterSet {
    fn from(values: Vec<Value>) -> Self {
        ParameterSet::Positional(values)
    }
}

/// SQL text with `$1..$n` placeholders and the values bound to them.
///
/// Fields are private: SQL and parameters are always set together.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStatement {
    sql: String,
    parameters: Vec<SqlValue>,
    name: Option<String>,
}

impl PreparedStatement {
    /// Build a statement, checking the placeholder count against `parameters`.
    pub fn new(sql: impl Into<String>, parameters: Vec<SqlValue>) -> Result<Self> {
        let sql = sql.into();
        let expected = placeholder_count(&sql);
        if expected != parameters.len() {
            return Err(Error::ParameterMismatch {
                expected,
                provided: parameters.len(),
            });
        }
        Ok(Self::from_parts(sql, parameters))
    }

    /// Build a statement from caller-supplied SQL and parameters.
    pub fn from_caller(sql: impl Into<String>, parameters: ParameterSet) -> Result<Self> {
        Self::new(sql, parameters.into_values()?)
    }

    // Builder output, correct by construction.
    pub(crate) fn from_parts(sql: String, parameters: Vec<SqlValue>) -> Self {
        Self {
            sql,
            parameters,
            name: None,
        }
    }

    /// Attach a cache name. Blank names leave the statement unnamed.
    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn parameters(&self) -> &[SqlValue] {
        &self.parameters
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn placeholder_count(&self) -> usize {
        placeholder_count(&self.sql)
    }

    /// Whether the statement hands rows back (a `RETURNING` clause
    /// outside any quoted literal or identifier).
    pub fn returns_rows(&self) -> bool {
        let unquoted = literal_regex().replace_all(&self.sql, "''");
        returning_regex().is_match(&unquoted)
    }
}
