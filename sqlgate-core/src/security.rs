// SQL security validation for caller-supplied statements

use crate::error::{Error, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Whether a caller statement may read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    #[default]
    Read,
    Write,
}

impl OperationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationMode::Read => "read",
            OperationMode::Write => "write",
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(OperationMode::Read),
            "write" => Ok(OperationMode::Write),
            _ => Err(Error::SqlRejected("Invalid operation type".to_string())),
        }
    }
}

/// Keywords that are never allowed, matched as whole words.
const DANGEROUS_KEYWORDS: &[&str] = &[
    "DROP",
    "TRUNCATE",
    "ALTER",
    "CREATE",
    "EXEC",
    "EXECUTE",
    "UNION ALL",
    "UNION",
    "SELECT INTO",
    "COPY",
    "GRANT",
    "REVOKE",
    "DENY",
    "BACKUP",
    "RESTORE",
    "SHUTDOWN",
    "KILL",
    "RECONFIGURE",
    "RECOVERY",
    "BULK INSERT",
    "OPENROWSET",
    "OPENDATASOURCE",
];

/// Identifier prefixes that reach system objects, matched at word start.
const DANGEROUS_PREFIXES: &[&str] = &["xp_", "sp_", "sys.", "pg_catalog.", "pg_"];

/// Attack shapes, checked after the keyword scan.
const BLOCKED_PATTERNS: &[(&str, &str)] = &[
    ("statement chaining", r";\s*[A-Z]"),
    ("block comment", r"/\*.*?\*/"),
    ("line comment", r"--.*$"),
    ("numeric tautology", r"\b(OR|AND)\s+\d+\s*=\s*\d+"),
    ("quoted tautology", r"\b(OR|AND)\s+'[^']*'"),
    ("double-quoted tautology", r#"\b(OR|AND)\s+"[^"]*""#),
    ("union select", r"\bUNION\s+(ALL\s+)?SELECT\b"),
    ("stacked statement", r";\s*(DROP|DELETE|INSERT|UPDATE|CREATE|ALTER)\b"),
    ("procedure call", r"\b(EXEC|EXECUTE|CALL)\b"),
    ("file operation", r"\b(LOAD_FILE|INTO\s+OUTFILE|INTO\s+DUMPFILE)\b"),
    ("system procedure", r"\b(xp_|sp_)\w+"),
];

/// Keywords that turn a read into a write.
const WRITE_KEYWORDS: &[(&str, &str)] = &[
    ("INSERT", r"\bINSERT\b"),
    ("UPDATE", r"\bUPDATE\b"),
    ("DELETE", r"\bDELETE\b"),
    ("VALUES", r"\bVALUES\b"),
    ("SET", r"\bSET\b"),
    ("RETURNING", r"\bRETURNING\b"),
    ("ON CONFLICT", r"\bON\s+CONFLICT\b"),
    ("MERGE", r"\bMERGE\b"),
    ("UPSERT", r"\bUPSERT\b"),
    ("CREATE TEMP TABLE", r"\bCREATE\s+TEMP(ORARY)?\s+TABLE\b"),
    ("IF NOT EXISTS", r"\bIF\s+NOT\s+EXISTS\b"),
    ("CAST", r"\bCAST\b"),
];

fn scan_regex(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .multi_line(true)
        .dot_matches_new_line(true)
        .build()
        .expect("Invalid regex pattern")
}

fn anchored_regex(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("Invalid regex pattern")
}

/// Keywords that also match as the tail of an underscored name (`dblink_exec`).
const UNDERSCORE_KEYWORDS: &[&str] = &["EXEC", "EXECUTE"];

fn keyword_pattern(keyword: &str) -> String {
    let words: Vec<String> = keyword.split_whitespace().map(regex::escape).collect();
    let start = if UNDERSCORE_KEYWORDS.contains(&keyword) { r"(?:\b|_)" } else { r"\b" };
    format!(r"{}{}\b", start, words.join(r"\s+"))
}

/// Conservative SQL validator.
///
/// Every check is a textual scan: no parsing, false positives are accepted.
/// Statements that pass still execute with bound parameters only.
pub struct SqlValidator {
    keywords: Vec<(&'static str, Regex)>,
    prefixes: Vec<(&'static str, Regex)>,
    patterns: Vec<(&'static str, Regex)>,
    write_keywords: Vec<(&'static str, Regex)>,
    create_any: Regex,
    create_temp_table: Regex,
    read_start: Regex,
    write_start: Regex,
}

impl SqlValidator {
    pub fn new() -> Self {
        let keywords = DANGEROUS_KEYWORDS
            .iter()
            .map(|kw| (*kw, scan_regex(&keyword_pattern(kw))))
            .collect();
        let prefixes = DANGEROUS_PREFIXES
            .iter()
            .map(|p| (*p, scan_regex(&format!(r"\b{}", regex::escape(p)))))
            .collect();
        let patterns = BLOCKED_PATTERNS
            .iter()
            .map(|(name, p)| (*name, scan_regex(p)))
            .collect();
        let write_keywords = WRITE_KEYWORDS
            .iter()
            .map(|(name, p)| (*name, scan_regex(p)))
            .collect();

        Self {
            keywords,
            prefixes,
            patterns,
            write_keywords,
            create_any: scan_regex(r"\bCREATE\b"),
            create_temp_table: scan_regex(r"\bCREATE\s+TEMP(ORARY)?\s+TABLE\b"),
            read_start: anchored_regex(r"\ASELECT\b"),
            write_start: anchored_regex(r"\A(INSERT|UPDATE|DELETE|CREATE\s+TEMP(ORARY)?\s+TABLE)\b"),
        }
    }

    /// Validate `sql` for the given mode. The first failing check wins.
    pub fn validate(&self, sql: &str, mode: OperationMode) -> Result<()> {
        let result = self.check(sql, mode);
        if let Err(Error::SqlRejected(reason)) = &result {
            AuditLogger::log_sql_rejected(mode, reason);
        }
        result
    }

    fn check(&self, sql: &str, mode: OperationMode) -> Result<()> {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return Err(Error::SqlRejected("Empty SQL statement".to_string()));
        }

        self.check_keywords(trimmed, mode)?;
        self.check_patterns(trimmed)?;

        match mode {
            OperationMode::Read => self.check_read(trimmed),
            OperationMode::Write => self.check_write(trimmed),
        }
    }

    fn check_keywords(&self, sql: &str, mode: OperationMode) -> Result<()> {
        for (keyword, re) in &self.keywords {
            if !re.is_match(sql) {
                continue;
            }
            if *keyword == "CREATE" && mode == OperationMode::Write && self.only_temp_tables(sql) {
                continue;
            }
            return Err(Error::SqlRejected(format!("dangerous keyword '{}'", keyword)));
        }
        for (prefix, re) in &self.prefixes {
            if re.is_match(sql) {
                return Err(Error::SqlRejected(format!("dangerous keyword '{}'", prefix)));
            }
        }
        Ok(())
    }

    // Every CREATE in the statement must introduce a temporary table.
    fn only_temp_tables(&self, sql: &str) -> bool {
        self.create_any.find_iter(sql).count() == self.create_temp_table.find_iter(sql).count()
    }

    fn check_patterns(&self, sql: &str) -> Result<()> {
        match self.patterns.iter().find(|(_, re)| re.is_match(sql)) {
            Some((name, _)) => Err(Error::SqlRejected(format!("blocked pattern ({})", name))),
            None => Ok(()),
        }
    }

    fn check_read(&self, sql: &str) -> Result<()> {
        if !self.read_start.is_match(sql) {
            return Err(Error::SqlRejected(
                "Read operations must start with SELECT".to_string(),
            ));
        }
        if let Some((keyword, _)) = self.write_keywords.iter().find(|(_, re)| re.is_match(sql)) {
            return Err(Error::SqlRejected(format!(
                "write keyword '{}' not allowed in read operation",
                keyword
            )));
        }
        Ok(())
    }

    fn check_write(&self, sql: &str) -> Result<()> {
        if !self.write_start.is_match(sql) {
            return Err(Error::SqlRejected(
                "Write operations must start with INSERT, UPDATE, DELETE or CREATE TEMP TABLE"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SqlValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Security audit log. Statement text is never logged, only the trigger.
pub struct AuditLogger;

impl AuditLogger {
    pub fn log_sql_rejected(mode: OperationMode, reason: &str) {
        tracing::warn!("SECURITY_EVENT: event=sql_rejected, mode={}, reason={}", mode, reason);
    }

    pub fn log_identifier_rejected(reason: &str) {
        tracing::warn!("SECURITY_EVENT: event=identifier_rejected, reason={}", reason);
    }
}
