// Identifier sanitization for dynamically built SQL

use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Character sequences that are never valid inside an identifier.
const DANGEROUS_SEQUENCES: &[&str] = &[";", "--", "/*", "*/", "'", "\"", "`"];

fn qualified_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*(\.[a-zA-Z_][a-zA-Z0-9_]*)*$")
            .expect("Invalid regex pattern")
    })
}

fn simple_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$")
            .expect("Invalid regex pattern")
    })
}

/// A schema, table or column name that passed sanitization.
///
/// The only way to obtain one is through the `sanitize*` functions, so any
/// value of this type is safe to interpolate into SQL text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SanitizedIdentifier(String);

impl SanitizedIdentifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for SanitizedIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SanitizedIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn check_common(identifier: &str) -> Result<()> {
    if identifier.is_empty() {
        return Err(Error::InvalidIdentifier("Empty identifier".to_string()));
    }
    if let Some(seq) = DANGEROUS_SEQUENCES.iter().find(|s| identifier.contains(*s)) {
        return Err(Error::InvalidIdentifier(format!(
            "Invalid character in identifier: '{}'",
            seq
        )));
    }
    Ok(())
}

/// The primary key column addressed by the id-based verbs.
pub(crate) fn id_column() -> SanitizedIdentifier {
    SanitizedIdentifier("id".to_string())
}

/// Validate a possibly dotted identifier (`name` or `schema.name`).
pub fn sanitize(identifier: &str) -> Result<SanitizedIdentifier> {
    check_common(identifier)?;
    if !qualified_name_regex().is_match(identifier) {
        return Err(Error::InvalidIdentifier(
            "Invalid identifier format".to_string(),
        ));
    }
    Ok(SanitizedIdentifier(identifier.to_string()))
}

pub fn sanitize_schema(schema: &str) -> Result<SanitizedIdentifier> {
    sanitize(schema)
}

pub fn sanitize_table(table: &str) -> Result<SanitizedIdentifier> {
    sanitize(table)
}

/// Validate a column name. Columns are single names, dots are rejected.
pub fn sanitize_column(column: &str) -> Result<SanitizedIdentifier> {
    check_common(column)?;
    if !simple_name_regex().is_match(column) {
        return Err(Error::InvalidIdentifier(
            "Invalid identifier format".to_string(),
        ));
    }
    Ok(SanitizedIdentifier(column.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_and_dotted_names_pass_unchanged() {
        assert_eq!(sanitize("users").unwrap().as_str(), "users");
        assert_eq!(sanitize("_tmp1").unwrap().as_str(), "_tmp1");
        assert_eq!(sanitize("public.users").unwrap().as_str(), "public.users");
        assert_eq!(sanitize("a.b.c").unwrap().to_string(), "a.b.c");
    }

    #[test]
    fn test_empty_identifier() {
        assert_eq!(
            sanitize(""),
            Err(Error::InvalidIdentifier("Empty identifier".to_string()))
        );
    }

    #[test]
    fn test_dangerous_character_named_in_error() {
        assert_eq!(
            sanitize("users;drop"),
            Err(Error::InvalidIdentifier(
                "Invalid character in identifier: ';'".to_string()
            ))
        );
        let err = sanitize("users--").unwrap_err();
        assert!(err.to_string().contains("'--'"));
        let err = sanitize("a`b").unwrap_err();
        assert!(err.to_string().contains('`'));
    }

    #[test]
    fn test_format_violations() {
        for bad in ["1users", "us er", "users.", ".users", "a..b", "naïve", "a-b"] {
            assert_eq!(
                sanitize(bad),
                Err(Error::InvalidIdentifier(
                    "Invalid identifier format".to_string()
                )),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_column_rejects_dots() {
        assert!(sanitize_column("created_at").is_ok());
        assert!(sanitize_column("public.users").is_err());
        assert!(sanitize_column("").is_err());
        assert!(sanitize_table("orders").is_ok());
        assert!(sanitize_schema("pg catalog").is_err());
    }
}
