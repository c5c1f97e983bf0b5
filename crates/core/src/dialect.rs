//! SQL dialects of the supported server families
//!
//! The set of dialects is closed: the server version string reported on the
//! first connection selects exactly one variant and it never changes for the
//! lifetime of a provider.
//!
//! | Server | Version string | Dialect |
//! |---|---|---|
//! | MySQL 5.6 / 5.7 | `5.6.x`, `5.7.x[-suffix]` | `MySql56` |
//! | MariaDB 10.x | `[5.5.5-]10.x.y-MariaDB[-suffix]` | `MariaDb10` |

use crate::error::{Error, Result};
use crate::types::TransactionMode;
use crate::value::SqlValue;
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static MARIADB_10: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|-)10\.\d+\.\d+-MariaDB").expect("valid regex"));
static MYSQL_56: Lazy<Regex> = Lazy::new(|| Regex::new(r"^5\.[67]\.\d+").expect("valid regex"));

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// SQL syntax strategy for one server family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// MySQL 5.6 and 5.7
    MySql56,
    /// MariaDB 10.x
    MariaDb10,
}

impl Dialect {
    /// Classify a server version string
    ///
    /// # Errors
    /// `Error::UnsupportedServer` if the version matches no supported family.
    pub fn detect(version: &str) -> Result<Dialect> {
        if MARIADB_10.is_match(version) {
            Ok(Dialect::MariaDb10)
        } else if MYSQL_56.is_match(version) {
            Ok(Dialect::MySql56)
        } else {
            Err(Error::UnsupportedServer {
                version: version.to_string(),
            })
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::MySql56 => "mysql56",
            Dialect::MariaDb10 => "mariadb10",
        }
    }

    /// Quoted, escaped string literal
    pub fn string_literal(&self, s: &str) -> String {
        let mut out = String::with_capacity(s.len() + 2);
        out.push('\'');
        for ch in s.chars() {
            match ch {
                '\0' => out.push_str("\\0"),
                '\x08' => out.push_str("\\b"),
                '\t' => out.push_str("\\t"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\x1a' => out.push_str("\\Z"),
                '\'' => out.push_str("\\'"),
                '"' => out.push_str("\\\""),
                '\\' => out.push_str("\\\\"),
                c => out.push(c),
            }
        }
        out.push('\'');
        out
    }

    /// Boolean literal
    pub fn boolean_literal(&self, b: bool) -> &'static str {
        if b {
            "TRUE"
        } else {
            "FALSE"
        }
    }

    /// Backtick-quoted identifier
    pub fn identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    /// `DATETIME(6)` literal in UTC
    pub fn datetime_literal(&self, dt: DateTime<Utc>) -> String {
        self.naive_datetime_literal(dt.naive_utc())
    }

    fn naive_datetime_literal(&self, dt: NaiveDateTime) -> String {
        format!("'{}'", dt.format(DATETIME_FORMAT))
    }

    /// Hex blob literal
    pub fn bytes_literal(&self, bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len() * 2 + 3);
        out.push_str("X'");
        for b in bytes {
            out.push_str(&format!("{:02X}", b));
        }
        out.push('\'');
        out
    }

    /// Literal for an arbitrary value
    pub fn value_literal(&self, value: &SqlValue) -> String {
        match value {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Int(v) => v.to_string(),
            SqlValue::UInt(v) => v.to_string(),
            SqlValue::Float(v) if v.is_finite() => v.to_string(),
            SqlValue::Float(_) => "NULL".to_string(),
            SqlValue::Text(s) => self.string_literal(s),
            SqlValue::Bytes(b) => self.bytes_literal(b),
            SqlValue::DateTime(dt) => self.naive_datetime_literal(*dt),
        }
    }

    /// Statement opening a transaction in the given mode
    pub fn start_transaction(&self, mode: TransactionMode) -> &'static str {
        match mode {
            TransactionMode::ReadOnly => "START TRANSACTION READ ONLY",
            TransactionMode::ReadWrite => "START TRANSACTION READ WRITE",
        }
    }

    /// Reference to the proposed row value inside `ON DUPLICATE KEY UPDATE`
    pub fn upsert_value(&self, column: &str) -> String {
        format!("VALUES({})", self.identifier(column))
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_detect_mysql() {
        assert_eq!(Dialect::detect("5.7.34").unwrap(), Dialect::MySql56);
        assert_eq!(Dialect::detect("5.6.51-log").unwrap(), Dialect::MySql56);
    }

    #[test]
    fn test_detect_mariadb() {
        assert_eq!(Dialect::detect("10.5.8-MariaDB").unwrap(), Dialect::MariaDb10);
        assert_eq!(
            Dialect::detect("5.5.5-10.3.39-MariaDB-0+deb10u1").unwrap(),
            Dialect::MariaDb10
        );
    }

    #[test]
    fn test_detect_unsupported() {
        for version in ["8.0.1", "5.5.62", "11.2.2-MariaDB", "", "10.5.8"] {
            let err = Dialect::detect(version).unwrap_err();
            assert_eq!(
                err,
                Error::UnsupportedServer {
                    version: version.to_string()
                }
            );
        }
    }

    #[test]
    fn test_string_literal_escaping() {
        let d = Dialect::MySql56;
        assert_eq!(d.string_literal("plain"), "'plain'");
        assert_eq!(d.string_literal("it's"), "'it\\'s'");
        assert_eq!(d.string_literal("a\\b"), "'a\\\\b'");
        assert_eq!(d.string_literal("line\nbreak\0"), "'line\\nbreak\\0'");
    }

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(Dialect::MariaDb10.identifier("segment_versions"), "`segment_versions`");
        assert_eq!(Dialect::MariaDb10.identifier("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_value_literals() {
        let d = Dialect::MariaDb10;
        assert_eq!(d.value_literal(&SqlValue::Null), "NULL");
        assert_eq!(d.value_literal(&SqlValue::UInt(9)), "9");
        assert_eq!(d.value_literal(&SqlValue::Bytes(vec![0xde, 0x01])), "X'DE01'");
        assert_eq!(d.boolean_literal(true), "TRUE");

        let dt = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 58).unwrap();
        assert_eq!(d.datetime_literal(dt), "'2024-02-29 23:59:58.000000'");
    }

    #[test]
    fn test_start_transaction() {
        let d = Dialect::MySql56;
        assert_eq!(
            d.start_transaction(TransactionMode::ReadOnly),
            "START TRANSACTION READ ONLY"
        );
        assert_eq!(
            d.start_transaction(TransactionMode::ReadWrite),
            "START TRANSACTION READ WRITE"
        );
    }
}
