//! Column codecs for types SQLite has no native representation for.
//!
//! Money is stored as TEXT and parsed back into an exact `Decimal`; SQLite's
//! own numeric affinity would round it through a double.

use std::str::FromStr;

use rusqlite::types::Type;
use rusqlite::Row;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// A stored enum column held a value no variant matches.
#[derive(Debug, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

fn conversion_failure<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub fn decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw).map_err(|e| conversion_failure(idx, e))
}

pub fn opt_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Decimal::from_str(&s).map_err(|e| conversion_failure(idx, e)))
        .transpose()
}

pub fn uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_failure(idx, e))
}

pub fn opt_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Uuid::parse_str(&s).map_err(|e| conversion_failure(idx, e)))
        .transpose()
}

/// Parse a closed-enum column through its `FromStr` impl.
pub fn variant<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = UnknownVariant>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_failure(idx, e))
}

/// Decimal rendering used for every money column.
pub fn money(amount: Decimal) -> String {
    amount.normalize().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decimal_column_is_exact() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (v TEXT)").unwrap();
        conn.execute("INSERT INTO t (v) VALUES (?1)", [money(dec!(0.1000001))])
            .unwrap();
        let v = conn
            .query_row("SELECT v FROM t", [], |row| decimal(row, 0))
            .unwrap();
        assert_eq!(v, dec!(0.1000001));
    }

    #[test]
    fn test_bad_decimal_is_conversion_failure() {
        let conn = Connection::open_in_memory().unwrap();
        let result = conn.query_row("SELECT 'not-a-number'", [], |row| decimal(row, 0));
        assert!(matches!(
            result,
            Err(rusqlite::Error::FromSqlConversionFailure(0, _, _))
        ));
    }
}
