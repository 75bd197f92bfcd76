//! Versioned net-asset-value history.
//!
//! Every token-denominated price in the system is derived from the single
//! active [`NavRecord`] of a project. Recording a new value supersedes the
//! previous one inside the same transaction, and a partial unique index on
//! `(project_id) WHERE is_superseded = 0` makes a second active row
//! impossible even if a caller bypasses [`record_nav`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use log::info;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::ids::ProjectId;
use crate::core::project;
use crate::error::{ErrorClass, ErrorCode};
use crate::store::codec::{self, UnknownVariant};
use crate::store::{Store, StoreError};

/// Where a NAV figure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavSource {
    /// Entered by an administrator.
    Manual,
    /// Derived by the system, e.g. after a milestone burn.
    Formula,
    /// Taken from an external audit.
    Audited,
}

impl NavSource {
    pub fn as_str(self) -> &'static str {
        match self {
            NavSource::Manual => "manual",
            NavSource::Formula => "formula",
            NavSource::Audited => "audited",
        }
    }
}

impl fmt::Display for NavSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NavSource {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(NavSource::Manual),
            "formula" => Ok(NavSource::Formula),
            "audited" => Ok(NavSource::Audited),
            other => Err(UnknownVariant::new("nav source", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum NavError {
    #[error("NAV value must be positive, got {0}")]
    InvalidValue(Decimal),
    #[error("no NAV available for project {0}")]
    NoNavAvailable(ProjectId),
    #[error("project {0} not found")]
    UnknownProject(ProjectId),
    #[error("NAV arithmetic overflowed at {0}")]
    Overflow(Decimal),
    #[error(transparent)]
    Project(#[from] project::ProjectError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for NavError {
    fn from(e: rusqlite::Error) -> Self {
        NavError::Store(e.into())
    }
}

impl ErrorCode for NavError {
    fn code(&self) -> &'static str {
        match self {
            NavError::InvalidValue(_) => "INVALID_NAV_VALUE",
            NavError::NoNavAvailable(_) => "NO_NAV_AVAILABLE",
            NavError::UnknownProject(_) => "PROJECT_NOT_FOUND",
            NavError::Overflow(_) => "NAV_OVERFLOW",
            NavError::Project(e) => e.code(),
            NavError::Store(e) => e.code(),
        }
    }

    fn class(&self) -> ErrorClass {
        match self {
            NavError::Project(e) => e.class(),
            NavError::Store(e) => e.class(),
            _ => ErrorClass::Validation,
        }
    }
}

/// One version of a project's value per token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavRecord {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub value_per_token: Decimal,
    pub source: NavSource,
    pub effective_at: DateTime<Utc>,
    pub is_superseded: bool,
    pub notes: Option<String>,
}

impl NavRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: codec::uuid(row, 0)?,
            project_id: ProjectId::new(row.get::<_, String>(1)?),
            value_per_token: codec::decimal(row, 2)?,
            source: codec::variant(row, 3)?,
            effective_at: row.get(4)?,
            is_superseded: row.get(5)?,
            notes: row.get(6)?,
        })
    }

    /// Project-level NAV: value per token times outstanding tokens.
    pub fn project_total(&self, token_supply: Decimal) -> Result<Decimal, NavError> {
        self.value_per_token
            .checked_mul(token_supply)
            .ok_or(NavError::Overflow(self.value_per_token))
    }
}

const NAV_COLUMNS: &str =
    "id, project_id, value_per_token, source, effective_at, is_superseded, notes";

/// Supersede the active record and insert `value` as the new active one.
///
/// Takes a transaction so both steps commit or roll back together; callers
/// that rewrite NAV as part of a larger unit (milestone confirmation) pass
/// their own transaction.
pub fn record_nav(
    tx: &Transaction<'_>,
    project_id: &ProjectId,
    value: Decimal,
    source: NavSource,
    notes: Option<&str>,
) -> Result<NavRecord, NavError> {
    if value <= Decimal::ZERO {
        return Err(NavError::InvalidValue(value));
    }
    if !project::project_exists(tx, project_id)? {
        return Err(NavError::UnknownProject(project_id.clone()));
    }

    let superseded = tx.execute(
        "UPDATE nav_records SET is_superseded = 1 WHERE project_id = ?1 AND is_superseded = 0",
        [project_id.as_str()],
    )?;

    let record = NavRecord {
        id: Uuid::new_v4(),
        project_id: project_id.clone(),
        value_per_token: value,
        source,
        effective_at: Utc::now(),
        is_superseded: false,
        notes: notes.map(str::to_string),
    };
    tx.execute(
        "INSERT INTO nav_records (id, project_id, value_per_token, source, effective_at, is_superseded, notes)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
        params![
            record.id.to_string(),
            project_id.as_str(),
            codec::money(value),
            source.as_str(),
            record.effective_at,
            record.notes,
        ],
    )?;

    info!(
        "NAV for {} set to {} ({}), superseding {} record(s)",
        project_id, value, source, superseded
    );
    Ok(record)
}

/// The single active NAV record of a project.
pub fn active_nav(conn: &Connection, project_id: &ProjectId) -> Result<NavRecord, NavError> {
    let sql = format!(
        "SELECT {} FROM nav_records WHERE project_id = ?1 AND is_superseded = 0
         ORDER BY effective_at DESC, seq DESC LIMIT 1",
        NAV_COLUMNS
    );
    conn.query_row(&sql, [project_id.as_str()], NavRecord::from_row)
        .optional()?
        .ok_or_else(|| NavError::NoNavAvailable(project_id.clone()))
}

/// Full NAV history of a project, newest first.
pub fn nav_history(conn: &Connection, project_id: &ProjectId) -> Result<Vec<NavRecord>, NavError> {
    let sql = format!(
        "SELECT {} FROM nav_records WHERE project_id = ?1 ORDER BY effective_at DESC, seq DESC",
        NAV_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([project_id.as_str()], NavRecord::from_row)?;
    let mut history = Vec::new();
    for row in rows {
        history.push(row?);
    }
    Ok(history)
}

/// Store-level entry points for administrative NAV changes.
pub struct NavLedger<'a> {
    store: &'a Store,
}

impl<'a> NavLedger<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn record(
        &self,
        project_id: &ProjectId,
        value: Decimal,
        source: NavSource,
        notes: Option<&str>,
    ) -> Result<NavRecord, NavError> {
        self.store
            .write(|tx| record_nav(tx, project_id, value, source, notes))
    }

    pub fn active(&self, project_id: &ProjectId) -> Result<NavRecord, NavError> {
        self.store.read(|conn| active_nav(conn, project_id))
    }

    pub fn history(&self, project_id: &ProjectId) -> Result<Vec<NavRecord>, NavError> {
        self.store.read(|conn| nav_history(conn, project_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn setup() -> (Store, ProjectId) {
        let store = Store::open_in_memory().unwrap();
        let id = ProjectId::new("PRJ-NAV");
        store
            .write(|tx| project::register_project(tx, &id, "Test", dec!(100), None))
            .unwrap();
        (store, id)
    }

    #[test]
    fn test_no_nav_is_distinct_condition() {
        let (store, id) = setup();
        let result = NavLedger::new(&store).active(&id);
        assert!(matches!(result, Err(NavError::NoNavAvailable(_))));
    }

    #[test]
    fn test_record_supersedes_previous() {
        let (store, id) = setup();
        let ledger = NavLedger::new(&store);
        let first = ledger.record(&id, dec!(10), NavSource::Manual, None).unwrap();
        let second = ledger
            .record(&id, dec!(12.5), NavSource::Audited, Some("Q2 audit"))
            .unwrap();

        let active = ledger.active(&id).unwrap();
        assert_eq!(active.id, second.id);
        assert_eq!(active.value_per_token, dec!(12.5));

        let history = ledger.history(&id).unwrap();
        assert_eq!(history.len(), 2);
        let old = history.iter().find(|r| r.id == first.id).unwrap();
        assert!(old.is_superseded);
        assert_eq!(history.iter().filter(|r| !r.is_superseded).count(), 1);
    }

    #[test]
    fn test_rejects_non_positive_value() {
        let (store, id) = setup();
        let ledger = NavLedger::new(&store);
        assert!(matches!(
            ledger.record(&id, Decimal::ZERO, NavSource::Manual, None),
            Err(NavError::InvalidValue(_))
        ));
        assert!(matches!(
            ledger.record(&id, dec!(-1), NavSource::Manual, None),
            Err(NavError::InvalidValue(_))
        ));
        assert!(ledger.history(&id).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_project() {
        let (store, _) = setup();
        let result = NavLedger::new(&store).record(
            &ProjectId::new("nope"),
            dec!(1),
            NavSource::Manual,
            None,
        );
        assert!(matches!(result, Err(NavError::UnknownProject(_))));
    }

    #[test]
    fn test_second_active_row_is_rejected_by_index() {
        let (store, id) = setup();
        NavLedger::new(&store)
            .record(&id, dec!(10), NavSource::Manual, None)
            .unwrap();
        let result: Result<usize, StoreError> = store.write(|tx| {
            tx.execute(
                "INSERT INTO nav_records (id, project_id, value_per_token, source, effective_at, is_superseded)
                 VALUES ('x', ?1, '11', 'manual', 'now', 0)",
                [id.as_str()],
            )
            .map_err(StoreError::from)
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_project_total() {
        let (store, id) = setup();
        let record = NavLedger::new(&store)
            .record(&id, dec!(4), NavSource::Manual, None)
            .unwrap();
        assert_eq!(record.project_total(dec!(100)).unwrap(), dec!(400));
    }

    #[test]
    fn test_project_total_overflow_is_an_error() {
        let (store, id) = setup();
        let record = NavLedger::new(&store)
            .record(&id, Decimal::MAX, NavSource::Manual, None)
            .unwrap();
        let err = record.project_total(dec!(2)).unwrap_err();
        assert!(matches!(err, NavError::Overflow(_)));
        assert_eq!(err.code(), "NAV_OVERFLOW");
    }
}
