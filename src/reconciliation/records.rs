use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use log::{error, info};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::ids::Actor;
use crate::error::{ErrorClass, ErrorCode};
use crate::reconciliation::audit::{self, AuditAction, AuditEntry, EntityKind};
use crate::store::codec::{self, UnknownVariant};
use crate::store::{Store, StoreError};

/// Which settlement flow diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    WalletFunding,
    MilestoneBurn,
    CapitalAllocation,
    RedemptionPayout,
}

impl DivergenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DivergenceKind::WalletFunding => "wallet_funding",
            DivergenceKind::MilestoneBurn => "milestone_burn",
            DivergenceKind::CapitalAllocation => "capital_allocation",
            DivergenceKind::RedemptionPayout => "redemption_payout",
        }
    }
}

impl fmt::Display for DivergenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DivergenceKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wallet_funding" => Ok(DivergenceKind::WalletFunding),
            "milestone_burn" => Ok(DivergenceKind::MilestoneBurn),
            "capital_allocation" => Ok(DivergenceKind::CapitalAllocation),
            "redemption_payout" => Ok(DivergenceKind::RedemptionPayout),
            other => Err(UnknownVariant::new("divergence kind", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(UnknownVariant::new("severity", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("reconciliation record {0} not found")]
    NotFound(Uuid),
    #[error("reconciliation record {id} was already resolved by {resolved_by}")]
    AlreadyResolved { id: Uuid, resolved_by: String },
    #[error("resolution notes must not be empty")]
    MissingNotes,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for ReconciliationError {
    fn from(e: rusqlite::Error) -> Self {
        ReconciliationError::Store(e.into())
    }
}

impl ErrorCode for ReconciliationError {
    fn code(&self) -> &'static str {
        match self {
            ReconciliationError::NotFound(_) => "RECONCILIATION_NOT_FOUND",
            ReconciliationError::AlreadyResolved { .. } => "ALREADY_RESOLVED",
            ReconciliationError::MissingNotes => "VALIDATION_ERROR",
            ReconciliationError::Store(e) => e.code(),
        }
    }

    fn class(&self) -> ErrorClass {
        match self {
            ReconciliationError::NotFound(_) | ReconciliationError::MissingNotes => {
                ErrorClass::Validation
            }
            ReconciliationError::AlreadyResolved { .. } => ErrorClass::DomainState,
            ReconciliationError::Store(e) => e.class(),
        }
    }
}

/// A flagged divergence between the asset network and the local ledger.
///
/// Only written after an irreversible external action succeeded and the
/// paired local write failed or conflicted. Never deleted; cleared only by
/// [`resolve_record`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub id: Uuid,
    pub kind: DivergenceKind,
    pub severity: Severity,
    pub external_tx_ref: Option<String>,
    pub related_entity_id: String,
    pub amount: Option<Decimal>,
    pub message: String,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ReconciliationRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: codec::uuid(row, 0)?,
            kind: codec::variant(row, 1)?,
            severity: codec::variant(row, 2)?,
            external_tx_ref: row.get(3)?,
            related_entity_id: row.get(4)?,
            amount: codec::opt_decimal(row, 5)?,
            message: row.get(6)?,
            resolved: row.get(7)?,
            resolved_by: row.get(8)?,
            resolution_notes: row.get(9)?,
            created_at: row.get(10)?,
            resolved_at: row.get(11)?,
        })
    }
}

impl fmt::Display for ReconciliationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} entity={} ref={} amount={} {}{}",
            self.severity,
            self.id,
            self.kind,
            self.related_entity_id,
            self.external_tx_ref.as_deref().unwrap_or("-"),
            self.amount.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string()),
            self.message,
            if self.resolved { " (resolved)" } else { "" }
        )
    }
}

/// Fields of a divergence about to be flagged.
#[derive(Debug, Clone, PartialEq)]
pub struct DivergenceDraft {
    pub kind: DivergenceKind,
    pub severity: Severity,
    pub external_tx_ref: Option<String>,
    pub related_entity_id: String,
    pub amount: Option<Decimal>,
    pub message: String,
}

impl DivergenceDraft {
    /// A critical divergence: the external action happened, local state
    /// does not reflect it.
    pub fn critical(
        kind: DivergenceKind,
        related_entity_id: impl fmt::Display,
        external_tx_ref: Option<&str>,
        amount: Option<Decimal>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity: Severity::Critical,
            external_tx_ref: external_tx_ref.map(str::to_string),
            related_entity_id: related_entity_id.to_string(),
            amount,
            message: message.into(),
        }
    }
}

const RECORD_COLUMNS: &str = "id, error_type, severity, external_tx_ref, related_entity_id, amount, message, \
     resolved, resolved_by, resolution_notes, created_at, resolved_at";

pub fn insert_record(
    conn: &Connection,
    draft: &DivergenceDraft,
) -> Result<ReconciliationRecord, ReconciliationError> {
    let record = ReconciliationRecord {
        id: Uuid::new_v4(),
        kind: draft.kind,
        severity: draft.severity,
        external_tx_ref: draft.external_tx_ref.clone(),
        related_entity_id: draft.related_entity_id.clone(),
        amount: draft.amount,
        message: draft.message.clone(),
        resolved: false,
        resolved_by: None,
        resolution_notes: None,
        created_at: Utc::now(),
        resolved_at: None,
    };
    conn.execute(
        "INSERT INTO reconciliation_records
            (id, error_type, severity, external_tx_ref, related_entity_id, amount, message, resolved, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
        params![
            record.id.to_string(),
            record.kind.as_str(),
            record.severity.as_str(),
            record.external_tx_ref,
            record.related_entity_id,
            record.amount.map(codec::money),
            record.message,
            record.created_at,
        ],
    )?;
    Ok(record)
}

pub fn get_record(conn: &Connection, id: Uuid) -> Result<ReconciliationRecord, ReconciliationError> {
    let sql = format!("SELECT {} FROM reconciliation_records WHERE id = ?1", RECORD_COLUMNS);
    conn.query_row(&sql, [id.to_string()], ReconciliationRecord::from_row)
        .optional()?
        .ok_or(ReconciliationError::NotFound(id))
}

/// Unresolved records, most severe first, then oldest first.
pub fn list_unresolved(conn: &Connection) -> Result<Vec<ReconciliationRecord>, ReconciliationError> {
    let sql = format!(
        "SELECT {} FROM reconciliation_records WHERE resolved = 0 ORDER BY seq",
        RECORD_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], ReconciliationRecord::from_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    result.sort_by(|a, b| b.severity.cmp(&a.severity));
    Ok(result)
}

/// Manually clear a record. The record itself stays in the table.
pub fn resolve_record(
    tx: &Transaction<'_>,
    id: Uuid,
    actor: &Actor,
    notes: &str,
) -> Result<ReconciliationRecord, ReconciliationError> {
    if notes.trim().is_empty() {
        return Err(ReconciliationError::MissingNotes);
    }
    let current = get_record(tx, id)?;
    if current.resolved {
        return Err(ReconciliationError::AlreadyResolved {
            id,
            resolved_by: current.resolved_by.unwrap_or_default(),
        });
    }
    let now = Utc::now();
    tx.execute(
        "UPDATE reconciliation_records
         SET resolved = 1, resolved_by = ?1, resolution_notes = ?2, resolved_at = ?3
         WHERE id = ?4 AND resolved = 0",
        params![actor.as_str(), notes, now, id.to_string()],
    )?;
    audit::record_critical(
        tx,
        AuditEntry::new(actor, AuditAction::ReconciliationResolved, EntityKind::Reconciliation, id)
            .transition("unresolved", "resolved")
            .with_detail(serde_json::json!({
                "kind": current.kind,
                "related_entity_id": current.related_entity_id,
                "external_tx_ref": current.external_tx_ref,
                "notes": notes,
            })),
    )?;
    info!("Reconciliation record {} resolved by {}", id, actor);
    Ok(ReconciliationRecord {
        resolved: true,
        resolved_by: Some(actor.as_str().to_string()),
        resolution_notes: Some(notes.to_string()),
        resolved_at: Some(now),
        ..current
    })
}

/// Store-level entry points for the reconciliation queue.
pub struct ReconciliationLedger<'a> {
    store: &'a Store,
}

impl<'a> ReconciliationLedger<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Persist a divergence in its own transaction.
    ///
    /// This is the secondary write path used after the primary confirm
    /// transaction rolled back. If it fails too, the divergence is logged at
    /// `error!` with everything needed to reconstruct it by hand.
    pub fn flag(&self, draft: &DivergenceDraft) -> Option<ReconciliationRecord> {
        match self.store.write(|tx| insert_record(tx, draft)) {
            Ok(record) => {
                error!(
                    "Divergence flagged: {} {} entity={} ref={:?} amount={:?}: {}",
                    record.id,
                    record.kind,
                    record.related_entity_id,
                    record.external_tx_ref,
                    record.amount,
                    record.message
                );
                Some(record)
            }
            Err(e) => {
                error!(
                    "UNRECORDED divergence ({}): {} entity={} ref={:?} amount={:?}: {}; write failed: {}",
                    draft.severity,
                    draft.kind,
                    draft.related_entity_id,
                    draft.external_tx_ref,
                    draft.amount,
                    draft.message,
                    e
                );
                None
            }
        }
    }

    pub fn unresolved(&self) -> Result<Vec<ReconciliationRecord>, ReconciliationError> {
        self.store.read(list_unresolved)
    }

    pub fn get(&self, id: Uuid) -> Result<ReconciliationRecord, ReconciliationError> {
        self.store.read(|conn| get_record(conn, id))
    }

    pub fn resolve(
        &self,
        id: Uuid,
        actor: &Actor,
        notes: &str,
    ) -> Result<ReconciliationRecord, ReconciliationError> {
        self.store.write(|tx| resolve_record(tx, id, actor, notes))
    }
}
