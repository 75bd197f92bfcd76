//! Revenue distribution batch.
//!
//! Verified, unprocessed revenue records are split across the destination
//! pools and attributed to holders. Each record is handled in its own
//! `IMMEDIATE` transaction that re-checks `processed` first and marks it in
//! the same unit of work as the rows it produces. A crash mid-batch leaves
//! processed records alone on the next run; a failing record stays
//! unprocessed and the batch moves on.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::allocation::largest_remainder::{self, AllocationError, Claim};
use crate::allocation::split::{RevenueSplit, SplitDestination, SplitLeg};
use crate::config::SettlementConfig;
use crate::core::ids::{Actor, HolderId, ProjectId};
use crate::core::money::{self, MoneyError};
use crate::core::pool::{self, PoolDirection, PoolError};
use crate::core::project::{self, ProjectError};
use crate::error::{ErrorClass, ErrorCode};
use crate::reconciliation::audit::{self, AuditAction, AuditEntry, EntityKind};
use crate::store::codec::{self, UnknownVariant};
use crate::store::{Store, StoreError};

/// How the holder slice of revenue is attributed to individual holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HolderSharePolicy {
    /// Same amount to every holder with a positive balance.
    Equal,
    /// Proportional to token balance.
    #[default]
    TokenWeighted,
}

impl HolderSharePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            HolderSharePolicy::Equal => "equal",
            HolderSharePolicy::TokenWeighted => "token_weighted",
        }
    }
}

impl fmt::Display for HolderSharePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HolderSharePolicy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "equal" => Ok(HolderSharePolicy::Equal),
            "token_weighted" => Ok(HolderSharePolicy::TokenWeighted),
            other => Err(UnknownVariant::new("holder share policy", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum RevenueError {
    #[error("revenue record {0} not found")]
    NotFound(Uuid),
    #[error("revenue record {0} is not verified")]
    NotVerified(Uuid),
    #[error("revenue record {0} was already processed")]
    AlreadyProcessed(Uuid),
    #[error("source reference must not be empty")]
    MissingSourceReference,
    #[error(transparent)]
    Money(#[from] MoneyError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for RevenueError {
    fn from(e: rusqlite::Error) -> Self {
        RevenueError::Store(e.into())
    }
}

impl ErrorCode for RevenueError {
    fn code(&self) -> &'static str {
        match self {
            RevenueError::NotFound(_) => "REVENUE_NOT_FOUND",
            RevenueError::NotVerified(_) => "REVENUE_NOT_VERIFIED",
            RevenueError::AlreadyProcessed(_) => "REVENUE_ALREADY_PROCESSED",
            RevenueError::MissingSourceReference => "VALIDATION_ERROR",
            RevenueError::Money(e) => e.code(),
            RevenueError::Allocation(e) => e.code(),
            RevenueError::Project(e) => e.code(),
            RevenueError::Pool(e) => e.code(),
            RevenueError::Store(e) => e.code(),
        }
    }

    fn class(&self) -> ErrorClass {
        match self {
            RevenueError::NotFound(_) | RevenueError::MissingSourceReference => {
                ErrorClass::Validation
            }
            RevenueError::NotVerified(_) | RevenueError::AlreadyProcessed(_) => {
                ErrorClass::DomainState
            }
            RevenueError::Money(e) => e.class(),
            RevenueError::Allocation(e) => e.class(),
            RevenueError::Project(e) => e.class(),
            RevenueError::Pool(e) => e.class(),
            RevenueError::Store(e) => e.class(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenueRecord {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub amount: Decimal,
    pub source_reference: String,
    pub verified: bool,
    pub processed: bool,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl RevenueRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: codec::uuid(row, 0)?,
            project_id: ProjectId::new(row.get::<_, String>(1)?),
            amount: codec::decimal(row, 2)?,
            source_reference: row.get(3)?,
            verified: row.get(4)?,
            processed: row.get(5)?,
            received_at: row.get(6)?,
            processed_at: row.get(7)?,
        })
    }
}

const REVENUE_COLUMNS: &str =
    "id, project_id, amount, source_reference, verified, processed, received_at, processed_at";

/// One holder's slice of a processed revenue record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HolderRevenueShare {
    pub revenue_record_id: Uuid,
    pub project_id: ProjectId,
    pub holder_id: HolderId,
    pub amount: Decimal,
    pub policy: HolderSharePolicy,
}

pub fn record_revenue(
    tx: &Transaction<'_>,
    project_id: &ProjectId,
    amount: Decimal,
    source_reference: &str,
    scale: u32,
) -> Result<RevenueRecord, RevenueError> {
    if amount <= Decimal::ZERO {
        return Err(MoneyError::NonPositive(amount).into());
    }
    money::to_minor_units(amount, scale)?;
    if source_reference.trim().is_empty() {
        return Err(RevenueError::MissingSourceReference);
    }
    if !project::project_exists(tx, project_id)? {
        return Err(ProjectError::NotFound(project_id.clone()).into());
    }
    let record = RevenueRecord {
        id: Uuid::new_v4(),
        project_id: project_id.clone(),
        amount,
        source_reference: source_reference.to_string(),
        verified: false,
        processed: false,
        received_at: Utc::now(),
        processed_at: None,
    };
    tx.execute(
        "INSERT INTO revenue_records (id, project_id, amount, source_reference, verified, processed, received_at)
         VALUES (?1, ?2, ?3, ?4, 0, 0, ?5)",
        params![
            record.id.to_string(),
            project_id.as_str(),
            codec::money(amount),
            record.source_reference,
            record.received_at,
        ],
    )?;
    debug!("Recorded revenue {} of {} for {}", record.id, amount, project_id);
    Ok(record)
}

pub fn get_revenue(conn: &Connection, id: Uuid) -> Result<RevenueRecord, RevenueError> {
    let sql = format!("SELECT {} FROM revenue_records WHERE id = ?1", REVENUE_COLUMNS);
    conn.query_row(&sql, [id.to_string()], RevenueRecord::from_row)
        .optional()?
        .ok_or(RevenueError::NotFound(id))
}

pub fn verify_revenue(tx: &Transaction<'_>, id: Uuid) -> Result<RevenueRecord, RevenueError> {
    let record = get_revenue(tx, id)?;
    if record.processed {
        return Err(RevenueError::AlreadyProcessed(id));
    }
    tx.execute(
        "UPDATE revenue_records SET verified = 1 WHERE id = ?1",
        [id.to_string()],
    )?;
    Ok(RevenueRecord {
        verified: true,
        ..record
    })
}

/// Verified, unprocessed records in arrival order.
pub fn pending_revenue(conn: &Connection) -> Result<Vec<RevenueRecord>, RevenueError> {
    let sql = format!(
        "SELECT {} FROM revenue_records WHERE verified = 1 AND processed = 0 ORDER BY seq",
        REVENUE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], RevenueRecord::from_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

pub fn holder_shares(
    conn: &Connection,
    revenue_record_id: Uuid,
) -> Result<Vec<HolderRevenueShare>, RevenueError> {
    let mut stmt = conn.prepare(
        "SELECT revenue_record_id, project_id, holder_id, amount, policy
         FROM holder_revenue_shares WHERE revenue_record_id = ?1 ORDER BY holder_id",
    )?;
    let rows = stmt.query_map([revenue_record_id.to_string()], |row| {
        Ok(HolderRevenueShare {
            revenue_record_id: codec::uuid(row, 0)?,
            project_id: ProjectId::new(row.get::<_, String>(1)?),
            holder_id: HolderId::new(row.get::<_, String>(2)?),
            amount: codec::decimal(row, 3)?,
            policy: codec::variant(row, 4)?,
        })
    })?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// Attribute `amount` to holders under `policy`. Holders with a zero
/// balance are not eligible under either policy.
pub fn attribute_to_holders(
    amount: Decimal,
    holdings: &[(HolderId, Decimal)],
    policy: HolderSharePolicy,
    scale: u32,
) -> Result<Vec<(HolderId, Decimal)>, AllocationError> {
    let eligible: Vec<&(HolderId, Decimal)> =
        holdings.iter().filter(|(_, b)| *b > Decimal::ZERO).collect();
    let allocation = match policy {
        HolderSharePolicy::Equal => {
            let ids: Vec<HolderId> = eligible.iter().map(|(h, _)| h.clone()).collect();
            largest_remainder::allocate_equal(amount, &ids, scale)?
        }
        HolderSharePolicy::TokenWeighted => {
            let claims: Vec<Claim> = eligible
                .iter()
                .map(|(h, b)| Claim::new(h.clone(), *b))
                .collect();
            largest_remainder::allocate_pro_rata(amount, &claims, scale)?
        }
    };
    Ok(allocation
        .shares
        .into_iter()
        .map(|s| (s.holder, s.amount))
        .collect())
}

/// What happened to one record inside [`process_revenue`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ProcessOutcome {
    Processed {
        legs: Vec<SplitLeg<SplitDestination>>,
        holder_shares: usize,
    },
    /// Another worker got there first.
    AlreadyProcessed,
}

/// Split and attribute one record inside the caller's transaction.
pub fn process_revenue(
    tx: &Transaction<'_>,
    id: Uuid,
    config: &SettlementConfig,
    actor: &Actor,
) -> Result<ProcessOutcome, RevenueError> {
    let record = get_revenue(tx, id)?;
    if record.processed {
        return Ok(ProcessOutcome::AlreadyProcessed);
    }
    if !record.verified {
        return Err(RevenueError::NotVerified(id));
    }

    let project = project::get_project(tx, &record.project_id)?;
    let split: RevenueSplit = project
        .revenue_split
        .clone()
        .unwrap_or_else(|| config.revenue_split.clone());
    let legs = split.apply(record.amount, config.minor_unit_scale)?;
    let source = format!("revenue:{}", id);

    let mut holder_shares = 0;
    for leg in &legs {
        if leg.amount == Decimal::ZERO {
            continue;
        }
        pool::append_pool_transaction(
            tx,
            leg.key.pool(),
            PoolDirection::Inflow,
            leg.amount,
            Some(&record.project_id),
            &source,
        )?;
        if leg.key != SplitDestination::Holders {
            continue;
        }
        let holdings: Vec<(HolderId, Decimal)> = project::holdings(tx, &record.project_id)?
            .into_iter()
            .map(|h| (h.holder_id, h.balance))
            .collect();
        let shares = match attribute_to_holders(
            leg.amount,
            &holdings,
            config.holder_share_policy,
            config.minor_unit_scale,
        ) {
            Ok(shares) => shares,
            Err(AllocationError::NoEligibleHolders) => {
                info!(
                    "No eligible holders for {}; {} stays in the distribution pool",
                    record.project_id, leg.amount
                );
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        let now = Utc::now();
        for (holder, amount) in &shares {
            tx.execute(
                "INSERT INTO holder_revenue_shares (id, revenue_record_id, project_id, holder_id, amount, policy, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    id.to_string(),
                    record.project_id.as_str(),
                    holder.as_str(),
                    codec::money(*amount),
                    config.holder_share_policy.as_str(),
                    now,
                ],
            )?;
        }
        holder_shares = shares.len();
    }

    let marked = tx.execute(
        "UPDATE revenue_records SET processed = 1, processed_at = ?1 WHERE id = ?2 AND processed = 0",
        params![Utc::now(), id.to_string()],
    )?;
    if marked != 1 {
        return Err(RevenueError::AlreadyProcessed(id));
    }
    audit::record_critical(
        tx,
        AuditEntry::new(actor, AuditAction::RevenueProcessed, EntityKind::Revenue, id)
            .transition("verified", "processed")
            .with_detail(serde_json::json!({
                "amount": record.amount.to_string(),
                "policy": config.holder_share_policy.as_str(),
                "legs": legs
                    .iter()
                    .map(|l| serde_json::json!({ "destination": l.key, "amount": l.amount.to_string() }))
                    .collect::<Vec<_>>(),
                "holder_shares": holder_shares,
            })),
    )?;
    Ok(ProcessOutcome::Processed {
        legs,
        holder_shares,
    })
}

/// Summary of one batch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub scanned: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: Vec<(Uuid, String)>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Revenue Batch ===")?;
        writeln!(f, "Scanned:   {}", self.scanned)?;
        writeln!(f, "Processed: {}", self.processed)?;
        writeln!(f, "Skipped:   {}", self.skipped)?;
        writeln!(f, "Failed:    {}", self.failed.len())?;
        for (id, reason) in &self.failed {
            writeln!(f, "  {}  {}", id, reason)?;
        }
        Ok(())
    }
}

/// Process every verified, unprocessed record.
pub fn run_revenue_batch(
    store: &Store,
    config: &SettlementConfig,
    actor: &Actor,
) -> Result<BatchReport, RevenueError> {
    let pending = store.read(pending_revenue)?;
    let mut report = BatchReport {
        scanned: pending.len(),
        ..Default::default()
    };
    info!("Revenue batch: {} record(s) to process", pending.len());

    for record in pending {
        match store.write(|tx| process_revenue(tx, record.id, config, actor)) {
            Ok(ProcessOutcome::Processed { holder_shares, .. }) => {
                debug!(
                    "Processed revenue {} ({} holder shares)",
                    record.id, holder_shares
                );
                report.processed += 1;
            }
            Ok(ProcessOutcome::AlreadyProcessed) => report.skipped += 1,
            Err(e) => {
                warn!("Revenue record {} left unprocessed: {}", record.id, e);
                report.failed.push((record.id, e.to_string()));
            }
        }
    }
    info!(
        "Revenue batch done: {} processed, {} skipped, {} failed",
        report.processed,
        report.skipped,
        report.failed.len()
    );
    Ok(report)
}

/// Store-level entry points for the revenue feed.
pub struct RevenueLedger<'a> {
    store: &'a Store,
    scale: u32,
}

impl<'a> RevenueLedger<'a> {
    pub fn new(store: &'a Store, scale: u32) -> Self {
        Self { store, scale }
    }

    pub fn record(
        &self,
        project_id: &ProjectId,
        amount: Decimal,
        source_reference: &str,
    ) -> Result<RevenueRecord, RevenueError> {
        self.store
            .write(|tx| record_revenue(tx, project_id, amount, source_reference, self.scale))
    }

    pub fn verify(&self, id: Uuid) -> Result<RevenueRecord, RevenueError> {
        self.store.write(|tx| verify_revenue(tx, id))
    }

    pub fn get(&self, id: Uuid) -> Result<RevenueRecord, RevenueError> {
        self.store.read(|conn| get_revenue(conn, id))
    }

    pub fn holder_shares(&self, id: Uuid) -> Result<Vec<HolderRevenueShare>, RevenueError> {
        self.store.read(|conn| holder_shares(conn, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pool::PoolType;
    use rust_decimal_macros::dec;

    fn setup(holders: &[(&str, Decimal)]) -> (Store, ProjectId) {
        let store = Store::open_in_memory().unwrap();
        let id = ProjectId::new("PRJ-REV");
        store
            .write(|tx| -> Result<(), ProjectError> {
                project::register_project(tx, &id, "Revenue", Decimal::ZERO, None)?;
                for (holder, tokens) in holders {
                    project::issue_tokens(tx, &id, &HolderId::new(*holder), *tokens)?;
                }
                Ok(())
            })
            .unwrap();
        (store, id)
    }

    #[test]
    fn test_unverified_records_are_not_processed() {
        let (store, id) = setup(&[("alice", dec!(100))]);
        let config = SettlementConfig::default();
        let ledger = RevenueLedger::new(&store, 2);
        ledger.record(&id, dec!(1000), "bank:001").unwrap();

        let report = run_revenue_batch(&store, &config, &Actor::system("test")).unwrap();
        assert_eq!(report.scanned, 0);
    }

    #[test]
    fn test_batch_splits_and_attributes() {
        let (store, id) = setup(&[("alice", dec!(300)), ("bob", dec!(700))]);
        let config = SettlementConfig::default();
        let ledger = RevenueLedger::new(&store, 2);
        let record = ledger.record(&id, dec!(1000), "bank:001").unwrap();
        ledger.verify(record.id).unwrap();

        let report = run_revenue_batch(&store, &config, &Actor::system("test")).unwrap();
        assert_eq!(report.processed, 1);
        assert!(report.is_clean());

        let shares = ledger.holder_shares(record.id).unwrap();
        assert_eq!(shares.len(), 2);
        assert_eq!(shares[0].amount, dec!(210));
        assert_eq!(shares[1].amount, dec!(490));

        let treasury = store
            .read(|conn| pool::pool_balance(conn, PoolType::Treasury, None))
            .unwrap();
        assert_eq!(treasury, dec!(150));
        assert!(ledger.get(record.id).unwrap().processed);

        let again = run_revenue_batch(&store, &config, &Actor::system("test")).unwrap();
        assert_eq!(again.scanned, 0);
    }

    #[test]
    fn test_equal_policy() {
        let shares = attribute_to_holders(
            dec!(100),
            &[
                (HolderId::new("a"), dec!(1)),
                (HolderId::new("b"), dec!(999)),
                (HolderId::new("c"), dec!(0)),
            ],
            HolderSharePolicy::Equal,
            2,
        )
        .unwrap();
        assert_eq!(shares.len(), 2);
        assert_eq!(shares[0].1, dec!(50));
        assert_eq!(shares[1].1, dec!(50));
    }

    #[test]
    fn test_no_holders_keeps_money_in_distribution_pool() {
        let (store, id) = setup(&[]);
        let config = SettlementConfig::default();
        let ledger = RevenueLedger::new(&store, 2);
        let record = ledger.record(&id, dec!(100), "bank:002").unwrap();
        ledger.verify(record.id).unwrap();

        let report = run_revenue_batch(&store, &config, &Actor::system("test")).unwrap();
        assert_eq!(report.processed, 1);
        assert!(ledger.holder_shares(record.id).unwrap().is_empty());
        let distribution = store
            .read(|conn| pool::pool_balance(conn, PoolType::Distribution, None))
            .unwrap();
        assert_eq!(distribution, dec!(70));
    }

    #[test]
    fn test_rejects_sub_minor_unit_amount() {
        let (store, id) = setup(&[]);
        let ledger = RevenueLedger::new(&store, 2);
        assert!(matches!(
            ledger.record(&id, dec!(10.001), "bank:003"),
            Err(RevenueError::Money(MoneyError::PrecisionExceeded { .. }))
        ));
    }
}
