//! Compliance audit trail.
//!
//! Two write paths feed the same `audit_log` table:
//!
//! - **critical** entries (disbursement, allocation, cancellation, funding,
//!   payout) go through [`record_critical`] inside the transaction that
//!   performs the transition, so the entry and the transition commit or roll
//!   back together;
//! - **informational** entries (creation, submission, staging) go through the
//!   [`AuditQueue`] background worker, which never blocks the caller and
//!   delivers at least once. Inserts are keyed by entry id, so a redelivered
//!   entry is ignored rather than duplicated.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rusqlite::{params, Connection, Row, Transaction};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::ids::Actor;
use crate::store::codec::{self, UnknownVariant};
use crate::store::{Store, StoreError};

/// Every state-changing action the core records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ProjectRegistered,
    TokensIssued,
    NavRecorded,
    WalletStaged,
    WalletFunded,
    MilestoneCreated,
    MilestoneSubmitted,
    MilestoneApproved,
    MilestoneRejected,
    BankTransferAttached,
    DisbursementStaged,
    MilestoneDisbursed,
    CapitalAllocationStaged,
    CapitalAllocated,
    DistributionCreated,
    DistributionCalculated,
    DistributionActivated,
    DistributionCompleted,
    DistributionCancelled,
    AllocationWithdrawn,
    RevenueRecorded,
    RevenueVerified,
    RevenueProcessed,
    RedemptionRequested,
    RedemptionStaged,
    RedemptionCancelled,
    RedemptionPaid,
    SettlementReleased,
    SettlementDivergent,
    ReconciliationResolved,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::ProjectRegistered => "project_registered",
            AuditAction::TokensIssued => "tokens_issued",
            AuditAction::NavRecorded => "nav_recorded",
            AuditAction::WalletStaged => "wallet_staged",
            AuditAction::WalletFunded => "wallet_funded",
            AuditAction::MilestoneCreated => "milestone_created",
            AuditAction::MilestoneSubmitted => "milestone_submitted",
            AuditAction::MilestoneApproved => "milestone_approved",
            AuditAction::MilestoneRejected => "milestone_rejected",
            AuditAction::BankTransferAttached => "bank_transfer_attached",
            AuditAction::DisbursementStaged => "disbursement_staged",
            AuditAction::MilestoneDisbursed => "milestone_disbursed",
            AuditAction::CapitalAllocationStaged => "capital_allocation_staged",
            AuditAction::CapitalAllocated => "capital_allocated",
            AuditAction::DistributionCreated => "distribution_created",
            AuditAction::DistributionCalculated => "distribution_calculated",
            AuditAction::DistributionActivated => "distribution_activated",
            AuditAction::DistributionCompleted => "distribution_completed",
            AuditAction::DistributionCancelled => "distribution_cancelled",
            AuditAction::AllocationWithdrawn => "allocation_withdrawn",
            AuditAction::RevenueRecorded => "revenue_recorded",
            AuditAction::RevenueVerified => "revenue_verified",
            AuditAction::RevenueProcessed => "revenue_processed",
            AuditAction::RedemptionRequested => "redemption_requested",
            AuditAction::RedemptionStaged => "redemption_staged",
            AuditAction::RedemptionCancelled => "redemption_cancelled",
            AuditAction::RedemptionPaid => "redemption_paid",
            AuditAction::SettlementReleased => "settlement_released",
            AuditAction::SettlementDivergent => "settlement_divergent",
            AuditAction::ReconciliationResolved => "reconciliation_resolved",
        }
    }

    /// Whether the action must be written in the same transaction as the
    /// transition it describes.
    pub fn is_critical(self) -> bool {
        match self {
            AuditAction::WalletFunded
            | AuditAction::MilestoneDisbursed
            | AuditAction::CapitalAllocated
            | AuditAction::DistributionCalculated
            | AuditAction::DistributionCancelled
            | AuditAction::AllocationWithdrawn
            | AuditAction::RevenueProcessed
            | AuditAction::RedemptionPaid
            | AuditAction::RedemptionCancelled
            | AuditAction::NavRecorded
            | AuditAction::SettlementReleased
            | AuditAction::SettlementDivergent
            | AuditAction::ReconciliationResolved => true,
            AuditAction::ProjectRegistered
            | AuditAction::TokensIssued
            | AuditAction::WalletStaged
            | AuditAction::MilestoneCreated
            | AuditAction::MilestoneSubmitted
            | AuditAction::MilestoneApproved
            | AuditAction::MilestoneRejected
            | AuditAction::BankTransferAttached
            | AuditAction::DisbursementStaged
            | AuditAction::CapitalAllocationStaged
            | AuditAction::DistributionCreated
            | AuditAction::DistributionActivated
            | AuditAction::DistributionCompleted
            | AuditAction::RevenueRecorded
            | AuditAction::RevenueVerified
            | AuditAction::RedemptionRequested
            | AuditAction::RedemptionStaged => false,
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [AuditAction; 30] = [
            AuditAction::ProjectRegistered,
            AuditAction::TokensIssued,
            AuditAction::NavRecorded,
            AuditAction::WalletStaged,
            AuditAction::WalletFunded,
            AuditAction::MilestoneCreated,
            AuditAction::MilestoneSubmitted,
            AuditAction::MilestoneApproved,
            AuditAction::MilestoneRejected,
            AuditAction::BankTransferAttached,
            AuditAction::DisbursementStaged,
            AuditAction::MilestoneDisbursed,
            AuditAction::CapitalAllocationStaged,
            AuditAction::CapitalAllocated,
            AuditAction::DistributionCreated,
            AuditAction::DistributionCalculated,
            AuditAction::DistributionActivated,
            AuditAction::DistributionCompleted,
            AuditAction::DistributionCancelled,
            AuditAction::AllocationWithdrawn,
            AuditAction::RevenueRecorded,
            AuditAction::RevenueVerified,
            AuditAction::RevenueProcessed,
            AuditAction::RedemptionRequested,
            AuditAction::RedemptionStaged,
            AuditAction::RedemptionCancelled,
            AuditAction::RedemptionPaid,
            AuditAction::SettlementReleased,
            AuditAction::SettlementDivergent,
            AuditAction::ReconciliationResolved,
        ];
        ALL.into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("audit action", s))
    }
}

/// Kind of entity an audit entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Nav,
    Wallet,
    Milestone,
    CapitalAllocation,
    Distribution,
    DistributionAllocation,
    Revenue,
    Redemption,
    Reconciliation,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Nav => "nav",
            EntityKind::Wallet => "wallet",
            EntityKind::Milestone => "milestone",
            EntityKind::CapitalAllocation => "capital_allocation",
            EntityKind::Distribution => "distribution",
            EntityKind::DistributionAllocation => "distribution_allocation",
            EntityKind::Revenue => "revenue",
            EntityKind::Redemption => "redemption",
            EntityKind::Reconciliation => "reconciliation",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(EntityKind::Project),
            "nav" => Ok(EntityKind::Nav),
            "wallet" => Ok(EntityKind::Wallet),
            "milestone" => Ok(EntityKind::Milestone),
            "capital_allocation" => Ok(EntityKind::CapitalAllocation),
            "distribution" => Ok(EntityKind::Distribution),
            "distribution_allocation" => Ok(EntityKind::DistributionAllocation),
            "revenue" => Ok(EntityKind::Revenue),
            "redemption" => Ok(EntityKind::Redemption),
            "reconciliation" => Ok(EntityKind::Reconciliation),
            other => Err(UnknownVariant::new("entity kind", other)),
        }
    }
}

/// One row of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor: Actor,
    pub action: AuditAction,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub before_status: Option<String>,
    pub after_status: Option<String>,
    pub detail: serde_json::Value,
    pub critical: bool,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        actor: &Actor,
        action: AuditAction,
        entity_kind: EntityKind,
        entity_id: impl fmt::Display,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor: actor.clone(),
            action,
            entity_kind,
            entity_id: entity_id.to_string(),
            before_status: None,
            after_status: None,
            detail: serde_json::Value::Null,
            critical: action.is_critical(),
            created_at: Utc::now(),
        }
    }

    pub fn transition(mut self, before: impl fmt::Display, after: impl fmt::Display) -> Self {
        self.before_status = Some(before.to_string());
        self.after_status = Some(after.to_string());
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let detail: String = row.get(7)?;
        Ok(Self {
            id: codec::uuid(row, 0)?,
            actor: Actor::new(row.get::<_, String>(1)?),
            action: codec::variant(row, 2)?,
            entity_kind: codec::variant(row, 3)?,
            entity_id: row.get(4)?,
            before_status: row.get(5)?,
            after_status: row.get(6)?,
            detail: serde_json::from_str(&detail).unwrap_or(serde_json::Value::String(detail)),
            critical: row.get(8)?,
            created_at: row.get(9)?,
        })
    }
}

pub(crate) fn insert_entry(conn: &Connection, entry: &AuditEntry) -> Result<bool, StoreError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO audit_log
            (id, actor, action, entity_kind, entity_id, before_status, after_status, detail, critical, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            entry.id.to_string(),
            entry.actor.as_str(),
            entry.action.as_str(),
            entry.entity_kind.as_str(),
            entry.entity_id,
            entry.before_status,
            entry.after_status,
            serde_json::to_string(&entry.detail)?,
            entry.critical,
            entry.created_at,
        ],
    )?;
    Ok(inserted == 1)
}

/// Write a critical entry as part of the caller's transaction.
pub fn record_critical(tx: &Transaction<'_>, mut entry: AuditEntry) -> Result<(), StoreError> {
    entry.critical = true;
    insert_entry(tx, &entry)?;
    Ok(())
}

/// Audit history of one entity, oldest first.
pub fn entries_for(
    conn: &Connection,
    kind: EntityKind,
    entity_id: &str,
) -> Result<Vec<AuditEntry>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, actor, action, entity_kind, entity_id, before_status, after_status, detail, critical, created_at
         FROM audit_log WHERE entity_kind = ?1 AND entity_id = ?2 ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![kind.as_str(), entity_id], AuditEntry::from_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// Retry policy of the background audit worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditQueueConfig {
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for AuditQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_backoff_ms: 50,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time view of the worker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AuditQueueStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub retried: u64,
    /// Entries dropped after exhausting every attempt.
    pub failed: u64,
}

/// Background worker for informational audit entries.
///
/// `enqueue` never blocks and never fails the caller. Dropping the queue
/// (or calling [`AuditQueue::shutdown`]) drains what was already enqueued
/// before the worker thread exits.
pub struct AuditQueue {
    sender: Option<Sender<AuditEntry>>,
    worker: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl AuditQueue {
    pub fn start(store: Arc<Store>, config: AuditQueueConfig) -> Self {
        let (sender, receiver) = mpsc::channel::<AuditEntry>();
        let counters = Arc::new(Counters::default());
        let worker_counters = Arc::clone(&counters);
        let worker = thread::Builder::new()
            .name("audit-writer".to_string())
            .spawn(move || run_worker(store, receiver, worker_counters, config));

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Failed to start audit worker: {}", e);
                None
            }
        };
        Self {
            sender: worker.as_ref().map(|_| sender),
            worker,
            counters,
        }
    }

    pub fn enqueue(&self, mut entry: AuditEntry) {
        entry.critical = false;
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        let sent = match &self.sender {
            Some(sender) => sender.send(entry).map_err(|e| e.0),
            None => Err(entry),
        };
        if let Err(entry) = sent {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Audit worker unavailable, dropped {} for {} {}",
                entry.action, entry.entity_kind, entry.entity_id
            );
        }
    }

    pub fn stats(&self) -> AuditQueueStats {
        AuditQueueStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Drain the queue, stop the worker and return the final counters.
    pub fn shutdown(mut self) -> AuditQueueStats {
        self.stop();
        self.stats()
    }

    fn stop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("Audit worker panicked");
            }
        }
    }
}

impl Drop for AuditQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(
    store: Arc<Store>,
    receiver: Receiver<AuditEntry>,
    counters: Arc<Counters>,
    config: AuditQueueConfig,
) {
    debug!("Audit worker started");
    for entry in receiver {
        let mut attempt = 1;
        loop {
            match store.write(|tx| insert_entry(tx, &entry)) {
                Ok(inserted) => {
                    if !inserted {
                        debug!("Audit entry {} already delivered", entry.id);
                    }
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(e) if attempt < config.max_attempts => {
                    counters.retried.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Audit write for {} failed (attempt {}/{}): {}",
                        entry.id, attempt, config.max_attempts, e
                    );
                    thread::sleep(Duration::from_millis(
                        config.retry_backoff_ms.saturating_mul(u64::from(attempt)),
                    ));
                    attempt += 1;
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Dropping audit entry {} ({} {} {}) after {} attempts: {}",
                        entry.id, entry.action, entry.entity_kind, entry.entity_id, attempt, e
                    );
                    break;
                }
            }
        }
    }
    info!("Audit worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_round_trip() {
        for action in [
            AuditAction::MilestoneDisbursed,
            AuditAction::WalletStaged,
            AuditAction::ReconciliationResolved,
        ] {
            assert_eq!(action.as_str().parse::<AuditAction>().unwrap(), action);
        }
        assert!("teleported".parse::<AuditAction>().is_err());
    }

    #[test]
    fn test_critical_entry_commits_with_transaction() {
        let store = Store::open_in_memory().unwrap();
        let actor = Actor::new("admin:ops");
        let entry = AuditEntry::new(&actor, AuditAction::MilestoneDisbursed, EntityKind::Milestone, "m-1")
            .transition("approved", "disbursed")
            .with_detail(serde_json::json!({ "burned": "500" }));
        store.write(|tx| record_critical(tx, entry)).unwrap();

        let entries = store
            .read(|conn| entries_for(conn, EntityKind::Milestone, "m-1"))
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].critical);
        assert_eq!(entries[0].after_status.as_deref(), Some("disbursed"));
        assert_eq!(entries[0].detail["burned"], "500");
    }

    #[test]
    fn test_critical_entry_rolls_back_with_transaction() {
        let store = Store::open_in_memory().unwrap();
        let actor = Actor::new("admin:ops");
        let result: Result<(), StoreError> = store.write(|tx| {
            record_critical(
                tx,
                AuditEntry::new(&actor, AuditAction::CapitalAllocated, EntityKind::CapitalAllocation, "c-1"),
            )?;
            Err(StoreError::LockPoisoned)
        });
        assert!(result.is_err());
        let entries = store
            .read(|conn| entries_for(conn, EntityKind::CapitalAllocation, "c-1"))
            .unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_queue_delivers_on_shutdown() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let queue = AuditQueue::start(Arc::clone(&store), AuditQueueConfig::default());
        let actor = Actor::system("test");
        for i in 0..10 {
            queue.enqueue(AuditEntry::new(
                &actor,
                AuditAction::MilestoneCreated,
                EntityKind::Milestone,
                format!("m-{}", i),
            ));
        }
        let stats = queue.shutdown();
        assert_eq!(stats.enqueued, 10);
        assert_eq!(stats.delivered, 10);
        assert_eq!(stats.failed, 0);

        let entries = store
            .read(|conn| entries_for(conn, EntityKind::Milestone, "m-3"))
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].critical);
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let entry = AuditEntry::new(
            &Actor::system("test"),
            AuditAction::RevenueRecorded,
            EntityKind::Revenue,
            "r-1",
        );
        assert!(store.write(|tx| insert_entry(tx, &entry)).unwrap());
        assert!(!store.write(|tx| insert_entry(tx, &entry)).unwrap());
        let entries = store
            .read(|conn| entries_for(conn, EntityKind::Revenue, "r-1"))
            .unwrap();
        assert_eq!(entries.len(), 1);
    }
}
