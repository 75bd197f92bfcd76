//! Distribution events: a fixed total paid out pro rata to token holders.
//!
//! ```text
//! draft --calculate--> calculated --activate--> active --complete--> completed
//!   |                      |                      (automatic once fully withdrawn)
//!   +------cancel----------+--> cancelled
//! ```
//!
//! Calculation snapshots holdings and the active NAV and writes one
//! allocation row per holder in the same transaction. The rows always add up
//! to the event total exactly.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use log::info;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::allocation::largest_remainder::{self, AllocationError, Claim};
use crate::core::ids::{Actor, HolderId, ProjectId};
use crate::core::money::{self, MoneyError};
use crate::core::nav::{self, NavError};
use crate::core::project::{self, ProjectError};
use crate::error::{ErrorClass, ErrorCode};
use crate::reconciliation::audit::{self, AuditAction, AuditEntry, EntityKind};
use crate::store::codec::{self, UnknownVariant};
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStatus {
    Draft,
    Calculated,
    Active,
    Completed,
    Cancelled,
}

impl DistributionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DistributionStatus::Draft => "draft",
            DistributionStatus::Calculated => "calculated",
            DistributionStatus::Active => "active",
            DistributionStatus::Completed => "completed",
            DistributionStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_transition_to(self, next: DistributionStatus) -> bool {
        matches!(
            (self, next),
            (DistributionStatus::Draft, DistributionStatus::Calculated)
                | (DistributionStatus::Draft, DistributionStatus::Cancelled)
                | (DistributionStatus::Calculated, DistributionStatus::Active)
                | (DistributionStatus::Calculated, DistributionStatus::Cancelled)
                | (DistributionStatus::Active, DistributionStatus::Completed)
        )
    }
}

impl fmt::Display for DistributionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistributionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(DistributionStatus::Draft),
            "calculated" => Ok(DistributionStatus::Calculated),
            "active" => Ok(DistributionStatus::Active),
            "completed" => Ok(DistributionStatus::Completed),
            "cancelled" => Ok(DistributionStatus::Cancelled),
            other => Err(UnknownVariant::new("distribution status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Calculated,
    Available,
    Withdrawn,
    Cancelled,
}

impl AllocationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AllocationStatus::Calculated => "calculated",
            AllocationStatus::Available => "available",
            AllocationStatus::Withdrawn => "withdrawn",
            AllocationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "calculated" => Ok(AllocationStatus::Calculated),
            "available" => Ok(AllocationStatus::Available),
            "withdrawn" => Ok(AllocationStatus::Withdrawn),
            "cancelled" => Ok(AllocationStatus::Cancelled),
            other => Err(UnknownVariant::new("allocation status", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("distribution {0} not found")]
    NotFound(Uuid),
    #[error("holder {holder} has no allocation in distribution {event}")]
    AllocationNotFound { event: Uuid, holder: HolderId },
    #[error("distribution {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: DistributionStatus,
        to: DistributionStatus,
    },
    #[error("amount must be positive, got {0}")]
    InvalidAmount(Decimal),
    #[error("holder {holder} has {available} available, {requested} requested")]
    ExceedsAvailable {
        holder: HolderId,
        available: Decimal,
        requested: Decimal,
    },
    #[error("allocation of {holder} is {status}, not available")]
    NotWithdrawable {
        holder: HolderId,
        status: AllocationStatus,
    },
    #[error(transparent)]
    Money(#[from] MoneyError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Nav(#[from] NavError),
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for DistributionError {
    fn from(e: rusqlite::Error) -> Self {
        DistributionError::Store(e.into())
    }
}

impl ErrorCode for DistributionError {
    fn code(&self) -> &'static str {
        match self {
            DistributionError::NotFound(_) => "DISTRIBUTION_NOT_FOUND",
            DistributionError::AllocationNotFound { .. } => "ALLOCATION_NOT_FOUND",
            DistributionError::InvalidTransition { .. } => "INVALID_TRANSITION",
            DistributionError::InvalidAmount(_) => "INVALID_AMOUNT",
            DistributionError::ExceedsAvailable { .. } => "EXCEEDS_AVAILABLE",
            DistributionError::NotWithdrawable { .. } => "NOT_WITHDRAWABLE",
            DistributionError::Money(e) => e.code(),
            DistributionError::Allocation(e) => e.code(),
            DistributionError::Nav(e) => e.code(),
            DistributionError::Project(e) => e.code(),
            DistributionError::Store(e) => e.code(),
        }
    }

    fn class(&self) -> ErrorClass {
        match self {
            DistributionError::NotFound(_)
            | DistributionError::AllocationNotFound { .. }
            | DistributionError::InvalidAmount(_) => ErrorClass::Validation,
            DistributionError::InvalidTransition { .. }
            | DistributionError::ExceedsAvailable { .. }
            | DistributionError::NotWithdrawable { .. } => ErrorClass::DomainState,
            DistributionError::Money(e) => e.class(),
            DistributionError::Allocation(e) => e.class(),
            DistributionError::Nav(e) => e.class(),
            DistributionError::Project(e) => e.class(),
            DistributionError::Store(e) => e.class(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionEvent {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub total_amount: Decimal,
    pub status: DistributionStatus,
    /// Sum of holder balances frozen at calculation.
    pub snapshot_total_weight: Option<Decimal>,
    /// Active NAV per token at calculation.
    pub snapshot_nav: Option<Decimal>,
    pub total_allocated: Decimal,
    pub total_withdrawn: Decimal,
    pub created_at: DateTime<Utc>,
    pub calculated_at: Option<DateTime<Utc>>,
}

impl DistributionEvent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: codec::uuid(row, 0)?,
            project_id: ProjectId::new(row.get::<_, String>(1)?),
            total_amount: codec::decimal(row, 2)?,
            status: codec::variant(row, 3)?,
            snapshot_total_weight: codec::opt_decimal(row, 4)?,
            snapshot_nav: codec::opt_decimal(row, 5)?,
            total_allocated: codec::decimal(row, 6)?,
            total_withdrawn: codec::decimal(row, 7)?,
            created_at: row.get(8)?,
            calculated_at: row.get(9)?,
        })
    }

    fn require(&self, next: DistributionStatus) -> Result<(), DistributionError> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(DistributionError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionAllocation {
    pub id: Uuid,
    pub distribution_event_id: Uuid,
    pub project_id: ProjectId,
    pub holder_id: HolderId,
    pub weight_held: Decimal,
    pub ownership_percentage: Decimal,
    pub allocated_amount: Decimal,
    pub available_amount: Decimal,
    pub status: AllocationStatus,
}

impl DistributionAllocation {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: codec::uuid(row, 0)?,
            distribution_event_id: codec::uuid(row, 1)?,
            project_id: ProjectId::new(row.get::<_, String>(2)?),
            holder_id: HolderId::new(row.get::<_, String>(3)?),
            weight_held: codec::decimal(row, 4)?,
            ownership_percentage: codec::decimal(row, 5)?,
            allocated_amount: codec::decimal(row, 6)?,
            available_amount: codec::decimal(row, 7)?,
            status: codec::variant(row, 8)?,
        })
    }
}

impl fmt::Display for DistributionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Distribution {} ===", self.id)?;
        writeln!(f, "Project:   {}", self.project_id)?;
        writeln!(f, "Status:    {}", self.status)?;
        writeln!(f, "Total:     {}", self.total_amount)?;
        writeln!(f, "Allocated: {}", self.total_allocated)?;
        writeln!(f, "Withdrawn: {}", self.total_withdrawn)?;
        if let Some(nav) = self.snapshot_nav {
            writeln!(f, "NAV:       {}", nav)?;
        }
        Ok(())
    }
}

const EVENT_COLUMNS: &str = "id, project_id, total_amount, status, snapshot_total_weight, snapshot_nav, \
     total_allocated, total_withdrawn, created_at, calculated_at";

const ALLOCATION_COLUMNS: &str = "id, distribution_event_id, project_id, holder_id, weight_held, \
     ownership_percentage, allocated_amount, available_amount, status";

pub fn get_distribution(conn: &Connection, id: Uuid) -> Result<DistributionEvent, DistributionError> {
    let sql = format!("SELECT {} FROM distribution_events WHERE id = ?1", EVENT_COLUMNS);
    conn.query_row(&sql, [id.to_string()], DistributionEvent::from_row)
        .optional()?
        .ok_or(DistributionError::NotFound(id))
}

/// Allocation rows of an event, ordered by holder id.
pub fn allocations_for(conn: &Connection, event_id: Uuid) -> Result<Vec<DistributionAllocation>, DistributionError> {
    let sql = format!(
        "SELECT {} FROM distribution_allocations WHERE distribution_event_id = ?1 ORDER BY holder_id",
        ALLOCATION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([event_id.to_string()], DistributionAllocation::from_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

fn set_status(
    tx: &Transaction<'_>,
    event: &DistributionEvent,
    next: DistributionStatus,
) -> Result<(), DistributionError> {
    event.require(next)?;
    let updated = tx.execute(
        "UPDATE distribution_events SET status = ?1 WHERE id = ?2 AND status = ?3",
        params![next.as_str(), event.id.to_string(), event.status.as_str()],
    )?;
    if updated == 0 {
        return Err(DistributionError::InvalidTransition {
            id: event.id,
            from: event.status,
            to: next,
        });
    }
    Ok(())
}

pub fn create_distribution(
    tx: &Transaction<'_>,
    project_id: &ProjectId,
    total_amount: Decimal,
    scale: u32,
    actor: &Actor,
) -> Result<DistributionEvent, DistributionError> {
    if total_amount <= Decimal::ZERO {
        return Err(DistributionError::InvalidAmount(total_amount));
    }
    money::to_minor_units(total_amount, scale)?;
    project::get_project(tx, project_id)?;

    let event = DistributionEvent {
        id: Uuid::new_v4(),
        project_id: project_id.clone(),
        total_amount,
        status: DistributionStatus::Draft,
        snapshot_total_weight: None,
        snapshot_nav: None,
        total_allocated: Decimal::ZERO,
        total_withdrawn: Decimal::ZERO,
        created_at: Utc::now(),
        calculated_at: None,
    };
    tx.execute(
        "INSERT INTO distribution_events
            (id, project_id, total_amount, status, total_allocated, total_withdrawn, created_at)
         VALUES (?1, ?2, ?3, ?4, '0', '0', ?5)",
        params![
            event.id.to_string(),
            project_id.as_str(),
            codec::money(total_amount),
            event.status.as_str(),
            event.created_at,
        ],
    )?;
    audit::insert_entry(
        tx,
        &AuditEntry::new(actor, AuditAction::DistributionCreated, EntityKind::Distribution, event.id)
            .with_detail(serde_json::json!({ "project_id": project_id, "total_amount": total_amount })),
    )?;
    Ok(event)
}

/// Snapshot holdings and NAV, compute the allocations and freeze them.
pub fn calculate_distribution(
    tx: &Transaction<'_>,
    id: Uuid,
    scale: u32,
    actor: &Actor,
) -> Result<DistributionEvent, DistributionError> {
    let event = get_distribution(tx, id)?;
    event.require(DistributionStatus::Calculated)?;

    let active = nav::active_nav(tx, &event.project_id)?;
    let claims: Vec<Claim> = project::holdings(tx, &event.project_id)?
        .into_iter()
        .map(|h| Claim::new(h.holder_id, h.balance))
        .collect();
    let allocation = largest_remainder::allocate_pro_rata(event.total_amount, &claims, scale)?;

    for share in &allocation.shares {
        tx.execute(
            "INSERT INTO distribution_allocations
                (id, distribution_event_id, project_id, holder_id, weight_held, ownership_percentage,
                 allocated_amount, available_amount, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8)",
            params![
                Uuid::new_v4().to_string(),
                id.to_string(),
                event.project_id.as_str(),
                share.holder.as_str(),
                codec::money(share.weight),
                codec::money(share.ownership_percentage),
                codec::money(share.amount),
                AllocationStatus::Calculated.as_str(),
            ],
        )?;
    }

    let total_allocated = allocation.allocated_total();
    let now = Utc::now();
    set_status(tx, &event, DistributionStatus::Calculated)?;
    tx.execute(
        "UPDATE distribution_events
         SET snapshot_total_weight = ?1, snapshot_nav = ?2, total_allocated = ?3, calculated_at = ?4
         WHERE id = ?5",
        params![
            codec::money(allocation.total_weight),
            codec::money(active.value_per_token),
            codec::money(total_allocated),
            now,
            id.to_string(),
        ],
    )?;
    audit::record_critical(
        tx,
        AuditEntry::new(actor, AuditAction::DistributionCalculated, EntityKind::Distribution, id)
            .transition(DistributionStatus::Draft, DistributionStatus::Calculated)
            .with_detail(serde_json::json!({
                "holders": allocation.shares.len(),
                "total_weight": allocation.total_weight,
                "snapshot_nav": active.value_per_token,
                "leftover_units": allocation.leftover_units.to_string(),
                "total_allocated": total_allocated,
            })),
    )?;
    info!(
        "Distribution {} calculated: {} across {} holder(s)",
        id,
        total_allocated,
        allocation.shares.len()
    );
    get_distribution(tx, id)
}

/// Make calculated allocations withdrawable.
pub fn activate_distribution(
    tx: &Transaction<'_>,
    id: Uuid,
    actor: &Actor,
) -> Result<DistributionEvent, DistributionError> {
    let event = get_distribution(tx, id)?;
    set_status(tx, &event, DistributionStatus::Active)?;
    tx.execute(
        "UPDATE distribution_allocations SET status = ?1 WHERE distribution_event_id = ?2 AND status = ?3",
        params![
            AllocationStatus::Available.as_str(),
            id.to_string(),
            AllocationStatus::Calculated.as_str(),
        ],
    )?;
    audit::insert_entry(
        tx,
        &AuditEntry::new(actor, AuditAction::DistributionActivated, EntityKind::Distribution, id)
            .transition(DistributionStatus::Calculated, DistributionStatus::Active),
    )?;
    get_distribution(tx, id)
}

/// Record a holder withdrawing part of their allocation. Completes the
/// event once everything allocated has been withdrawn.
pub fn record_withdrawal(
    tx: &Transaction<'_>,
    id: Uuid,
    holder: &HolderId,
    amount: Decimal,
    actor: &Actor,
) -> Result<DistributionAllocation, DistributionError> {
    if amount <= Decimal::ZERO {
        return Err(DistributionError::InvalidAmount(amount));
    }
    let event = get_distribution(tx, id)?;
    if event.status != DistributionStatus::Active {
        return Err(DistributionError::InvalidTransition {
            id,
            from: event.status,
            to: DistributionStatus::Completed,
        });
    }
    let sql = format!(
        "SELECT {} FROM distribution_allocations WHERE distribution_event_id = ?1 AND holder_id = ?2",
        ALLOCATION_COLUMNS
    );
    let allocation = tx
        .query_row(&sql, [id.to_string(), holder.as_str().to_string()], DistributionAllocation::from_row)
        .optional()?
        .ok_or_else(|| DistributionError::AllocationNotFound {
            event: id,
            holder: holder.clone(),
        })?;
    if allocation.status != AllocationStatus::Available {
        return Err(DistributionError::NotWithdrawable {
            holder: holder.clone(),
            status: allocation.status,
        });
    }
    if amount > allocation.available_amount {
        return Err(DistributionError::ExceedsAvailable {
            holder: holder.clone(),
            available: allocation.available_amount,
            requested: amount,
        });
    }

    let remaining = allocation.available_amount - amount;
    let status = if remaining == Decimal::ZERO {
        AllocationStatus::Withdrawn
    } else {
        AllocationStatus::Available
    };
    tx.execute(
        "UPDATE distribution_allocations SET available_amount = ?1, status = ?2 WHERE id = ?3",
        params![codec::money(remaining), status.as_str(), allocation.id.to_string()],
    )?;
    let total_withdrawn = event.total_withdrawn + amount;
    tx.execute(
        "UPDATE distribution_events SET total_withdrawn = ?1 WHERE id = ?2",
        params![codec::money(total_withdrawn), id.to_string()],
    )?;
    audit::record_critical(
        tx,
        AuditEntry::new(
            actor,
            AuditAction::AllocationWithdrawn,
            EntityKind::DistributionAllocation,
            allocation.id,
        )
        .transition(allocation.status, status)
        .with_detail(serde_json::json!({
            "distribution_id": id,
            "holder_id": holder,
            "amount": amount,
            "remaining": remaining,
        })),
    )?;

    if total_withdrawn == event.total_allocated {
        complete(tx, &event, actor)?;
    }
    Ok(DistributionAllocation {
        available_amount: remaining,
        status,
        ..allocation
    })
}

fn complete(tx: &Transaction<'_>, event: &DistributionEvent, actor: &Actor) -> Result<(), DistributionError> {
    set_status(tx, event, DistributionStatus::Completed)?;
    audit::insert_entry(
        tx,
        &AuditEntry::new(actor, AuditAction::DistributionCompleted, EntityKind::Distribution, event.id)
            .transition(DistributionStatus::Active, DistributionStatus::Completed),
    )?;
    info!("Distribution {} completed", event.id);
    Ok(())
}

pub fn complete_distribution(
    tx: &Transaction<'_>,
    id: Uuid,
    actor: &Actor,
) -> Result<DistributionEvent, DistributionError> {
    let event = get_distribution(tx, id)?;
    complete(tx, &event, actor)?;
    get_distribution(tx, id)
}

/// Cancel a draft or calculated event and its allocations.
pub fn cancel_distribution(
    tx: &Transaction<'_>,
    id: Uuid,
    reason: &str,
    actor: &Actor,
) -> Result<DistributionEvent, DistributionError> {
    let event = get_distribution(tx, id)?;
    set_status(tx, &event, DistributionStatus::Cancelled)?;
    let cascaded = tx.execute(
        "UPDATE distribution_allocations SET status = ?1, available_amount = '0'
         WHERE distribution_event_id = ?2",
        params![AllocationStatus::Cancelled.as_str(), id.to_string()],
    )?;
    audit::record_critical(
        tx,
        AuditEntry::new(actor, AuditAction::DistributionCancelled, EntityKind::Distribution, id)
            .transition(event.status, DistributionStatus::Cancelled)
            .with_detail(serde_json::json!({ "reason": reason, "allocations_cancelled": cascaded })),
    )?;
    info!("Distribution {} cancelled ({} allocation(s))", id, cascaded);
    get_distribution(tx, id)
}

/// Store-level entry points for distribution events.
pub struct DistributionLedger<'a> {
    store: &'a Store,
    scale: u32,
}

impl<'a> DistributionLedger<'a> {
    pub fn new(store: &'a Store, scale: u32) -> Self {
        Self { store, scale }
    }

    pub fn create(
        &self,
        project_id: &ProjectId,
        total_amount: Decimal,
        actor: &Actor,
    ) -> Result<DistributionEvent, DistributionError> {
        self.store
            .write(|tx| create_distribution(tx, project_id, total_amount, self.scale, actor))
    }

    pub fn calculate(&self, id: Uuid, actor: &Actor) -> Result<DistributionEvent, DistributionError> {
        self.store
            .write(|tx| calculate_distribution(tx, id, self.scale, actor))
    }

    pub fn activate(&self, id: Uuid, actor: &Actor) -> Result<DistributionEvent, DistributionError> {
        self.store.write(|tx| activate_distribution(tx, id, actor))
    }

    pub fn withdraw(
        &self,
        id: Uuid,
        holder: &HolderId,
        amount: Decimal,
        actor: &Actor,
    ) -> Result<DistributionAllocation, DistributionError> {
        self.store
            .write(|tx| record_withdrawal(tx, id, holder, amount, actor))
    }

    pub fn complete(&self, id: Uuid, actor: &Actor) -> Result<DistributionEvent, DistributionError> {
        self.store.write(|tx| complete_distribution(tx, id, actor))
    }

    pub fn cancel(&self, id: Uuid, reason: &str, actor: &Actor) -> Result<DistributionEvent, DistributionError> {
        self.store
            .write(|tx| cancel_distribution(tx, id, reason, actor))
    }

    pub fn get(&self, id: Uuid) -> Result<DistributionEvent, DistributionError> {
        self.store.read(|conn| get_distribution(conn, id))
    }

    pub fn allocations(&self, id: Uuid) -> Result<Vec<DistributionAllocation>, DistributionError> {
        self.store.read(|conn| allocations_for(conn, id))
    }
}
