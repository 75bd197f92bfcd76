//! Milestone lifecycle and disbursement.
//!
//! A milestone moves `draft -> submitted -> approved -> disbursed`, or
//! `submitted -> rejected`. Disbursement burns the milestone amount of the
//! settlement asset from the project wallet and rewrites the project's NAV
//! to reflect the capital that left it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use log::info;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SettlementConfig;
use crate::core::ids::{Actor, ProjectId};
use crate::core::money::NetworkAmount;
use crate::core::nav::{self, NavError, NavSource};
use crate::core::project;
use crate::network::{AssetNetwork, NetworkError, TxRef};
use crate::reconciliation::audit::{self, AuditAction, AuditEntry, EntityKind};
use crate::reconciliation::records::DivergenceKind;
use crate::settlement::orchestrator::SettlementFlow;
use crate::settlement::wallet;
use crate::settlement::{guard_unsettled, Settlement, SettlementError, SettlementOutcome, SettlementState};
use crate::store::codec::{self, UnknownVariant};

const KIND: &str = "milestone";

/// Decimal places kept on a recomputed per-token NAV.
const NAV_DP: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Draft,
    Submitted,
    Approved,
    Rejected,
    Disbursed,
}

impl MilestoneStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MilestoneStatus::Draft => "draft",
            MilestoneStatus::Submitted => "submitted",
            MilestoneStatus::Approved => "approved",
            MilestoneStatus::Rejected => "rejected",
            MilestoneStatus::Disbursed => "disbursed",
        }
    }

    pub fn can_transition_to(self, next: MilestoneStatus) -> bool {
        matches!(
            (self, next),
            (MilestoneStatus::Draft, MilestoneStatus::Submitted)
                | (MilestoneStatus::Submitted, MilestoneStatus::Approved)
                | (MilestoneStatus::Submitted, MilestoneStatus::Rejected)
                | (MilestoneStatus::Approved, MilestoneStatus::Disbursed)
        )
    }
}

impl fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MilestoneStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(MilestoneStatus::Draft),
            "submitted" => Ok(MilestoneStatus::Submitted),
            "approved" => Ok(MilestoneStatus::Approved),
            "rejected" => Ok(MilestoneStatus::Rejected),
            "disbursed" => Ok(MilestoneStatus::Disbursed),
            other => Err(UnknownVariant::new("milestone status", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub sequence_number: u32,
    pub target_amount: Decimal,
    pub status: MilestoneStatus,
    pub bank_transfer_reference: Option<String>,
    pub burned_amount: Option<Decimal>,
    /// Burn reference. Written once; its presence means the burn happened.
    pub external_tx_ref: Option<String>,
    pub settlement_state: SettlementState,
    pub intent_id: Option<Uuid>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub disbursed_at: Option<DateTime<Utc>>,
}

impl Milestone {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: codec::uuid(row, 0)?,
            project_id: ProjectId::new(row.get::<_, String>(1)?),
            sequence_number: row.get(2)?,
            target_amount: codec::decimal(row, 3)?,
            status: codec::variant(row, 4)?,
            bank_transfer_reference: row.get(5)?,
            burned_amount: codec::opt_decimal(row, 6)?,
            external_tx_ref: row.get(7)?,
            settlement_state: codec::variant(row, 8)?,
            intent_id: codec::opt_uuid(row, 9)?,
            rejection_reason: row.get(10)?,
            created_at: row.get(11)?,
            disbursed_at: row.get(12)?,
        })
    }
}

/// What a confirmed disbursement changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisbursementReceipt {
    pub milestone: Milestone,
    pub burned_amount: Decimal,
    pub previous_nav_total: Decimal,
    pub new_nav_total: Decimal,
    pub new_value_per_token: Decimal,
}

impl fmt::Display for DisbursementReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Milestone Disbursement ===")?;
        writeln!(f, "Milestone:      {} (#{})", self.milestone.id, self.milestone.sequence_number)?;
        writeln!(f, "Project:        {}", self.milestone.project_id)?;
        writeln!(f, "Burned:         {}", self.burned_amount)?;
        writeln!(f, "NAV total:      {} -> {}", self.previous_nav_total, self.new_nav_total)?;
        writeln!(f, "Price/token:    {}", self.new_value_per_token)?;
        writeln!(
            f,
            "Burn reference: {}",
            self.milestone.external_tx_ref.as_deref().unwrap_or("-")
        )
    }
}

const MILESTONE_COLUMNS: &str = "id, project_id, sequence_number, target_amount, status, \
     bank_transfer_reference, burned_amount, external_tx_ref, settlement_state, intent_id, \
     rejection_reason, created_at, disbursed_at";

pub fn get_milestone(conn: &Connection, id: Uuid) -> Result<Milestone, SettlementError> {
    let sql = format!("SELECT {} FROM milestones WHERE id = ?1", MILESTONE_COLUMNS);
    conn.query_row(&sql, [id.to_string()], Milestone::from_row)
        .optional()?
        .ok_or_else(|| SettlementError::NotFound {
            kind: KIND,
            id: id.to_string(),
        })
}

/// Milestones of a project in sequence order.
pub fn milestones_for(conn: &Connection, project: &ProjectId) -> Result<Vec<Milestone>, SettlementError> {
    let sql = format!(
        "SELECT {} FROM milestones WHERE project_id = ?1 ORDER BY sequence_number",
        MILESTONE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([project.as_str()], Milestone::from_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

pub fn create_milestone(
    tx: &Transaction<'_>,
    project_id: &ProjectId,
    sequence_number: u32,
    target_amount: Decimal,
) -> Result<Milestone, SettlementError> {
    if target_amount <= Decimal::ZERO {
        return Err(SettlementError::InvalidAmount(target_amount));
    }
    project::get_project(tx, project_id)?;
    let taken: Option<String> = tx
        .query_row(
            "SELECT id FROM milestones WHERE project_id = ?1 AND sequence_number = ?2",
            params![project_id.as_str(), sequence_number],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(existing) = taken {
        return Err(SettlementError::InvalidTransition {
            kind: KIND,
            id: existing,
            from: format!("sequence {}", sequence_number),
            to: MilestoneStatus::Draft.to_string(),
        });
    }

    let milestone = Milestone {
        id: Uuid::new_v4(),
        project_id: project_id.clone(),
        sequence_number,
        target_amount,
        status: MilestoneStatus::Draft,
        bank_transfer_reference: None,
        burned_amount: None,
        external_tx_ref: None,
        settlement_state: SettlementState::Staged,
        intent_id: None,
        rejection_reason: None,
        created_at: Utc::now(),
        disbursed_at: None,
    };
    tx.execute(
        "INSERT INTO milestones
            (id, project_id, sequence_number, target_amount, status, settlement_state, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            milestone.id.to_string(),
            project_id.as_str(),
            sequence_number,
            codec::money(target_amount),
            milestone.status.as_str(),
            milestone.settlement_state.as_str(),
            milestone.created_at,
        ],
    )?;
    Ok(milestone)
}

/// Move a milestone along its review lifecycle. Disbursement is not
/// reachable from here; it only happens through the burn flow.
fn advance(
    tx: &Transaction<'_>,
    id: Uuid,
    next: MilestoneStatus,
    rejection_reason: Option<&str>,
) -> Result<Milestone, SettlementError> {
    let current = get_milestone(tx, id)?;
    if next == MilestoneStatus::Disbursed || !current.status.can_transition_to(next) {
        return Err(SettlementError::InvalidTransition {
            kind: KIND,
            id: id.to_string(),
            from: current.status.to_string(),
            to: next.to_string(),
        });
    }
    tx.execute(
        "UPDATE milestones SET status = ?1, rejection_reason = COALESCE(?2, rejection_reason)
         WHERE id = ?3 AND status = ?4",
        params![next.as_str(), rejection_reason, id.to_string(), current.status.as_str()],
    )?;
    Ok(Milestone {
        status: next,
        rejection_reason: rejection_reason.map(str::to_string).or(current.rejection_reason),
        ..current
    })
}

pub(crate) struct BurnIntent {
    intent_id: Uuid,
    project_id: ProjectId,
    wallet_address: String,
    amount: NetworkAmount,
    /// Project NAV when the burn was staged; the confirm reprices.
    staged_nav_total: Decimal,
}

pub(crate) struct MilestoneBurn<'a> {
    id: Uuid,
    config: &'a SettlementConfig,
    actor: &'a Actor,
}

impl<'a> MilestoneBurn<'a> {
    pub(crate) fn new(id: Uuid, config: &'a SettlementConfig, actor: &'a Actor) -> Self {
        Self { id, config, actor }
    }

    /// Preconditions, checked in order; the first failure is returned.
    fn validate(&self, tx: &Connection, milestone: &Milestone) -> Result<BurnIntent, SettlementError> {
        guard_unsettled(
            KIND,
            &milestone.id.to_string(),
            milestone.settlement_state,
            milestone.external_tx_ref.as_deref(),
        )?;
        if milestone.status != MilestoneStatus::Approved {
            return Err(SettlementError::InvalidTransition {
                kind: KIND,
                id: milestone.id.to_string(),
                from: milestone.status.to_string(),
                to: MilestoneStatus::Disbursed.to_string(),
            });
        }
        if milestone
            .bank_transfer_reference
            .as_deref()
            .map_or(true, |r| r.trim().is_empty())
        {
            return Err(SettlementError::MissingBankTransfer(milestone.id.to_string()));
        }

        let pricing = price_burn(tx, &milestone.project_id, milestone.target_amount)?;
        let wallet = wallet::require_funded_wallet(tx, &milestone.project_id)?;
        let amount = NetworkAmount::new(milestone.target_amount)?;
        Ok(BurnIntent {
            intent_id: Uuid::new_v4(),
            project_id: milestone.project_id.clone(),
            wallet_address: wallet.address,
            amount,
            staged_nav_total: pricing.nav_total,
        })
    }
}

/// Project NAV before and after a burn.
struct BurnPricing {
    nav_total: Decimal,
    new_nav_total: Decimal,
    new_value_per_token: Decimal,
}

/// Price a burn against the active NAV and the current token supply.
fn price_burn(conn: &Connection, project_id: &ProjectId, burn: Decimal) -> Result<BurnPricing, SettlementError> {
    let active = nav::active_nav(conn, project_id)?;
    let project = project::get_project(conn, project_id)?;
    if project.token_supply <= Decimal::ZERO {
        return Err(SettlementError::NoOutstandingTokens(project.id));
    }
    let nav_total = active.project_total(project.token_supply)?;
    if burn > nav_total {
        return Err(SettlementError::ExceedsNav {
            requested: burn,
            nav_total,
        });
    }
    let new_nav_total = nav_total - burn;
    let new_value_per_token = new_nav_total
        .checked_div(project.token_supply)
        .ok_or(NavError::Overflow(new_nav_total))?
        .round_dp(NAV_DP);
    if new_value_per_token <= Decimal::ZERO {
        return Err(SettlementError::DegeneratePostBurnPrice {
            project: project.id,
            price: new_value_per_token,
        });
    }
    Ok(BurnPricing {
        nav_total,
        new_nav_total,
        new_value_per_token,
    })
}

impl SettlementFlow for MilestoneBurn<'_> {
    type Intent = BurnIntent;
    type Output = DisbursementReceipt;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn entity_kind(&self) -> EntityKind {
        EntityKind::Milestone
    }

    fn divergence_kind(&self) -> DivergenceKind {
        DivergenceKind::MilestoneBurn
    }

    fn entity_id(&self) -> String {
        self.id.to_string()
    }

    fn stage(&self, tx: &Transaction<'_>) -> Result<BurnIntent, SettlementError> {
        let milestone = get_milestone(tx, self.id)?;
        let intent = self.validate(tx, &milestone)?;
        tx.execute(
            "UPDATE milestones SET settlement_state = ?1, intent_id = ?2
             WHERE id = ?3 AND settlement_state = ?4 AND external_tx_ref IS NULL",
            params![
                SettlementState::ExternalPending.as_str(),
                intent.intent_id.to_string(),
                self.id.to_string(),
                SettlementState::Staged.as_str(),
            ],
        )?;
        Ok(intent)
    }

    fn staged_audit(&self, intent: &BurnIntent) -> Option<AuditEntry> {
        Some(
            AuditEntry::new(self.actor, AuditAction::DisbursementStaged, EntityKind::Milestone, self.id)
                .transition(SettlementState::Staged, SettlementState::ExternalPending)
                .with_detail(serde_json::json!({
                    "intent_id": intent.intent_id,
                    "amount": intent.amount.value(),
                    "nav_total": intent.staged_nav_total,
                })),
        )
    }

    fn execute(&self, network: &dyn AssetNetwork, intent: &BurnIntent) -> Result<TxRef, NetworkError> {
        network.transfer(
            &intent.wallet_address,
            &self.config.asset_issuer,
            &self.config.settlement_asset,
            &intent.amount,
        )
    }

    fn confirm(
        &self,
        tx: &Transaction<'_>,
        intent: &BurnIntent,
        tx_ref: &TxRef,
    ) -> Result<DisbursementReceipt, SettlementError> {
        let burn = intent.amount.value();
        let pricing = price_burn(tx, &intent.project_id, burn)?;
        let now = Utc::now();
        let updated = tx.execute(
            "UPDATE milestones
             SET status = ?1, burned_amount = ?2, external_tx_ref = ?3, settlement_state = ?4, disbursed_at = ?5
             WHERE id = ?6 AND intent_id = ?7 AND settlement_state = ?8 AND status = ?9
               AND external_tx_ref IS NULL",
            params![
                MilestoneStatus::Disbursed.as_str(),
                codec::money(burn),
                tx_ref.as_str(),
                SettlementState::Confirmed.as_str(),
                now,
                self.id.to_string(),
                intent.intent_id.to_string(),
                SettlementState::ExternalPending.as_str(),
                MilestoneStatus::Approved.as_str(),
            ],
        )?;
        if updated == 0 {
            return Err(SettlementError::ConfirmConflict {
                kind: KIND,
                id: self.id.to_string(),
            });
        }

        let new_value = pricing.new_value_per_token;
        let note = format!("milestone {} burn {}", self.id, tx_ref);
        nav::record_nav(tx, &intent.project_id, new_value, NavSource::Formula, Some(&note))?;
        project::set_token_price(tx, &intent.project_id, new_value)?;

        audit::record_critical(
            tx,
            AuditEntry::new(self.actor, AuditAction::MilestoneDisbursed, EntityKind::Milestone, self.id)
                .transition(MilestoneStatus::Approved, MilestoneStatus::Disbursed)
                .with_detail(serde_json::json!({
                    "burned_amount": burn,
                    "external_ref": tx_ref.as_str(),
                    "staged_nav_total": intent.staged_nav_total,
                    "previous_nav_total": pricing.nav_total,
                    "new_nav_total": pricing.new_nav_total,
                    "new_value_per_token": new_value,
                })),
        )?;
        info!(
            "Milestone {} disbursed: burned {}, NAV {} -> {}",
            self.id, burn, pricing.nav_total, pricing.new_nav_total
        );

        Ok(DisbursementReceipt {
            milestone: get_milestone(tx, self.id)?,
            burned_amount: burn,
            previous_nav_total: pricing.nav_total,
            new_nav_total: pricing.new_nav_total,
            new_value_per_token: new_value,
        })
    }

    fn release(&self, tx: &Transaction<'_>, intent: &BurnIntent) -> Result<(), SettlementError> {
        tx.execute(
            "UPDATE milestones SET settlement_state = ?1, intent_id = NULL
             WHERE id = ?2 AND intent_id = ?3 AND settlement_state = ?4",
            params![
                SettlementState::Staged.as_str(),
                self.id.to_string(),
                intent.intent_id.to_string(),
                SettlementState::ExternalPending.as_str(),
            ],
        )?;
        Ok(())
    }

    fn mark_divergent(
        &self,
        tx: &Transaction<'_>,
        _intent: &BurnIntent,
        tx_ref: &TxRef,
    ) -> Result<(), SettlementError> {
        tx.execute(
            "UPDATE milestones SET settlement_state = ?1, external_tx_ref = COALESCE(external_tx_ref, ?2)
             WHERE id = ?3",
            params![SettlementState::Divergent.as_str(), tx_ref.as_str(), self.id.to_string()],
        )?;
        Ok(())
    }

    fn amount(&self, intent: &BurnIntent) -> Option<Decimal> {
        Some(intent.amount.value())
    }

    fn pending_intent(&self, conn: &Connection) -> Result<BurnIntent, SettlementError> {
        let milestone = get_milestone(conn, self.id)?;
        let intent_id = match (milestone.settlement_state, milestone.intent_id) {
            (SettlementState::ExternalPending, Some(intent_id)) => intent_id,
            _ => {
                return Err(SettlementError::NotPending {
                    kind: KIND,
                    id: self.id.to_string(),
                })
            }
        };
        let active = nav::active_nav(conn, &milestone.project_id)?;
        let project = project::get_project(conn, &milestone.project_id)?;
        let wallet = wallet::require_funded_wallet(conn, &milestone.project_id)?;
        Ok(BurnIntent {
            intent_id,
            project_id: milestone.project_id,
            wallet_address: wallet.address,
            amount: NetworkAmount::new(milestone.target_amount)?,
            staged_nav_total: active.project_total(project.token_supply)?,
        })
    }
}

impl Settlement<'_> {
    pub fn create_milestone(
        &self,
        project: &ProjectId,
        sequence_number: u32,
        target_amount: Decimal,
        actor: &Actor,
    ) -> Result<Milestone, SettlementError> {
        let milestone = self
            .store
            .write(|tx| create_milestone(tx, project, sequence_number, target_amount))?;
        self.note(
            AuditEntry::new(actor, AuditAction::MilestoneCreated, EntityKind::Milestone, milestone.id)
                .with_detail(serde_json::json!({
                    "project_id": project,
                    "sequence_number": sequence_number,
                    "target_amount": target_amount,
                })),
        );
        Ok(milestone)
    }

    pub fn submit_milestone(&self, id: Uuid, actor: &Actor) -> Result<Milestone, SettlementError> {
        let milestone = self
            .store
            .write(|tx| advance(tx, id, MilestoneStatus::Submitted, None))?;
        self.note(
            AuditEntry::new(actor, AuditAction::MilestoneSubmitted, EntityKind::Milestone, id)
                .transition(MilestoneStatus::Draft, MilestoneStatus::Submitted),
        );
        Ok(milestone)
    }

    pub fn approve_milestone(&self, id: Uuid, actor: &Actor) -> Result<Milestone, SettlementError> {
        let milestone = self
            .store
            .write(|tx| advance(tx, id, MilestoneStatus::Approved, None))?;
        self.note(
            AuditEntry::new(actor, AuditAction::MilestoneApproved, EntityKind::Milestone, id)
                .transition(MilestoneStatus::Submitted, MilestoneStatus::Approved),
        );
        Ok(milestone)
    }

    pub fn reject_milestone(&self, id: Uuid, reason: &str, actor: &Actor) -> Result<Milestone, SettlementError> {
        let milestone = self
            .store
            .write(|tx| advance(tx, id, MilestoneStatus::Rejected, Some(reason)))?;
        self.note(
            AuditEntry::new(actor, AuditAction::MilestoneRejected, EntityKind::Milestone, id)
                .transition(MilestoneStatus::Submitted, MilestoneStatus::Rejected)
                .with_detail(serde_json::json!({ "reason": reason })),
        );
        Ok(milestone)
    }

    /// Record the off-network bank transfer that funded the milestone's work.
    pub fn attach_bank_transfer(
        &self,
        id: Uuid,
        reference: &str,
        actor: &Actor,
    ) -> Result<Milestone, SettlementError> {
        if reference.trim().is_empty() {
            return Err(SettlementError::MissingBankTransfer(id.to_string()));
        }
        let milestone = self.store.write(|tx| {
            let current = get_milestone(tx, id)?;
            if current.status == MilestoneStatus::Disbursed || current.status == MilestoneStatus::Rejected {
                return Err(SettlementError::InvalidTransition {
                    kind: KIND,
                    id: id.to_string(),
                    from: current.status.to_string(),
                    to: "bank_transfer_attached".to_string(),
                });
            }
            tx.execute(
                "UPDATE milestones SET bank_transfer_reference = ?1 WHERE id = ?2",
                params![reference, id.to_string()],
            )?;
            Ok(Milestone {
                bank_transfer_reference: Some(reference.to_string()),
                ..current
            })
        })?;
        self.note(
            AuditEntry::new(actor, AuditAction::BankTransferAttached, EntityKind::Milestone, id)
                .with_detail(serde_json::json!({ "reference": reference })),
        );
        Ok(milestone)
    }

    /// Burn the milestone amount and rewrite the project's NAV.
    ///
    /// Once a burn reference is on file every later call returns
    /// [`SettlementError::AlreadySettled`] without touching the network.
    pub fn disburse_milestone(
        &self,
        id: Uuid,
        actor: &Actor,
    ) -> Result<SettlementOutcome<DisbursementReceipt>, SettlementError> {
        self.run(&MilestoneBurn::new(id, self.config, actor))
    }

    pub fn milestone(&self, id: Uuid) -> Result<Milestone, SettlementError> {
        self.store.read(|conn| get_milestone(conn, id))
    }
}
