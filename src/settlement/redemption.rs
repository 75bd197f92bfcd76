//! Token redemption requests and their payout.
//!
//! A request prices the tokens at the active NAV, rounds the payout down to
//! the minor unit and reserves it against one funding source. The payout
//! itself runs through the orchestrator; confirmation retires the tokens.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use log::info;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SettlementConfig;
use crate::core::ids::{Actor, HolderId, ProjectId};
use crate::core::money::{self, NetworkAmount};
use crate::core::nav::{self, NavError};
use crate::core::pool::{self, PoolDirection, PoolType};
use crate::core::project::{self, ProjectError};
use crate::network::{AssetNetwork, NetworkError, TxRef};
use crate::reconciliation::audit::{self, AuditAction, AuditEntry, EntityKind};
use crate::reconciliation::records::DivergenceKind;
use crate::settlement::orchestrator::SettlementFlow;
use crate::settlement::wallet;
use crate::settlement::{guard_unsettled, Settlement, SettlementError, SettlementOutcome, SettlementState};
use crate::store::codec::{self, UnknownVariant};
use crate::treasury::funding::{self, FundingDecision};

const KIND: &str = "redemption";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionStatus {
    Pending,
    Paid,
    Cancelled,
}

impl RedemptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RedemptionStatus::Pending => "pending",
            RedemptionStatus::Paid => "paid",
            RedemptionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RedemptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RedemptionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RedemptionStatus::Pending),
            "paid" => Ok(RedemptionStatus::Paid),
            "cancelled" => Ok(RedemptionStatus::Cancelled),
            other => Err(UnknownVariant::new("redemption status", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedemptionRequest {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub holder_id: HolderId,
    /// Network account the payout is sent to.
    pub holder_address: String,
    pub token_amount: Decimal,
    /// NAV the payout was priced at; frozen at request time.
    pub nav_per_token: Decimal,
    pub payout_amount: Decimal,
    pub funding_source: PoolType,
    pub status: RedemptionStatus,
    pub settlement_state: SettlementState,
    pub external_tx_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl RedemptionRequest {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: codec::uuid(row, 0)?,
            project_id: ProjectId::new(row.get::<_, String>(1)?),
            holder_id: HolderId::new(row.get::<_, String>(2)?),
            holder_address: row.get(3)?,
            token_amount: codec::decimal(row, 4)?,
            nav_per_token: codec::decimal(row, 5)?,
            payout_amount: codec::decimal(row, 6)?,
            funding_source: codec::variant(row, 7)?,
            status: codec::variant(row, 8)?,
            settlement_state: codec::variant(row, 9)?,
            external_tx_ref: row.get(10)?,
            created_at: row.get(11)?,
            paid_at: row.get(12)?,
        })
    }
}

pub fn get_redemption(conn: &Connection, id: Uuid) -> Result<RedemptionRequest, SettlementError> {
    conn.query_row(
        "SELECT id, project_id, holder_id, holder_address, token_amount, nav_per_token, payout_amount,
                funding_source, status, settlement_state, external_tx_ref, created_at, paid_at
         FROM redemption_requests WHERE id = ?1",
        [id.to_string()],
        RedemptionRequest::from_row,
    )
    .optional()?
    .ok_or_else(|| SettlementError::NotFound {
        kind: KIND,
        id: id.to_string(),
    })
}

/// Tokens of `holder` already promised to pending redemptions.
fn pending_tokens(conn: &Connection, project: &ProjectId, holder: &HolderId) -> Result<Decimal, SettlementError> {
    let mut stmt = conn.prepare(
        "SELECT token_amount FROM redemption_requests
         WHERE project_id = ?1 AND holder_id = ?2 AND status = 'pending'",
    )?;
    let rows = stmt.query_map([project.as_str(), holder.as_str()], |row| codec::decimal(row, 0))?;
    let mut total = Decimal::ZERO;
    for row in rows {
        total += row?;
    }
    Ok(total)
}

/// Price and reserve a redemption. Nothing leaves any account here.
pub fn create_redemption(
    tx: &Transaction<'_>,
    config: &SettlementConfig,
    project_id: &ProjectId,
    holder: &HolderId,
    holder_address: &str,
    tokens: Decimal,
) -> Result<(RedemptionRequest, FundingDecision), SettlementError> {
    if tokens <= Decimal::ZERO {
        return Err(SettlementError::InvalidAmount(tokens));
    }
    let held = project::holding_balance(tx, project_id, holder)?;
    let free = held - pending_tokens(tx, project_id, holder)?;
    if tokens > free {
        return Err(ProjectError::InsufficientHolding {
            project: project_id.clone(),
            holder: holder.clone(),
            held: free,
            requested: tokens,
        }
        .into());
    }

    let active = nav::active_nav(tx, project_id)?;
    let gross = tokens
        .checked_mul(active.value_per_token)
        .ok_or(NavError::Overflow(active.value_per_token))?;
    let payout = money::floor_to_scale(gross, config.minor_unit_scale);
    if payout <= Decimal::ZERO {
        return Err(SettlementError::InvalidAmount(payout));
    }
    let decision = config.funding_resolver().resolve(tx, project_id, payout)?;

    let request = RedemptionRequest {
        id: Uuid::new_v4(),
        project_id: project_id.clone(),
        holder_id: holder.clone(),
        holder_address: holder_address.to_string(),
        token_amount: tokens,
        nav_per_token: active.value_per_token,
        payout_amount: payout,
        funding_source: decision.selected,
        status: RedemptionStatus::Pending,
        settlement_state: SettlementState::Staged,
        external_tx_ref: None,
        created_at: Utc::now(),
        paid_at: None,
    };
    tx.execute(
        "INSERT INTO redemption_requests
            (id, project_id, holder_id, holder_address, token_amount, nav_per_token, payout_amount,
             funding_source, status, settlement_state, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            request.id.to_string(),
            project_id.as_str(),
            holder.as_str(),
            holder_address,
            codec::money(tokens),
            codec::money(request.nav_per_token),
            codec::money(payout),
            request.funding_source.as_str(),
            request.status.as_str(),
            request.settlement_state.as_str(),
            request.created_at,
        ],
    )?;
    Ok((request, decision))
}

pub(crate) struct PayoutIntent {
    pool: PoolType,
    project: ProjectId,
    holder: HolderId,
    tokens: Decimal,
    from: String,
    to: String,
    amount: NetworkAmount,
}

pub(crate) struct RedemptionPayout<'a> {
    id: Uuid,
    config: &'a SettlementConfig,
    actor: &'a Actor,
}

impl<'a> RedemptionPayout<'a> {
    pub(crate) fn new(id: Uuid, config: &'a SettlementConfig, actor: &'a Actor) -> Self {
        Self { id, config, actor }
    }

    fn source_account(&self, conn: &Connection, request: &RedemptionRequest) -> Result<String, SettlementError> {
        match request.funding_source {
            PoolType::ProjectCashflow => Ok(wallet::require_funded_wallet(conn, &request.project_id)?.address),
            pool => self
                .config
                .pool_account(pool)
                .map(str::to_string)
                .ok_or(SettlementError::MissingPoolAccount(pool)),
        }
    }

    fn intent_for(&self, conn: &Connection, request: &RedemptionRequest) -> Result<PayoutIntent, SettlementError> {
        Ok(PayoutIntent {
            pool: request.funding_source,
            project: request.project_id.clone(),
            holder: request.holder_id.clone(),
            tokens: request.token_amount,
            from: self.source_account(conn, request)?,
            to: request.holder_address.clone(),
            amount: NetworkAmount::new(request.payout_amount)?,
        })
    }
}

impl SettlementFlow for RedemptionPayout<'_> {
    type Intent = PayoutIntent;
    type Output = RedemptionRequest;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn entity_kind(&self) -> EntityKind {
        EntityKind::Redemption
    }

    fn divergence_kind(&self) -> DivergenceKind {
        DivergenceKind::RedemptionPayout
    }

    fn entity_id(&self) -> String {
        self.id.to_string()
    }

    fn stage(&self, tx: &Transaction<'_>) -> Result<PayoutIntent, SettlementError> {
        let request = get_redemption(tx, self.id)?;
        guard_unsettled(
            KIND,
            &self.id.to_string(),
            request.settlement_state,
            request.external_tx_ref.as_deref(),
        )?;
        if request.status != RedemptionStatus::Pending {
            return Err(SettlementError::InvalidTransition {
                kind: KIND,
                id: self.id.to_string(),
                from: request.status.to_string(),
                to: RedemptionStatus::Paid.to_string(),
            });
        }

        // The pool may have moved since the request was priced.
        let pool_type = request.funding_source;
        let balance = pool::pool_balance(tx, pool_type, Some(&request.project_id))?;
        let committed = funding::pending_commitments(tx, pool_type, Some(&request.project_id), Some(self.id))?;
        let floor = self.config.funding_resolver().reserve_floor(pool_type);
        let available = balance - floor - committed;
        if available < request.payout_amount {
            return Err(SettlementError::InsufficientPoolBalance {
                pool: pool_type,
                available,
                requested: request.payout_amount,
            });
        }

        let intent = self.intent_for(tx, &request)?;
        tx.execute(
            "UPDATE redemption_requests SET settlement_state = ?1
             WHERE id = ?2 AND status = 'pending' AND settlement_state = ?3 AND external_tx_ref IS NULL",
            params![
                SettlementState::ExternalPending.as_str(),
                self.id.to_string(),
                SettlementState::Staged.as_str(),
            ],
        )?;
        Ok(intent)
    }

    fn staged_audit(&self, intent: &PayoutIntent) -> Option<AuditEntry> {
        Some(
            AuditEntry::new(self.actor, AuditAction::RedemptionStaged, EntityKind::Redemption, self.id)
                .transition(SettlementState::Staged, SettlementState::ExternalPending)
                .with_detail(serde_json::json!({
                    "pool": intent.pool,
                    "amount": intent.amount.value(),
                    "to": intent.to,
                })),
        )
    }

    fn execute(&self, network: &dyn AssetNetwork, intent: &PayoutIntent) -> Result<TxRef, NetworkError> {
        network.transfer(&intent.from, &intent.to, &self.config.settlement_asset, &intent.amount)
    }

    fn confirm(
        &self,
        tx: &Transaction<'_>,
        intent: &PayoutIntent,
        tx_ref: &TxRef,
    ) -> Result<RedemptionRequest, SettlementError> {
        let updated = tx.execute(
            "UPDATE redemption_requests
             SET status = ?1, settlement_state = ?2, external_tx_ref = ?3, paid_at = ?4
             WHERE id = ?5 AND status = ?6 AND settlement_state = ?7 AND external_tx_ref IS NULL",
            params![
                RedemptionStatus::Paid.as_str(),
                SettlementState::Confirmed.as_str(),
                tx_ref.as_str(),
                Utc::now(),
                self.id.to_string(),
                RedemptionStatus::Pending.as_str(),
                SettlementState::ExternalPending.as_str(),
            ],
        )?;
        if updated == 0 {
            return Err(SettlementError::ConfirmConflict {
                kind: KIND,
                id: self.id.to_string(),
            });
        }
        pool::append_pool_transaction(
            tx,
            intent.pool,
            PoolDirection::Outflow,
            intent.amount.value(),
            Some(&intent.project),
            &format!("redemption:{}", self.id),
        )?;
        project::retire_tokens(tx, &intent.project, &intent.holder, intent.tokens)?;
        audit::record_critical(
            tx,
            AuditEntry::new(self.actor, AuditAction::RedemptionPaid, EntityKind::Redemption, self.id)
                .transition(RedemptionStatus::Pending, RedemptionStatus::Paid)
                .with_detail(serde_json::json!({
                    "holder_id": intent.holder,
                    "tokens": intent.tokens,
                    "payout": intent.amount.value(),
                    "pool": intent.pool,
                    "external_ref": tx_ref.as_str(),
                })),
        )?;
        info!(
            "Redemption {} paid: {} tokens of {} for {}",
            self.id, intent.tokens, intent.project, intent.amount
        );
        get_redemption(tx, self.id)
    }

    fn release(&self, tx: &Transaction<'_>, _intent: &PayoutIntent) -> Result<(), SettlementError> {
        tx.execute(
            "UPDATE redemption_requests SET settlement_state = ?1 WHERE id = ?2 AND settlement_state = ?3",
            params![
                SettlementState::Staged.as_str(),
                self.id.to_string(),
                SettlementState::ExternalPending.as_str(),
            ],
        )?;
        Ok(())
    }

    fn mark_divergent(
        &self,
        tx: &Transaction<'_>,
        _intent: &PayoutIntent,
        tx_ref: &TxRef,
    ) -> Result<(), SettlementError> {
        tx.execute(
            "UPDATE redemption_requests SET settlement_state = ?1, external_tx_ref = COALESCE(external_tx_ref, ?2)
             WHERE id = ?3",
            params![SettlementState::Divergent.as_str(), tx_ref.as_str(), self.id.to_string()],
        )?;
        Ok(())
    }

    fn amount(&self, intent: &PayoutIntent) -> Option<Decimal> {
        Some(intent.amount.value())
    }

    fn pending_intent(&self, conn: &Connection) -> Result<PayoutIntent, SettlementError> {
        let request = get_redemption(conn, self.id)?;
        if request.settlement_state != SettlementState::ExternalPending {
            return Err(SettlementError::NotPending {
                kind: KIND,
                id: self.id.to_string(),
            });
        }
        self.intent_for(conn, &request)
    }
}

impl Settlement<'_> {
    /// Price `tokens` at the active NAV and reserve the payout.
    pub fn request_redemption(
        &self,
        project: &ProjectId,
        holder: &HolderId,
        holder_address: &str,
        tokens: Decimal,
        actor: &Actor,
    ) -> Result<RedemptionRequest, SettlementError> {
        let (request, decision) = self
            .store
            .write(|tx| create_redemption(tx, self.config, project, holder, holder_address, tokens))?;
        self.note(
            AuditEntry::new(actor, AuditAction::RedemptionRequested, EntityKind::Redemption, request.id)
                .with_detail(serde_json::json!({
                    "holder_id": holder,
                    "tokens": tokens,
                    "payout": request.payout_amount,
                    "funding": decision,
                })),
        );
        Ok(request)
    }

    /// Withdraw a request that has not reached the network.
    pub fn cancel_redemption(&self, id: Uuid, actor: &Actor) -> Result<RedemptionRequest, SettlementError> {
        self.store.write(|tx| {
            let request = get_redemption(tx, id)?;
            guard_unsettled(KIND, &id.to_string(), request.settlement_state, request.external_tx_ref.as_deref())?;
            if request.status != RedemptionStatus::Pending {
                return Err(SettlementError::InvalidTransition {
                    kind: KIND,
                    id: id.to_string(),
                    from: request.status.to_string(),
                    to: RedemptionStatus::Cancelled.to_string(),
                });
            }
            tx.execute(
                "UPDATE redemption_requests SET status = ?1 WHERE id = ?2 AND status = ?3",
                params![
                    RedemptionStatus::Cancelled.as_str(),
                    id.to_string(),
                    RedemptionStatus::Pending.as_str(),
                ],
            )?;
            audit::record_critical(
                tx,
                AuditEntry::new(actor, AuditAction::RedemptionCancelled, EntityKind::Redemption, id)
                    .transition(RedemptionStatus::Pending, RedemptionStatus::Cancelled),
            )?;
            Ok(RedemptionRequest {
                status: RedemptionStatus::Cancelled,
                ..request
            })
        })
    }

    /// Send the payout and retire the redeemed tokens.
    pub fn settle_redemption(
        &self,
        id: Uuid,
        actor: &Actor,
    ) -> Result<SettlementOutcome<RedemptionRequest>, SettlementError> {
        self.run(&RedemptionPayout::new(id, self.config, actor))
    }

    pub fn redemption(&self, id: Uuid) -> Result<RedemptionRequest, SettlementError> {
        self.store.read(|conn| get_redemption(conn, id))
    }
}
