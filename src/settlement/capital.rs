//! Pool-to-project capital allocation.
//!
//! Requests are keyed by a caller-supplied `request_key`; resubmitting the
//! same key with the same parameters is a retry, with different parameters a
//! conflict.

use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SettlementConfig;
use crate::core::ids::{Actor, ProjectId};
use crate::core::money::NetworkAmount;
use crate::core::pool::{self, PoolDirection, PoolType};
use crate::core::project;
use crate::network::{AssetNetwork, NetworkError, TxRef};
use crate::reconciliation::audit::{self, AuditAction, AuditEntry, EntityKind};
use crate::reconciliation::records::DivergenceKind;
use crate::settlement::orchestrator::SettlementFlow;
use crate::settlement::wallet;
use crate::settlement::{guard_unsettled, Settlement, SettlementError, SettlementOutcome, SettlementState};
use crate::store::codec;
use crate::treasury::funding;

const KIND: &str = "capital allocation";

/// A request to move capital from a global pool into a project wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapitalRequest {
    pub request_key: String,
    pub pool: PoolType,
    pub project: ProjectId,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalAllocation {
    pub id: Uuid,
    pub request_key: String,
    pub pool_type: PoolType,
    pub project_id: ProjectId,
    pub amount: Decimal,
    pub settlement_state: SettlementState,
    pub external_tx_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl CapitalAllocation {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: codec::uuid(row, 0)?,
            request_key: row.get(1)?,
            pool_type: codec::variant(row, 2)?,
            project_id: ProjectId::new(row.get::<_, String>(3)?),
            amount: codec::decimal(row, 4)?,
            settlement_state: codec::variant(row, 5)?,
            external_tx_ref: row.get(6)?,
            created_at: row.get(7)?,
            confirmed_at: row.get(8)?,
        })
    }

    fn matches(&self, request: &CapitalRequest) -> bool {
        self.pool_type == request.pool && self.project_id == request.project && self.amount == request.amount
    }
}

impl fmt::Display for CapitalAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} amount {} [{}] ref={}",
            self.request_key,
            self.pool_type,
            self.project_id,
            self.amount,
            self.settlement_state,
            self.external_tx_ref.as_deref().unwrap_or("-")
        )
    }
}

pub fn get_allocation(conn: &Connection, request_key: &str) -> Result<Option<CapitalAllocation>, SettlementError> {
    let allocation = conn
        .query_row(
            "SELECT id, request_key, pool_type, project_id, amount, settlement_state, external_tx_ref,
                    created_at, confirmed_at
             FROM capital_allocations WHERE request_key = ?1",
            [request_key],
            CapitalAllocation::from_row,
        )
        .optional()?;
    Ok(allocation)
}

pub(crate) struct TransferIntent {
    id: Uuid,
    pool: PoolType,
    project: ProjectId,
    from: String,
    to: String,
    amount: NetworkAmount,
}

pub(crate) struct PoolAllocation<'a> {
    request_key: &'a str,
    request: Option<&'a CapitalRequest>,
    config: &'a SettlementConfig,
    actor: &'a Actor,
}

impl<'a> PoolAllocation<'a> {
    pub(crate) fn new(request: &'a CapitalRequest, config: &'a SettlementConfig, actor: &'a Actor) -> Self {
        Self {
            request_key: &request.request_key,
            request: Some(request),
            config,
            actor,
        }
    }

    /// Flow over an allocation already on file, for operator resolution.
    pub(crate) fn pending(request_key: &'a str, config: &'a SettlementConfig, actor: &'a Actor) -> Self {
        Self {
            request_key,
            request: None,
            config,
            actor,
        }
    }

    fn existing(&self, conn: &Connection) -> Result<CapitalAllocation, SettlementError> {
        get_allocation(conn, self.request_key)?.ok_or_else(|| SettlementError::NotFound {
            kind: KIND,
            id: self.request_key.to_string(),
        })
    }

    fn intent_for(&self, conn: &Connection, allocation: &CapitalAllocation) -> Result<TransferIntent, SettlementError> {
        let from = self
            .config
            .pool_account(allocation.pool_type)
            .ok_or(SettlementError::MissingPoolAccount(allocation.pool_type))?;
        let wallet = wallet::require_funded_wallet(conn, &allocation.project_id)?;
        Ok(TransferIntent {
            id: allocation.id,
            pool: allocation.pool_type,
            project: allocation.project_id.clone(),
            from: from.to_string(),
            to: wallet.address,
            amount: NetworkAmount::new(allocation.amount)?,
        })
    }

    fn insert(&self, tx: &Transaction<'_>, request: &CapitalRequest) -> Result<CapitalAllocation, SettlementError> {
        let allocation = CapitalAllocation {
            id: Uuid::new_v4(),
            request_key: request.request_key.clone(),
            pool_type: request.pool,
            project_id: request.project.clone(),
            amount: request.amount,
            settlement_state: SettlementState::Staged,
            external_tx_ref: None,
            created_at: Utc::now(),
            confirmed_at: None,
        };
        tx.execute(
            "INSERT INTO capital_allocations
                (id, request_key, pool_type, project_id, amount, settlement_state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                allocation.id.to_string(),
                allocation.request_key,
                allocation.pool_type.as_str(),
                allocation.project_id.as_str(),
                codec::money(allocation.amount),
                allocation.settlement_state.as_str(),
                allocation.created_at,
            ],
        )?;
        Ok(allocation)
    }
}

impl SettlementFlow for PoolAllocation<'_> {
    type Intent = TransferIntent;
    type Output = CapitalAllocation;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn entity_kind(&self) -> EntityKind {
        EntityKind::CapitalAllocation
    }

    fn divergence_kind(&self) -> DivergenceKind {
        DivergenceKind::CapitalAllocation
    }

    fn entity_id(&self) -> String {
        self.request_key.to_string()
    }

    fn stage(&self, tx: &Transaction<'_>) -> Result<TransferIntent, SettlementError> {
        let allocation = match (get_allocation(tx, self.request_key)?, self.request) {
            (Some(existing), Some(request)) if !existing.matches(request) => {
                return Err(SettlementError::RequestKeyConflict(self.request_key.to_string()))
            }
            (Some(existing), _) => {
                guard_unsettled(
                    KIND,
                    self.request_key,
                    existing.settlement_state,
                    existing.external_tx_ref.as_deref(),
                )?;
                existing
            }
            (None, Some(request)) => {
                if request.amount <= Decimal::ZERO {
                    return Err(SettlementError::InvalidAmount(request.amount));
                }
                project::get_project(tx, &request.project)?;
                self.insert(tx, request)?
            }
            (None, None) => {
                return Err(SettlementError::NotFound {
                    kind: KIND,
                    id: self.request_key.to_string(),
                })
            }
        };

        let intent = self.intent_for(tx, &allocation)?;

        let balance = pool::pool_balance(tx, allocation.pool_type, Some(&allocation.project_id))?;
        let committed = funding::pending_commitments(
            tx,
            allocation.pool_type,
            Some(&allocation.project_id),
            Some(allocation.id),
        )?;
        let floor = self.config.funding_resolver().reserve_floor(allocation.pool_type);
        let available = balance - floor - committed;
        if available < allocation.amount {
            return Err(SettlementError::InsufficientPoolBalance {
                pool: allocation.pool_type,
                available,
                requested: allocation.amount,
            });
        }

        tx.execute(
            "UPDATE capital_allocations SET settlement_state = ?1
             WHERE id = ?2 AND settlement_state = ?3 AND external_tx_ref IS NULL",
            params![
                SettlementState::ExternalPending.as_str(),
                allocation.id.to_string(),
                SettlementState::Staged.as_str(),
            ],
        )?;
        Ok(intent)
    }

    fn staged_audit(&self, intent: &TransferIntent) -> Option<AuditEntry> {
        Some(
            AuditEntry::new(
                self.actor,
                AuditAction::CapitalAllocationStaged,
                EntityKind::CapitalAllocation,
                self.request_key,
            )
            .transition(SettlementState::Staged, SettlementState::ExternalPending)
            .with_detail(serde_json::json!({
                "pool": intent.pool,
                "project_id": intent.project,
                "amount": intent.amount.value(),
            })),
        )
    }

    fn execute(&self, network: &dyn AssetNetwork, intent: &TransferIntent) -> Result<TxRef, NetworkError> {
        network.transfer(&intent.from, &intent.to, &self.config.settlement_asset, &intent.amount)
    }

    fn confirm(
        &self,
        tx: &Transaction<'_>,
        intent: &TransferIntent,
        tx_ref: &TxRef,
    ) -> Result<CapitalAllocation, SettlementError> {
        let now = Utc::now();
        let updated = tx.execute(
            "UPDATE capital_allocations SET settlement_state = ?1, external_tx_ref = ?2, confirmed_at = ?3
             WHERE id = ?4 AND settlement_state = ?5 AND external_tx_ref IS NULL",
            params![
                SettlementState::Confirmed.as_str(),
                tx_ref.as_str(),
                now,
                intent.id.to_string(),
                SettlementState::ExternalPending.as_str(),
            ],
        )?;
        if updated == 0 {
            return Err(SettlementError::ConfirmConflict {
                kind: KIND,
                id: self.request_key.to_string(),
            });
        }
        pool::append_pool_transaction(
            tx,
            intent.pool,
            PoolDirection::Allocation,
            intent.amount.value(),
            Some(&intent.project),
            &format!("capital_allocation:{}", intent.id),
        )?;
        audit::record_critical(
            tx,
            AuditEntry::new(
                self.actor,
                AuditAction::CapitalAllocated,
                EntityKind::CapitalAllocation,
                self.request_key,
            )
            .transition(SettlementState::ExternalPending, SettlementState::Confirmed)
            .with_detail(serde_json::json!({
                "pool": intent.pool,
                "project_id": intent.project,
                "amount": intent.amount.value(),
                "external_ref": tx_ref.as_str(),
            })),
        )?;
        self.existing(tx)
    }

    fn release(&self, tx: &Transaction<'_>, intent: &TransferIntent) -> Result<(), SettlementError> {
        tx.execute(
            "UPDATE capital_allocations SET settlement_state = ?1 WHERE id = ?2 AND settlement_state = ?3",
            params![
                SettlementState::Staged.as_str(),
                intent.id.to_string(),
                SettlementState::ExternalPending.as_str(),
            ],
        )?;
        Ok(())
    }

    fn mark_divergent(
        &self,
        tx: &Transaction<'_>,
        intent: &TransferIntent,
        tx_ref: &TxRef,
    ) -> Result<(), SettlementError> {
        tx.execute(
            "UPDATE capital_allocations SET settlement_state = ?1, external_tx_ref = COALESCE(external_tx_ref, ?2)
             WHERE id = ?3",
            params![SettlementState::Divergent.as_str(), tx_ref.as_str(), intent.id.to_string()],
        )?;
        Ok(())
    }

    fn amount(&self, intent: &TransferIntent) -> Option<Decimal> {
        Some(intent.amount.value())
    }

    fn pending_intent(&self, conn: &Connection) -> Result<TransferIntent, SettlementError> {
        let allocation = self.existing(conn)?;
        if allocation.settlement_state != SettlementState::ExternalPending {
            return Err(SettlementError::NotPending {
                kind: KIND,
                id: self.request_key.to_string(),
            });
        }
        self.intent_for(conn, &allocation)
    }
}

impl Settlement<'_> {
    /// Move capital from a global pool into the project's wallet.
    pub fn allocate_capital(
        &self,
        request: &CapitalRequest,
        actor: &Actor,
    ) -> Result<SettlementOutcome<CapitalAllocation>, SettlementError> {
        self.run(&PoolAllocation::new(request, self.config, actor))
    }

    pub fn capital_allocation(&self, request_key: &str) -> Result<Option<CapitalAllocation>, SettlementError> {
        self.store.read(|conn| get_allocation(conn, request_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pool::PoolLedger;
    use crate::simulation::network::{Operation, SimulatedNetwork};
    use crate::store::Store;
    use crate::treasury::funding::FundingSource;
    use rust_decimal_macros::dec;

    const TREASURY: &str = "GTREASURY";

    struct Fixture {
        store: Store,
        network: SimulatedNetwork,
        config: SettlementConfig,
        project: ProjectId,
        actor: Actor,
    }

    impl Fixture {
        fn new(treasury_floor: Decimal) -> Self {
            let store = Store::open_in_memory().unwrap();
            let project = ProjectId::new("PRJ-FARM");
            store
                .write(|tx| project::register_project(tx, &project, "Farm", dec!(100), None))
                .unwrap();
            let mut config = SettlementConfig {
                asset_issuer: "GISSUER".to_string(),
                funding_sources: vec![FundingSource::new(PoolType::Treasury, treasury_floor)],
                ..Default::default()
            };
            config.pool_accounts.insert(PoolType::Treasury, TREASURY.to_string());
            let network = SimulatedNetwork::new("GISSUER");
            network.create_account(TREASURY, &NetworkAmount::new(dec!(2)).unwrap()).unwrap();
            network
                .establish_trustline(TREASURY, &config.settlement_asset, "GISSUER")
                .unwrap();
            network.fund(TREASURY, &config.settlement_asset, dec!(5000)).unwrap();
            PoolLedger::new(&store)
                .deposit(PoolType::Treasury, None, dec!(1000), "seed")
                .unwrap();
            let fx = Self {
                store,
                network,
                config,
                project,
                actor: Actor::new("admin:treasury"),
            };
            Settlement::new(&fx.store, &fx.network, &fx.config)
                .provision_wallet(&fx.project, &fx.actor)
                .unwrap();
            fx
        }

        fn settlement(&self) -> Settlement<'_> {
            Settlement::new(&self.store, &self.network, &self.config)
        }

        fn request(&self, key: &str, amount: Decimal) -> CapitalRequest {
            CapitalRequest {
                request_key: key.to_string(),
                pool: PoolType::Treasury,
                project: self.project.clone(),
                amount,
            }
        }
    }

    #[test]
    fn test_allocation_records_pool_row() {
        let fx = Fixture::new(Decimal::ZERO);
        let outcome = fx
            .settlement()
            .allocate_capital(&fx.request("cap-1", dec!(300)), &fx.actor)
            .unwrap();
        let allocation = outcome.output().unwrap();
        assert_eq!(allocation.settlement_state, SettlementState::Confirmed);

        let balance = PoolLedger::new(&fx.store).balance(PoolType::Treasury, None).unwrap();
        assert_eq!(balance, dec!(700));
    }

    #[test]
    fn test_reserve_floor_limits_allocation() {
        let fx = Fixture::new(dec!(800));
        let err = fx
            .settlement()
            .allocate_capital(&fx.request("cap-1", dec!(300)), &fx.actor)
            .unwrap_err();
        assert!(matches!(
            err,
            SettlementError::InsufficientPoolBalance { available, .. } if available == dec!(200)
        ));
        assert_eq!(fx.network.calls(Operation::Transfer), 0);
    }

    #[test]
    fn test_same_key_different_amount_conflicts() {
        let fx = Fixture::new(Decimal::ZERO);
        let s = fx.settlement();
        s.allocate_capital(&fx.request("cap-1", dec!(100)), &fx.actor).unwrap();
        let err = s
            .allocate_capital(&fx.request("cap-1", dec!(200)), &fx.actor)
            .unwrap_err();
        assert!(matches!(err, SettlementError::RequestKeyConflict(_)));
    }

    #[test]
    fn test_retry_after_confirm_is_already_settled() {
        let fx = Fixture::new(Decimal::ZERO);
        let s = fx.settlement();
        let request = fx.request("cap-1", dec!(100));
        s.allocate_capital(&request, &fx.actor).unwrap();
        let err = s.allocate_capital(&request, &fx.actor).unwrap_err();
        assert!(matches!(err, SettlementError::AlreadySettled { .. }));
        assert_eq!(fx.network.calls(Operation::Transfer), 1);
    }

    #[test]
    fn test_missing_pool_account() {
        let fx = Fixture::new(Decimal::ZERO);
        let mut request = fx.request("cap-1", dec!(10));
        request.pool = PoolType::Liquidity;
        let err = fx.settlement().allocate_capital(&request, &fx.actor).unwrap_err();
        assert!(matches!(err, SettlementError::MissingPoolAccount(PoolType::Liquidity)));
    }
}
