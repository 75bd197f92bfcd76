//! Project wallet provisioning.
//!
//! Staging generates and persists the address; the network call creates the
//! account and its trustline to the settlement asset; confirmation stamps
//! `funded_at` only if the address is still the one that was staged.

use chrono::{DateTime, Utc};
use log::debug;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SettlementConfig;
use crate::core::ids::{Actor, ProjectId};
use crate::core::money::NetworkAmount;
use crate::core::project;
use crate::network::{AssetNetwork, NetworkError, TxRef};
use crate::reconciliation::audit::{self, AuditAction, AuditEntry, EntityKind};
use crate::reconciliation::records::DivergenceKind;
use crate::settlement::orchestrator::SettlementFlow;
use crate::settlement::{guard_unsettled, Settlement, SettlementError, SettlementOutcome, SettlementState};
use crate::store::codec;

const KIND: &str = "wallet";

/// Base32 alphabet of network account addresses.
const ADDRESS_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
const ADDRESS_BODY_LEN: usize = 55;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectWallet {
    pub project_id: ProjectId,
    pub address: String,
    /// Pointer into the key store; the secret itself never touches the ledger.
    pub secret_material_ref: String,
    pub staged_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub settlement_state: SettlementState,
    pub external_tx_ref: Option<String>,
}

impl ProjectWallet {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            project_id: ProjectId::new(row.get::<_, String>(0)?),
            address: row.get(1)?,
            secret_material_ref: row.get(2)?,
            staged_at: row.get(3)?,
            funded_at: row.get(4)?,
            settlement_state: codec::variant(row, 5)?,
            external_tx_ref: row.get(6)?,
        })
    }

    pub fn is_funded(&self) -> bool {
        self.funded_at.is_some() && self.settlement_state == SettlementState::Confirmed
    }
}

pub fn get_wallet(conn: &Connection, project: &ProjectId) -> Result<Option<ProjectWallet>, SettlementError> {
    let wallet = conn
        .query_row(
            "SELECT project_id, address, secret_material_ref, staged_at, funded_at, settlement_state, external_tx_ref
             FROM project_wallets WHERE project_id = ?1",
            [project.as_str()],
            ProjectWallet::from_row,
        )
        .optional()?;
    Ok(wallet)
}

/// The project's wallet, provided it finished funding.
pub fn require_funded_wallet(conn: &Connection, project: &ProjectId) -> Result<ProjectWallet, SettlementError> {
    match get_wallet(conn, project)? {
        Some(wallet) if wallet.is_funded() => Ok(wallet),
        _ => Err(SettlementError::WalletNotFunded(project.clone())),
    }
}

fn generate_address() -> String {
    let mut rng = rand::thread_rng();
    let mut address = String::with_capacity(ADDRESS_BODY_LEN + 1);
    address.push('G');
    for _ in 0..ADDRESS_BODY_LEN {
        address.push(ADDRESS_ALPHABET[rng.gen_range(0..ADDRESS_ALPHABET.len())] as char);
    }
    address
}

pub(crate) struct WalletIntent {
    address: String,
    starting_reserve: NetworkAmount,
}

pub(crate) struct WalletFunding<'a> {
    project: &'a ProjectId,
    config: &'a SettlementConfig,
    actor: &'a Actor,
}

impl<'a> WalletFunding<'a> {
    pub(crate) fn new(project: &'a ProjectId, config: &'a SettlementConfig, actor: &'a Actor) -> Self {
        Self {
            project,
            config,
            actor,
        }
    }

    fn current(&self, conn: &Connection) -> Result<ProjectWallet, SettlementError> {
        get_wallet(conn, self.project)?.ok_or_else(|| SettlementError::NotFound {
            kind: KIND,
            id: self.project.to_string(),
        })
    }
}

impl SettlementFlow for WalletFunding<'_> {
    type Intent = WalletIntent;
    type Output = ProjectWallet;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn entity_kind(&self) -> EntityKind {
        EntityKind::Wallet
    }

    fn divergence_kind(&self) -> DivergenceKind {
        DivergenceKind::WalletFunding
    }

    fn entity_id(&self) -> String {
        self.project.to_string()
    }

    fn stage(&self, tx: &Transaction<'_>) -> Result<WalletIntent, SettlementError> {
        project::get_project(tx, self.project)?;
        let starting_reserve = NetworkAmount::new(self.config.starting_reserve)?;

        let address = match get_wallet(tx, self.project)? {
            Some(wallet) => {
                guard_unsettled(
                    KIND,
                    self.project.as_str(),
                    wallet.settlement_state,
                    wallet.external_tx_ref.as_deref(),
                )?;
                wallet.address
            }
            None => {
                let address = generate_address();
                tx.execute(
                    "INSERT INTO project_wallets
                        (project_id, address, secret_material_ref, staged_at, settlement_state)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        self.project.as_str(),
                        address,
                        format!("kms:{}", Uuid::new_v4()),
                        Utc::now(),
                        SettlementState::Staged.as_str(),
                    ],
                )?;
                debug!("Generated wallet address {} for {}", address, self.project);
                address
            }
        };

        tx.execute(
            "UPDATE project_wallets SET settlement_state = ?1
             WHERE project_id = ?2 AND address = ?3 AND settlement_state = ?4",
            params![
                SettlementState::ExternalPending.as_str(),
                self.project.as_str(),
                address,
                SettlementState::Staged.as_str(),
            ],
        )?;
        Ok(WalletIntent {
            address,
            starting_reserve,
        })
    }

    fn staged_audit(&self, intent: &WalletIntent) -> Option<AuditEntry> {
        Some(
            AuditEntry::new(self.actor, AuditAction::WalletStaged, EntityKind::Wallet, self.project)
                .transition(SettlementState::Staged, SettlementState::ExternalPending)
                .with_detail(serde_json::json!({ "address": intent.address })),
        )
    }

    fn execute(&self, network: &dyn AssetNetwork, intent: &WalletIntent) -> Result<TxRef, NetworkError> {
        let account = match network.create_account(&intent.address, &intent.starting_reserve) {
            Ok(tx_ref) => Some(tx_ref),
            Err(e) if e.is_already_exists() => None,
            Err(e) => return Err(e),
        };
        let trustline = match network.establish_trustline(
            &intent.address,
            &self.config.settlement_asset,
            &self.config.asset_issuer,
        ) {
            Ok(tx_ref) => Some(tx_ref),
            Err(e) if e.is_already_exists() => None,
            Err(e) => return Err(e),
        };
        Ok(account
            .or(trustline)
            .unwrap_or_else(|| TxRef::new(format!("preexisting:{}", intent.address))))
    }

    fn confirm(
        &self,
        tx: &Transaction<'_>,
        intent: &WalletIntent,
        tx_ref: &TxRef,
    ) -> Result<ProjectWallet, SettlementError> {
        let now = Utc::now();
        let updated = tx.execute(
            "UPDATE project_wallets SET funded_at = ?1, settlement_state = ?2, external_tx_ref = ?3
             WHERE project_id = ?4 AND address = ?5 AND settlement_state = ?6 AND funded_at IS NULL",
            params![
                now,
                SettlementState::Confirmed.as_str(),
                tx_ref.as_str(),
                self.project.as_str(),
                intent.address,
                SettlementState::ExternalPending.as_str(),
            ],
        )?;
        if updated == 0 {
            return Err(SettlementError::ConfirmConflict {
                kind: KIND,
                id: self.project.to_string(),
            });
        }
        audit::record_critical(
            tx,
            AuditEntry::new(self.actor, AuditAction::WalletFunded, EntityKind::Wallet, self.project)
                .transition(SettlementState::ExternalPending, SettlementState::Confirmed)
                .with_detail(serde_json::json!({
                    "address": intent.address,
                    "external_ref": tx_ref.as_str(),
                })),
        )?;
        self.current(tx)
    }

    fn release(&self, tx: &Transaction<'_>, intent: &WalletIntent) -> Result<(), SettlementError> {
        tx.execute(
            "UPDATE project_wallets SET settlement_state = ?1
             WHERE project_id = ?2 AND address = ?3 AND settlement_state = ?4",
            params![
                SettlementState::Staged.as_str(),
                self.project.as_str(),
                intent.address,
                SettlementState::ExternalPending.as_str(),
            ],
        )?;
        Ok(())
    }

    fn mark_divergent(
        &self,
        tx: &Transaction<'_>,
        _intent: &WalletIntent,
        tx_ref: &TxRef,
    ) -> Result<(), SettlementError> {
        tx.execute(
            "UPDATE project_wallets SET settlement_state = ?1, external_tx_ref = ?2 WHERE project_id = ?3",
            params![SettlementState::Divergent.as_str(), tx_ref.as_str(), self.project.as_str()],
        )?;
        Ok(())
    }

    fn amount(&self, intent: &WalletIntent) -> Option<Decimal> {
        Some(intent.starting_reserve.value())
    }

    fn pending_intent(&self, conn: &Connection) -> Result<WalletIntent, SettlementError> {
        let wallet = self.current(conn)?;
        if wallet.settlement_state != SettlementState::ExternalPending {
            return Err(SettlementError::NotPending {
                kind: KIND,
                id: self.project.to_string(),
            });
        }
        Ok(WalletIntent {
            address: wallet.address,
            starting_reserve: NetworkAmount::new(self.config.starting_reserve)?,
        })
    }
}

impl Settlement<'_> {
    /// Create, fund and trust-enable the project's wallet.
    ///
    /// A wallet that already carries a funding reference is refused with
    /// [`SettlementError::AlreadySettled`] and no network call is made.
    pub fn provision_wallet(
        &self,
        project: &ProjectId,
        actor: &Actor,
    ) -> Result<SettlementOutcome<ProjectWallet>, SettlementError> {
        self.run(&WalletFunding::new(project, self.config, actor))
    }

    pub fn wallet(&self, project: &ProjectId) -> Result<Option<ProjectWallet>, SettlementError> {
        self.store.read(|conn| get_wallet(conn, project))
    }
}
