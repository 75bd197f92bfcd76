//! Three-stage settlement: stage, external action, confirm.
//!
//! ```text
//! staged --stage--> external_pending --confirm--> confirmed
//!    ^                  |        |
//!    +-----release------+        +--confirm failed--> divergent
//!      (definite failure)
//! ```
//!
//! A timeout leaves the entity in `external_pending`; only an operator can
//! move it on, through [`Settlement::resolve_pending`], once the network has
//! been checked. The external call is never retried blindly.

use std::time::{Duration, Instant};

use log::{error, info, warn};
use rusqlite::{Connection, Transaction};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::ids::{Actor, ProjectId};
use crate::network::{AssetNetwork, NetworkError, TxRef};
use crate::reconciliation::audit::{self, AuditAction, AuditEntry, EntityKind};
use crate::reconciliation::records::{self, DivergenceDraft, DivergenceKind, ReconciliationLedger};
use crate::settlement::{capital, milestone, redemption, wallet, Settlement, SettlementError};

/// One concrete flow plugged into the orchestrator.
pub(crate) trait SettlementFlow {
    /// What stage hands to the external call and to confirm.
    type Intent;
    type Output;

    fn kind(&self) -> &'static str;

    fn entity_kind(&self) -> EntityKind;

    fn divergence_kind(&self) -> DivergenceKind;

    fn entity_id(&self) -> String;

    /// Lock, validate and move the entity to `external_pending`.
    fn stage(&self, tx: &Transaction<'_>) -> Result<Self::Intent, SettlementError>;

    /// Informational audit entry written after a successful stage.
    fn staged_audit(&self, _intent: &Self::Intent) -> Option<AuditEntry> {
        None
    }

    fn execute(&self, network: &dyn AssetNetwork, intent: &Self::Intent) -> Result<TxRef, NetworkError>;

    /// Compare-and-swap the staged entity to its confirmed form.
    fn confirm(
        &self,
        tx: &Transaction<'_>,
        intent: &Self::Intent,
        tx_ref: &TxRef,
    ) -> Result<Self::Output, SettlementError>;

    /// Return a pending entity to `staged` after a definite failure.
    fn release(&self, tx: &Transaction<'_>, intent: &Self::Intent) -> Result<(), SettlementError>;

    /// Record the external reference and the `divergent` state.
    fn mark_divergent(
        &self,
        tx: &Transaction<'_>,
        intent: &Self::Intent,
        tx_ref: &TxRef,
    ) -> Result<(), SettlementError>;

    fn amount(&self, intent: &Self::Intent) -> Option<Decimal>;

    /// Rebuild the intent of an entity left in `external_pending`.
    fn pending_intent(&self, conn: &Connection) -> Result<Self::Intent, SettlementError>;
}

/// Result of a flow that reached the network.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SettlementOutcome<T> {
    Confirmed { output: T, external_ref: String },
    /// The transfer landed but local confirmation failed. A critical
    /// reconciliation record was written unless `reconciliation_id` is
    /// `None`, in which case the divergence only reached the error log.
    Divergent {
        external_ref: String,
        reconciliation_id: Option<Uuid>,
        error: String,
    },
}

impl<T> SettlementOutcome<T> {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, SettlementOutcome::Confirmed { .. })
    }

    pub fn external_ref(&self) -> &str {
        match self {
            SettlementOutcome::Confirmed { external_ref, .. } => external_ref,
            SettlementOutcome::Divergent { external_ref, .. } => external_ref,
        }
    }

    pub fn output(&self) -> Option<&T> {
        match self {
            SettlementOutcome::Confirmed { output, .. } => Some(output),
            SettlementOutcome::Divergent { .. } => None,
        }
    }

    pub fn into_output(self) -> Option<T> {
        match self {
            SettlementOutcome::Confirmed { output, .. } => Some(output),
            SettlementOutcome::Divergent { .. } => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> SettlementOutcome<U> {
        match self {
            SettlementOutcome::Confirmed {
                output,
                external_ref,
            } => SettlementOutcome::Confirmed {
                output: f(output),
                external_ref,
            },
            SettlementOutcome::Divergent {
                external_ref,
                reconciliation_id,
                error,
            } => SettlementOutcome::Divergent {
                external_ref,
                reconciliation_id,
                error,
            },
        }
    }
}

/// An entity that may be stuck in `external_pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PendingEntity {
    Wallet(ProjectId),
    Milestone(Uuid),
    CapitalAllocation(String),
    Redemption(Uuid),
}

/// What the operator found on the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingResolution {
    /// The call landed under this reference.
    Landed { external_ref: String },
    /// The call never took effect.
    NotExecuted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ResolvedPending {
    Confirmed { external_ref: String },
    Released,
    Divergent {
        external_ref: String,
        reconciliation_id: Option<Uuid>,
    },
}

impl Settlement<'_> {
    pub(crate) fn run<F: SettlementFlow>(
        &self,
        flow: &F,
    ) -> Result<SettlementOutcome<F::Output>, SettlementError> {
        let intent = self.store.write(|tx| flow.stage(tx))?;
        if let Some(entry) = flow.staged_audit(&intent) {
            self.note(entry);
        }
        info!("Staged {} {}", flow.kind(), flow.entity_id());

        let started = Instant::now();
        let result = flow.execute(self.network, &intent);
        let elapsed = started.elapsed();
        if elapsed > Duration::from_millis(self.config.network_timeout_ms) {
            warn!(
                "Network call for {} {} took {:?}, over the {}ms budget",
                flow.kind(),
                flow.entity_id(),
                elapsed,
                self.config.network_timeout_ms
            );
        }

        let tx_ref = match result {
            Ok(tx_ref) => tx_ref,
            Err(e) if e.is_definite() => {
                warn!(
                    "External call for {} {} failed, releasing intent: {}",
                    flow.kind(),
                    flow.entity_id(),
                    e
                );
                let released = self.store.write(|tx| flow.release(tx, &intent));
                if let Err(release_err) = released {
                    error!(
                        "Could not release {} {}; it stays external_pending: {}",
                        flow.kind(),
                        flow.entity_id(),
                        release_err
                    );
                }
                return Err(SettlementError::Network(e));
            }
            Err(e) => {
                error!(
                    "Outcome of external call for {} {} is unknown: {}",
                    flow.kind(),
                    flow.entity_id(),
                    e
                );
                return Err(SettlementError::OutcomeUnknown {
                    kind: flow.kind(),
                    id: flow.entity_id(),
                });
            }
        };

        match self.store.write(|tx| flow.confirm(tx, &intent, &tx_ref)) {
            Ok(output) => {
                info!("Confirmed {} {} as {}", flow.kind(), flow.entity_id(), tx_ref);
                Ok(SettlementOutcome::Confirmed {
                    output,
                    external_ref: tx_ref.to_string(),
                })
            }
            Err(cause) => {
                let reconciliation_id = self.diverge(flow, &intent, &tx_ref, &cause);
                Ok(SettlementOutcome::Divergent {
                    external_ref: tx_ref.to_string(),
                    reconciliation_id,
                    error: cause.to_string(),
                })
            }
        }
    }

    /// Persist a divergence. First tries one transaction that writes the
    /// record and marks the entity; if that fails, writes the record alone.
    fn diverge<F: SettlementFlow>(
        &self,
        flow: &F,
        intent: &F::Intent,
        tx_ref: &TxRef,
        cause: &SettlementError,
    ) -> Option<Uuid> {
        let draft = DivergenceDraft::critical(
            flow.divergence_kind(),
            flow.entity_id(),
            Some(tx_ref.as_str()),
            flow.amount(intent),
            format!(
                "{} {} settled externally as {} but local confirmation failed: {}",
                flow.kind(),
                flow.entity_id(),
                tx_ref,
                cause
            ),
        );
        let actor = Actor::system("settlement");
        let primary: Result<Uuid, SettlementError> = self.store.write(|tx| {
            let record = records::insert_record(tx, &draft)?;
            flow.mark_divergent(tx, intent, tx_ref)?;
            audit::record_critical(
                tx,
                AuditEntry::new(&actor, AuditAction::SettlementDivergent, flow.entity_kind(), flow.entity_id())
                    .transition("external_pending", "divergent")
                    .with_detail(serde_json::json!({
                        "external_ref": tx_ref.as_str(),
                        "reconciliation_id": record.id,
                        "cause": cause.to_string(),
                    })),
            )?;
            Ok(record.id)
        });
        match primary {
            Ok(id) => {
                error!(
                    "Divergence on {} {}: external ref {}, reconciliation record {}",
                    flow.kind(),
                    flow.entity_id(),
                    tx_ref,
                    id
                );
                Some(id)
            }
            Err(e) => {
                warn!(
                    "Could not mark {} {} divergent ({}); flagging through secondary path",
                    flow.kind(),
                    flow.entity_id(),
                    e
                );
                ReconciliationLedger::new(self.store)
                    .flag(&draft)
                    .map(|record| record.id)
            }
        }
    }

    pub(crate) fn resolve_flow<F: SettlementFlow>(
        &self,
        flow: &F,
        resolution: PendingResolution,
        actor: &Actor,
    ) -> Result<ResolvedPending, SettlementError> {
        match resolution {
            PendingResolution::NotExecuted => {
                self.store.write(|tx| {
                    let intent = flow.pending_intent(tx)?;
                    flow.release(tx, &intent)?;
                    audit::record_critical(
                        tx,
                        AuditEntry::new(actor, AuditAction::SettlementReleased, flow.entity_kind(), flow.entity_id())
                            .transition("external_pending", "staged")
                            .with_detail(serde_json::json!({ "resolution": "not_executed" })),
                    )?;
                    Ok::<_, SettlementError>(())
                })?;
                info!("{} {} released by {}", flow.kind(), flow.entity_id(), actor);
                Ok(ResolvedPending::Released)
            }
            PendingResolution::Landed { external_ref } => {
                let tx_ref = TxRef::new(external_ref);
                let intent = self.store.read(|conn| flow.pending_intent(conn))?;
                match self.store.write(|tx| flow.confirm(tx, &intent, &tx_ref)) {
                    Ok(_) => {
                        info!(
                            "{} {} confirmed as {} by {}",
                            flow.kind(),
                            flow.entity_id(),
                            tx_ref,
                            actor
                        );
                        Ok(ResolvedPending::Confirmed {
                            external_ref: tx_ref.to_string(),
                        })
                    }
                    Err(cause) => {
                        let reconciliation_id = self.diverge(flow, &intent, &tx_ref, &cause);
                        Ok(ResolvedPending::Divergent {
                            external_ref: tx_ref.to_string(),
                            reconciliation_id,
                        })
                    }
                }
            }
        }
    }

    /// Operator action for an entity left `external_pending` by a timeout.
    pub fn resolve_pending(
        &self,
        entity: PendingEntity,
        resolution: PendingResolution,
        actor: &Actor,
    ) -> Result<ResolvedPending, SettlementError> {
        match entity {
            PendingEntity::Wallet(project) => {
                let flow = wallet::WalletFunding::new(&project, self.config, actor);
                self.resolve_flow(&flow, resolution, actor)
            }
            PendingEntity::Milestone(id) => {
                let flow = milestone::MilestoneBurn::new(id, self.config, actor);
                self.resolve_flow(&flow, resolution, actor)
            }
            PendingEntity::CapitalAllocation(request_key) => {
                let flow = capital::PoolAllocation::pending(&request_key, self.config, actor);
                self.resolve_flow(&flow, resolution, actor)
            }
            PendingEntity::Redemption(id) => {
                let flow = redemption::RedemptionPayout::new(id, self.config, actor);
                self.resolve_flow(&flow, resolution, actor)
            }
        }
    }
}
