//! Operations that pair a durable local change with one irreversible
//! transfer on the asset network.
//!
//! Every flow runs through [`orchestrator`]: stage the intent locally, call
//! the network outside any transaction, then confirm with a compare-and-swap
//! write. The flows themselves live in [`wallet`], [`milestone`],
//! [`capital`] and [`redemption`], each as inherent methods on
//! [`Settlement`].

pub mod capital;
pub mod milestone;
pub mod orchestrator;
pub mod redemption;
pub mod wallet;

use std::fmt;
use std::str::FromStr;

use log::warn;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SettlementConfig;
use crate::core::ids::ProjectId;
use crate::core::money::MoneyError;
use crate::core::nav::NavError;
use crate::core::pool::{PoolError, PoolType};
use crate::core::project::ProjectError;
use crate::error::{ErrorClass, ErrorCode};
use crate::network::{AssetNetwork, NetworkError};
use crate::reconciliation::audit::{self, AuditEntry, AuditQueue};
use crate::reconciliation::records::ReconciliationError;
use crate::store::codec::UnknownVariant;
use crate::store::{Store, StoreError};
use crate::treasury::funding::FundingError;

pub use orchestrator::{PendingEntity, PendingResolution, ResolvedPending, SettlementOutcome};

/// Where an entity stands relative to its external action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementState {
    /// Intent recorded locally; no external call in flight.
    Staged,
    /// External call issued or about to be; outcome not yet recorded.
    ExternalPending,
    Confirmed,
    /// External action happened but local confirmation failed. Terminal.
    Divergent,
}

impl SettlementState {
    pub fn as_str(self) -> &'static str {
        match self {
            SettlementState::Staged => "staged",
            SettlementState::ExternalPending => "external_pending",
            SettlementState::Confirmed => "confirmed",
            SettlementState::Divergent => "divergent",
        }
    }
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettlementState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staged" => Ok(SettlementState::Staged),
            "external_pending" => Ok(SettlementState::ExternalPending),
            "confirmed" => Ok(SettlementState::Confirmed),
            "divergent" => Ok(SettlementState::Divergent),
            other => Err(UnknownVariant::new("settlement state", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} {id} cannot move from {from} to {to}")]
    InvalidTransition {
        kind: &'static str,
        id: String,
        from: String,
        to: String,
    },
    #[error("amount must be positive, got {0}")]
    InvalidAmount(Decimal),
    #[error("burn of {requested} exceeds project NAV {nav_total}")]
    ExceedsNav { requested: Decimal, nav_total: Decimal },
    #[error("project {0} has no outstanding tokens")]
    NoOutstandingTokens(ProjectId),
    #[error("milestone {0} has no bank transfer reference on file")]
    MissingBankTransfer(String),
    #[error("burn would leave project {project} with non-positive token price {price}")]
    DegeneratePostBurnPrice { project: ProjectId, price: Decimal },
    #[error("project {0} has no funded wallet")]
    WalletNotFunded(ProjectId),
    #[error("{pool} pool has {available} available, {requested} requested")]
    InsufficientPoolBalance {
        pool: PoolType,
        available: Decimal,
        requested: Decimal,
    },
    #[error("no network account configured for the {0} pool")]
    MissingPoolAccount(PoolType),
    #[error("request key {0} was already used with different parameters")]
    RequestKeyConflict(String),
    #[error("{kind} {id} already settled with external reference {external_ref}")]
    AlreadySettled {
        kind: &'static str,
        id: String,
        external_ref: String,
    },
    #[error("{kind} {id} has an external call with unknown outcome; resolve it before retrying")]
    OutcomeUnknown { kind: &'static str, id: String },
    #[error("{kind} {id} changed between staging and confirmation")]
    ConfirmConflict { kind: &'static str, id: String },
    #[error("{kind} {id} has no external call pending")]
    NotPending { kind: &'static str, id: String },
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Money(#[from] MoneyError),
    #[error(transparent)]
    Nav(#[from] NavError),
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Funding(#[from] FundingError),
    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for SettlementError {
    fn from(e: rusqlite::Error) -> Self {
        SettlementError::Store(e.into())
    }
}

impl ErrorCode for SettlementError {
    fn code(&self) -> &'static str {
        match self {
            SettlementError::NotFound { .. } => "NOT_FOUND",
            SettlementError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SettlementError::InvalidAmount(_) => "INVALID_AMOUNT",
            SettlementError::ExceedsNav { .. } => "EXCEEDS_NAV",
            SettlementError::NoOutstandingTokens(_) => "NO_OUTSTANDING_TOKENS",
            SettlementError::MissingBankTransfer(_) => "MISSING_BANK_TRANSFER",
            SettlementError::DegeneratePostBurnPrice { .. } => "DEGENERATE_POST_BURN_PRICE",
            SettlementError::WalletNotFunded(_) => "WALLET_NOT_FUNDED",
            SettlementError::InsufficientPoolBalance { .. } => "INSUFFICIENT_POOL_BALANCE",
            SettlementError::MissingPoolAccount(_) => "MISSING_POOL_ACCOUNT",
            SettlementError::RequestKeyConflict(_) => "REQUEST_KEY_CONFLICT",
            SettlementError::AlreadySettled { .. } => "ALREADY_SETTLED",
            SettlementError::OutcomeUnknown { .. } => "OUTCOME_UNKNOWN",
            SettlementError::ConfirmConflict { .. } => "CONFIRM_CONFLICT",
            SettlementError::NotPending { .. } => "NOT_PENDING",
            SettlementError::Network(e) => e.code(),
            SettlementError::Money(e) => e.code(),
            SettlementError::Nav(e) => e.code(),
            SettlementError::Project(e) => e.code(),
            SettlementError::Pool(e) => e.code(),
            SettlementError::Funding(e) => e.code(),
            SettlementError::Reconciliation(e) => e.code(),
            SettlementError::Store(e) => e.code(),
        }
    }

    fn class(&self) -> ErrorClass {
        match self {
            SettlementError::NotFound { .. }
            | SettlementError::InvalidAmount(_)
            | SettlementError::MissingBankTransfer(_)
            | SettlementError::MissingPoolAccount(_)
            | SettlementError::RequestKeyConflict(_) => ErrorClass::Validation,
            SettlementError::InvalidTransition { .. }
            | SettlementError::ExceedsNav { .. }
            | SettlementError::NoOutstandingTokens(_)
            | SettlementError::DegeneratePostBurnPrice { .. }
            | SettlementError::WalletNotFunded(_)
            | SettlementError::InsufficientPoolBalance { .. }
            | SettlementError::AlreadySettled { .. }
            | SettlementError::OutcomeUnknown { .. }
            | SettlementError::NotPending { .. } => ErrorClass::DomainState,
            SettlementError::ConfirmConflict { .. } => ErrorClass::Divergence,
            SettlementError::Network(e) => e.class(),
            SettlementError::Money(e) => e.class(),
            SettlementError::Nav(e) => e.class(),
            SettlementError::Project(e) => e.class(),
            SettlementError::Pool(e) => e.class(),
            SettlementError::Funding(e) => e.class(),
            SettlementError::Reconciliation(e) => e.class(),
            SettlementError::Store(e) => e.class(),
        }
    }
}

/// Handles shared by every settlement flow.
pub struct Settlement<'a> {
    store: &'a Store,
    network: &'a dyn AssetNetwork,
    config: &'a SettlementConfig,
    audit: Option<&'a AuditQueue>,
}

impl<'a> Settlement<'a> {
    pub fn new(store: &'a Store, network: &'a dyn AssetNetwork, config: &'a SettlementConfig) -> Self {
        Self {
            store,
            network,
            config,
            audit: None,
        }
    }

    /// Send informational audit entries through a background queue instead
    /// of writing them inline.
    pub fn with_audit_queue(mut self, queue: &'a AuditQueue) -> Self {
        self.audit = Some(queue);
        self
    }

    pub fn store(&self) -> &Store {
        self.store
    }

    pub fn config(&self) -> &SettlementConfig {
        self.config
    }

    /// Best-effort informational audit. Never fails the caller.
    pub(crate) fn note(&self, entry: AuditEntry) {
        match self.audit {
            Some(queue) => queue.enqueue(entry),
            None => {
                let action = entry.action;
                let mut entry = entry;
                entry.critical = false;
                let written: Result<bool, StoreError> =
                    self.store.write(|tx| audit::insert_entry(tx, &entry));
                if let Err(e) = written {
                    warn!("Informational audit {} not written: {}", action, e);
                }
            }
        }
    }
}

/// Refuse to stage an entity that already carries an external reference or
/// has a call in flight.
pub(crate) fn guard_unsettled(
    kind: &'static str,
    id: &str,
    state: SettlementState,
    external_ref: Option<&str>,
) -> Result<(), SettlementError> {
    if let Some(external_ref) = external_ref {
        return Err(SettlementError::AlreadySettled {
            kind,
            id: id.to_string(),
            external_ref: external_ref.to_string(),
        });
    }
    match state {
        SettlementState::Staged => Ok(()),
        SettlementState::ExternalPending => Err(SettlementError::OutcomeUnknown {
            kind,
            id: id.to_string(),
        }),
        SettlementState::Confirmed | SettlementState::Divergent => {
            Err(SettlementError::InvalidTransition {
                kind,
                id: id.to_string(),
                from: state.to_string(),
                to: SettlementState::ExternalPending.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_ref_short_circuits_first() {
        let err = guard_unsettled("milestone", "m-1", SettlementState::Divergent, Some("tx-1")).unwrap_err();
        assert!(matches!(err, SettlementError::AlreadySettled { ref external_ref, .. } if external_ref == "tx-1"));
    }

    #[test]
    fn test_pending_is_outcome_unknown() {
        let err = guard_unsettled("wallet", "p", SettlementState::ExternalPending, None).unwrap_err();
        assert!(matches!(err, SettlementError::OutcomeUnknown { .. }));
        assert!(!err.class().is_retryable());
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            SettlementState::Staged,
            SettlementState::ExternalPending,
            SettlementState::Confirmed,
            SettlementState::Divergent,
        ] {
            assert_eq!(state.as_str().parse::<SettlementState>().unwrap(), state);
        }
    }
}
