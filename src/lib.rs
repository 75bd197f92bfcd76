//! # settlement-core
//!
//! Settlement and reconciliation core for tokenized fixed-term project
//! investments.
//!
//! Holders own fractional claims (tokens) in projects. Profit events are
//! priced against a versioned NAV, split exactly to the minor unit, and paid
//! out while money moves across two ledgers: the local relational store and
//! an external asset network whose transfers cannot be undone. Every
//! operation that touches both either lands on both or leaves a durable
//! reconciliation record behind.
//!
//! ## Architecture
//!
//! - **core**: Identifiers, exact money, projects and holdings, NAV ledger, pool log
//! - **allocation**: Largest-remainder pro-rata, percentage splits, distribution events
//! - **treasury**: Funding source resolution against reserve floors
//! - **settlement**: Stage / execute / confirm orchestration and its flows
//! - **reconciliation**: Divergence records and the audit trail
//! - **jobs**: Revenue batch processing
//! - **network**: Asset network contract
//! - **simulation**: In-memory network and random holder sets
//! - **store**: SQLite persistence

pub mod allocation;
pub mod config;
pub mod core;
pub mod error;
pub mod jobs;
pub mod network;
pub mod outcome;
pub mod reconciliation;
pub mod settlement;
pub mod simulation;
pub mod store;
pub mod treasury;

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::allocation::distribution::{DistributionLedger, DistributionStatus};
    pub use crate::allocation::largest_remainder::{allocate_pro_rata, Allocation, Claim};
    pub use crate::allocation::split::{split_by_percentages, RevenueSplit};
    pub use crate::config::SettlementConfig;
    pub use crate::core::ids::{Actor, HolderId, ProjectId};
    pub use crate::core::money::{AssetCode, NetworkAmount};
    pub use crate::core::nav::{NavLedger, NavSource};
    pub use crate::core::pool::{PoolLedger, PoolType};
    pub use crate::error::{ErrorClass, ErrorCode};
    pub use crate::network::{AssetNetwork, NetworkError, TxRef};
    pub use crate::outcome::ApiResponse;
    pub use crate::reconciliation::records::ReconciliationLedger;
    pub use crate::settlement::{Settlement, SettlementError, SettlementOutcome};
    pub use crate::store::Store;
}
