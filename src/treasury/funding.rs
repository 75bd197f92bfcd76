//! Funding source selection for payouts.
//!
//! Sources are tried in configured order. A source is available for
//! `balance - reserve_floor - pending commitments`; the first source whose
//! availability covers the whole amount is selected. A payout is never split
//! across sources.

use std::fmt;

use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::ids::ProjectId;
use crate::core::pool::{self, PoolError, PoolType};
use crate::error::{ErrorClass, ErrorCode};
use crate::store::{codec, StoreError};

#[derive(Debug, Error)]
pub enum FundingError {
    #[error("required amount must be positive, got {0}")]
    InvalidAmount(Decimal),
    #[error("no funding sources configured")]
    NoSources,
    #[error("insufficient funds: no single source can cover {required}")]
    InsufficientFunds {
        required: Decimal,
        breakdown: Vec<SourceAvailability>,
    },
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for FundingError {
    fn from(e: rusqlite::Error) -> Self {
        FundingError::Store(e.into())
    }
}

impl ErrorCode for FundingError {
    fn code(&self) -> &'static str {
        match self {
            FundingError::InvalidAmount(_) => "INVALID_AMOUNT",
            FundingError::NoSources => "NO_FUNDING_SOURCES",
            FundingError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            FundingError::Pool(e) => e.code(),
            FundingError::Store(e) => e.code(),
        }
    }

    fn class(&self) -> ErrorClass {
        match self {
            FundingError::InvalidAmount(_) => ErrorClass::Validation,
            FundingError::NoSources => ErrorClass::Internal,
            FundingError::InsufficientFunds { .. } => ErrorClass::DomainState,
            FundingError::Pool(e) => e.class(),
            FundingError::Store(e) => e.class(),
        }
    }
}

/// One configured source with its minimum reserve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingSource {
    pub pool: PoolType,
    #[serde(default)]
    pub reserve_floor: Decimal,
}

impl FundingSource {
    pub fn new(pool: PoolType, reserve_floor: Decimal) -> Self {
        Self {
            pool,
            reserve_floor,
        }
    }
}

/// Default order: the project's own cashflow, then treasury, then liquidity.
pub fn default_sources() -> Vec<FundingSource> {
    vec![
        FundingSource::new(PoolType::ProjectCashflow, Decimal::ZERO),
        FundingSource::new(PoolType::Treasury, Decimal::ZERO),
        FundingSource::new(PoolType::Liquidity, Decimal::ZERO),
    ]
}

/// How much one source could contribute at resolution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAvailability {
    pub pool: PoolType,
    pub balance: Decimal,
    pub reserve_floor: Decimal,
    pub committed: Decimal,
    pub available: Decimal,
    pub sufficient: bool,
}

/// The selected source plus what was examined on the way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingDecision {
    pub selected: PoolType,
    pub required: Decimal,
    pub breakdown: Vec<SourceAvailability>,
}

impl fmt::Display for FundingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Funding Decision ===")?;
        writeln!(f, "Required: {}", self.required)?;
        writeln!(f, "Selected: {}", self.selected)?;
        for source in &self.breakdown {
            writeln!(
                f,
                "  {:<16} balance {:>14}  floor {:>10}  committed {:>12}  available {:>14}{}",
                source.pool.as_str(),
                source.balance,
                source.reserve_floor,
                source.committed,
                source.available,
                if source.sufficient { "  <-" } else { "" }
            )?;
        }
        Ok(())
    }
}

/// Ordered list of funding sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingResolver {
    sources: Vec<FundingSource>,
}

impl FundingResolver {
    pub fn new(sources: Vec<FundingSource>) -> Self {
        Self { sources }
    }

    pub fn sources(&self) -> &[FundingSource] {
        &self.sources
    }

    pub fn reserve_floor(&self, pool: PoolType) -> Decimal {
        self.sources
            .iter()
            .find(|s| s.pool == pool)
            .map(|s| s.reserve_floor)
            .unwrap_or(Decimal::ZERO)
    }

    /// Pick a source using balances from `position`, which returns
    /// `(balance, committed)` for a pool.
    pub fn resolve_with<F>(&self, required: Decimal, mut position: F) -> Result<FundingDecision, FundingError>
    where
        F: FnMut(PoolType) -> Result<(Decimal, Decimal), FundingError>,
    {
        if required <= Decimal::ZERO {
            return Err(FundingError::InvalidAmount(required));
        }
        if self.sources.is_empty() {
            return Err(FundingError::NoSources);
        }

        let mut breakdown = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let (balance, committed) = position(source.pool)?;
            let available = balance - source.reserve_floor - committed;
            let sufficient = available >= required;
            breakdown.push(SourceAvailability {
                pool: source.pool,
                balance,
                reserve_floor: source.reserve_floor,
                committed,
                available,
                sufficient,
            });
            if sufficient {
                return Ok(FundingDecision {
                    selected: source.pool,
                    required,
                    breakdown,
                });
            }
        }
        Err(FundingError::InsufficientFunds {
            required,
            breakdown,
        })
    }

    /// Pick a source for a payout of `required` on behalf of `project`.
    pub fn resolve(
        &self,
        conn: &Connection,
        project: &ProjectId,
        required: Decimal,
    ) -> Result<FundingDecision, FundingError> {
        self.resolve_with(required, |pool_type| {
            let balance = pool::pool_balance(conn, pool_type, Some(project))?;
            let committed = pending_commitments(conn, pool_type, Some(project), None)?;
            Ok((balance, committed))
        })
    }
}

impl Default for FundingResolver {
    fn default() -> Self {
        Self::new(default_sources())
    }
}

/// Money already promised out of a pool but not yet recorded in its log:
/// pending redemptions funded by the pool and capital allocations whose
/// transfer is in flight. `exclude` skips one entity (the one being staged).
pub fn pending_commitments(
    conn: &Connection,
    pool_type: PoolType,
    project: Option<&ProjectId>,
    exclude: Option<Uuid>,
) -> Result<Decimal, FundingError> {
    let scope = if pool_type.is_project_scoped() {
        project.map(|p| p.as_str().to_string())
    } else {
        None
    };
    let excluded = exclude.map(|id| id.to_string());
    let mut total = Decimal::ZERO;

    let mut redemptions = conn.prepare(
        "SELECT payout_amount FROM redemption_requests
         WHERE status = 'pending' AND funding_source = ?1
           AND (?2 IS NULL OR project_id = ?2) AND (?3 IS NULL OR id <> ?3)",
    )?;
    let rows = redemptions.query_map(params![pool_type.as_str(), scope, excluded], |row| {
        codec::decimal(row, 0)
    })?;
    for row in rows {
        total += row?;
    }

    let mut allocations = conn.prepare(
        "SELECT amount FROM capital_allocations
         WHERE settlement_state = 'external_pending' AND pool_type = ?1
           AND (?2 IS NULL OR project_id = ?2) AND (?3 IS NULL OR id <> ?3)",
    )?;
    let rows = allocations.query_map(params![pool_type.as_str(), scope, excluded], |row| {
        codec::decimal(row, 0)
    })?;
    for row in rows {
        total += row?;
    }
    Ok(total)
}
