use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row, Transaction};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::ids::ProjectId;
use crate::error::{ErrorClass, ErrorCode};
use crate::store::codec::{self, UnknownVariant};
use crate::store::{Store, StoreError};

/// A capital pool. Closed set; every match over it is exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    Treasury,
    Liquidity,
    Distribution,
    Operations,
    /// Per-project operating cash. Rows are always scoped to a project.
    ProjectCashflow,
}

impl PoolType {
    pub const ALL: [PoolType; 5] = [
        PoolType::Treasury,
        PoolType::Liquidity,
        PoolType::Distribution,
        PoolType::Operations,
        PoolType::ProjectCashflow,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PoolType::Treasury => "treasury",
            PoolType::Liquidity => "liquidity",
            PoolType::Distribution => "distribution",
            PoolType::Operations => "operations",
            PoolType::ProjectCashflow => "project_cashflow",
        }
    }

    pub fn is_project_scoped(self) -> bool {
        matches!(self, PoolType::ProjectCashflow)
    }
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "treasury" => Ok(PoolType::Treasury),
            "liquidity" => Ok(PoolType::Liquidity),
            "distribution" => Ok(PoolType::Distribution),
            "operations" => Ok(PoolType::Operations),
            "project_cashflow" => Ok(PoolType::ProjectCashflow),
            other => Err(UnknownVariant::new("pool type", other)),
        }
    }
}

/// Direction of a pool movement. Amounts are always stored positive; the
/// direction decides the sign when the balance is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolDirection {
    Inflow,
    Outflow,
    /// Capital moved from the pool to a project.
    Allocation,
    /// Fees collected into the pool.
    Fee,
    /// Pool spent buying tokens back from holders.
    Buyback,
}

impl PoolDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            PoolDirection::Inflow => "inflow",
            PoolDirection::Outflow => "outflow",
            PoolDirection::Allocation => "allocation",
            PoolDirection::Fee => "fee",
            PoolDirection::Buyback => "buyback",
        }
    }

    /// Signed contribution of `amount` to the pool balance.
    pub fn signed(self, amount: Decimal) -> Decimal {
        match self {
            PoolDirection::Inflow | PoolDirection::Fee => amount,
            PoolDirection::Outflow | PoolDirection::Allocation | PoolDirection::Buyback => -amount,
        }
    }
}

impl fmt::Display for PoolDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolDirection {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inflow" => Ok(PoolDirection::Inflow),
            "outflow" => Ok(PoolDirection::Outflow),
            "allocation" => Ok(PoolDirection::Allocation),
            "fee" => Ok(PoolDirection::Fee),
            "buyback" => Ok(PoolDirection::Buyback),
            other => Err(UnknownVariant::new("pool direction", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool amount must be positive, got {0}")]
    InvalidAmount(Decimal),
    #[error("{0} pool rows must be scoped to a project")]
    MissingProjectScope(PoolType),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for PoolError {
    fn from(e: rusqlite::Error) -> Self {
        PoolError::Store(e.into())
    }
}

impl ErrorCode for PoolError {
    fn code(&self) -> &'static str {
        match self {
            PoolError::InvalidAmount(_) => "INVALID_AMOUNT",
            PoolError::MissingProjectScope(_) => "MISSING_PROJECT_SCOPE",
            PoolError::Store(e) => e.code(),
        }
    }

    fn class(&self) -> ErrorClass {
        match self {
            PoolError::Store(e) => e.class(),
            _ => ErrorClass::Validation,
        }
    }
}

/// One append-only row of the capital pool log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalPoolTransaction {
    pub id: Uuid,
    pub pool_type: PoolType,
    pub direction: PoolDirection,
    pub amount: Decimal,
    pub project_id: Option<ProjectId>,
    pub source_reference: String,
    pub created_at: DateTime<Utc>,
}

impl CapitalPoolTransaction {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: codec::uuid(row, 0)?,
            pool_type: codec::variant(row, 1)?,
            direction: codec::variant(row, 2)?,
            amount: codec::decimal(row, 3)?,
            project_id: row.get::<_, Option<String>>(4)?.map(ProjectId::new),
            source_reference: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    pub fn signed_amount(&self) -> Decimal {
        self.direction.signed(self.amount)
    }
}

/// Append one row to the pool log. There is no update or delete path.
pub fn append_pool_transaction(
    tx: &Transaction<'_>,
    pool_type: PoolType,
    direction: PoolDirection,
    amount: Decimal,
    project_id: Option<&ProjectId>,
    source_reference: &str,
) -> Result<CapitalPoolTransaction, PoolError> {
    if amount <= Decimal::ZERO {
        return Err(PoolError::InvalidAmount(amount));
    }
    if pool_type.is_project_scoped() && project_id.is_none() {
        return Err(PoolError::MissingProjectScope(pool_type));
    }
    let row = CapitalPoolTransaction {
        id: Uuid::new_v4(),
        pool_type,
        direction,
        amount,
        project_id: project_id.cloned(),
        source_reference: source_reference.to_string(),
        created_at: Utc::now(),
    };
    tx.execute(
        "INSERT INTO pool_transactions (id, pool_type, direction, amount, project_id, source_reference, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            row.id.to_string(),
            pool_type.as_str(),
            direction.as_str(),
            codec::money(amount),
            row.project_id.as_ref().map(|p| p.as_str().to_string()),
            row.source_reference,
            row.created_at,
        ],
    )?;
    Ok(row)
}

/// Pool log rows, oldest first. Project-scoped pools are filtered by
/// `project`; global pools ignore it.
pub fn pool_transactions(
    conn: &Connection,
    pool_type: PoolType,
    project: Option<&ProjectId>,
) -> Result<Vec<CapitalPoolTransaction>, PoolError> {
    let scope = match (pool_type.is_project_scoped(), project) {
        (true, Some(p)) => Some(p.as_str().to_string()),
        (true, None) => return Err(PoolError::MissingProjectScope(pool_type)),
        (false, _) => None,
    };
    let mut stmt = conn.prepare(
        "SELECT id, pool_type, direction, amount, project_id, source_reference, created_at
         FROM pool_transactions
         WHERE pool_type = ?1 AND (?2 IS NULL OR project_id = ?2)
         ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![pool_type.as_str(), scope], CapitalPoolTransaction::from_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// Current balance of a pool, derived by summing its log.
///
/// The sum runs over exact decimals in Rust; SQLite's `SUM` would go
/// through floating point.
pub fn pool_balance(
    conn: &Connection,
    pool_type: PoolType,
    project: Option<&ProjectId>,
) -> Result<Decimal, PoolError> {
    Ok(pool_transactions(conn, pool_type, project)?
        .iter()
        .map(CapitalPoolTransaction::signed_amount)
        .sum())
}

/// Per-pool totals of the global pools, for operator reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStatement {
    pub balances: BTreeMap<PoolType, Decimal>,
    pub inflows: BTreeMap<PoolType, Decimal>,
    pub outflows: BTreeMap<PoolType, Decimal>,
}

impl PoolStatement {
    pub fn build(conn: &Connection) -> Result<Self, PoolError> {
        let mut statement = PoolStatement::default();
        for pool in PoolType::ALL {
            if pool.is_project_scoped() {
                continue;
            }
            for row in pool_transactions(conn, pool, None)? {
                let signed = row.signed_amount();
                *statement.balances.entry(pool).or_insert(Decimal::ZERO) += signed;
                let bucket = if signed > Decimal::ZERO {
                    &mut statement.inflows
                } else {
                    &mut statement.outflows
                };
                *bucket.entry(pool).or_insert(Decimal::ZERO) += row.amount;
            }
        }
        Ok(statement)
    }

    pub fn balance(&self, pool: PoolType) -> Decimal {
        self.balances.get(&pool).copied().unwrap_or(Decimal::ZERO)
    }
}

impl fmt::Display for PoolStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Pool Statement ===")?;
        for (pool, balance) in &self.balances {
            let inflow = self.inflows.get(pool).copied().unwrap_or(Decimal::ZERO);
            let outflow = self.outflows.get(pool).copied().unwrap_or(Decimal::ZERO);
            writeln!(
                f,
                "  {:<14} balance {:>16}  in {:>16}  out {:>16}",
                pool.as_str(),
                balance,
                inflow,
                outflow
            )?;
        }
        Ok(())
    }
}

/// Store-level entry points for operator deposits into pools.
pub struct PoolLedger<'a> {
    store: &'a Store,
}

impl<'a> PoolLedger<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn deposit(
        &self,
        pool_type: PoolType,
        project: Option<&ProjectId>,
        amount: Decimal,
        source_reference: &str,
    ) -> Result<CapitalPoolTransaction, PoolError> {
        self.store.write(|tx| {
            append_pool_transaction(
                tx,
                pool_type,
                PoolDirection::Inflow,
                amount,
                project,
                source_reference,
            )
        })
    }

    pub fn balance(&self, pool_type: PoolType, project: Option<&ProjectId>) -> Result<Decimal, PoolError> {
        self.store.read(|conn| pool_balance(conn, pool_type, project))
    }

    pub fn statement(&self) -> Result<PoolStatement, PoolError> {
        self.store.read(PoolStatement::build)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_balance_is_derived_from_log() {
        let store = Store::open_in_memory().unwrap();
        store
            .write(|tx| {
                append_pool_transaction(tx, PoolType::Treasury, PoolDirection::Inflow, dec!(100), None, "seed")?;
                append_pool_transaction(tx, PoolType::Treasury, PoolDirection::Fee, dec!(5), None, "fee")?;
                append_pool_transaction(tx, PoolType::Treasury, PoolDirection::Allocation, dec!(30), None, "alloc")?;
                append_pool_transaction(tx, PoolType::Treasury, PoolDirection::Buyback, dec!(10.5), None, "buy")?;
                Ok::<_, PoolError>(())
            })
            .unwrap();

        let balance = PoolLedger::new(&store).balance(PoolType::Treasury, None).unwrap();
        assert_eq!(balance, dec!(64.5));
    }

    #[test]
    fn test_project_cashflow_requires_scope() {
        let store = Store::open_in_memory().unwrap();
        let result = PoolLedger::new(&store).deposit(PoolType::ProjectCashflow, None, dec!(1), "x");
        assert!(matches!(result, Err(PoolError::MissingProjectScope(_))));
    }

    #[test]
    fn test_project_cashflow_is_isolated_per_project() {
        let store = Store::open_in_memory().unwrap();
        let ledger = PoolLedger::new(&store);
        let a = ProjectId::new("A");
        let b = ProjectId::new("B");
        ledger.deposit(PoolType::ProjectCashflow, Some(&a), dec!(50), "a").unwrap();
        ledger.deposit(PoolType::ProjectCashflow, Some(&b), dec!(70), "b").unwrap();
        assert_eq!(ledger.balance(PoolType::ProjectCashflow, Some(&a)).unwrap(), dec!(50));
        assert_eq!(ledger.balance(PoolType::ProjectCashflow, Some(&b)).unwrap(), dec!(70));
    }

    #[test]
    fn test_rejects_non_positive_amount() {
        let store = Store::open_in_memory().unwrap();
        let result = PoolLedger::new(&store).deposit(PoolType::Liquidity, None, Decimal::ZERO, "x");
        assert!(matches!(result, Err(PoolError::InvalidAmount(_))));
    }

    #[test]
    fn test_statement() {
        let store = Store::open_in_memory().unwrap();
        let ledger = PoolLedger::new(&store);
        ledger.deposit(PoolType::Liquidity, None, dec!(100), "seed").unwrap();
        store
            .write(|tx| {
                append_pool_transaction(tx, PoolType::Liquidity, PoolDirection::Outflow, dec!(40), None, "payout")
            })
            .unwrap();
        let statement = ledger.statement().unwrap();
        assert_eq!(statement.balance(PoolType::Liquidity), dec!(60));
        assert_eq!(statement.inflows[&PoolType::Liquidity], dec!(100));
        assert_eq!(statement.outflows[&PoolType::Liquidity], dec!(40));
        assert_eq!(statement.balance(PoolType::Treasury), Decimal::ZERO);
    }
}
