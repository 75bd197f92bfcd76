use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::allocation::split::RevenueSplit;
use crate::core::ids::{HolderId, ProjectId};
use crate::error::{ErrorClass, ErrorCode};
use crate::store::codec;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("project {0} not found")]
    NotFound(ProjectId),
    #[error("project {0} already exists")]
    AlreadyExists(ProjectId),
    #[error("token amount must be positive, got {0}")]
    InvalidTokenAmount(Decimal),
    #[error("holder {holder} holds {held} tokens of {project}, cannot retire {requested}")]
    InsufficientHolding {
        project: ProjectId,
        holder: HolderId,
        held: Decimal,
        requested: Decimal,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for ProjectError {
    fn from(e: rusqlite::Error) -> Self {
        ProjectError::Store(e.into())
    }
}

impl ErrorCode for ProjectError {
    fn code(&self) -> &'static str {
        match self {
            ProjectError::NotFound(_) => "PROJECT_NOT_FOUND",
            ProjectError::AlreadyExists(_) => "PROJECT_EXISTS",
            ProjectError::InvalidTokenAmount(_) => "INVALID_AMOUNT",
            ProjectError::InsufficientHolding { .. } => "INSUFFICIENT_HOLDING",
            ProjectError::Store(e) => e.code(),
        }
    }

    fn class(&self) -> ErrorClass {
        match self {
            ProjectError::NotFound(_) | ProjectError::InvalidTokenAmount(_) => {
                ErrorClass::Validation
            }
            ProjectError::AlreadyExists(_) | ProjectError::InsufficientHolding { .. } => {
                ErrorClass::DomainState
            }
            ProjectError::Store(e) => e.class(),
        }
    }
}

/// A fixed-term project whose value is fractionalised into tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Outstanding tokens; the denominator of every per-token price.
    pub token_supply: Decimal,
    /// Cached price per token, recomputed whenever the NAV is rewritten by a burn.
    pub token_price: Option<Decimal>,
    /// Project-specific revenue split; the configured default applies when absent.
    pub revenue_split: Option<RevenueSplit>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<(Self, Option<String>)> {
        Ok((
            Self {
                id: ProjectId::new(row.get::<_, String>(0)?),
                name: row.get(1)?,
                token_supply: codec::decimal(row, 2)?,
                token_price: codec::opt_decimal(row, 3)?,
                revenue_split: None,
                created_at: row.get(5)?,
            },
            row.get(4)?,
        ))
    }
}

/// One holder's token balance in a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenHolding {
    pub project_id: ProjectId,
    pub holder_id: HolderId,
    pub balance: Decimal,
}

pub fn register_project(
    tx: &Transaction<'_>,
    id: &ProjectId,
    name: &str,
    token_supply: Decimal,
    revenue_split: Option<&RevenueSplit>,
) -> Result<Project, ProjectError> {
    if token_supply < Decimal::ZERO {
        return Err(ProjectError::InvalidTokenAmount(token_supply));
    }
    if project_exists(tx, id)? {
        return Err(ProjectError::AlreadyExists(id.clone()));
    }
    let split_json = revenue_split
        .map(serde_json::to_string)
        .transpose()
        .map_err(StoreError::from)?;
    let now = Utc::now();
    tx.execute(
        "INSERT INTO projects (id, name, token_supply, revenue_split, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id.as_str(), name, codec::money(token_supply), split_json, now],
    )?;
    debug!("Registered project {} with supply {}", id, token_supply);
    Ok(Project {
        id: id.clone(),
        name: name.to_string(),
        token_supply,
        token_price: None,
        revenue_split: revenue_split.cloned(),
        created_at: now,
    })
}

pub fn project_exists(conn: &Connection, id: &ProjectId) -> Result<bool, ProjectError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM projects WHERE id = ?1",
            [id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn get_project(conn: &Connection, id: &ProjectId) -> Result<Project, ProjectError> {
    let row = conn
        .query_row(
            "SELECT id, name, token_supply, token_price, revenue_split, created_at FROM projects WHERE id = ?1",
            [id.as_str()],
            Project::from_row,
        )
        .optional()?;
    let (mut project, split_json) = row.ok_or_else(|| ProjectError::NotFound(id.clone()))?;
    project.revenue_split = split_json
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(StoreError::from)?;
    Ok(project)
}

pub fn set_token_price(
    tx: &Transaction<'_>,
    id: &ProjectId,
    price: Decimal,
) -> Result<(), ProjectError> {
    let updated = tx.execute(
        "UPDATE projects SET token_price = ?1 WHERE id = ?2",
        params![codec::money(price), id.as_str()],
    )?;
    if updated == 0 {
        return Err(ProjectError::NotFound(id.clone()));
    }
    Ok(())
}

/// Issue new tokens to a holder. Increases both the holding and the supply.
pub fn issue_tokens(
    tx: &Transaction<'_>,
    project: &ProjectId,
    holder: &HolderId,
    tokens: Decimal,
) -> Result<TokenHolding, ProjectError> {
    if tokens <= Decimal::ZERO {
        return Err(ProjectError::InvalidTokenAmount(tokens));
    }
    let current = get_project(tx, project)?;
    let held = holding_balance(tx, project, holder)?;
    let balance = held + tokens;
    write_holding(tx, project, holder, balance)?;
    write_supply(tx, project, current.token_supply + tokens)?;
    Ok(TokenHolding {
        project_id: project.clone(),
        holder_id: holder.clone(),
        balance,
    })
}

/// Retire tokens a holder has redeemed. Decreases both the holding and the supply.
pub fn retire_tokens(
    tx: &Transaction<'_>,
    project: &ProjectId,
    holder: &HolderId,
    tokens: Decimal,
) -> Result<TokenHolding, ProjectError> {
    if tokens <= Decimal::ZERO {
        return Err(ProjectError::InvalidTokenAmount(tokens));
    }
    let current = get_project(tx, project)?;
    let held = holding_balance(tx, project, holder)?;
    if held < tokens {
        return Err(ProjectError::InsufficientHolding {
            project: project.clone(),
            holder: holder.clone(),
            held,
            requested: tokens,
        });
    }
    let balance = held - tokens;
    write_holding(tx, project, holder, balance)?;
    write_supply(tx, project, current.token_supply - tokens)?;
    Ok(TokenHolding {
        project_id: project.clone(),
        holder_id: holder.clone(),
        balance,
    })
}

pub fn holding_balance(
    conn: &Connection,
    project: &ProjectId,
    holder: &HolderId,
) -> Result<Decimal, ProjectError> {
    let balance = conn
        .query_row(
            "SELECT balance FROM token_holdings WHERE project_id = ?1 AND holder_id = ?2",
            [project.as_str(), holder.as_str()],
            |row| codec::decimal(row, 0),
        )
        .optional()?;
    Ok(balance.unwrap_or(Decimal::ZERO))
}

/// All holdings of a project, ordered by holder id.
pub fn holdings(conn: &Connection, project: &ProjectId) -> Result<Vec<TokenHolding>, ProjectError> {
    let mut stmt = conn.prepare(
        "SELECT holder_id, balance FROM token_holdings WHERE project_id = ?1 ORDER BY holder_id",
    )?;
    let rows = stmt.query_map([project.as_str()], |row| {
        Ok(TokenHolding {
            project_id: project.clone(),
            holder_id: HolderId::new(row.get::<_, String>(0)?),
            balance: codec::decimal(row, 1)?,
        })
    })?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

fn write_holding(
    tx: &Transaction<'_>,
    project: &ProjectId,
    holder: &HolderId,
    balance: Decimal,
) -> Result<(), ProjectError> {
    tx.execute(
        "INSERT INTO token_holdings (project_id, holder_id, balance, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (project_id, holder_id) DO UPDATE SET balance = excluded.balance, updated_at = excluded.updated_at",
        params![project.as_str(), holder.as_str(), codec::money(balance), Utc::now()],
    )?;
    Ok(())
}

fn write_supply(tx: &Transaction<'_>, project: &ProjectId, supply: Decimal) -> Result<(), ProjectError> {
    tx.execute(
        "UPDATE projects SET token_supply = ?1 WHERE id = ?2",
        params![codec::money(supply), project.as_str()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use rust_decimal_macros::dec;

    fn setup() -> (Store, ProjectId) {
        let store = Store::open_in_memory().unwrap();
        let id = ProjectId::new("PRJ-1");
        store
            .write(|tx| register_project(tx, &id, "Solar farm", Decimal::ZERO, None))
            .unwrap();
        (store, id)
    }

    #[test]
    fn test_register_and_get() {
        let (store, id) = setup();
        let project = store.read(|conn| get_project(conn, &id)).unwrap();
        assert_eq!(project.name, "Solar farm");
        assert_eq!(project.token_supply, Decimal::ZERO);
        assert!(project.revenue_split.is_none());
    }

    #[test]
    fn test_duplicate_project_rejected() {
        let (store, id) = setup();
        let result = store.write(|tx| register_project(tx, &id, "Again", Decimal::ZERO, None));
        assert!(matches!(result, Err(ProjectError::AlreadyExists(_))));
    }

    #[test]
    fn test_issue_and_retire_track_supply() {
        let (store, id) = setup();
        let alice = HolderId::new("alice");
        store
            .write(|tx| issue_tokens(tx, &id, &alice, dec!(300)))
            .unwrap();
        store
            .write(|tx| retire_tokens(tx, &id, &alice, dec!(100)))
            .unwrap();

        let project = store.read(|conn| get_project(conn, &id)).unwrap();
        assert_eq!(project.token_supply, dec!(200));
        let held = store
            .read(|conn| holding_balance(conn, &id, &alice))
            .unwrap();
        assert_eq!(held, dec!(200));
    }

    #[test]
    fn test_retire_more_than_held() {
        let (store, id) = setup();
        let alice = HolderId::new("alice");
        store.write(|tx| issue_tokens(tx, &id, &alice, dec!(10))).unwrap();
        let result = store.write(|tx| retire_tokens(tx, &id, &alice, dec!(11)));
        assert!(matches!(
            result,
            Err(ProjectError::InsufficientHolding { .. })
        ));
    }
}
