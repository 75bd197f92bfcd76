//! Settlement configuration.
//!
//! Every field has a default, so a config file only needs to name what it
//! overrides:
//!
//! ```json
//! {
//!   "asset_issuer": "GISSUER...",
//!   "pool_accounts": { "treasury": "GTREASURY...", "liquidity": "GLIQ..." },
//!   "funding_sources": [
//!     { "pool": "project_cashflow" },
//!     { "pool": "treasury", "reserve_floor": "1000" },
//!     { "pool": "liquidity", "reserve_floor": "20" }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::allocation::split::RevenueSplit;
use crate::core::money::{self, AssetCode, NETWORK_PRECISION};
use crate::core::pool::PoolType;
use crate::error::{ErrorClass, ErrorCode};
use crate::jobs::revenue::HolderSharePolicy;
use crate::reconciliation::audit::AuditQueueConfig;
use crate::treasury::funding::{self, FundingResolver, FundingSource};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ErrorCode for ConfigError {
    fn code(&self) -> &'static str {
        "CONFIG_ERROR"
    }

    fn class(&self) -> ErrorClass {
        ErrorClass::Validation
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Fractional digits of the settlement currency's smallest unit.
    pub minor_unit_scale: u32,
    /// Token burned on disbursement and moved on payouts.
    pub settlement_asset: AssetCode,
    /// Issuer account of the settlement asset. Transfers to it are burns.
    pub asset_issuer: String,
    /// Native reserve sent when a project wallet is created.
    pub starting_reserve: Decimal,
    /// Payout sources, in the order they are tried.
    pub funding_sources: Vec<FundingSource>,
    /// Network account backing each global pool.
    pub pool_accounts: BTreeMap<PoolType, String>,
    /// Applied when a project carries no split of its own.
    pub revenue_split: RevenueSplit,
    pub holder_share_policy: HolderSharePolicy,
    pub network_timeout_ms: u64,
    pub audit: AuditQueueConfig,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            minor_unit_scale: money::DEFAULT_MINOR_UNIT_SCALE,
            settlement_asset: AssetCode::new("NGNTS"),
            asset_issuer: String::new(),
            starting_reserve: Decimal::from(2),
            funding_sources: funding::default_sources(),
            pool_accounts: BTreeMap::new(),
            revenue_split: RevenueSplit::default(),
            holder_share_policy: HolderSharePolicy::default(),
            network_timeout_ms: 30_000,
            audit: AuditQueueConfig::default(),
        }
    }
}

impl SettlementConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: SettlementConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.minor_unit_scale > NETWORK_PRECISION {
            return Err(ConfigError::Invalid(format!(
                "minor_unit_scale {} exceeds network precision {}",
                self.minor_unit_scale, NETWORK_PRECISION
            )));
        }
        if self.settlement_asset.as_str().is_empty() {
            return Err(ConfigError::Invalid("settlement_asset is empty".to_string()));
        }
        if self.starting_reserve <= Decimal::ZERO {
            return Err(ConfigError::Invalid(format!(
                "starting_reserve must be positive, got {}",
                self.starting_reserve
            )));
        }
        self.revenue_split
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("revenue_split: {}", e)))?;
        for (i, source) in self.funding_sources.iter().enumerate() {
            if source.reserve_floor < Decimal::ZERO {
                return Err(ConfigError::Invalid(format!(
                    "funding source {} has a negative reserve floor",
                    source.pool
                )));
            }
            if self.funding_sources[..i].iter().any(|s| s.pool == source.pool) {
                return Err(ConfigError::Invalid(format!(
                    "funding source {} listed twice",
                    source.pool
                )));
            }
        }
        if self.network_timeout_ms == 0 {
            return Err(ConfigError::Invalid("network_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn funding_resolver(&self) -> FundingResolver {
        FundingResolver::new(self.funding_sources.clone())
    }

    pub fn pool_account(&self, pool: PoolType) -> Option<&str> {
        self.pool_accounts.get(&pool).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        SettlementConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "asset_issuer": "GISSUER",
                "pool_accounts": {{ "treasury": "GTREASURY" }},
                "funding_sources": [{{ "pool": "liquidity", "reserve_floor": "20" }}],
                "holder_share_policy": "equal"
            }}"#
        )
        .unwrap();

        let config = SettlementConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.minor_unit_scale, 2);
        assert_eq!(config.asset_issuer, "GISSUER");
        assert_eq!(config.pool_account(PoolType::Treasury), Some("GTREASURY"));
        assert_eq!(config.funding_sources[0].reserve_floor, dec!(20));
        assert_eq!(config.holder_share_policy, HolderSharePolicy::Equal);
        assert_eq!(config.revenue_split, RevenueSplit::default());
    }

    #[test]
    fn test_rejects_bad_split() {
        let config = SettlementConfig {
            revenue_split: RevenueSplit {
                treasury: dec!(50),
                holders: dec!(50),
                liquidity: dec!(10),
                operations: dec!(0),
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_duplicate_source() {
        let config = SettlementConfig {
            funding_sources: vec![
                FundingSource::new(PoolType::Treasury, dec!(0)),
                FundingSource::new(PoolType::Treasury, dec!(10)),
            ],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
