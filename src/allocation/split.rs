//! Fixed-percentage splits.
//!
//! Revenue is divided across destinations by configured percentages that
//! must sum to exactly 100. A mismatched sum is a validation failure; the
//! percentages are never renormalised. Rounding reuses the same
//! floor-plus-largest-remainder rule as holder allocations, so the legs
//! always add back up to the input amount.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::allocation::largest_remainder::{distribute_units, AllocationError};
use crate::core::money;
use crate::core::pool::PoolType;
use crate::store::codec::UnknownVariant;

/// Where a slice of revenue goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitDestination {
    Treasury,
    Holders,
    Liquidity,
    Operations,
}

impl SplitDestination {
    pub fn as_str(self) -> &'static str {
        match self {
            SplitDestination::Treasury => "treasury",
            SplitDestination::Holders => "holders",
            SplitDestination::Liquidity => "liquidity",
            SplitDestination::Operations => "operations",
        }
    }

    /// Pool that receives this slice. Holder money lands in the
    /// distribution pool before it is attributed to individual holders.
    pub fn pool(self) -> PoolType {
        match self {
            SplitDestination::Treasury => PoolType::Treasury,
            SplitDestination::Holders => PoolType::Distribution,
            SplitDestination::Liquidity => PoolType::Liquidity,
            SplitDestination::Operations => PoolType::Operations,
        }
    }
}

impl fmt::Display for SplitDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SplitDestination {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "treasury" => Ok(SplitDestination::Treasury),
            "holders" => Ok(SplitDestination::Holders),
            "liquidity" => Ok(SplitDestination::Liquidity),
            "operations" => Ok(SplitDestination::Operations),
            other => Err(UnknownVariant::new("split destination", other)),
        }
    }
}

/// Four-way revenue split, in percent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevenueSplit {
    pub treasury: Decimal,
    pub holders: Decimal,
    pub liquidity: Decimal,
    pub operations: Decimal,
}

impl Default for RevenueSplit {
    fn default() -> Self {
        Self {
            treasury: Decimal::from(15),
            holders: Decimal::from(70),
            liquidity: Decimal::from(10),
            operations: Decimal::from(5),
        }
    }
}

impl RevenueSplit {
    pub fn legs(&self) -> [(SplitDestination, Decimal); 4] {
        [
            (SplitDestination::Treasury, self.treasury),
            (SplitDestination::Holders, self.holders),
            (SplitDestination::Liquidity, self.liquidity),
            (SplitDestination::Operations, self.operations),
        ]
    }

    pub fn validate(&self) -> Result<(), AllocationError> {
        validate_percentages(&self.legs())
    }

    pub fn apply(
        &self,
        amount: Decimal,
        scale: u32,
    ) -> Result<Vec<SplitLeg<SplitDestination>>, AllocationError> {
        split_by_percentages(amount, &self.legs(), scale)
    }
}

/// One output leg of a percentage split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitLeg<K> {
    pub key: K,
    pub percentage: Decimal,
    pub amount: Decimal,
}

fn validate_percentages<K: fmt::Display>(legs: &[(K, Decimal)]) -> Result<(), AllocationError> {
    for (key, pct) in legs {
        if *pct < Decimal::ZERO {
            return Err(AllocationError::NegativeWeight {
                claimant: key.to_string(),
                weight: *pct,
            });
        }
    }
    let sum: Decimal = legs.iter().map(|(_, p)| *p).sum();
    if sum != Decimal::ONE_HUNDRED {
        return Err(AllocationError::PercentagesMismatch(sum));
    }
    Ok(())
}

/// Split `amount` by percentages summing to exactly 100.
///
/// Legs are returned in input order; zero-percent legs are kept with a
/// zero amount so every destination is accounted for.
///
/// # Examples
///
/// ```
/// use settlement_core::allocation::split::split_by_percentages;
/// use rust_decimal_macros::dec;
///
/// let legs = split_by_percentages(
///     dec!(100.01),
///     &[("a", dec!(33.33)), ("b", dec!(33.33)), ("c", dec!(33.34))],
///     2,
/// ).unwrap();
/// let total: rust_decimal::Decimal = legs.iter().map(|l| l.amount).sum();
/// assert_eq!(total, dec!(100.01));
/// ```
pub fn split_by_percentages<K>(
    amount: Decimal,
    legs: &[(K, Decimal)],
    scale: u32,
) -> Result<Vec<SplitLeg<K>>, AllocationError>
where
    K: Clone + Ord + fmt::Display,
{
    validate_percentages(legs)?;
    if amount <= Decimal::ZERO {
        return Err(AllocationError::NonPositiveTotal(amount));
    }
    let units = money::to_minor_units(amount, scale)?;
    let distributed = distribute_units(units, legs)?;
    distributed
        .into_iter()
        .zip(legs)
        .map(|((key, leg_units, _), (_, pct))| -> Result<SplitLeg<K>, AllocationError> {
            Ok(SplitLeg {
                key,
                percentage: *pct,
                amount: money::from_minor_units(leg_units, scale)?,
            })
        })
        .collect()
}
