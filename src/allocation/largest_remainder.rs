use crate::core::ids::HolderId;
use crate::core::money::{self, MoneyError};
use crate::error::{ErrorClass, ErrorCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Decimal places kept on informational ownership percentages.
const OWNERSHIP_DP: u32 = 6;

#[derive(Debug, Error, PartialEq)]
pub enum AllocationError {
    #[error("no eligible holders: total weight is zero")]
    NoEligibleHolders,
    #[error("weight for {claimant} must not be negative, got {weight}")]
    NegativeWeight { claimant: String, weight: Decimal },
    #[error("claimant {0} appears more than once")]
    DuplicateClaimant(String),
    #[error("total must be positive, got {0}")]
    NonPositiveTotal(Decimal),
    #[error("percentages must sum to exactly 100, got {0}")]
    PercentagesMismatch(Decimal),
    #[error("allocation arithmetic overflowed")]
    Overflow,
    #[error(transparent)]
    Money(#[from] MoneyError),
}

impl ErrorCode for AllocationError {
    fn code(&self) -> &'static str {
        match self {
            AllocationError::NoEligibleHolders => "NO_ELIGIBLE_HOLDERS",
            AllocationError::NegativeWeight { .. } => "NEGATIVE_WEIGHT",
            AllocationError::DuplicateClaimant(_) => "DUPLICATE_CLAIMANT",
            AllocationError::NonPositiveTotal(_) => "INVALID_AMOUNT",
            AllocationError::PercentagesMismatch(_) => "PERCENTAGES_MISMATCH",
            AllocationError::Overflow => "ALLOCATION_OVERFLOW",
            AllocationError::Money(_) => "INVALID_AMOUNT",
        }
    }

    fn class(&self) -> ErrorClass {
        match self {
            AllocationError::NoEligibleHolders => ErrorClass::DomainState,
            _ => ErrorClass::Validation,
        }
    }
}

/// A holder's claim on a pool of money.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub holder: HolderId,
    pub weight: Decimal,
}

impl Claim {
    pub fn new(holder: impl Into<HolderId>, weight: Decimal) -> Self {
        Self {
            holder: holder.into(),
            weight,
        }
    }
}

/// One holder's outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Share {
    pub holder: HolderId,
    pub weight: Decimal,
    /// Informational; `weight / total_weight * 100`, rounded.
    pub ownership_percentage: Decimal,
    pub amount: Decimal,
    /// Whether this holder received one of the leftover minor units.
    pub received_remainder: bool,
}

/// Result of a pro-rata allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub total: Decimal,
    pub total_weight: Decimal,
    pub scale: u32,
    /// Minor units handed out by remainder rank rather than by floor.
    pub leftover_units: i128,
    /// Shares of holders with positive weight, ordered by holder id.
    pub shares: Vec<Share>,
}

impl Allocation {
    pub fn allocated_total(&self) -> Decimal {
        self.shares.iter().map(|s| s.amount).sum()
    }

    /// Conservation check: the shares add back up to the total exactly.
    pub fn is_conserved(&self) -> bool {
        self.allocated_total() == self.total
    }

    pub fn share_of(&self, holder: &HolderId) -> Option<&Share> {
        self.shares.iter().find(|s| &s.holder == holder)
    }
}

impl fmt::Display for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Allocation ===")?;
        writeln!(f, "Total:          {}", self.total)?;
        writeln!(f, "Total weight:   {}", self.total_weight)?;
        writeln!(f, "Leftover units: {}", self.leftover_units)?;
        writeln!(f, "Conserved:      {}", self.is_conserved())?;
        for share in &self.shares {
            writeln!(
                f,
                "  {:<20} weight {:>14}  {:>10}%  {:>16}{}",
                share.holder.as_str(),
                share.weight,
                share.ownership_percentage,
                share.amount,
                if share.received_remainder { "  +1" } else { "" }
            )?;
        }
        Ok(())
    }
}

/// Largest-remainder split of `total_units` across weighted keys.
///
/// Every weight is lifted to a common decimal scale so the proportional
/// share `total_units * w / W` is an exact rational over integers. Floors
/// are handed out first, then one unit each to the largest remainders,
/// ties broken by ascending key. Returns `(key, units, got_remainder)` in
/// input order.
pub(crate) fn distribute_units<K>(
    total_units: i128,
    weighted: &[(K, Decimal)],
) -> Result<Vec<(K, i128, bool)>, AllocationError>
where
    K: Clone + Ord + fmt::Display,
{
    let mut seen = BTreeSet::new();
    for (key, weight) in weighted {
        if *weight < Decimal::ZERO {
            return Err(AllocationError::NegativeWeight {
                claimant: key.to_string(),
                weight: *weight,
            });
        }
        if !seen.insert(key) {
            return Err(AllocationError::DuplicateClaimant(key.to_string()));
        }
    }

    let common_scale = weighted
        .iter()
        .map(|(_, w)| w.normalize().scale())
        .max()
        .unwrap_or(0);

    let mut integer_weights = Vec::with_capacity(weighted.len());
    let mut total_weight: i128 = 0;
    for (_, weight) in weighted {
        let w = weight.normalize();
        let factor = 10i128
            .checked_pow(common_scale - w.scale())
            .ok_or(AllocationError::Overflow)?;
        let lifted = w.mantissa().checked_mul(factor).ok_or(AllocationError::Overflow)?;
        total_weight = total_weight
            .checked_add(lifted)
            .ok_or(AllocationError::Overflow)?;
        integer_weights.push(lifted);
    }
    if total_weight == 0 {
        return Err(AllocationError::NoEligibleHolders);
    }

    let mut floors = Vec::with_capacity(weighted.len());
    let mut remainders = Vec::with_capacity(weighted.len());
    let mut floor_sum: i128 = 0;
    for w in &integer_weights {
        let numerator = total_units.checked_mul(*w).ok_or(AllocationError::Overflow)?;
        let floor = numerator / total_weight;
        floor_sum += floor;
        floors.push(floor);
        remainders.push(numerator % total_weight);
    }

    let leftover = total_units - floor_sum;
    debug_assert!(leftover >= 0 && leftover < weighted.len().max(1) as i128);

    let mut rank: Vec<usize> = (0..weighted.len()).collect();
    rank.sort_by(|&a, &b| {
        remainders[b]
            .cmp(&remainders[a])
            .then_with(|| weighted[a].0.cmp(&weighted[b].0))
    });

    let mut bumped = vec![false; weighted.len()];
    for &idx in rank.iter().take(leftover as usize) {
        floors[idx] += 1;
        bumped[idx] = true;
    }

    Ok(weighted
        .iter()
        .zip(floors)
        .zip(bumped)
        .map(|(((key, _), units), got)| (key.clone(), units, got))
        .collect())
}

/// Split `total` across holders in proportion to their weights.
///
/// Zero-weight holders are excluded from the result. The returned shares
/// sum to `total` exactly, and who receives each rounding unit depends only
/// on the inputs.
///
/// # Examples
///
/// ```
/// use settlement_core::allocation::largest_remainder::{allocate_pro_rata, Claim};
/// use rust_decimal_macros::dec;
///
/// let claims = vec![Claim::new("alice", dec!(1)), Claim::new("bob", dec!(2))];
/// let allocation = allocate_pro_rata(dec!(1000.01), &claims, 2).unwrap();
/// assert_eq!(allocation.shares[0].amount, dec!(333.34));
/// assert_eq!(allocation.shares[1].amount, dec!(666.67));
/// assert!(allocation.is_conserved());
/// ```
pub fn allocate_pro_rata(
    total: Decimal,
    claims: &[Claim],
    scale: u32,
) -> Result<Allocation, AllocationError> {
    if total <= Decimal::ZERO {
        return Err(AllocationError::NonPositiveTotal(total));
    }
    let total_units = money::to_minor_units(total, scale)?;

    let mut eligible: Vec<(HolderId, Decimal)> = Vec::with_capacity(claims.len());
    for claim in claims {
        if claim.weight < Decimal::ZERO {
            return Err(AllocationError::NegativeWeight {
                claimant: claim.holder.to_string(),
                weight: claim.weight,
            });
        }
        if claim.weight > Decimal::ZERO {
            eligible.push((claim.holder.clone(), claim.weight));
        }
    }
    if eligible.is_empty() {
        return Err(AllocationError::NoEligibleHolders);
    }
    eligible.sort_by(|a, b| a.0.cmp(&b.0));

    let total_weight: Decimal = eligible.iter().map(|(_, w)| *w).sum();
    let units = distribute_units(total_units, &eligible)?;

    let mut shares = Vec::with_capacity(units.len());
    let mut leftover_units = 0;
    for ((holder, weight), (_, amount_units, bumped)) in eligible.into_iter().zip(units) {
        if bumped {
            leftover_units += 1;
        }
        let ownership = weight
            .checked_div(total_weight)
            .and_then(|r| r.checked_mul(Decimal::ONE_HUNDRED))
            .ok_or(AllocationError::Overflow)?
            .round_dp(OWNERSHIP_DP);
        shares.push(Share {
            holder,
            weight,
            ownership_percentage: ownership,
            amount: money::from_minor_units(amount_units, scale)?,
            received_remainder: bumped,
        });
    }

    Ok(Allocation {
        total,
        total_weight,
        scale,
        leftover_units,
        shares,
    })
}

/// Split `total` evenly across `holders` (every weight is one).
pub fn allocate_equal(
    total: Decimal,
    holders: &[HolderId],
    scale: u32,
) -> Result<Allocation, AllocationError> {
    let claims: Vec<Claim> = holders
        .iter()
        .map(|h| Claim {
            holder: h.clone(),
            weight: Decimal::ONE,
        })
        .collect();
    allocate_pro_rata(total, &claims, scale)
}
