//! Random holder sets for benchmarks and stress tests.

use rand::Rng;
use rust_decimal::Decimal;

use crate::allocation::largest_remainder::Claim;
use crate::core::ids::HolderId;

/// Shape of a generated holder set.
#[derive(Debug, Clone)]
pub struct HoldingsConfig {
    pub holder_count: usize,
    /// Token balances are drawn uniformly from this range, in whole tokens.
    pub min_tokens: u64,
    pub max_tokens: u64,
    /// Fractional digits kept on each balance.
    pub token_scale: u32,
    /// Share of holders given a zero balance, in percent.
    pub zero_balance_percent: u32,
}

impl Default for HoldingsConfig {
    fn default() -> Self {
        Self {
            holder_count: 100,
            min_tokens: 1,
            max_tokens: 100_000,
            token_scale: 4,
            zero_balance_percent: 5,
        }
    }
}

/// Generate a random set of claims with unique holder ids.
pub fn generate_holdings(config: &HoldingsConfig) -> Vec<Claim> {
    let mut rng = rand::thread_rng();
    let unit = 10u64.pow(config.token_scale);
    let low = config.min_tokens.saturating_mul(unit);
    let high = config.max_tokens.saturating_mul(unit).max(low + 1);

    (0..config.holder_count)
        .map(|i| {
            let holder = HolderId::new(format!("HOLDER-{:05}", i));
            if rng.gen_range(0..100) < config.zero_balance_percent {
                return Claim::new(holder, Decimal::ZERO);
            }
            let raw = rng.gen_range(low..high);
            Claim::new(holder, Decimal::new(raw as i64, config.token_scale))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_generates_requested_count() {
        let claims = generate_holdings(&HoldingsConfig::default());
        assert_eq!(claims.len(), 100);
        let unique: BTreeSet<_> = claims.iter().map(|c| c.holder.clone()).collect();
        assert_eq!(unique.len(), 100);
        assert!(claims.iter().all(|c| c.weight >= Decimal::ZERO));
    }

    #[test]
    fn test_all_zero_when_requested() {
        let config = HoldingsConfig {
            holder_count: 10,
            zero_balance_percent: 100,
            ..Default::default()
        };
        assert!(generate_holdings(&config)
            .iter()
            .all(|c| c.weight == Decimal::ZERO));
    }
}
