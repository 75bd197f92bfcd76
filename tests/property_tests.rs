use proptest::prelude::*;
use rust_decimal::Decimal;

use settlement_core::allocation::largest_remainder::{
    allocate_equal, allocate_pro_rata, AllocationError, Claim,
};
use settlement_core::allocation::split::split_by_percentages;
use settlement_core::core::ids::{HolderId, ProjectId};
use settlement_core::core::money::{self, NetworkAmount};
use settlement_core::core::nav::{NavLedger, NavSource};
use settlement_core::core::pool::PoolType;
use settlement_core::core::project;
use settlement_core::store::Store;
use settlement_core::treasury::funding::{FundingError, FundingResolver, FundingSource};

/// A total in minor units at scale 2, from 0.01 to 10,000,000.00.
fn arb_total() -> impl Strategy<Value = Decimal> {
    (1i64..1_000_000_000i64).prop_map(|units| Decimal::new(units, 2))
}

/// A token balance with up to 4 fractional digits; zero is allowed.
fn arb_weight() -> impl Strategy<Value = Decimal> {
    prop_oneof![
        1 => Just(Decimal::ZERO),
        9 => (1i64..1_000_000_000i64).prop_map(|raw| Decimal::new(raw, 4)),
    ]
}

/// 1..40 claims with unique holder ids.
fn arb_claims() -> impl Strategy<Value = Vec<Claim>> {
    prop::collection::vec(arb_weight(), 1..40).prop_map(|weights| {
        weights
            .into_iter()
            .enumerate()
            .map(|(i, w)| Claim::new(HolderId::new(format!("H{:03}", i)), w))
            .collect()
    })
}

/// Percentages in hundredths that sum to exactly 100.
fn arb_percentages() -> impl Strategy<Value = Vec<(String, Decimal)>> {
    prop::collection::vec(1u32..10_000u32, 1..8).prop_map(|cuts| {
        let total: u64 = cuts.iter().map(|c| u64::from(*c)).sum();
        let mut legs: Vec<(String, Decimal)> = Vec::with_capacity(cuts.len());
        let mut assigned = 0i64;
        for (i, cut) in cuts.iter().enumerate() {
            let hundredths = (u64::from(*cut) * 10_000 / total) as i64;
            legs.push((format!("leg{}", i), Decimal::new(hundredths, 2)));
            assigned += hundredths;
        }
        if let Some(last) = legs.last_mut() {
            last.1 += Decimal::new(10_000 - assigned, 2);
        }
        legs
    })
}

proptest! {
    // ===================================================================
    // Pro-rata allocation always hands out exactly the total.
    // ===================================================================
    #[test]
    fn allocation_conserves_total(total in arb_total(), claims in arb_claims()) {
        match allocate_pro_rata(total, &claims, 2) {
            Ok(allocation) => {
                prop_assert!(allocation.is_conserved());
                prop_assert_eq!(allocation.allocated_total(), total);
            }
            Err(AllocationError::NoEligibleHolders) => {
                prop_assert!(claims.iter().all(|c| c.weight == Decimal::ZERO));
            }
            Err(e) => prop_assert!(false, "unexpected error: {}", e),
        }
    }

    // ===================================================================
    // Zero-weight holders never appear; every amount is within one unit
    // of the exact share.
    // ===================================================================
    #[test]
    fn allocation_is_fair_to_the_unit(total in arb_total(), claims in arb_claims()) {
        prop_assume!(claims.iter().any(|c| c.weight > Decimal::ZERO));
        let allocation = allocate_pro_rata(total, &claims, 2).unwrap();
        let unit = Decimal::new(1, 2);
        for share in &allocation.shares {
            prop_assert!(share.weight > Decimal::ZERO);
            let exact = total * share.weight / allocation.total_weight;
            prop_assert!((share.amount - exact).abs() < unit, "{} vs {}", share.amount, exact);
            prop_assert!(share.amount.scale() <= 2);
        }
        let positive = claims.iter().filter(|c| c.weight > Decimal::ZERO).count();
        prop_assert_eq!(allocation.shares.len(), positive);
    }

    // ===================================================================
    // Leftover units never exceed the number of recipients.
    // ===================================================================
    #[test]
    fn leftover_bounded_by_recipients(total in arb_total(), claims in arb_claims()) {
        prop_assume!(claims.iter().any(|c| c.weight > Decimal::ZERO));
        let allocation = allocate_pro_rata(total, &claims, 2).unwrap();
        prop_assert!(allocation.leftover_units >= 0);
        prop_assert!(allocation.leftover_units < allocation.shares.len() as i128);
        let bumped = allocation.shares.iter().filter(|s| s.received_remainder).count();
        prop_assert_eq!(bumped as i128, allocation.leftover_units);
    }

    // ===================================================================
    // Input order does not change anyone's amount.
    // ===================================================================
    #[test]
    fn allocation_ignores_input_order(total in arb_total(), claims in arb_claims()) {
        prop_assume!(claims.iter().any(|c| c.weight > Decimal::ZERO));
        let forward = allocate_pro_rata(total, &claims, 2).unwrap();
        let mut reversed_claims = claims.clone();
        reversed_claims.reverse();
        let reversed = allocate_pro_rata(total, &reversed_claims, 2).unwrap();
        for share in &forward.shares {
            let other = reversed.share_of(&share.holder).unwrap();
            prop_assert_eq!(share.amount, other.amount);
        }
    }

    // ===================================================================
    // Equal shares differ by at most one minor unit.
    // ===================================================================
    #[test]
    fn equal_split_is_level(total in arb_total(), count in 1usize..50) {
        let holders: Vec<HolderId> = (0..count).map(|i| HolderId::new(format!("H{:03}", i))).collect();
        let allocation = allocate_equal(total, &holders, 2).unwrap();
        prop_assert!(allocation.is_conserved());
        let max = allocation.shares.iter().map(|s| s.amount).max().unwrap();
        let min = allocation.shares.iter().map(|s| s.amount).min().unwrap();
        prop_assert!(max - min <= Decimal::new(1, 2));
    }

    // ===================================================================
    // Percentage splits conserve the amount and keep every leg.
    // ===================================================================
    #[test]
    fn percentage_split_conserves(amount in arb_total(), legs in arb_percentages()) {
        let split = split_by_percentages(amount, &legs, 2).unwrap();
        prop_assert_eq!(split.len(), legs.len());
        let sum: Decimal = split.iter().map(|l| l.amount).sum();
        prop_assert_eq!(sum, amount);
    }

    // ===================================================================
    // Percentages off by any amount are rejected, never renormalised.
    // ===================================================================
    #[test]
    fn percentage_mismatch_rejected(amount in arb_total(), legs in arb_percentages(), skew in 1i64..500) {
        let mut skewed = legs.clone();
        skewed[0].1 += Decimal::new(skew, 2);
        let result = split_by_percentages(amount, &skewed, 2);
        prop_assert!(matches!(result, Err(AllocationError::PercentagesMismatch(_))));
    }

    // ===================================================================
    // Minor-unit conversion round-trips whole amounts and refuses
    // anything finer than the scale.
    // ===================================================================
    #[test]
    fn minor_units_reject_excess_precision(units in 1i64..1_000_000_000i64, extra in 1i64..10) {
        let exact = Decimal::new(units, 2);
        prop_assert_eq!(money::to_minor_units(exact, 2).unwrap(), i128::from(units));
        let finer = exact + Decimal::new(extra, 3);
        prop_assert!(money::to_minor_units(finer, 2).is_err());
    }

    // ===================================================================
    // Network amounts always render with seven fractional digits.
    // ===================================================================
    #[test]
    fn network_amount_has_seven_digits(raw in 1i64..1_000_000_000_000i64, scale in 0u32..8) {
        let amount = NetworkAmount::new(Decimal::new(raw, scale)).unwrap();
        let rendered = amount.to_string();
        let fraction = rendered.split('.').nth(1).unwrap_or("");
        prop_assert_eq!(fraction.len(), 7);
        prop_assert_eq!(rendered.parse::<Decimal>().unwrap(), Decimal::new(raw, scale));
    }

    // ===================================================================
    // The resolver picks the first source that covers the request after
    // its floor, or none at all.
    // ===================================================================
    #[test]
    fn resolver_respects_floors(
        balances in prop::collection::vec(0i64..10_000, 3),
        floors in prop::collection::vec(0i64..2_000, 3),
        required in 1i64..10_000,
    ) {
        let pools = [PoolType::ProjectCashflow, PoolType::Treasury, PoolType::Liquidity];
        let resolver = FundingResolver::new(
            pools
                .iter()
                .zip(&floors)
                .map(|(pool, floor)| FundingSource::new(*pool, Decimal::from(*floor)))
                .collect(),
        );
        let position = |pool: PoolType| -> Result<(Decimal, Decimal), FundingError> {
            let i = pools.iter().position(|p| *p == pool).unwrap();
            Ok((Decimal::from(balances[i]), Decimal::ZERO))
        };
        let expected = (0..3).find(|&i| balances[i] - floors[i] >= required);
        match (resolver.resolve_with(Decimal::from(required), position), expected) {
            (Ok(decision), Some(i)) => prop_assert_eq!(decision.selected, pools[i]),
            (Err(FundingError::InsufficientFunds { breakdown, .. }), None) => {
                prop_assert_eq!(breakdown.len(), 3)
            }
            (other, expected) => prop_assert!(false, "{:?} vs {:?}", other, expected),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    // ===================================================================
    // However many NAV records are written, exactly one is active and it
    // is the latest.
    // ===================================================================
    #[test]
    fn nav_keeps_single_active(values in prop::collection::vec(1i64..100_000, 1..12)) {
        let store = Store::open_in_memory().unwrap();
        let id = ProjectId::new("PRJ-PROP");
        store
            .write(|tx| project::register_project(tx, &id, "Prop", Decimal::from(10), None))
            .unwrap();
        let navs = NavLedger::new(&store);
        for raw in &values {
            navs.record(&id, Decimal::new(*raw, 3), NavSource::Manual, None).unwrap();
        }
        let history = navs.history(&id).unwrap();
        prop_assert_eq!(history.len(), values.len());
        prop_assert_eq!(history.iter().filter(|r| !r.is_superseded).count(), 1);
        let last = Decimal::new(*values.last().unwrap(), 3);
        prop_assert_eq!(navs.active(&id).unwrap().value_per_token, last);
    }
}
