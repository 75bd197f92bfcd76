//! Pro-rata allocation and revenue split example.
//!
//! Shows how an amount that does not divide evenly is handed out in
//! whole minor units, with no unit created or lost.

use rust_decimal_macros::dec;
use settlement_core::allocation::largest_remainder::{allocate_pro_rata, Claim};
use settlement_core::allocation::split::{split_by_percentages, RevenueSplit};

fn main() {
    println!("╔═══════════════════════════════════════════════╗");
    println!("║  settlement-core: Pro-Rata Allocation Example ║");
    println!("╚═══════════════════════════════════════════════╝\n");

    // --- Scenario 1: Uneven pro-rata split ---
    println!("━━━ Scenario 1: 1000.01 across weights 1:2 ━━━\n");

    let claims = vec![Claim::new("alice", dec!(1)), Claim::new("bob", dec!(2))];
    let allocation = allocate_pro_rata(dec!(1000.01), &claims, 2).expect("valid claims");
    println!("{}", allocation);

    // --- Scenario 2: Holder with no tokens ---
    println!("━━━ Scenario 2: Zero-weight holders receive nothing ━━━\n");

    let claims = vec![
        Claim::new("carol", dec!(60)),
        Claim::new("dave", dec!(40)),
        Claim::new("erin", dec!(0)),
    ];
    let allocation = allocate_pro_rata(dec!(250.03), &claims, 2).expect("valid claims");
    println!("{}", allocation);

    // --- Scenario 3: Fixed percentages ---
    println!("━━━ Scenario 3: Three-way percentage split of 100.01 ━━━\n");

    let legs = split_by_percentages(
        dec!(100.01),
        &[("a", dec!(33.33)), ("b", dec!(33.33)), ("c", dec!(33.34))],
        2,
    )
    .expect("percentages sum to 100");
    for leg in &legs {
        println!("  {:<4} {:>7}%  {:>10}", leg.key, leg.percentage, leg.amount);
    }
    println!();

    // --- Scenario 4: Default revenue split ---
    println!("━━━ Scenario 4: Revenue of 12500.01 under the default split ━━━\n");

    let split = RevenueSplit::default();
    let legs = split.apply(dec!(12500.01), 2).expect("default split is valid");
    for leg in &legs {
        println!(
            "  {:<12} {:>6}%  {:>12}  -> {} pool",
            leg.key.as_str(),
            leg.percentage,
            leg.amount,
            leg.key.pool().as_str()
        );
    }
}
