//! Milestone disbursement example.
//!
//! Runs a milestone from creation to burn against an in-memory ledger and
//! the simulated asset network, then shows how the burn reprices the
//! project's tokens.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use settlement_core::config::SettlementConfig;
use settlement_core::core::ids::{Actor, HolderId, ProjectId};
use settlement_core::core::nav::{NavLedger, NavSource};
use settlement_core::core::project::{self, ProjectError};
use settlement_core::network::AssetNetwork;
use settlement_core::settlement::{Settlement, SettlementOutcome};
use settlement_core::simulation::network::SimulatedNetwork;
use settlement_core::store::Store;

const ISSUER: &str = "GISSUER";

fn main() {
    println!("╔═══════════════════════════════════════════════════╗");
    println!("║  settlement-core: Milestone Disbursement Example  ║");
    println!("╚═══════════════════════════════════════════════════╝\n");

    let store = Store::open_in_memory().expect("in-memory ledger");
    let network = SimulatedNetwork::new(ISSUER);
    let config = SettlementConfig {
        asset_issuer: ISSUER.to_string(),
        ..Default::default()
    };
    let actor = Actor::new("admin:ops");
    let project_id = ProjectId::new("PRJ-IRRIGATION");

    // --- Project with 1,000 tokens at a NAV of 12.50 ---
    store
        .write(|tx| {
            project::register_project(tx, &project_id, "Valley irrigation", Decimal::ZERO, None)?;
            project::issue_tokens(tx, &project_id, &HolderId::new("coop-a"), dec!(600))?;
            project::issue_tokens(tx, &project_id, &HolderId::new("coop-b"), dec!(400))?;
            Ok::<_, ProjectError>(())
        })
        .expect("project registered");
    let opening = NavLedger::new(&store)
        .record(&project_id, dec!(12.50), NavSource::Audited, Some("opening audit"))
        .expect("opening NAV");
    println!("Opening NAV per token: {}", opening.value_per_token);

    let settlement = Settlement::new(&store, &network, &config);

    // --- Project wallet, funded with the settlement asset ---
    let wallet = settlement
        .provision_wallet(&project_id, &actor)
        .expect("wallet provisioned")
        .into_output()
        .expect("wallet confirmed");
    network
        .fund(&wallet.address, &config.settlement_asset, dec!(5000))
        .expect("wallet funded");
    let balance = network
        .balance(&wallet.address, &config.settlement_asset)
        .expect("wallet balance");
    println!("Project wallet {} holds {}\n", wallet.address, balance);

    // --- Milestone lifecycle ---
    let milestone = settlement
        .create_milestone(&project_id, 1, dec!(2500), &actor)
        .and_then(|m| settlement.submit_milestone(m.id, &actor))
        .and_then(|m| settlement.approve_milestone(m.id, &actor))
        .and_then(|m| settlement.attach_bank_transfer(m.id, "BANK-2024-017", &actor))
        .expect("milestone approved");
    println!("Milestone {} is {:?}\n", milestone.id, milestone.status);

    match settlement
        .disburse_milestone(milestone.id, &actor)
        .expect("burn submitted")
    {
        SettlementOutcome::Confirmed {
            output,
            external_ref,
        } => {
            println!("Burn confirmed as {}\n", external_ref);
            println!("{}", output);
        }
        SettlementOutcome::Divergent {
            external_ref,
            reconciliation_id,
            error,
        } => {
            println!(
                "Burn {} landed but did not confirm locally ({}); reconciliation {:?}",
                external_ref, error, reconciliation_id
            );
        }
    }

    // --- A second disbursement is refused ---
    let err = settlement
        .disburse_milestone(milestone.id, &actor)
        .expect_err("milestone already disbursed");
    println!("Second disbursement refused: {}", err);
}
