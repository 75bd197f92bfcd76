use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use settlement_core::allocation::distribution::{DistributionLedger, DistributionStatus};
use settlement_core::config::SettlementConfig;
use settlement_core::core::ids::{Actor, HolderId, ProjectId};
use settlement_core::core::money::NetworkAmount;
use settlement_core::core::nav::{self, NavLedger, NavSource};
use settlement_core::core::pool::{PoolLedger, PoolType};
use settlement_core::core::project::{self, ProjectError};
use settlement_core::error::{ErrorClass, ErrorCode};
use settlement_core::jobs::revenue::{self, RevenueLedger};
use settlement_core::network::{AssetNetwork, NetworkError};
use settlement_core::outcome::ApiResponse;
use settlement_core::reconciliation::audit::{self, AuditAction, AuditQueue, EntityKind};
use settlement_core::reconciliation::records::{DivergenceKind, ReconciliationLedger};
use settlement_core::settlement::capital::CapitalRequest;
use settlement_core::settlement::milestone::MilestoneStatus;
use settlement_core::settlement::redemption::RedemptionStatus;
use settlement_core::settlement::{
    PendingEntity, PendingResolution, ResolvedPending, Settlement, SettlementError, SettlementOutcome,
    SettlementState,
};
use settlement_core::simulation::network::{Operation, SimulatedNetwork};
use settlement_core::store::{Store, StoreError};
use settlement_core::treasury::funding::{FundingError, FundingSource};

const ISSUER: &str = "GISSUER";
const TREASURY: &str = "GTREASURY";
const ALICE_ADDRESS: &str = "GALICE";

/// A project with two holders (alice 60, bob 40), an audited NAV of 10,
/// a treasury pool holding 10,000 both locally and on the network.
struct Platform {
    store: Arc<Store>,
    network: SimulatedNetwork,
    config: SettlementConfig,
    project: ProjectId,
    alice: HolderId,
    bob: HolderId,
    actor: Actor,
}

impl Platform {
    fn new() -> Self {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let project = ProjectId::new("PRJ-ORCHARD");
        let alice = HolderId::new("alice");
        let bob = HolderId::new("bob");
        store
            .write(|tx| {
                project::register_project(tx, &project, "Orchard", Decimal::ZERO, None)?;
                project::issue_tokens(tx, &project, &alice, dec!(60))?;
                project::issue_tokens(tx, &project, &bob, dec!(40))?;
                Ok::<_, ProjectError>(())
            })
            .unwrap();
        NavLedger::new(&store)
            .record(&project, dec!(10), NavSource::Audited, Some("opening audit"))
            .unwrap();

        let mut config = SettlementConfig {
            asset_issuer: ISSUER.to_string(),
            ..Default::default()
        };
        config.pool_accounts.insert(PoolType::Treasury, TREASURY.to_string());

        let network = SimulatedNetwork::new(ISSUER);
        let reserve = NetworkAmount::new(dec!(2)).unwrap();
        for account in [TREASURY, ALICE_ADDRESS] {
            network.create_account(account, &reserve).unwrap();
            network
                .establish_trustline(account, &config.settlement_asset, ISSUER)
                .unwrap();
        }
        network.fund(TREASURY, &config.settlement_asset, dec!(10000)).unwrap();
        PoolLedger::new(&store)
            .deposit(PoolType::Treasury, None, dec!(10000), "seed")
            .unwrap();

        Self {
            store,
            network,
            config,
            project,
            alice,
            bob,
            actor: Actor::new("admin:ops"),
        }
    }

    fn settlement(&self) -> Settlement<'_> {
        Settlement::new(&self.store, &self.network, &self.config)
    }

    fn wallet_address(&self) -> String {
        self.settlement()
            .provision_wallet(&self.project, &self.actor)
            .unwrap()
            .into_output()
            .unwrap()
            .address
    }

    fn approved_milestone(&self, target: Decimal) -> uuid::Uuid {
        let s = self.settlement();
        let m = s.create_milestone(&self.project, 1, target, &self.actor).unwrap();
        s.submit_milestone(m.id, &self.actor).unwrap();
        s.approve_milestone(m.id, &self.actor).unwrap();
        s.attach_bank_transfer(m.id, "BANK-2024-001", &self.actor).unwrap();
        m.id
    }

    fn capital_request(&self, key: &str, amount: Decimal) -> CapitalRequest {
        CapitalRequest {
            request_key: key.to_string(),
            pool: PoolType::Treasury,
            project: self.project.clone(),
            amount,
        }
    }
}

/// Full pipeline: wallet → capital → milestone burn → revenue → distribution.
#[test]
fn full_project_lifecycle() {
    let p = Platform::new();
    let s = p.settlement();

    let address = p.wallet_address();
    let wallet = s.wallet(&p.project).unwrap().unwrap();
    assert!(wallet.is_funded());
    assert_eq!(wallet.settlement_state, SettlementState::Confirmed);

    // Capital moves from the treasury into the project wallet.
    let capital = s
        .allocate_capital(&p.capital_request("cap-001", dec!(3000)), &p.actor)
        .unwrap();
    assert!(capital.is_confirmed());
    assert_eq!(
        p.network.balance(&address, &p.config.settlement_asset).unwrap(),
        dec!(3000)
    );

    // Burn 400 against a project NAV of 10 * 100 = 1000.
    let milestone = p.approved_milestone(dec!(400));
    let receipt = s
        .disburse_milestone(milestone, &p.actor)
        .unwrap()
        .into_output()
        .unwrap();
    assert_eq!(receipt.burned_amount, dec!(400));
    assert_eq!(receipt.previous_nav_total, dec!(1000));
    assert_eq!(receipt.new_nav_total, dec!(600));
    assert_eq!(receipt.new_value_per_token, dec!(6));
    assert_eq!(p.network.burned(&p.config.settlement_asset), dec!(400));
    assert_eq!(s.milestone(milestone).unwrap().status, MilestoneStatus::Disbursed);

    let active = NavLedger::new(&p.store).active(&p.project).unwrap();
    assert_eq!(active.value_per_token, dec!(6));
    assert_eq!(active.source, NavSource::Formula);
    let project = p.store.read(|conn| project::get_project(conn, &p.project)).unwrap();
    assert_eq!(project.token_price, Some(dec!(6)));

    // Revenue of 1000.01 at the default 15/70/10/5 split.
    let revenue_ledger = RevenueLedger::new(&p.store, p.config.minor_unit_scale);
    let record = revenue_ledger
        .record(&p.project, dec!(1000.01), "harvest-2024")
        .unwrap();
    revenue_ledger.verify(record.id).unwrap();
    let report = revenue::run_revenue_batch(&p.store, &p.config, &p.actor).unwrap();
    assert_eq!(report.processed, 1);
    assert!(report.is_clean());

    let pools = PoolLedger::new(&p.store);
    assert_eq!(pools.balance(PoolType::Treasury, None).unwrap(), dec!(7150.00));
    assert_eq!(pools.balance(PoolType::Distribution, None).unwrap(), dec!(700.01));
    let shares = revenue_ledger.holder_shares(record.id).unwrap();
    let total_shares: Decimal = shares.iter().map(|s| s.amount).sum();
    assert_eq!(total_shares, dec!(700.01));
    let alice_share = shares.iter().find(|s| s.holder_id == p.alice).unwrap();
    assert_eq!(alice_share.amount, dec!(420.01));

    // A distribution is priced against the post-burn NAV.
    let distributions = DistributionLedger::new(&p.store, p.config.minor_unit_scale);
    let event = distributions.create(&p.project, dec!(1000.01), &p.actor).unwrap();
    let event = distributions.calculate(event.id, &p.actor).unwrap();
    assert_eq!(event.snapshot_nav, Some(dec!(6)));
    assert_eq!(event.total_allocated, dec!(1000.01));
    distributions.activate(event.id, &p.actor).unwrap();
    distributions.withdraw(event.id, &p.alice, dec!(600.01), &p.actor).unwrap();
    distributions.withdraw(event.id, &p.bob, dec!(400.00), &p.actor).unwrap();
    assert_eq!(
        distributions.get(event.id).unwrap().status,
        DistributionStatus::Completed
    );

    let trail = p
        .store
        .read(|conn| audit::entries_for(conn, EntityKind::Milestone, &milestone.to_string()))
        .unwrap();
    assert!(trail
        .iter()
        .any(|e| e.action == AuditAction::MilestoneDisbursed && e.critical));
    assert!(ReconciliationLedger::new(&p.store).unresolved().unwrap().is_empty());
}

/// Milestone disbursement is idempotent: one burn, however often it is called.
#[test]
fn milestone_burn_happens_once() {
    let p = Platform::new();
    let address = p.wallet_address();
    p.network
        .fund(&address, &p.config.settlement_asset, dec!(1000))
        .unwrap();
    let milestone = p.approved_milestone(dec!(250));
    let s = p.settlement();

    s.disburse_milestone(milestone, &p.actor).unwrap();
    for _ in 0..3 {
        let err = s.disburse_milestone(milestone, &p.actor).unwrap_err();
        assert!(matches!(err, SettlementError::AlreadySettled { .. }));
        assert_eq!(err.class(), ErrorClass::DomainState);
    }
    assert_eq!(p.network.calls(Operation::Transfer), 1);
    assert_eq!(p.network.burned(&p.config.settlement_asset), dec!(250));
}

/// Burn 500 against a NAV of 400 is refused before any network call.
#[test]
fn burn_exceeding_nav_makes_no_network_call() {
    let p = Platform::new();
    NavLedger::new(&p.store)
        .record(&p.project, dec!(4), NavSource::Manual, None)
        .unwrap();
    let address = p.wallet_address();
    p.network
        .fund(&address, &p.config.settlement_asset, dec!(1000))
        .unwrap();
    let milestone = p.approved_milestone(dec!(500));

    let err = p
        .settlement()
        .disburse_milestone(milestone, &p.actor)
        .unwrap_err();
    assert!(matches!(
        err,
        SettlementError::ExceedsNav { requested, nav_total } if requested == dec!(500) && nav_total == dec!(400)
    ));
    assert_eq!(p.network.calls(Operation::Transfer), 0);
    let m = p.settlement().milestone(milestone).unwrap();
    assert_eq!(m.status, MilestoneStatus::Approved);
    assert_eq!(m.settlement_state, SettlementState::Staged);
}

/// The burn lands, then local confirmation conflicts. The divergence is
/// persisted and surfaced as a partial success.
#[test]
fn divergent_burn_is_flagged_for_reconciliation() {
    let p = Platform::new();
    let address = p.wallet_address();
    p.network
        .fund(&address, &p.config.settlement_asset, dec!(1000))
        .unwrap();
    let milestone = p.approved_milestone(dec!(300));

    // Another writer rewrites the intent while the burn is in flight.
    let hook_store = Arc::clone(&p.store);
    p.network.after_success(move |op, _| {
        if op == Operation::Transfer {
            let tampered: Result<usize, StoreError> = hook_store.write(|tx| {
                tx.execute("UPDATE milestones SET intent_id = 'tampered'", [])
                    .map_err(StoreError::from)
            });
            tampered.unwrap();
        }
    });

    let outcome = p
        .settlement()
        .disburse_milestone(milestone, &p.actor)
        .unwrap();
    let (external_ref, reconciliation_id) = match &outcome {
        SettlementOutcome::Divergent {
            external_ref,
            reconciliation_id,
            ..
        } => (external_ref.clone(), reconciliation_id.unwrap()),
        other => panic!("expected divergence, got {:?}", other),
    };
    assert_eq!(p.network.burned(&p.config.settlement_asset), dec!(300));

    let ledger = ReconciliationLedger::new(&p.store);
    let record = ledger.get(reconciliation_id).unwrap();
    assert_eq!(record.kind, DivergenceKind::MilestoneBurn);
    assert_eq!(record.external_tx_ref.as_deref(), Some(external_ref.as_str()));
    assert_eq!(record.amount, Some(dec!(300)));
    assert_eq!(record.related_entity_id, milestone.to_string());

    let m = p.settlement().milestone(milestone).unwrap();
    assert_eq!(m.settlement_state, SettlementState::Divergent);
    assert_ne!(m.status, MilestoneStatus::Disbursed);
    // NAV untouched by the failed confirmation.
    let active = NavLedger::new(&p.store).active(&p.project).unwrap();
    assert_eq!(active.value_per_token, dec!(10));

    let response = ApiResponse::from_outcome(Ok::<_, SettlementError>(outcome));
    assert!(response.requires_manual_reconciliation());
    let json = serde_json::to_value(&response).unwrap();
    assert_eq!(json["partialSuccess"], serde_json::json!(true));
    assert_eq!(json["externalRef"], serde_json::json!(external_ref));

    // A divergent milestone is never retried automatically.
    assert!(p.settlement().disburse_milestone(milestone, &p.actor).is_err());
    assert_eq!(p.network.calls(Operation::Transfer), 1);

    let resolved = ledger
        .resolve(reconciliation_id, &Actor::new("admin:finance"), "burn matched on network")
        .unwrap();
    assert!(resolved.resolved);
    assert!(ledger.unresolved().unwrap().is_empty());
    // Resolved records are kept.
    assert!(ledger.get(reconciliation_id).is_ok());
}

/// An audit lands while the burn is in flight. The post-burn price is
/// derived from that audit, not from the NAV seen at staging.
#[test]
fn burn_reprices_against_nav_recorded_in_flight() {
    let p = Platform::new();
    let address = p.wallet_address();
    p.network
        .fund(&address, &p.config.settlement_asset, dec!(1000))
        .unwrap();
    let milestone = p.approved_milestone(dec!(300));

    let hook_store = Arc::clone(&p.store);
    let hook_project = p.project.clone();
    p.network.after_success(move |op, _| {
        if op == Operation::Transfer {
            NavLedger::new(&hook_store)
                .record(&hook_project, dec!(20), NavSource::Audited, Some("mid-burn audit"))
                .unwrap();
        }
    });

    let outcome = p
        .settlement()
        .disburse_milestone(milestone, &p.actor)
        .unwrap();
    assert!(outcome.is_confirmed());
    let receipt = outcome.into_output().unwrap();
    // (20 * 100 - 300) / 100
    assert_eq!(receipt.previous_nav_total, dec!(2000));
    assert_eq!(receipt.new_nav_total, dec!(1700));
    assert_eq!(receipt.new_value_per_token, dec!(17));

    let ledger = NavLedger::new(&p.store);
    let active = ledger.active(&p.project).unwrap();
    assert_eq!(active.value_per_token, dec!(17));
    assert_eq!(active.source, NavSource::Formula);
    let history = ledger.history(&p.project).unwrap();
    assert!(history
        .iter()
        .any(|r| r.value_per_token == dec!(20) && r.source == NavSource::Audited && r.is_superseded));
    assert!(ReconciliationLedger::new(&p.store).unresolved().unwrap().is_empty());
}

/// The NAV drops below the burn while it is in flight. The burn has landed,
/// so the mismatch is recorded for reconciliation and the new NAV stands.
#[test]
fn burn_outgrown_by_in_flight_nav_drop_diverges() {
    let p = Platform::new();
    let address = p.wallet_address();
    p.network
        .fund(&address, &p.config.settlement_asset, dec!(1000))
        .unwrap();
    let milestone = p.approved_milestone(dec!(300));

    let hook_store = Arc::clone(&p.store);
    let hook_project = p.project.clone();
    p.network.after_success(move |op, _| {
        if op == Operation::Transfer {
            NavLedger::new(&hook_store)
                .record(&hook_project, dec!(2), NavSource::Audited, Some("write-down"))
                .unwrap();
        }
    });

    let outcome = p
        .settlement()
        .disburse_milestone(milestone, &p.actor)
        .unwrap();
    let reconciliation_id = match &outcome {
        SettlementOutcome::Divergent {
            reconciliation_id, ..
        } => reconciliation_id.unwrap(),
        other => panic!("expected divergence, got {:?}", other),
    };
    assert_eq!(p.network.burned(&p.config.settlement_asset), dec!(300));

    let record = ReconciliationLedger::new(&p.store)
        .get(reconciliation_id)
        .unwrap();
    assert_eq!(record.kind, DivergenceKind::MilestoneBurn);
    assert_eq!(record.amount, Some(dec!(300)));

    let m = p.settlement().milestone(milestone).unwrap();
    assert_eq!(m.settlement_state, SettlementState::Divergent);
    assert_ne!(m.status, MilestoneStatus::Disbursed);
    let active = NavLedger::new(&p.store).active(&p.project).unwrap();
    assert_eq!(active.value_per_token, dec!(2));
    assert_eq!(active.source, NavSource::Audited);
}

/// A lost response leaves the payout pending until an operator confirms it.
#[test]
fn redemption_timeout_resolved_as_landed() {
    let p = Platform::new();
    let s = p.settlement();
    let request = s
        .request_redemption(&p.project, &p.alice, ALICE_ADDRESS, dec!(20), &p.actor)
        .unwrap();
    assert_eq!(request.payout_amount, dec!(200));

    p.network.lose_next_response(Operation::Transfer);
    let err = s.settle_redemption(request.id, &p.actor).unwrap_err();
    assert!(matches!(err, SettlementError::OutcomeUnknown { .. }));
    assert_eq!(
        s.redemption(request.id).unwrap().settlement_state,
        SettlementState::ExternalPending
    );

    // Retrying without resolution never re-issues the transfer.
    let err = s.settle_redemption(request.id, &p.actor).unwrap_err();
    assert!(matches!(err, SettlementError::OutcomeUnknown { .. }));
    assert_eq!(p.network.calls(Operation::Transfer), 1);

    let landed = p.network.last_tx_ref().unwrap();
    let resolved = s
        .resolve_pending(
            PendingEntity::Redemption(request.id),
            PendingResolution::Landed {
                external_ref: landed.to_string(),
            },
            &Actor::new("admin:finance"),
        )
        .unwrap();
    assert_eq!(
        resolved,
        ResolvedPending::Confirmed {
            external_ref: landed.to_string()
        }
    );

    let paid = s.redemption(request.id).unwrap();
    assert_eq!(paid.status, RedemptionStatus::Paid);
    assert_eq!(paid.external_tx_ref.as_deref(), Some(landed.as_str()));
    let held = p
        .store
        .read(|conn| project::holding_balance(conn, &p.project, &p.alice))
        .unwrap();
    assert_eq!(held, dec!(40));
    assert_eq!(
        p.network.balance(ALICE_ADDRESS, &p.config.settlement_asset).unwrap(),
        dec!(200)
    );
}

/// A timeout that never reached the network is released and retried.
#[test]
fn capital_timeout_released_then_retried() {
    let p = Platform::new();
    p.wallet_address();
    let s = p.settlement();
    let request = p.capital_request("cap-timeout", dec!(1500));

    p.network.fail_next(
        Operation::Transfer,
        NetworkError::Timeout {
            operation: "transfer",
        },
    );
    let err = s.allocate_capital(&request, &p.actor).unwrap_err();
    assert!(matches!(err, SettlementError::OutcomeUnknown { .. }));

    // While pending, the amount is committed against the pool.
    let err = s
        .allocate_capital(&p.capital_request("cap-other", dec!(9000)), &p.actor)
        .unwrap_err();
    assert!(matches!(err, SettlementError::InsufficientPoolBalance { .. }));

    let resolved = s
        .resolve_pending(
            PendingEntity::CapitalAllocation("cap-timeout".to_string()),
            PendingResolution::NotExecuted,
            &p.actor,
        )
        .unwrap();
    assert_eq!(resolved, ResolvedPending::Released);
    let staged = s.capital_allocation("cap-timeout").unwrap().unwrap();
    assert_eq!(staged.settlement_state, SettlementState::Staged);

    let outcome = s.allocate_capital(&request, &p.actor).unwrap();
    assert!(outcome.is_confirmed());
    assert_eq!(
        PoolLedger::new(&p.store).balance(PoolType::Treasury, None).unwrap(),
        dec!(8500)
    );
}

/// A definite failure releases the intent; the next attempt succeeds.
#[test]
fn definite_failure_is_retryable() {
    let p = Platform::new();
    p.network.fail_next(
        Operation::CreateAccount,
        NetworkError::Transport("connection reset".to_string()),
    );
    let err = p
        .settlement()
        .provision_wallet(&p.project, &p.actor)
        .unwrap_err();
    assert!(err.class().is_retryable());
    let wallet = p.settlement().wallet(&p.project).unwrap().unwrap();
    assert_eq!(wallet.settlement_state, SettlementState::Staged);
    assert!(!wallet.is_funded());

    let outcome = p.settlement().provision_wallet(&p.project, &p.actor).unwrap();
    let funded = outcome.into_output().unwrap();
    assert_eq!(funded.address, wallet.address);
    assert!(funded.is_funded());
}

/// Reserve floors: 100 balance, 20 floor, 85 requested is unavailable.
#[test]
fn reserve_floor_blocks_redemption() {
    let store = Store::open_in_memory().unwrap();
    let project = ProjectId::new("PRJ-SMALL");
    let holder = HolderId::new("carol");
    store
        .write(|tx| {
            project::register_project(tx, &project, "Small", Decimal::ZERO, None)?;
            project::issue_tokens(tx, &project, &holder, dec!(100))?;
            Ok::<_, ProjectError>(())
        })
        .unwrap();
    store
        .write(|tx| nav::record_nav(tx, &project, dec!(1), NavSource::Manual, None))
        .unwrap();
    PoolLedger::new(&store)
        .deposit(PoolType::Treasury, None, dec!(100), "seed")
        .unwrap();
    let config = SettlementConfig {
        asset_issuer: ISSUER.to_string(),
        funding_sources: vec![FundingSource::new(PoolType::Treasury, dec!(20))],
        ..Default::default()
    };
    let network = SimulatedNetwork::new(ISSUER);
    let s = Settlement::new(&store, &network, &config);

    let err = s
        .request_redemption(&project, &holder, "GCAROL", dec!(85), &Actor::new("carol"))
        .unwrap_err();
    match err {
        SettlementError::Funding(FundingError::InsufficientFunds { breakdown, .. }) => {
            assert_eq!(breakdown.len(), 1);
            assert_eq!(breakdown[0].available, dec!(80));
        }
        other => panic!("expected insufficient funds, got {:?}", other),
    }
    s.request_redemption(&project, &holder, "GCAROL", dec!(80), &Actor::new("carol"))
        .unwrap();
}

/// Informational audit entries go through the background queue.
#[test]
fn audit_queue_delivers_informational_entries() {
    let p = Platform::new();
    let queue = AuditQueue::start(Arc::clone(&p.store), p.config.audit);
    let milestone = {
        let s = p.settlement().with_audit_queue(&queue);
        let m = s.create_milestone(&p.project, 7, dec!(100), &p.actor).unwrap();
        s.submit_milestone(m.id, &p.actor).unwrap();
        m.id
    };
    let stats = queue.shutdown();
    assert_eq!(stats.enqueued, 2);
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.failed, 0);

    let trail = p
        .store
        .read(|conn| audit::entries_for(conn, EntityKind::Milestone, &milestone.to_string()))
        .unwrap();
    let actions: Vec<_> = trail.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![AuditAction::MilestoneCreated, AuditAction::MilestoneSubmitted]
    );
    assert!(trail.iter().all(|e| !e.critical));
}

/// NAV history and the single active record survive a reopen.
#[test]
fn file_store_keeps_state_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let project = ProjectId::new("PRJ-DISK");
    {
        let store = Store::open(&path).unwrap();
        store
            .write(|tx| project::register_project(tx, &project, "Disk", dec!(50), None))
            .unwrap();
        let navs = NavLedger::new(&store);
        for value in [dec!(1), dec!(1.5), dec!(2.25)] {
            navs.record(&project, value, NavSource::Manual, None).unwrap();
        }
    }

    let store = Store::open(&path).unwrap();
    let navs = NavLedger::new(&store);
    assert_eq!(navs.active(&project).unwrap().value_per_token, dec!(2.25));
    let history = navs.history(&project).unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history.iter().filter(|r| !r.is_superseded).count(), 1);
}

/// Errors carry stable codes for the response envelope.
#[test]
fn error_responses_carry_codes() {
    let p = Platform::new();
    let result = p
        .settlement()
        .request_redemption(&p.project, &p.bob, "GBOB", dec!(41), &p.actor);
    let err = result.as_ref().unwrap_err();
    assert_eq!(err.class(), ErrorClass::DomainState);
    let response = ApiResponse::from_result(result);
    assert!(!response.is_success());
    assert_eq!(response.code(), Some("INSUFFICIENT_HOLDING"));
}
