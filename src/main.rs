//! settlement-core CLI
//!
//! Run allocations and operator tasks against a settlement ledger.
//!
//! # Usage
//!
//! ```bash
//! # Pro-rata allocation of a total across weighted holders
//! settlement-core allocate --total 1000.01 --weights alice=1,bob=2
//!
//! # Percentage split
//! settlement-core split --amount 100.01 --percentages a=33.33,b=33.33,c=33.34
//!
//! # List and resolve divergences
//! settlement-core reconcile --db ledger.db
//! settlement-core reconcile --db ledger.db --resolve <ID> --notes "matched on network"
//!
//! # Clear an operation stuck after a timeout
//! settlement-core resolve --db ledger.db --entity milestone:<ID> --landed <TX_REF>
//!
//! # Process verified revenue
//! settlement-core batch --db ledger.db --config settlement.json
//!
//! # End-to-end run against an in-memory ledger and simulated network
//! settlement-core demo --holders 25
//! ```

use std::fmt;
use std::fs;
use std::path::Path;
use std::process;

use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use settlement_core::allocation::distribution::{DistributionEvent, DistributionLedger};
use settlement_core::allocation::largest_remainder::{allocate_pro_rata, Allocation, Claim};
use settlement_core::allocation::split::{split_by_percentages, SplitLeg};
use settlement_core::config::SettlementConfig;
use settlement_core::core::ids::{Actor, ProjectId};
use settlement_core::core::money::{AssetCode, NetworkAmount};
use settlement_core::core::nav::{NavLedger, NavSource};
use settlement_core::core::pool::{PoolLedger, PoolStatement, PoolType};
use settlement_core::core::project;
use settlement_core::jobs::revenue::{self, BatchReport, RevenueLedger};
use settlement_core::network::{AssetNetwork, NetworkError, TxRef};
use settlement_core::outcome::ApiResponse;
use settlement_core::reconciliation::records::ReconciliationLedger;
use settlement_core::settlement::capital::{CapitalAllocation, CapitalRequest};
use settlement_core::settlement::milestone::DisbursementReceipt;
use settlement_core::settlement::{PendingEntity, PendingResolution, Settlement, SettlementOutcome};
use settlement_core::simulation::holdings::{generate_holdings, HoldingsConfig};
use settlement_core::simulation::network::SimulatedNetwork;
use settlement_core::store::Store;

fn print_usage() {
    eprintln!(
        r#"settlement-core: settlement and reconciliation for tokenized project investments

USAGE:
    settlement-core <COMMAND> [OPTIONS]

COMMANDS:
    allocate    Split a total pro rata across weighted holders
    split       Split an amount by fixed percentages
    reconcile   List unresolved divergences, or resolve one
    resolve     Confirm or release an operation left pending by a timeout
    batch       Process verified, unprocessed revenue
    demo        Run every flow against an in-memory ledger
    help        Show this message

OPTIONS (allocate):
    --total <AMOUNT>        Amount to allocate
    --weights <LIST>        holder=weight pairs, comma-separated
    --input <FILE>          JSON file: {{"claims": [{{"holder": "...", "weight": "..."}}]}}
    --scale <N>             Minor-unit digits (default: 2)

OPTIONS (split):
    --amount <AMOUNT>       Amount to split
    --percentages <LIST>    key=percent pairs summing to 100 (default: revenue split)
    --scale <N>             Minor-unit digits (default: 2)

OPTIONS (reconcile):
    --db <FILE>             Ledger database
    --resolve <ID>          Mark a record resolved
    --notes <TEXT>          Resolution notes (required with --resolve)

OPTIONS (resolve):
    --db <FILE>             Ledger database
    --entity <KIND:ID>      wallet:<project>, milestone:<id>, capital:<key>, redemption:<id>
    --landed <TX_REF>       The call landed under this reference
    --not-executed          The call never took effect

OPTIONS (batch):
    --db <FILE>             Ledger database

OPTIONS (demo):
    --holders <N>           Number of generated holders (default: 25)

COMMON OPTIONS:
    --config <FILE>         Settlement config JSON (default: built-in defaults)
    --actor <NAME>          Actor recorded in the audit trail (default: operator:cli)
    --format <FORMAT>       Output format: text (default) or json

EXAMPLES:
    settlement-core allocate --total 1000.01 --weights alice=1,bob=2
    settlement-core split --amount 100.01 --percentages a=33.33,b=33.33,c=33.34 --format json
    settlement-core reconcile --db ledger.db
    settlement-core resolve --db ledger.db --entity redemption:<ID> --not-executed
    settlement-core batch --db ledger.db
    settlement-core demo --holders 50 --format json"#
    );
}

fn fail(message: impl fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    process::exit(1);
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => fail(format!("serializing output: {}", e)),
    }
}

/// Options shared by every command.
struct Options {
    format: String,
    config: Option<String>,
    db: Option<String>,
    actor: String,
    rest: Vec<(String, Option<String>)>,
}

impl Options {
    fn parse(args: &[String], flags: &[&str]) -> Self {
        let mut options = Options {
            format: "text".to_string(),
            config: None,
            db: None,
            actor: "operator:cli".to_string(),
            rest: Vec::new(),
        };
        let mut i = 0;
        while i < args.len() {
            let name = args[i].as_str();
            if flags.contains(&name) {
                options.rest.push((name.to_string(), None));
                i += 1;
                continue;
            }
            i += 1;
            let value = args.get(i).cloned().unwrap_or_else(|| {
                eprintln!("{} requires a value", name);
                process::exit(1);
            });
            match name {
                "--format" => options.format = value,
                "--config" => options.config = Some(value),
                "--db" => options.db = Some(value),
                "--actor" => options.actor = value,
                _ if name.starts_with("--") => options.rest.push((name.to_string(), Some(value))),
                _ => {
                    eprintln!("Unknown option: {}", name);
                    process::exit(1);
                }
            }
            i += 1;
        }
        if options.format != "text" && options.format != "json" {
            fail("--format requires 'text' or 'json'");
        }
        options
    }

    fn json(&self) -> bool {
        self.format == "json"
    }

    fn value(&self, name: &str) -> Option<&str> {
        self.rest
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    fn flag(&self, name: &str) -> bool {
        self.rest.iter().any(|(n, v)| n == name && v.is_none())
    }

    fn require(&self, name: &str) -> &str {
        self.value(name)
            .unwrap_or_else(|| fail(format!("{} is required", name)))
    }

    fn decimal(&self, name: &str) -> Decimal {
        let raw = self.require(name);
        raw.parse()
            .unwrap_or_else(|e| fail(format!("invalid amount '{}': {}", raw, e)))
    }

    fn scale(&self) -> u32 {
        match self.value("--scale") {
            Some(raw) => raw
                .parse()
                .unwrap_or_else(|_| fail("--scale requires a number")),
            None => self.settlement_config().minor_unit_scale,
        }
    }

    fn settlement_config(&self) -> SettlementConfig {
        match &self.config {
            Some(path) => SettlementConfig::from_json_file(Path::new(path))
                .unwrap_or_else(|e| fail(format!("loading config '{}': {}", path, e))),
            None => SettlementConfig::default(),
        }
    }

    fn store(&self) -> Store {
        let path = self
            .db
            .as_deref()
            .unwrap_or_else(|| fail("--db <FILE> is required"));
        Store::open(Path::new(path)).unwrap_or_else(|e| fail(format!("opening '{}': {}", path, e)))
    }

    fn actor(&self) -> Actor {
        Actor::new(self.actor.clone())
    }
}

/// Parse `key=value` pairs with decimal values.
fn parse_pairs(raw: &str) -> Vec<(String, Decimal)> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .unwrap_or_else(|| fail(format!("expected key=value, got '{}'", pair)));
            let value: Decimal = value
                .trim()
                .parse()
                .unwrap_or_else(|e| fail(format!("invalid number '{}': {}", value, e)));
            (key.trim().to_string(), value)
        })
        .collect()
}

#[derive(serde::Deserialize)]
struct ClaimsFile {
    claims: Vec<Claim>,
}

fn cmd_allocate(args: &[String]) {
    let options = Options::parse(args, &[]);
    let total = options.decimal("--total");
    let claims: Vec<Claim> = match (options.value("--weights"), options.value("--input")) {
        (Some(weights), None) => parse_pairs(weights)
            .into_iter()
            .map(|(holder, weight)| Claim::new(holder.as_str(), weight))
            .collect(),
        (None, Some(path)) => {
            let content = fs::read_to_string(path)
                .unwrap_or_else(|e| fail(format!("reading file '{}': {}", path, e)));
            let file: ClaimsFile = serde_json::from_str(&content)
                .unwrap_or_else(|e| fail(format!("parsing JSON: {}", e)));
            file.claims
        }
        _ => fail("exactly one of --weights or --input is required"),
    };

    let result: Result<Allocation, _> = allocate_pro_rata(total, &claims, options.scale());
    if options.json() {
        print_json(&ApiResponse::from_result(result));
    } else {
        match result {
            Ok(allocation) => println!("{}", allocation),
            Err(e) => fail(e),
        }
    }
}

fn cmd_split(args: &[String]) {
    let options = Options::parse(args, &[]);
    let amount = options.decimal("--amount");
    let legs: Vec<(String, Decimal)> = match options.value("--percentages") {
        Some(raw) => parse_pairs(raw),
        None => options
            .settlement_config()
            .revenue_split
            .legs()
            .iter()
            .map(|(dest, pct)| (dest.to_string(), *pct))
            .collect(),
    };

    let result: Result<Vec<SplitLeg<String>>, _> = split_by_percentages(amount, &legs, options.scale());
    if options.json() {
        print_json(&ApiResponse::from_result(result));
    } else {
        match result {
            Ok(legs) => {
                println!("=== Split of {} ===", amount);
                for leg in &legs {
                    println!("  {:<16} {:>8}%  {:>16}", leg.key, leg.percentage, leg.amount);
                }
                let total: Decimal = legs.iter().map(|l| l.amount).sum();
                println!("Total:     {}", total);
                println!("Conserved: {}", total == amount);
            }
            Err(e) => fail(e),
        }
    }
}

fn cmd_reconcile(args: &[String]) {
    let options = Options::parse(args, &[]);
    let store = options.store();
    let ledger = ReconciliationLedger::new(&store);

    if let Some(raw) = options.value("--resolve") {
        let id: Uuid = raw
            .parse()
            .unwrap_or_else(|e| fail(format!("invalid record id '{}': {}", raw, e)));
        let notes = options.require("--notes");
        let result = ledger.resolve(id, &options.actor(), notes);
        if options.json() {
            print_json(&ApiResponse::from_result(result));
        } else {
            match result {
                Ok(record) => println!("{}", record),
                Err(e) => fail(e),
            }
        }
        return;
    }

    let result = ledger.unresolved();
    if options.json() {
        print_json(&ApiResponse::from_result(result));
    } else {
        match result {
            Ok(records) if records.is_empty() => println!("No unresolved divergences."),
            Ok(records) => {
                for record in &records {
                    println!("{}", record);
                }
                println!("\nUnresolved: {}", records.len());
            }
            Err(e) => fail(e),
        }
    }
}

/// Network stand-in for operator commands that must not reach the network.
struct Offline;

impl Offline {
    fn refuse(operation: &str) -> NetworkError {
        NetworkError::Transport(format!("{} unavailable from the CLI", operation))
    }
}

impl AssetNetwork for Offline {
    fn create_account(&self, _address: &str, _reserve: &NetworkAmount) -> Result<TxRef, NetworkError> {
        Err(Offline::refuse("create_account"))
    }

    fn establish_trustline(&self, _address: &str, _asset: &AssetCode, _issuer: &str) -> Result<TxRef, NetworkError> {
        Err(Offline::refuse("establish_trustline"))
    }

    fn transfer(
        &self,
        _from: &str,
        _to: &str,
        _asset: &AssetCode,
        _amount: &NetworkAmount,
    ) -> Result<TxRef, NetworkError> {
        Err(Offline::refuse("transfer"))
    }

    fn balance(&self, _address: &str, _asset: &AssetCode) -> Result<Decimal, NetworkError> {
        Err(Offline::refuse("balance"))
    }
}

fn parse_entity(raw: &str) -> PendingEntity {
    let (kind, id) = raw
        .split_once(':')
        .unwrap_or_else(|| fail(format!("expected KIND:ID, got '{}'", raw)));
    let uuid = || -> Uuid { id.parse().unwrap_or_else(|e| fail(format!("invalid id '{}': {}", id, e))) };
    match kind {
        "wallet" => PendingEntity::Wallet(ProjectId::new(id)),
        "milestone" => PendingEntity::Milestone(uuid()),
        "capital" => PendingEntity::CapitalAllocation(id.to_string()),
        "redemption" => PendingEntity::Redemption(uuid()),
        other => fail(format!("unknown entity kind '{}'", other)),
    }
}

fn cmd_resolve(args: &[String]) {
    let options = Options::parse(args, &["--not-executed"]);
    let entity = parse_entity(options.require("--entity"));
    let resolution = match (options.value("--landed"), options.flag("--not-executed")) {
        (Some(external_ref), false) => PendingResolution::Landed {
            external_ref: external_ref.to_string(),
        },
        (None, true) => PendingResolution::NotExecuted,
        _ => fail("exactly one of --landed <TX_REF> or --not-executed is required"),
    };

    let store = options.store();
    let config = options.settlement_config();
    let settlement = Settlement::new(&store, &Offline, &config);
    let result = settlement.resolve_pending(entity, resolution, &options.actor());
    if options.json() {
        print_json(&ApiResponse::from_result(result));
    } else {
        match result {
            Ok(resolved) => println!("{:?}", resolved),
            Err(e) => fail(e),
        }
    }
}

fn cmd_batch(args: &[String]) {
    let options = Options::parse(args, &[]);
    let store = options.store();
    let config = options.settlement_config();
    let result: Result<BatchReport, _> = revenue::run_revenue_batch(&store, &config, &options.actor());
    if options.json() {
        print_json(&ApiResponse::from_result(result));
    } else {
        match result {
            Ok(report) => {
                println!("{}", report);
                if !report.is_clean() {
                    process::exit(2);
                }
            }
            Err(e) => fail(e),
        }
    }
}

const DEMO_ISSUER: &str = "GDEMOISSUER";
const DEMO_TREASURY: &str = "GDEMOTREASURY";

#[derive(Serialize)]
struct DemoReport {
    holders: usize,
    capital: Option<CapitalAllocation>,
    revenue: BatchReport,
    distribution: DistributionEvent,
    disbursement: Option<DisbursementReceipt>,
    pools: Vec<(PoolType, Decimal)>,
    unresolved_divergences: usize,
}

fn confirmed<T>(what: &str, outcome: SettlementOutcome<T>) -> Option<T> {
    if !outcome.is_confirmed() {
        eprintln!(
            "{} diverged under {}; see the reconciliation queue",
            what,
            outcome.external_ref()
        );
    }
    outcome.into_output()
}

fn cmd_demo(args: &[String]) {
    let options = Options::parse(args, &[]);
    let holder_count: usize = options
        .value("--holders")
        .map(|raw| raw.parse().unwrap_or_else(|_| fail("--holders requires a number")))
        .unwrap_or(25);
    let actor = options.actor();

    let mut config = options.settlement_config();
    config.asset_issuer = DEMO_ISSUER.to_string();
    config.pool_accounts.insert(PoolType::Treasury, DEMO_TREASURY.to_string());
    let scale = config.minor_unit_scale;

    let store = Store::open_in_memory().unwrap_or_else(|e| fail(e));
    let network = SimulatedNetwork::new(DEMO_ISSUER);
    let reserve = NetworkAmount::new(config.starting_reserve).unwrap_or_else(|e| fail(e));
    network
        .create_account(DEMO_TREASURY, &reserve)
        .and_then(|_| network.establish_trustline(DEMO_TREASURY, &config.settlement_asset, DEMO_ISSUER))
        .and_then(|_| network.fund(DEMO_TREASURY, &config.settlement_asset, Decimal::from(100_000)))
        .unwrap_or_else(|e| fail(e));

    let project_id = ProjectId::new("PRJ-DEMO");
    let claims = generate_holdings(&HoldingsConfig {
        holder_count,
        ..Default::default()
    });
    store
        .write(|tx| {
            project::register_project(tx, &project_id, "Demo irrigation project", Decimal::ZERO, None)?;
            for claim in claims.iter().filter(|c| c.weight > Decimal::ZERO) {
                project::issue_tokens(tx, &project_id, &claim.holder, claim.weight)?;
            }
            Ok::<_, project::ProjectError>(())
        })
        .unwrap_or_else(|e| fail(e));
    NavLedger::new(&store)
        .record(&project_id, Decimal::from(10), NavSource::Audited, Some("demo opening NAV"))
        .unwrap_or_else(|e| fail(e));
    PoolLedger::new(&store)
        .deposit(PoolType::Treasury, None, Decimal::from(50_000), "demo-seed")
        .unwrap_or_else(|e| fail(e));

    let settlement = Settlement::new(&store, &network, &config);
    settlement
        .provision_wallet(&project_id, &actor)
        .unwrap_or_else(|e| fail(e));
    let capital = settlement
        .allocate_capital(
            &CapitalRequest {
                request_key: "demo-capital-1".to_string(),
                pool: PoolType::Treasury,
                project: project_id.clone(),
                amount: Decimal::from(5_000),
            },
            &actor,
        )
        .map(|outcome| confirmed("Capital allocation", outcome))
        .unwrap_or_else(|e| fail(e));

    let revenue_ledger = RevenueLedger::new(&store, scale);
    let record = revenue_ledger
        .record(&project_id, Decimal::new(1_250_001, 2), "demo-harvest-sale")
        .and_then(|r| revenue_ledger.verify(r.id))
        .unwrap_or_else(|e| fail(e));
    let report = revenue::run_revenue_batch(&store, &config, &actor).unwrap_or_else(|e| fail(e));
    log::debug!("Demo revenue {} processed", record.id);

    let distributions = DistributionLedger::new(&store, scale);
    let distribution = distributions
        .create(&project_id, Decimal::new(100_001, 2), &actor)
        .and_then(|event| distributions.calculate(event.id, &actor))
        .and_then(|event| distributions.activate(event.id, &actor))
        .unwrap_or_else(|e| fail(e));

    let milestone = settlement
        .create_milestone(&project_id, 1, Decimal::from(2_500), &actor)
        .and_then(|m| settlement.submit_milestone(m.id, &actor))
        .and_then(|m| settlement.approve_milestone(m.id, &actor))
        .and_then(|m| settlement.attach_bank_transfer(m.id, "DEMO-BANK-001", &actor))
        .unwrap_or_else(|e| fail(e));
    let disbursement = settlement
        .disburse_milestone(milestone.id, &actor)
        .map(|outcome| confirmed("Milestone disbursement", outcome))
        .unwrap_or_else(|e| fail(e));

    let statement: PoolStatement = PoolLedger::new(&store).statement().unwrap_or_else(|e| fail(e));
    let unresolved = ReconciliationLedger::new(&store)
        .unresolved()
        .unwrap_or_else(|e| fail(e));

    if options.json() {
        let demo = DemoReport {
            holders: claims.len(),
            capital,
            revenue: report,
            distribution,
            disbursement,
            pools: PoolType::ALL.iter().map(|p| (*p, statement.balance(*p))).collect(),
            unresolved_divergences: unresolved.len(),
        };
        print_json(&ApiResponse::ok(demo));
    } else {
        println!("Generated {} holder(s)\n", claims.len());
        if let Some(capital) = &capital {
            println!("{}", capital);
        }
        println!("{}", report);
        println!("{}", distribution);
        if let Some(receipt) = &disbursement {
            println!("{}", receipt);
        }
        println!("{}", statement);
        println!("Unresolved divergences: {}", unresolved.len());
    }
}

fn main() {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let command = args[1].as_str();
    let rest = &args[2..];

    match command {
        "allocate" => cmd_allocate(rest),
        "split" => cmd_split(rest),
        "reconcile" => cmd_reconcile(rest),
        "resolve" => cmd_resolve(rest),
        "batch" => cmd_batch(rest),
        "demo" => cmd_demo(rest),
        "help" | "--help" | "-h" => print_usage(),
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            process::exit(1);
        }
    }
}
