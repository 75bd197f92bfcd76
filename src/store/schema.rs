//! Database schema definitions

use log::info;
use rusqlite::{Connection, OptionalExtension};

use super::StoreError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating settlement schema v{}", SCHEMA_VERSION);
        conn.execute_batch(LEDGER_SCHEMA)?;
        conn.execute_batch(SETTLEMENT_SCHEMA)?;
        conn.execute_batch(RECONCILIATION_SCHEMA)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found: current_version,
            supported: SCHEMA_VERSION,
        });
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32, StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StoreError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Projects, holdings, NAV history and the append-only pool log.
const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    token_supply TEXT NOT NULL,
    token_price TEXT,
    revenue_split TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS token_holdings (
    project_id TEXT NOT NULL REFERENCES projects(id),
    holder_id TEXT NOT NULL,
    balance TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (project_id, holder_id)
);

CREATE TABLE IF NOT EXISTS nav_records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    project_id TEXT NOT NULL REFERENCES projects(id),
    value_per_token TEXT NOT NULL,
    source TEXT NOT NULL,
    effective_at TEXT NOT NULL,
    is_superseded INTEGER NOT NULL DEFAULT 0,
    notes TEXT
);

-- At most one active NAV per project.
CREATE UNIQUE INDEX IF NOT EXISTS idx_nav_active
    ON nav_records(project_id) WHERE is_superseded = 0;

CREATE TABLE IF NOT EXISTS pool_transactions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    pool_type TEXT NOT NULL,
    direction TEXT NOT NULL,
    amount TEXT NOT NULL,
    project_id TEXT,
    source_reference TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pool_transactions_pool
    ON pool_transactions(pool_type, project_id);

CREATE TABLE IF NOT EXISTS revenue_records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    project_id TEXT NOT NULL REFERENCES projects(id),
    amount TEXT NOT NULL,
    source_reference TEXT NOT NULL,
    verified INTEGER NOT NULL DEFAULT 0,
    processed INTEGER NOT NULL DEFAULT 0,
    received_at TEXT NOT NULL,
    processed_at TEXT
);

CREATE TABLE IF NOT EXISTS holder_revenue_shares (
    id TEXT PRIMARY KEY,
    revenue_record_id TEXT NOT NULL REFERENCES revenue_records(id),
    project_id TEXT NOT NULL,
    holder_id TEXT NOT NULL,
    amount TEXT NOT NULL,
    policy TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (revenue_record_id, holder_id)
);
"#;

/// Entities that pair a local write with an external action.
const SETTLEMENT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS distribution_events (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    total_amount TEXT NOT NULL,
    status TEXT NOT NULL,
    snapshot_total_weight TEXT,
    snapshot_nav TEXT,
    total_allocated TEXT NOT NULL,
    total_withdrawn TEXT NOT NULL,
    created_at TEXT NOT NULL,
    calculated_at TEXT
);

CREATE TABLE IF NOT EXISTS distribution_allocations (
    id TEXT PRIMARY KEY,
    distribution_event_id TEXT NOT NULL REFERENCES distribution_events(id),
    project_id TEXT NOT NULL,
    holder_id TEXT NOT NULL,
    weight_held TEXT NOT NULL,
    ownership_percentage TEXT NOT NULL,
    allocated_amount TEXT NOT NULL,
    available_amount TEXT NOT NULL,
    status TEXT NOT NULL,
    UNIQUE (distribution_event_id, holder_id)
);

CREATE TABLE IF NOT EXISTS milestones (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    sequence_number INTEGER NOT NULL,
    target_amount TEXT NOT NULL,
    status TEXT NOT NULL,
    bank_transfer_reference TEXT,
    burned_amount TEXT,
    external_tx_ref TEXT UNIQUE,
    settlement_state TEXT NOT NULL,
    intent_id TEXT,
    rejection_reason TEXT,
    created_at TEXT NOT NULL,
    disbursed_at TEXT,
    UNIQUE (project_id, sequence_number)
);

CREATE TABLE IF NOT EXISTS project_wallets (
    project_id TEXT PRIMARY KEY REFERENCES projects(id),
    address TEXT NOT NULL UNIQUE,
    secret_material_ref TEXT NOT NULL,
    staged_at TEXT NOT NULL,
    funded_at TEXT,
    settlement_state TEXT NOT NULL,
    external_tx_ref TEXT
);

CREATE TABLE IF NOT EXISTS capital_allocations (
    id TEXT PRIMARY KEY,
    request_key TEXT NOT NULL UNIQUE,
    pool_type TEXT NOT NULL,
    project_id TEXT NOT NULL REFERENCES projects(id),
    amount TEXT NOT NULL,
    settlement_state TEXT NOT NULL,
    external_tx_ref TEXT UNIQUE,
    created_at TEXT NOT NULL,
    confirmed_at TEXT
);

CREATE TABLE IF NOT EXISTS redemption_requests (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    holder_id TEXT NOT NULL,
    holder_address TEXT NOT NULL,
    token_amount TEXT NOT NULL,
    nav_per_token TEXT NOT NULL,
    payout_amount TEXT NOT NULL,
    funding_source TEXT NOT NULL,
    status TEXT NOT NULL,
    settlement_state TEXT NOT NULL,
    external_tx_ref TEXT UNIQUE,
    created_at TEXT NOT NULL,
    paid_at TEXT
);
"#;

/// Divergence records and the audit trail. Neither is ever deleted.
const RECONCILIATION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS reconciliation_records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    error_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    external_tx_ref TEXT,
    related_entity_id TEXT NOT NULL,
    amount TEXT,
    message TEXT NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0,
    resolved_by TEXT,
    resolution_notes TEXT,
    created_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE TABLE IF NOT EXISTS audit_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    actor TEXT NOT NULL,
    action TEXT NOT NULL,
    entity_kind TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    before_status TEXT,
    after_status TEXT,
    detail TEXT NOT NULL,
    critical INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_log(entity_kind, entity_id);
"#;
