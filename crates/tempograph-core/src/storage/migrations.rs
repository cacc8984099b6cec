//! Database migrations
//!
//! This module manages SQLite schema migrations for tempograph.
//! Migrations are versioned and applied automatically on database connection.

use sqlx::SqlitePool;

/// Current schema version
pub const CURRENT_VERSION: i32 = 3;

/// SQL for creating the migrations tracking table
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: Temporal knowledge graph
const MIGRATION_V1: &str = r#"
    -- Episodic nodes: one row per ingested episode
    CREATE TABLE IF NOT EXISTS episodes (
        id TEXT PRIMARY KEY NOT NULL,
        group_id TEXT NOT NULL,
        name TEXT NOT NULL,
        body TEXT NOT NULL,
        source_kind TEXT NOT NULL,
        source_description TEXT NOT NULL DEFAULT '',
        reference_time TEXT NOT NULL,
        received_at TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('raw', 'full')),
        previous_episode_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_episodes_group_received ON episodes(group_id, received_at);
    CREATE INDEX IF NOT EXISTS idx_episodes_status ON episodes(status);

    -- Entity nodes, unique per group by canonical name
    CREATE TABLE IF NOT EXISTS entity_nodes (
        id TEXT PRIMARY KEY NOT NULL,
        group_id TEXT NOT NULL,
        name TEXT NOT NULL,
        canonical_name TEXT NOT NULL,
        summary TEXT,
        name_embedding BLOB,                     -- f32 little-endian
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(group_id, canonical_name)
    );

    CREATE INDEX IF NOT EXISTS idx_entity_nodes_group ON entity_nodes(group_id);

    -- Entity edges (facts); invalid_at is set once, never cleared
    CREATE TABLE IF NOT EXISTS entity_edges (
        id TEXT PRIMARY KEY NOT NULL,
        group_id TEXT NOT NULL,
        source_node_id TEXT NOT NULL REFERENCES entity_nodes(id),
        target_node_id TEXT NOT NULL REFERENCES entity_nodes(id),
        relation TEXT NOT NULL,
        fact_text TEXT NOT NULL,
        fact_embedding BLOB,                     -- f32 little-endian
        valid_at TEXT NOT NULL,
        invalid_at TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_entity_edges_group ON entity_edges(group_id);
    CREATE INDEX IF NOT EXISTS idx_entity_edges_source ON entity_edges(source_node_id);
    CREATE INDEX IF NOT EXISTS idx_entity_edges_target ON entity_edges(target_node_id);

    -- Provenance: episode -> entity / fact / previous episode
    CREATE TABLE IF NOT EXISTS episodic_edges (
        id TEXT PRIMARY KEY NOT NULL,
        group_id TEXT NOT NULL,
        episode_id TEXT NOT NULL REFERENCES episodes(id),
        target_id TEXT NOT NULL,
        kind TEXT NOT NULL CHECK (kind IN ('mentions', 'supports', 'preceded_by')),
        created_at TEXT NOT NULL,
        UNIQUE(episode_id, target_id, kind)
    );

    CREATE INDEX IF NOT EXISTS idx_episodic_edges_episode ON episodic_edges(episode_id);
"#;

/// Migration 2: Durable retry ledger
const MIGRATION_V2: &str = r#"
    CREATE TABLE IF NOT EXISTS retry_ledger (
        episode_id TEXT PRIMARY KEY NOT NULL,
        group_id TEXT NOT NULL,
        payload TEXT NOT NULL,                   -- JSON-encoded episode
        attempt_count INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        next_retry_at TEXT NOT NULL,
        last_error_category TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_retry_ledger_next_retry ON retry_ledger(next_retry_at);
"#;

/// Migration 3: Quarantined ledger rows and rejected episodes
const MIGRATION_V3: &str = r#"
    -- Ledger rows whose payload could not be decoded, kept for inspection
    CREATE TABLE IF NOT EXISTS retry_ledger_quarantine (
        episode_id TEXT PRIMARY KEY NOT NULL,
        group_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        attempt_count INTEGER NOT NULL,
        reason TEXT NOT NULL,
        quarantined_at TEXT NOT NULL
    );

    -- Episodes that were rejected without any commit
    CREATE TABLE IF NOT EXISTS episode_rejections (
        episode_id TEXT PRIMARY KEY NOT NULL,
        group_id TEXT NOT NULL,
        category TEXT NOT NULL,
        retry_after_ms INTEGER,
        rejected_at TEXT NOT NULL
    );
"#;

/// Get the current schema version from the database
async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    // MAX() over an empty table yields a single NULL row
    let (version,): (Option<i32>,) = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_one(pool)
        .await?;

    Ok(version.unwrap_or(0))
}

/// Record that a migration was applied
async fn record_migration(pool: &SqlitePool, version: i32) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Temporal knowledge graph");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    if current_version < 2 {
        tracing::info!("Applying migration v2: Retry ledger");
        sqlx::raw_sql(MIGRATION_V2).execute(pool).await?;
        record_migration(pool, 2).await?;
    }

    if current_version < 3 {
        tracing::info!("Applying migration v3: Ledger quarantine and rejections");
        sqlx::raw_sql(MIGRATION_V3).execute(pool).await?;
        record_migration(pool, 3).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Get migration status information
pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Current schema version in the database
    pub current_version: i32,
    /// Target schema version (latest)
    pub target_version: i32,
    /// Whether migrations need to be run
    pub needs_migration: bool,
}
