use anyhow::{Context, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::config::RelayConfig;

/// Current schema version; bump together with a new migration arm below.
const SCHEMA_VERSION: i64 = 1;

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &RelayConfig) -> Result<Self> {
        info!("Connecting to database: {}", config.db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .connect(&config.db_url())
            .await
            .with_context(|| format!("Failed to connect to database: {}", config.db_url()))?;

        self::run_migrations(&pool).await?;

        // Set pragmas for performance
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA temp_store = MEMORY")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await?;

        info!("Database initialized");

        Ok(Self { pool })
    }
}

pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (unixepoch()),
            description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await
            .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        anyhow::bail!(
            "Database schema version {} is newer than supported version {}. Please upgrade reefd.",
            current_version,
            SCHEMA_VERSION
        );
    }

    if current_version < 1 {
        migrate_v1(pool).await?;
    }

    Ok(())
}

/// v1: the three entity tables. Foreign keys are stored as the textual uuid
/// of the referenced row; room membership is a space-separated uuid list.
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    info!("Applying schema migration v1");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            message_uuid CHAR(36) NOT NULL UNIQUE,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL DEFAULT (unixepoch()),
            room CHAR(36) NOT NULL,
            user CHAR(36) NOT NULL,
            system_message INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_room_seq ON messages (room, seq)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rooms (
            uuid CHAR(36) NOT NULL UNIQUE,
            name TEXT NOT NULL,
            invitedusers TEXT NOT NULL DEFAULT '',
            password TEXT DEFAULT NULL,
            last_message CHAR(36) DEFAULT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            uuid CHAR(36) NOT NULL UNIQUE,
            created_at INTEGER NOT NULL DEFAULT (unixepoch()),
            name CHAR(24),
            pwhash TEXT DEFAULT NULL,
            friends TEXT NOT NULL DEFAULT '',
            email TEXT DEFAULT NULL,
            blockedusers TEXT NOT NULL DEFAULT '',
            nickname TEXT DEFAULT NULL,
            status INTEGER NOT NULL DEFAULT 1,
            rooms TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "INSERT INTO schema_version (version, description) VALUES (1, 'messages, rooms, users')",
    )
    .execute(pool)
    .await?;

    Ok(())
}
