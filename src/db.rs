//! Database connection management and schema setup.

use anyhow::Context as _;
use sqlx::SqlitePool;
use std::path::Path;

/// SQLite connection bundle for the tree store.
pub struct Db {
    pub sqlite: SqlitePool,
}

impl Db {
    /// Connect to the database file and initialize the schema.
    pub async fn connect(path: &Path) -> anyhow::Result<Self> {
        let sqlite_url = format!("sqlite:{}?mode=rwc", path.display());
        let sqlite = SqlitePool::connect(&sqlite_url)
            .await
            .with_context(|| format!("failed to connect to SQLite at {}", path.display()))?;

        init_schema(&sqlite).await?;

        Ok(Self { sqlite })
    }

    /// In-memory database, used by tests and ephemeral deployments.
    pub async fn connect_in_memory() -> anyhow::Result<Self> {
        let sqlite = SqlitePool::connect("sqlite::memory:")
            .await
            .context("failed to open in-memory SQLite")?;
        init_schema(&sqlite).await?;
        Ok(Self { sqlite })
    }

    /// Close the connection pool gracefully.
    pub async fn close(self) {
        self.sqlite.close().await;
    }
}

async fn init_schema(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS message_trees (
            root_id TEXT PRIMARY KEY,
            snapshot TEXT NOT NULL,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(pool)
    .await
    .context("failed to initialize message_trees schema")?;
    Ok(())
}
