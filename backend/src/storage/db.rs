use anyhow::Result;
use sqlx::{migrate::MigrateDatabase, Sqlite, SqlitePool};
use std::sync::Arc;

// Default database URL, overridable via DATABASE_URL
const DATABASE_URL: &str = "sqlite:recurring.db";

/// DbConnection manages the sqlite pool and schema setup
#[derive(Clone)]
pub struct DbConnection {
    pool: Arc<SqlitePool>,
}

impl DbConnection {
    /// Create a new database connection
    pub async fn new(url: &str) -> Result<Self> {
        // Create database if it doesn't exist
        if !Sqlite::database_exists(url).await.unwrap_or(false) {
            Sqlite::create_database(url).await?
        }

        let pool = SqlitePool::connect(url).await?;

        Self::setup_schema(&pool).await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Initialize the standard database
    pub async fn init() -> Result<Self> {
        let url = std::env::var("DATABASE_URL").unwrap_or_else(|_| DATABASE_URL.to_string());
        Self::new(&url).await
    }

    /// Initialize a test database with a unique name
    #[cfg(test)]
    pub async fn init_test() -> Result<Self> {
        let test_id = uuid::Uuid::new_v4().to_string();
        let db_url = format!("file:memdb_{}?mode=memory&cache=shared", test_id);

        Self::new(&db_url).await
    }

    /// Set up the required database schema
    async fn setup_schema(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cards (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                balance REAL NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS categories (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                card_id TEXT NOT NULL,
                category_id TEXT,
                direction TEXT NOT NULL,
                amount REAL NOT NULL,
                date TEXT NOT NULL,
                note TEXT
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recurring_rules (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                card_id TEXT NOT NULL,
                category_id TEXT,
                name TEXT NOT NULL,
                direction TEXT NOT NULL,
                amount REAL NOT NULL,
                frequency TEXT NOT NULL,
                frequency_type TEXT NOT NULL,
                repeat_interval INTEGER NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recurring_instances (
                id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL,
                scheduled_date TEXT NOT NULL,
                scheduled_amount REAL NOT NULL,
                status TEXT NOT NULL,
                transaction_id TEXT,
                actual_date TEXT,
                actual_amount REAL,
                notes TEXT,
                skip_reason TEXT,
                completed_at TEXT
            );
            "#,
        )
        .execute(pool)
        .await?;

        // Dates are stored as ISO text, so this index also yields
        // chronological ordering per rule.
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_instances_rule_date
            ON recurring_instances(rule_id, scheduled_date);
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_instances_status
            ON recurring_instances(status, scheduled_date);
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rule_history (
                id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL,
                instance_id TEXT,
                action TEXT NOT NULL,
                changed_fields TEXT NOT NULL,
                old_values TEXT,
                new_values TEXT,
                reason TEXT,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Get the underlying sqlite pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
