use async_trait::async_trait;
use shared::Category;
use sqlx::Row;

use crate::error::EngineResult;
use crate::storage::traits::CategoryStore;
use crate::storage::DbConnection;

/// Sqlite-backed category ownership checks.
#[derive(Clone)]
pub struct SqliteCategoryStore {
    db: DbConnection,
}

impl SqliteCategoryStore {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    /// Insert a category row. Used for bootstrapping and test setup.
    pub async fn store_category(&self, category: &Category) -> EngineResult<()> {
        sqlx::query("INSERT INTO categories (id, user_id, name) VALUES (?, ?, ?)")
            .bind(&category.id)
            .bind(&category.user_id)
            .bind(&category.name)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CategoryStore for SqliteCategoryStore {
    async fn owns_category(&self, user_id: &str, category_id: &str) -> EngineResult<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM categories WHERE id = ? AND user_id = ?")
            .bind(category_id)
            .bind(user_id)
            .fetch_one(self.db.pool())
            .await?;
        let count: i64 = row.get("n");
        Ok(count > 0)
    }
}
