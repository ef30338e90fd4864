use async_trait::async_trait;
use shared::Card;
use sqlx::Row;

use crate::error::EngineResult;
use crate::storage::traits::CardStore;
use crate::storage::DbConnection;

/// Sqlite-backed card lookups. Card management proper lives elsewhere; the
/// engine only reads cards and seeds them in tests.
#[derive(Clone)]
pub struct SqliteCardStore {
    db: DbConnection,
}

impl SqliteCardStore {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    /// Insert a card row. Used for bootstrapping and test setup.
    pub async fn store_card(&self, card: &Card) -> EngineResult<()> {
        sqlx::query("INSERT INTO cards (id, user_id, name, balance) VALUES (?, ?, ?, ?)")
            .bind(&card.id)
            .bind(&card.user_id)
            .bind(&card.name)
            .bind(card.balance)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CardStore for SqliteCardStore {
    async fn get_owned_card(&self, user_id: &str, card_id: &str) -> EngineResult<Option<Card>> {
        let row = sqlx::query(
            "SELECT id, user_id, name, balance FROM cards WHERE id = ? AND user_id = ?",
        )
        .bind(card_id)
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(|row| Card {
            id: row.get("id"),
            user_id: row.get("user_id"),
            name: row.get("name"),
            balance: row.get("balance"),
        }))
    }
}
