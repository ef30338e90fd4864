use async_trait::async_trait;
use shared::LedgerTransaction;
use sqlx::Row;
use tracing::info;

use crate::error::EngineResult;
use crate::storage::traits::LedgerStore;
use crate::storage::DbConnection;

/// Sqlite-backed ledger writer. Owns the invariant that a card's stored
/// balance always equals the signed sum of its ledger transactions.
#[derive(Clone)]
pub struct SqliteLedgerStore {
    db: DbConnection,
}

impl SqliteLedgerStore {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn insert_and_rebalance(&self, transaction: &LedgerTransaction) -> EngineResult<f64> {
        let mut tx = self.db.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO transactions
                (id, user_id, card_id, category_id, direction, amount, date, note)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&transaction.id)
        .bind(&transaction.user_id)
        .bind(&transaction.card_id)
        .bind(&transaction.category_id)
        .bind(transaction.direction.as_str())
        .bind(transaction.amount)
        .bind(transaction.date.to_string())
        .bind(&transaction.note)
        .execute(&mut *tx)
        .await?;

        // Full recompute rather than an increment, so a drifted stored
        // balance self-heals on the next write.
        let row = sqlx::query(
            r#"
            SELECT COALESCE(
                SUM(CASE WHEN direction = 'in' THEN amount ELSE -amount END), 0
            ) AS balance
            FROM transactions
            WHERE card_id = ?
            "#,
        )
        .bind(&transaction.card_id)
        .fetch_one(&mut *tx)
        .await?;
        let balance: f64 = row.get("balance");

        sqlx::query("UPDATE cards SET balance = ? WHERE id = ?")
            .bind(balance)
            .bind(&transaction.card_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(
            "Recorded transaction {} on card {}, balance now {:.2}",
            transaction.id, transaction.card_id, balance
        );
        Ok(balance)
    }
}
