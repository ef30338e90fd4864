use shared::HistoryRecord;
use sqlx::{Row, Sqlite, Transaction};
use tracing::info;

use crate::error::EngineResult;
use crate::storage::DbConnection;

/// Repository for the append-only audit log. Rows are only ever inserted;
/// there is deliberately no update or delete here.
#[derive(Clone)]
pub struct HistoryRepository {
    db: DbConnection,
}

impl HistoryRepository {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    /// Append a single history record outside of any larger transaction.
    pub async fn append(&self, record: &HistoryRecord) -> EngineResult<()> {
        let mut tx = self.db.pool().begin().await?;
        insert_history(&mut tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    /// List history for a rule, oldest first. History outlives rule
    /// cancellation and hard deletion.
    pub async fn list_for_rule(&self, rule_id: &str) -> EngineResult<Vec<HistoryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, rule_id, instance_id, action, changed_fields,
                   old_values, new_values, reason, created_at
            FROM rule_history
            WHERE rule_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(rule_id)
        .fetch_all(self.db.pool())
        .await?;

        let records = rows
            .iter()
            .map(|row| HistoryRecord {
                id: row.get("id"),
                rule_id: row.get("rule_id"),
                instance_id: row.get("instance_id"),
                action: row.get("action"),
                changed_fields: row.get("changed_fields"),
                old_values: row.get("old_values"),
                new_values: row.get("new_values"),
                reason: row.get("reason"),
                created_at: row.get("created_at"),
            })
            .collect();

        Ok(records)
    }
}

/// Insert a history row inside a caller-owned transaction, so the audit
/// entry commits or rolls back together with the mutation it describes.
pub(crate) async fn insert_history(
    tx: &mut Transaction<'_, Sqlite>,
    record: &HistoryRecord,
) -> EngineResult<()> {
    info!(
        "Recording history: rule={} action={}",
        record.rule_id, record.action
    );
    sqlx::query(
        r#"
        INSERT INTO rule_history
            (id, rule_id, instance_id, action, changed_fields,
             old_values, new_values, reason, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.rule_id)
    .bind(&record.instance_id)
    .bind(&record.action)
    .bind(&record.changed_fields)
    .bind(&record.old_values)
    .bind(&record.new_values)
    .bind(&record.reason)
    .bind(&record.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
