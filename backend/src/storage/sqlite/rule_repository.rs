use chrono::NaiveDate;
use shared::{HistoryRecord, RecurrenceRule, RemoveRuleRequest, RuleListRequest};
use sqlx::{sqlite::SqliteRow, Row};
use tracing::info;

use crate::error::EngineResult;
use crate::storage::sqlite::history_repository::insert_history;
use crate::storage::sqlite::{parse_date, parse_direction, parse_rule_status};
use crate::storage::DbConnection;

/// Repository for recurrence rule rows.
#[derive(Clone)]
pub struct RuleRepository {
    db: DbConnection,
}

impl RuleRepository {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    /// Store a new rule together with its creation history record.
    pub async fn store_rule(
        &self,
        rule: &RecurrenceRule,
        history: &HistoryRecord,
    ) -> EngineResult<()> {
        let frequency_json = serde_json::to_string(&rule.frequency)?;
        let mut tx = self.db.pool().begin().await?;
        sqlx::query(
            r#"
            INSERT INTO recurring_rules
                (id, user_id, card_id, category_id, name, direction, amount,
                 frequency, frequency_type, repeat_interval, start_date,
                 end_date, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.user_id)
        .bind(&rule.card_id)
        .bind(&rule.category_id)
        .bind(&rule.name)
        .bind(rule.direction.as_str())
        .bind(rule.amount)
        .bind(&frequency_json)
        .bind(rule.frequency.type_name())
        .bind(rule.interval as i64)
        .bind(rule.start_date.to_string())
        .bind(rule.end_date.map(|d| d.to_string()))
        .bind(rule.status.as_str())
        .bind(&rule.created_at)
        .bind(&rule.updated_at)
        .execute(&mut *tx)
        .await?;
        insert_history(&mut tx, history).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Get a rule by id, scoped to its owning user.
    pub async fn get_rule(
        &self,
        user_id: &str,
        rule_id: &str,
    ) -> EngineResult<Option<RecurrenceRule>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM recurring_rules WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(rule_id)
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await?;

        row.as_ref().map(rule_from_row).transpose()
    }

    /// Get a rule by id without an ownership filter. Used internally when
    /// ownership was already established through the instance join.
    pub async fn get_rule_by_id(&self, rule_id: &str) -> EngineResult<Option<RecurrenceRule>> {
        let row = sqlx::query("SELECT * FROM recurring_rules WHERE id = ?")
            .bind(rule_id)
            .fetch_optional(self.db.pool())
            .await?;

        row.as_ref().map(rule_from_row).transpose()
    }

    /// List a user's rules, newest first, with optional filters.
    pub async fn list_rules(&self, request: &RuleListRequest) -> EngineResult<Vec<RecurrenceRule>> {
        let mut sql = String::from("SELECT * FROM recurring_rules WHERE user_id = ?");
        let mut binds: Vec<String> = vec![request.user_id.clone()];

        if let Some(status) = request.status {
            sql.push_str(" AND status = ?");
            binds.push(status.as_str().to_string());
        }
        if let Some(is_active) = request.is_active {
            if is_active {
                sql.push_str(" AND status = 'active'");
            } else {
                sql.push_str(" AND status <> 'active'");
            }
        }
        if let Some(card_id) = &request.card_id {
            sql.push_str(" AND card_id = ?");
            binds.push(card_id.clone());
        }
        if let Some(frequency) = &request.frequency {
            sql.push_str(" AND frequency_type = ?");
            binds.push(frequency.clone());
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(self.db.pool()).await?;

        rows.iter().map(rule_from_row).collect()
    }

    /// Persist an updated definition. When `delete_pending` is set, pending
    /// instances generated under the old definition are removed in the same
    /// transaction. Returns the number of deleted instances.
    pub async fn apply_update(
        &self,
        rule: &RecurrenceRule,
        delete_pending: bool,
        history: &HistoryRecord,
    ) -> EngineResult<usize> {
        let frequency_json = serde_json::to_string(&rule.frequency)?;
        let mut tx = self.db.pool().begin().await?;

        sqlx::query(
            r#"
            UPDATE recurring_rules
            SET card_id = ?, category_id = ?, name = ?, direction = ?,
                amount = ?, frequency = ?, frequency_type = ?,
                repeat_interval = ?, start_date = ?, end_date = ?,
                status = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&rule.card_id)
        .bind(&rule.category_id)
        .bind(&rule.name)
        .bind(rule.direction.as_str())
        .bind(rule.amount)
        .bind(&frequency_json)
        .bind(rule.frequency.type_name())
        .bind(rule.interval as i64)
        .bind(rule.start_date.to_string())
        .bind(rule.end_date.map(|d| d.to_string()))
        .bind(rule.status.as_str())
        .bind(&rule.updated_at)
        .bind(&rule.id)
        .execute(&mut *tx)
        .await?;

        let mut deleted = 0;
        if delete_pending {
            let result = sqlx::query(
                "DELETE FROM recurring_instances WHERE rule_id = ? AND status = 'pending'",
            )
            .bind(&rule.id)
            .execute(&mut *tx)
            .await?;
            deleted = result.rows_affected() as usize;
        }

        insert_history(&mut tx, history).await?;
        tx.commit().await?;

        info!(
            "Updated rule {} (deleted {} pending instances)",
            rule.id, deleted
        );
        Ok(deleted)
    }

    /// Cancel a rule, applying the removal options to its instances. The
    /// rule becomes `cancelled`, instances matching the delete filters are
    /// removed, and every remaining non-terminal instance is transitioned
    /// to `cancelled`. Returns (cancelled, deleted) instance counts.
    pub async fn cancel_rule(
        &self,
        rule_id: &str,
        options: &RemoveRuleRequest,
        today: NaiveDate,
        now: &str,
        history: &HistoryRecord,
    ) -> EngineResult<(usize, usize)> {
        let mut tx = self.db.pool().begin().await?;

        sqlx::query("UPDATE recurring_rules SET status = 'cancelled', updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(rule_id)
            .execute(&mut *tx)
            .await?;

        let mut deleted = 0;
        if options.delete_instances {
            let mut sql = String::from("DELETE FROM recurring_instances WHERE rule_id = ?");
            if options.future_only {
                sql.push_str(" AND scheduled_date > ?");
            }
            if options.keep_completed {
                sql.push_str(" AND status NOT IN ('completed', 'modified')");
            }
            let mut query = sqlx::query(&sql).bind(rule_id);
            if options.future_only {
                query = query.bind(today.to_string());
            }
            let result = query.execute(&mut *tx).await?;
            deleted = result.rows_affected() as usize;
        }

        let result = sqlx::query(
            r#"
            UPDATE recurring_instances
            SET status = 'cancelled'
            WHERE rule_id = ? AND status IN ('pending', 'overdue')
            "#,
        )
        .bind(rule_id)
        .execute(&mut *tx)
        .await?;
        let cancelled = result.rows_affected() as usize;

        insert_history(&mut tx, history).await?;
        tx.commit().await?;

        info!(
            "Cancelled rule {}: {} instances cancelled, {} deleted",
            rule_id, cancelled, deleted
        );
        Ok((cancelled, deleted))
    }

    /// Hard-delete a rule and all of its instances. History rows are kept;
    /// they have independent lifetime.
    pub async fn delete_rule(&self, rule_id: &str, history: &HistoryRecord) -> EngineResult<()> {
        let mut tx = self.db.pool().begin().await?;
        insert_history(&mut tx, history).await?;
        sqlx::query("DELETE FROM recurring_instances WHERE rule_id = ?")
            .bind(rule_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM recurring_rules WHERE id = ?")
            .bind(rule_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!("Hard-deleted rule {}", rule_id);
        Ok(())
    }
}

pub(crate) fn rule_from_row(row: &SqliteRow) -> EngineResult<RecurrenceRule> {
    let frequency_json: String = row.get("frequency");
    let end_date: Option<String> = row.get("end_date");
    Ok(RecurrenceRule {
        id: row.get("id"),
        user_id: row.get("user_id"),
        card_id: row.get("card_id"),
        category_id: row.get("category_id"),
        name: row.get("name"),
        direction: parse_direction(&row.get::<String, _>("direction"))?,
        amount: row.get("amount"),
        frequency: serde_json::from_str(&frequency_json)?,
        interval: row.get::<i64, _>("repeat_interval") as u32,
        start_date: parse_date(&row.get::<String, _>("start_date"), "start_date")?,
        end_date: end_date
            .map(|value| parse_date(&value, "end_date"))
            .transpose()?,
        status: parse_rule_status(&row.get::<String, _>("status"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
