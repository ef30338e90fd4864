use chrono::NaiveDate;
use shared::{Direction, HistoryRecord, InstanceListRequest, InstanceStatus, RecurrenceInstance};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::info;

use crate::error::EngineResult;
use crate::storage::sqlite::history_repository::insert_history;
use crate::storage::sqlite::{parse_date, parse_direction, parse_instance_status};
use crate::storage::DbConnection;

/// A scheduled instance joined with the rule columns the read paths need.
#[derive(Debug, Clone)]
pub struct InstanceRow {
    pub instance: RecurrenceInstance,
    pub rule_name: String,
    pub card_id: String,
    pub direction: Direction,
}

#[derive(Clone)]
pub struct InstanceRepository {
    db: DbConnection,
}

impl InstanceRepository {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    /// Insert a batch of freshly generated instances in one transaction.
    /// All-or-nothing: a failure part-way leaves no partial batch behind.
    pub async fn store_batch(&self, instances: &[RecurrenceInstance]) -> EngineResult<usize> {
        if instances.is_empty() {
            return Ok(0);
        }

        let mut tx = self.db.pool().begin().await?;
        for instance in instances {
            sqlx::query(
                r#"
                INSERT INTO recurring_instances
                    (id, rule_id, scheduled_date, scheduled_amount, status,
                     transaction_id, actual_date, actual_amount, notes,
                     skip_reason, completed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&instance.id)
            .bind(&instance.rule_id)
            .bind(instance.scheduled_date.to_string())
            .bind(instance.scheduled_amount)
            .bind(instance.status.as_str())
            .bind(&instance.transaction_id)
            .bind(instance.actual_date.map(|d| d.to_string()))
            .bind(instance.actual_amount)
            .bind(&instance.notes)
            .bind(&instance.skip_reason)
            .bind(&instance.completed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        info!("Stored {} generated instances", instances.len());
        Ok(instances.len())
    }

    /// Latest scheduled date across ALL of a rule's instances, regardless of
    /// status. Generation resumes strictly after this date so cancelled or
    /// skipped instances are never re-created.
    pub async fn max_scheduled_date(&self, rule_id: &str) -> EngineResult<Option<NaiveDate>> {
        let row = sqlx::query(
            "SELECT MAX(scheduled_date) AS max_date FROM recurring_instances WHERE rule_id = ?",
        )
        .bind(rule_id)
        .fetch_one(self.db.pool())
        .await?;

        let max_date: Option<String> = row.get("max_date");
        match max_date {
            Some(value) => Ok(Some(parse_date(&value, "scheduled_date")?)),
            None => Ok(None),
        }
    }

    /// Fetch an instance, folding ownership into the lookup via the rule
    /// join. An instance under another user's rule reads as absent.
    pub async fn get_instance(
        &self,
        user_id: &str,
        instance_id: &str,
    ) -> EngineResult<Option<InstanceRow>> {
        let row = sqlx::query(
            r#"
            SELECT i.id, i.rule_id, i.scheduled_date, i.scheduled_amount,
                   i.status, i.transaction_id, i.actual_date, i.actual_amount,
                   i.notes, i.skip_reason, i.completed_at,
                   r.name AS rule_name, r.card_id, r.direction
            FROM recurring_instances i
            JOIN recurring_rules r ON i.rule_id = r.id
            WHERE i.id = ? AND r.user_id = ?
            "#,
        )
        .bind(instance_id)
        .bind(user_id)
        .fetch_optional(self.db.pool())
        .await?;

        match row {
            Some(row) => Ok(Some(instance_row_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// List a user's instances with optional filters, ordered by scheduled
    /// date ascending so projection folds read naturally.
    pub async fn list_instances(
        &self,
        user_id: &str,
        request: &InstanceListRequest,
        window_end: Option<NaiveDate>,
    ) -> EngineResult<Vec<InstanceRow>> {
        let mut sql = String::from(
            r#"
            SELECT i.id, i.rule_id, i.scheduled_date, i.scheduled_amount,
                   i.status, i.transaction_id, i.actual_date, i.actual_amount,
                   i.notes, i.skip_reason, i.completed_at,
                   r.name AS rule_name, r.card_id, r.direction
            FROM recurring_instances i
            JOIN recurring_rules r ON i.rule_id = r.id
            WHERE r.user_id = ?
            "#,
        );
        let mut binds: Vec<String> = vec![user_id.to_string()];

        if let Some(status) = &request.status {
            sql.push_str(" AND i.status = ?");
            binds.push(status.as_str().to_string());
        }
        if let Some(card_id) = &request.card_id {
            sql.push_str(" AND r.card_id = ?");
            binds.push(card_id.clone());
        }
        if let Some(rule_id) = &request.rule_id {
            sql.push_str(" AND i.rule_id = ?");
            binds.push(rule_id.clone());
        }
        if let Some(from) = request.from_date {
            sql.push_str(" AND i.scheduled_date >= ?");
            binds.push(from.to_string());
        }
        if let Some(to) = request.to_date.or(window_end) {
            sql.push_str(" AND i.scheduled_date <= ?");
            binds.push(to.to_string());
        }
        sql.push_str(" ORDER BY i.scheduled_date ASC, i.id ASC");

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(self.db.pool()).await?;

        rows.iter().map(instance_row_from_row).collect()
    }

    /// The next few actionable instances for a rule, used by the rule
    /// detail view.
    pub async fn upcoming_for_rule(
        &self,
        rule_id: &str,
        from: NaiveDate,
        limit: i64,
    ) -> EngineResult<Vec<RecurrenceInstance>> {
        let rows = sqlx::query(
            r#"
            SELECT id, rule_id, scheduled_date, scheduled_amount, status,
                   transaction_id, actual_date, actual_amount, notes,
                   skip_reason, completed_at
            FROM recurring_instances
            WHERE rule_id = ?
              AND status IN ('pending', 'overdue')
              AND scheduled_date >= ?
            ORDER BY scheduled_date ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(rule_id)
        .bind(from.to_string())
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(instance_from_row).collect()
    }

    /// Bulk-flip a user's past-due pending instances to overdue. Runs before
    /// instance reads so staleness never survives a fetch.
    pub async fn mark_overdue(&self, user_id: &str, today: NaiveDate) -> EngineResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE recurring_instances
            SET status = 'overdue'
            WHERE status = 'pending'
              AND scheduled_date < ?
              AND rule_id IN (SELECT id FROM recurring_rules WHERE user_id = ?)
            "#,
        )
        .bind(today.to_string())
        .bind(user_id)
        .execute(self.db.pool())
        .await?;

        let swept = result.rows_affected();
        if swept > 0 {
            info!("Marked {} instances overdue for user {}", swept, user_id);
        }
        Ok(swept)
    }

    /// Persist a lifecycle transition together with its audit record in one
    /// transaction.
    pub async fn apply_transition(
        &self,
        instance: &RecurrenceInstance,
        history: &HistoryRecord,
    ) -> EngineResult<()> {
        let mut tx = self.db.pool().begin().await?;
        update_instance(&mut tx, instance).await?;
        insert_history(&mut tx, history).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Rewrite an instance's lifecycle columns inside a caller-owned
/// transaction. Schedule columns (rule, date, amount) are immutable once
/// the instance exists.
pub(crate) async fn update_instance(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    instance: &RecurrenceInstance,
) -> EngineResult<()> {
    sqlx::query(
        r#"
        UPDATE recurring_instances
        SET status = ?, transaction_id = ?, actual_date = ?, actual_amount = ?,
            notes = ?, skip_reason = ?, completed_at = ?
        WHERE id = ?
        "#,
    )
    .bind(instance.status.as_str())
    .bind(&instance.transaction_id)
    .bind(instance.actual_date.map(|d| d.to_string()))
    .bind(instance.actual_amount)
    .bind(&instance.notes)
    .bind(&instance.skip_reason)
    .bind(&instance.completed_at)
    .bind(&instance.id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub(crate) fn instance_from_row(row: &SqliteRow) -> EngineResult<RecurrenceInstance> {
    let status: String = row.get("status");
    let scheduled_date: String = row.get("scheduled_date");
    let actual_date: Option<String> = row.get("actual_date");

    Ok(RecurrenceInstance {
        id: row.get("id"),
        rule_id: row.get("rule_id"),
        scheduled_date: parse_date(&scheduled_date, "scheduled_date")?,
        scheduled_amount: row.get("scheduled_amount"),
        status: parse_instance_status(&status)?,
        transaction_id: row.get("transaction_id"),
        actual_date: actual_date
            .map(|d| parse_date(&d, "actual_date"))
            .transpose()?,
        actual_amount: row.get("actual_amount"),
        notes: row.get("notes"),
        skip_reason: row.get("skip_reason"),
        completed_at: row.get("completed_at"),
    })
}

fn instance_row_from_row(row: &SqliteRow) -> EngineResult<InstanceRow> {
    let direction: String = row.get("direction");
    Ok(InstanceRow {
        instance: instance_from_row(row)?,
        rule_name: row.get("rule_name"),
        card_id: row.get("card_id"),
        direction: parse_direction(&direction)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Frequency, RecurrenceRule, RuleStatus};

    use crate::storage::sqlite::RuleRepository;

    async fn setup_test() -> (InstanceRepository, RuleRepository) {
        let db = DbConnection::init_test()
            .await
            .expect("Failed to create test database");
        (
            InstanceRepository::new(db.clone()),
            RuleRepository::new(db),
        )
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().expect("bad date literal")
    }

    fn test_rule(user_id: &str, card_id: &str) -> RecurrenceRule {
        RecurrenceRule {
            id: RecurrenceRule::generate_id(),
            user_id: user_id.to_string(),
            card_id: card_id.to_string(),
            category_id: Some("category::groceries".to_string()),
            name: "Weekly shop".to_string(),
            direction: Direction::Out,
            amount: 45.0,
            frequency: Frequency::Daily,
            interval: 1,
            start_date: date("2024-01-01"),
            end_date: None,
            status: RuleStatus::Active,
            created_at: "2024-01-01T00:00:00Z".to_string(),
            updated_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn history(rule_id: &str, action: &str) -> HistoryRecord {
        HistoryRecord {
            id: HistoryRecord::generate_id(),
            rule_id: rule_id.to_string(),
            instance_id: None,
            action: action.to_string(),
            changed_fields: "status".to_string(),
            old_values: None,
            new_values: None,
            reason: None,
            created_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn test_instance(rule_id: &str, scheduled: &str, amount: f64) -> RecurrenceInstance {
        RecurrenceInstance {
            id: RecurrenceInstance::generate_id(),
            rule_id: rule_id.to_string(),
            scheduled_date: date(scheduled),
            scheduled_amount: amount,
            status: InstanceStatus::Pending,
            transaction_id: None,
            actual_date: None,
            actual_amount: None,
            notes: None,
            skip_reason: None,
            completed_at: None,
        }
    }

    async fn seed_rule(rules: &RuleRepository, rule: &RecurrenceRule) {
        rules
            .store_rule(rule, &history(&rule.id, "created"))
            .await
            .expect("store rule failed");
    }

    #[tokio::test]
    async fn test_store_batch_and_max_date() {
        let (instances, rules) = setup_test().await;
        let rule = test_rule("user::alice", "card::main");
        seed_rule(&rules, &rule).await;

        let batch = vec![
            test_instance(&rule.id, "2024-01-01", 45.0),
            test_instance(&rule.id, "2024-01-08", 45.0),
            test_instance(&rule.id, "2024-01-15", 45.0),
        ];
        let stored = instances.store_batch(&batch).await.expect("store failed");
        assert_eq!(stored, 3);

        let max = instances
            .max_scheduled_date(&rule.id)
            .await
            .expect("max failed");
        assert_eq!(max, Some(date("2024-01-15")));
    }

    #[tokio::test]
    async fn test_max_date_empty_rule() {
        let (instances, rules) = setup_test().await;
        let rule = test_rule("user::alice", "card::main");
        seed_rule(&rules, &rule).await;

        let max = instances
            .max_scheduled_date(&rule.id)
            .await
            .expect("max failed");
        assert_eq!(max, None);
    }

    #[tokio::test]
    async fn test_store_batch_empty_is_noop() {
        let (instances, _rules) = setup_test().await;
        let stored = instances.store_batch(&[]).await.expect("store failed");
        assert_eq!(stored, 0);
    }

    #[tokio::test]
    async fn test_get_instance_enforces_ownership() {
        let (instances, rules) = setup_test().await;
        let rule = test_rule("user::alice", "card::main");
        seed_rule(&rules, &rule).await;

        let instance = test_instance(&rule.id, "2024-02-01", 45.0);
        instances
            .store_batch(std::slice::from_ref(&instance))
            .await
            .expect("store failed");

        let found = instances
            .get_instance("user::alice", &instance.id)
            .await
            .expect("get failed");
        let found = found.expect("instance should be visible to owner");
        assert_eq!(found.instance.id, instance.id);
        assert_eq!(found.rule_name, "Weekly shop");
        assert_eq!(found.card_id, "card::main");
        assert_eq!(found.direction, Direction::Out);

        let hidden = instances
            .get_instance("user::mallory", &instance.id)
            .await
            .expect("get failed");
        assert!(hidden.is_none());
    }

    #[tokio::test]
    async fn test_list_instances_filters_and_order() {
        let (instances, rules) = setup_test().await;
        let rule_a = test_rule("user::alice", "card::main");
        let mut rule_b = test_rule("user::alice", "card::savings");
        rule_b.name = "Savings top-up".to_string();
        seed_rule(&rules, &rule_a).await;
        seed_rule(&rules, &rule_b).await;

        instances
            .store_batch(&[
                test_instance(&rule_a.id, "2024-03-10", 45.0),
                test_instance(&rule_a.id, "2024-03-03", 45.0),
                test_instance(&rule_b.id, "2024-03-05", 100.0),
            ])
            .await
            .expect("store failed");

        let all = instances
            .list_instances("user::alice", &InstanceListRequest::default(), None)
            .await
            .expect("list failed");
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].instance.scheduled_date, date("2024-03-03"));
        assert_eq!(all[1].instance.scheduled_date, date("2024-03-05"));
        assert_eq!(all[2].instance.scheduled_date, date("2024-03-10"));

        let by_card = instances
            .list_instances(
                "user::alice",
                &InstanceListRequest {
                    card_id: Some("card::savings".to_string()),
                    ..Default::default()
                },
                None,
            )
            .await
            .expect("list failed");
        assert_eq!(by_card.len(), 1);
        assert_eq!(by_card[0].rule_name, "Savings top-up");

        let windowed = instances
            .list_instances(
                "user::alice",
                &InstanceListRequest {
                    from_date: Some(date("2024-03-04")),
                    to_date: Some(date("2024-03-09")),
                    ..Default::default()
                },
                None,
            )
            .await
            .expect("list failed");
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].instance.scheduled_date, date("2024-03-05"));
    }

    #[tokio::test]
    async fn test_mark_overdue_sweeps_only_past_pending() {
        let (instances, rules) = setup_test().await;
        let rule = test_rule("user::alice", "card::main");
        seed_rule(&rules, &rule).await;

        let past = test_instance(&rule.id, "2024-04-01", 45.0);
        let today = test_instance(&rule.id, "2024-04-10", 45.0);
        let future = test_instance(&rule.id, "2024-04-20", 45.0);
        let mut skipped = test_instance(&rule.id, "2024-03-01", 45.0);
        skipped.status = InstanceStatus::Skipped;
        instances
            .store_batch(&[past.clone(), today.clone(), future, skipped.clone()])
            .await
            .expect("store failed");

        let swept = instances
            .mark_overdue("user::alice", date("2024-04-10"))
            .await
            .expect("sweep failed");
        assert_eq!(swept, 1);

        let row = instances
            .get_instance("user::alice", &past.id)
            .await
            .expect("get failed")
            .expect("missing instance");
        assert_eq!(row.instance.status, InstanceStatus::Overdue);

        // Due today stays pending; terminal statuses are untouched.
        let row = instances
            .get_instance("user::alice", &today.id)
            .await
            .expect("get failed")
            .expect("missing instance");
        assert_eq!(row.instance.status, InstanceStatus::Pending);

        let row = instances
            .get_instance("user::alice", &skipped.id)
            .await
            .expect("get failed")
            .expect("missing instance");
        assert_eq!(row.instance.status, InstanceStatus::Skipped);
    }

    #[tokio::test]
    async fn test_mark_overdue_scoped_to_user() {
        let (instances, rules) = setup_test().await;
        let rule = test_rule("user::alice", "card::main");
        seed_rule(&rules, &rule).await;
        instances
            .store_batch(&[test_instance(&rule.id, "2024-04-01", 45.0)])
            .await
            .expect("store failed");

        let swept = instances
            .mark_overdue("user::bob", date("2024-05-01"))
            .await
            .expect("sweep failed");
        assert_eq!(swept, 0);
    }

    #[tokio::test]
    async fn test_apply_transition_persists_lifecycle_columns() {
        let (instances, rules) = setup_test().await;
        let rule = test_rule("user::alice", "card::main");
        seed_rule(&rules, &rule).await;

        let mut instance = test_instance(&rule.id, "2024-05-01", 45.0);
        instances
            .store_batch(std::slice::from_ref(&instance))
            .await
            .expect("store failed");

        instance.status = InstanceStatus::Skipped;
        instance.skip_reason = Some("on holiday".to_string());
        instances
            .apply_transition(&instance, &history(&rule.id, "instance_skipped"))
            .await
            .expect("transition failed");

        let row = instances
            .get_instance("user::alice", &instance.id)
            .await
            .expect("get failed")
            .expect("missing instance");
        assert_eq!(row.instance.status, InstanceStatus::Skipped);
        assert_eq!(row.instance.skip_reason.as_deref(), Some("on holiday"));
    }

    #[tokio::test]
    async fn test_upcoming_for_rule_limits_and_filters() {
        let (instances, rules) = setup_test().await;
        let rule = test_rule("user::alice", "card::main");
        seed_rule(&rules, &rule).await;

        let mut done = test_instance(&rule.id, "2024-06-03", 45.0);
        done.status = InstanceStatus::Completed;
        instances
            .store_batch(&[
                test_instance(&rule.id, "2024-06-01", 45.0),
                test_instance(&rule.id, "2024-06-02", 45.0),
                done,
                test_instance(&rule.id, "2024-06-04", 45.0),
            ])
            .await
            .expect("store failed");

        let upcoming = instances
            .upcoming_for_rule(&rule.id, date("2024-06-02"), 2)
            .await
            .expect("upcoming failed");
        assert_eq!(upcoming.len(), 2);
        assert_eq!(upcoming[0].scheduled_date, date("2024-06-02"));
        assert_eq!(upcoming[1].scheduled_date, date("2024-06-04"));
    }
}
