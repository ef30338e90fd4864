use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use shared::{
    CompleteInstanceRequest, CompleteInstanceResponse, CreateTransactionFromInstanceRequest,
    CreateTransactionFromInstanceResponse, GetInstanceResponse, HistoryRecord, InstanceListRequest,
    InstanceListResponse, InstanceStatus, InstanceWithBalance, LedgerTransaction,
    RecurrenceInstance, SkipInstanceRequest, SkipInstanceResponse,
};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::storage::sqlite::{InstanceRepository, InstanceRow, RuleRepository};
use crate::storage::{CardStore, DbConnection, LedgerStore};

/// Service owning the instance lifecycle: listing with projected balances,
/// completion (with or without a ledger write), and skipping.
#[derive(Clone)]
pub struct InstanceService {
    instances: InstanceRepository,
    rules: RuleRepository,
    cards: Arc<dyn CardStore>,
    ledger: Arc<dyn LedgerStore>,
}

impl InstanceService {
    pub fn new(db: DbConnection, cards: Arc<dyn CardStore>, ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            instances: InstanceRepository::new(db.clone()),
            rules: RuleRepository::new(db),
            cards,
            ledger,
        }
    }

    /// List a user's instances with a running balance projection per card.
    /// Past-due pending instances are swept to overdue first, so callers
    /// always see fresh statuses.
    pub async fn list_instances(
        &self,
        request: InstanceListRequest,
    ) -> EngineResult<InstanceListResponse> {
        let today = Utc::now().date_naive();
        self.instances.mark_overdue(&request.user_id, today).await?;

        let window_end = match (request.to_date, request.days_ahead) {
            (None, Some(days)) => Some(today + Duration::days(days)),
            _ => None,
        };
        let rows = self
            .instances
            .list_instances(&request.user_id, &request, window_end)
            .await?;

        let mut balances: HashMap<String, f64> = HashMap::new();
        for row in &rows {
            if !balances.contains_key(&row.card_id) {
                let card = self
                    .cards
                    .get_owned_card(&request.user_id, &row.card_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::Persistence(format!(
                            "rule references missing card: {}",
                            row.card_id
                        ))
                    })?;
                balances.insert(row.card_id.clone(), card.balance);
            }
        }

        // Only actionable instances move the projection forward; terminal
        // ones are already reflected in the card's stored balance.
        let mut instances = Vec::with_capacity(rows.len());
        for row in rows {
            let running = balances
                .get_mut(&row.card_id)
                .ok_or_else(|| EngineError::Persistence("balance map out of sync".to_string()))?;
            let projected_old_balance = *running;
            if row.instance.status.is_actionable() {
                *running += row.direction.signed(row.instance.scheduled_amount);
            }
            let projected_new_balance = *running;
            instances.push(InstanceWithBalance {
                instance: row.instance,
                rule_name: row.rule_name,
                card_id: row.card_id,
                direction: row.direction,
                projected_old_balance,
                projected_new_balance,
            });
        }

        Ok(InstanceListResponse { instances })
    }

    pub async fn get_instance(
        &self,
        user_id: &str,
        instance_id: &str,
    ) -> EngineResult<GetInstanceResponse> {
        let today = Utc::now().date_naive();
        self.instances.mark_overdue(user_id, today).await?;

        let row = self.require_instance(user_id, instance_id).await?;
        Ok(GetInstanceResponse {
            instance: row.instance,
        })
    }

    /// Complete an instance without touching the ledger. Status lands on
    /// `modified` when the resolved date or amount deviates from the
    /// schedule, `completed` otherwise.
    pub async fn complete_instance(
        &self,
        instance_id: &str,
        request: CompleteInstanceRequest,
    ) -> EngineResult<CompleteInstanceResponse> {
        info!("Completing instance {} for {}", instance_id, request.user_id);

        let row = self.require_instance(&request.user_id, instance_id).await?;
        require_actionable(&row.instance, "completed")?;

        let today = Utc::now().date_naive();
        let actual_date = request.actual_date.unwrap_or(today);
        let actual_amount = request.actual_amount.unwrap_or(row.instance.scheduled_amount);

        let instance = self
            .finalize_completion(&row, actual_date, actual_amount, request.notes, None)
            .await?;

        Ok(CompleteInstanceResponse {
            success_message: format!("Marked instance {}", instance.status.as_str()),
            instance,
        })
    }

    /// Complete an instance by writing a real ledger transaction first.
    ///
    /// Two separate transactions: the ledger write commits on its own, then
    /// instance finalization runs in a second one. A failure in the second
    /// phase leaves the committed ledger entry in place and the instance
    /// still actionable, so the caller can retry with `complete_instance`.
    pub async fn create_transaction_from_instance(
        &self,
        instance_id: &str,
        request: CreateTransactionFromInstanceRequest,
    ) -> EngineResult<CreateTransactionFromInstanceResponse> {
        info!(
            "Creating transaction from instance {} for {}",
            instance_id, request.user_id
        );

        let row = self.require_instance(&request.user_id, instance_id).await?;
        require_actionable(&row.instance, "completed")?;

        let rule = self
            .rules
            .get_rule_by_id(&row.instance.rule_id)
            .await?
            .ok_or_else(|| {
                EngineError::Persistence(format!(
                    "instance references missing rule: {}",
                    row.instance.rule_id
                ))
            })?;
        if self
            .cards
            .get_owned_card(&request.user_id, &row.card_id)
            .await?
            .is_none()
        {
            return Err(EngineError::NotFound(format!(
                "Card not found: {}",
                row.card_id
            )));
        }

        let today = Utc::now().date_naive();
        let actual_date = request.actual_date.unwrap_or(today);
        let actual_amount = request.actual_amount.unwrap_or(row.instance.scheduled_amount);

        let mut note = format!("Recurring: {}", row.rule_name);
        if actual_amount != row.instance.scheduled_amount {
            note.push_str(&format!(
                ", scheduled amount {:.2}",
                row.instance.scheduled_amount
            ));
        }
        if actual_date != row.instance.scheduled_date {
            note.push_str(&format!(", scheduled for {}", row.instance.scheduled_date));
        }

        let transaction = LedgerTransaction {
            id: LedgerTransaction::generate_id(),
            user_id: request.user_id.clone(),
            card_id: row.card_id.clone(),
            category_id: rule.category_id.clone(),
            direction: row.direction,
            amount: actual_amount,
            date: actual_date,
            note: Some(note),
        };

        let new_balance = self.ledger.insert_and_rebalance(&transaction).await?;

        let instance = self
            .finalize_completion(
                &row,
                actual_date,
                actual_amount,
                request.notes,
                Some(transaction.id.clone()),
            )
            .await?;

        Ok(CreateTransactionFromInstanceResponse {
            transaction_id: transaction.id,
            instance,
            new_balance,
            success_message: "Transaction recorded and instance completed".to_string(),
        })
    }

    /// Skip an instance, recording the reason. No ledger effect.
    pub async fn skip_instance(
        &self,
        instance_id: &str,
        request: SkipInstanceRequest,
    ) -> EngineResult<SkipInstanceResponse> {
        info!("Skipping instance {} for {}", instance_id, request.user_id);

        let row = self.require_instance(&request.user_id, instance_id).await?;
        require_actionable(&row.instance, "skipped")?;

        let mut instance = row.instance.clone();
        instance.status = InstanceStatus::Skipped;
        instance.skip_reason = request.reason;

        let record = transition_record(&row.instance, &instance, "skipped", "status,skip_reason")?;
        self.instances.apply_transition(&instance, &record).await?;

        Ok(SkipInstanceResponse {
            success_message: "Skipped instance".to_string(),
            instance,
        })
    }

    async fn finalize_completion(
        &self,
        row: &InstanceRow,
        actual_date: NaiveDate,
        actual_amount: f64,
        notes: Option<String>,
        transaction_id: Option<String>,
    ) -> EngineResult<RecurrenceInstance> {
        let deviates = actual_date != row.instance.scheduled_date
            || actual_amount != row.instance.scheduled_amount;

        let mut instance = row.instance.clone();
        instance.status = if deviates {
            InstanceStatus::Modified
        } else {
            InstanceStatus::Completed
        };
        instance.actual_date = Some(actual_date);
        instance.actual_amount = Some(actual_amount);
        instance.notes = notes.or(instance.notes);
        instance.transaction_id = transaction_id;
        instance.completed_at = Some(Utc::now().to_rfc3339());

        let record = transition_record(
            &row.instance,
            &instance,
            "completed",
            "status,actual_date,actual_amount",
        )?;
        self.instances.apply_transition(&instance, &record).await?;
        Ok(instance)
    }

    async fn require_instance(
        &self,
        user_id: &str,
        instance_id: &str,
    ) -> EngineResult<InstanceRow> {
        self.instances
            .get_instance(user_id, instance_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Instance not found: {}", instance_id)))
    }
}

fn require_actionable(instance: &RecurrenceInstance, verb: &str) -> EngineResult<()> {
    if !instance.status.is_actionable() {
        return Err(EngineError::Conflict(format!(
            "Instance {} is {} and cannot be {}",
            instance.id,
            instance.status.as_str(),
            verb
        )));
    }
    Ok(())
}

fn transition_record(
    old: &RecurrenceInstance,
    new: &RecurrenceInstance,
    action: &str,
    changed_fields: &str,
) -> EngineResult<HistoryRecord> {
    Ok(HistoryRecord {
        id: HistoryRecord::generate_id(),
        rule_id: new.rule_id.clone(),
        instance_id: Some(new.id.clone()),
        action: action.to_string(),
        changed_fields: changed_fields.to_string(),
        old_values: Some(serde_json::to_string(old)?),
        new_values: Some(serde_json::to_string(new)?),
        reason: new.skip_reason.clone(),
        created_at: Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Card, Direction, Frequency, RecurrenceRule, RuleStatus};

    use crate::storage::sqlite::{HistoryRepository, SqliteCardStore, SqliteLedgerStore};

    struct Fixture {
        service: InstanceService,
        instances: InstanceRepository,
        rules: RuleRepository,
        history: HistoryRepository,
        cards: SqliteCardStore,
    }

    async fn setup_test() -> Fixture {
        let db = DbConnection::init_test()
            .await
            .expect("Failed to create test database");
        let cards = SqliteCardStore::new(db.clone());
        cards
            .store_card(&Card {
                id: "card::main".to_string(),
                user_id: "user::alice".to_string(),
                name: "Main card".to_string(),
                balance: 100.0,
            })
            .await
            .expect("seed card failed");
        let ledger = SqliteLedgerStore::new(db.clone());

        Fixture {
            service: InstanceService::new(
                db.clone(),
                Arc::new(cards.clone()),
                Arc::new(ledger),
            ),
            instances: InstanceRepository::new(db.clone()),
            rules: RuleRepository::new(db.clone()),
            history: HistoryRepository::new(db),
            cards,
        }
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().expect("bad date literal")
    }

    fn rule(direction: Direction, amount: f64) -> RecurrenceRule {
        RecurrenceRule {
            id: RecurrenceRule::generate_id(),
            user_id: "user::alice".to_string(),
            card_id: "card::main".to_string(),
            category_id: None,
            name: "Gym membership".to_string(),
            direction,
            amount,
            frequency: Frequency::Daily,
            interval: 1,
            start_date: date("2024-01-01"),
            end_date: None,
            status: RuleStatus::Active,
            created_at: "2024-01-01T00:00:00Z".to_string(),
            updated_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn created(rule_id: &str) -> HistoryRecord {
        HistoryRecord {
            id: HistoryRecord::generate_id(),
            rule_id: rule_id.to_string(),
            instance_id: None,
            action: "created".to_string(),
            changed_fields: "rule".to_string(),
            old_values: None,
            new_values: None,
            reason: None,
            created_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn pending(rule_id: &str, scheduled: &str, amount: f64) -> RecurrenceInstance {
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

    async fn seed(fx: &Fixture, rule: &RecurrenceRule, instances: &[RecurrenceInstance]) {
        fx.rules
            .store_rule(rule, &created(&rule.id))
            .await
            .expect("store rule failed");
        fx.instances
            .store_batch(instances)
            .await
            .expect("store instances failed");
    }

    #[tokio::test]
    async fn test_complete_without_overrides_is_completed() {
        let fx = setup_test().await;
        let rule = rule(Direction::Out, 30.0);
        let instance = pending(&rule.id, "2024-02-01", 30.0);
        seed(&fx, &rule, std::slice::from_ref(&instance)).await;

        let response = fx
            .service
            .complete_instance(
                &instance.id,
                CompleteInstanceRequest {
                    user_id: "user::alice".to_string(),
                    actual_date: Some(date("2024-02-01")),
                    actual_amount: None,
                    notes: None,
                },
            )
            .await
            .expect("complete failed");

        assert_eq!(response.instance.status, InstanceStatus::Completed);
        assert_eq!(response.instance.actual_amount, Some(30.0));
        assert!(response.instance.completed_at.is_some());
        assert!(response.instance.transaction_id.is_none());

        let records = fx
            .history
            .list_for_rule(&rule.id)
            .await
            .expect("history failed");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].action, "completed");
        assert_eq!(records[1].instance_id.as_deref(), Some(instance.id.as_str()));
    }

    #[tokio::test]
    async fn test_complete_with_deviation_is_modified() {
        let fx = setup_test().await;
        let rule = rule(Direction::Out, 30.0);
        let by_date = pending(&rule.id, "2024-02-01", 30.0);
        let by_amount = pending(&rule.id, "2024-02-02", 30.0);
        seed(&fx, &rule, &[by_date.clone(), by_amount.clone()]).await;

        let response = fx
            .service
            .complete_instance(
                &by_date.id,
                CompleteInstanceRequest {
                    user_id: "user::alice".to_string(),
                    actual_date: Some(date("2024-02-03")),
                    actual_amount: None,
                    notes: None,
                },
            )
            .await
            .expect("complete failed");
        assert_eq!(response.instance.status, InstanceStatus::Modified);

        let response = fx
            .service
            .complete_instance(
                &by_amount.id,
                CompleteInstanceRequest {
                    user_id: "user::alice".to_string(),
                    actual_date: Some(date("2024-02-02")),
                    actual_amount: Some(25.0),
                    notes: None,
                },
            )
            .await
            .expect("complete failed");
        assert_eq!(response.instance.status, InstanceStatus::Modified);
        assert_eq!(response.instance.actual_amount, Some(25.0));
    }

    #[tokio::test]
    async fn test_complete_terminal_instance_is_conflict() {
        let fx = setup_test().await;
        let rule = rule(Direction::Out, 30.0);
        let instance = pending(&rule.id, "2024-02-01", 30.0);
        seed(&fx, &rule, std::slice::from_ref(&instance)).await;

        let request = || CompleteInstanceRequest {
            user_id: "user::alice".to_string(),
            actual_date: Some(date("2024-02-01")),
            actual_amount: None,
            notes: None,
        };
        fx.service
            .complete_instance(&instance.id, request())
            .await
            .expect("first complete failed");

        assert!(matches!(
            fx.service.complete_instance(&instance.id, request()).await,
            Err(EngineError::Conflict(_))
        ));
        assert!(matches!(
            fx.service
                .skip_instance(
                    &instance.id,
                    SkipInstanceRequest {
                        user_id: "user::alice".to_string(),
                        reason: None,
                    },
                )
                .await,
            Err(EngineError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_complete_foreign_instance_is_not_found() {
        let fx = setup_test().await;
        let rule = rule(Direction::Out, 30.0);
        let instance = pending(&rule.id, "2024-02-01", 30.0);
        seed(&fx, &rule, std::slice::from_ref(&instance)).await;

        assert!(matches!(
            fx.service
                .complete_instance(
                    &instance.id,
                    CompleteInstanceRequest {
                        user_id: "user::mallory".to_string(),
                        actual_date: None,
                        actual_amount: None,
                        notes: None,
                    },
                )
                .await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_skip_records_reason() {
        let fx = setup_test().await;
        let rule = rule(Direction::Out, 30.0);
        let instance = pending(&rule.id, "2024-02-01", 30.0);
        seed(&fx, &rule, std::slice::from_ref(&instance)).await;

        let response = fx
            .service
            .skip_instance(
                &instance.id,
                SkipInstanceRequest {
                    user_id: "user::alice".to_string(),
                    reason: Some("gym closed".to_string()),
                },
            )
            .await
            .expect("skip failed");

        assert_eq!(response.instance.status, InstanceStatus::Skipped);
        assert_eq!(response.instance.skip_reason.as_deref(), Some("gym closed"));

        let records = fx
            .history
            .list_for_rule(&rule.id)
            .await
            .expect("history failed");
        assert_eq!(records[1].action, "skipped");
        assert_eq!(records[1].reason.as_deref(), Some("gym closed"));
    }

    #[tokio::test]
    async fn test_create_transaction_updates_balance_and_links() {
        let fx = setup_test().await;
        let rule = rule(Direction::Out, 30.0);
        let instance = pending(&rule.id, "2024-02-01", 30.0);
        seed(&fx, &rule, std::slice::from_ref(&instance)).await;

        let response = fx
            .service
            .create_transaction_from_instance(
                &instance.id,
                CreateTransactionFromInstanceRequest {
                    user_id: "user::alice".to_string(),
                    actual_date: Some(date("2024-02-01")),
                    actual_amount: None,
                    notes: None,
                },
            )
            .await
            .expect("create transaction failed");

        // The card started at 100.0 with an empty ledger; the rebalance is
        // a full recompute, so the sole outflow leaves -30.
        assert_eq!(response.new_balance, -30.0);
        assert_eq!(response.instance.status, InstanceStatus::Completed);
        assert_eq!(
            response.instance.transaction_id.as_deref(),
            Some(response.transaction_id.as_str())
        );

        let card = fx
            .cards
            .get_owned_card("user::alice", "card::main")
            .await
            .expect("get card failed")
            .expect("missing card");
        assert_eq!(card.balance, -30.0);
    }

    #[tokio::test]
    async fn test_create_transaction_with_deviation_notes_schedule() {
        let fx = setup_test().await;
        let rule = rule(Direction::In, 50.0);
        let instance = pending(&rule.id, "2024-02-01", 50.0);
        seed(&fx, &rule, std::slice::from_ref(&instance)).await;

        let response = fx
            .service
            .create_transaction_from_instance(
                &instance.id,
                CreateTransactionFromInstanceRequest {
                    user_id: "user::alice".to_string(),
                    actual_date: Some(date("2024-02-05")),
                    actual_amount: Some(45.0),
                    notes: None,
                },
            )
            .await
            .expect("create transaction failed");

        assert_eq!(response.instance.status, InstanceStatus::Modified);
        assert_eq!(response.new_balance, 45.0);
    }

    #[tokio::test]
    async fn test_list_instances_projects_running_balance() {
        let fx = setup_test().await;
        let rule = rule(Direction::Out, 30.0);
        seed(
            &fx,
            &rule,
            &[
                pending(&rule.id, "2024-02-01", 30.0),
                pending(&rule.id, "2024-02-02", 30.0),
                pending(&rule.id, "2024-02-03", 30.0),
            ],
        )
        .await;

        let response = fx
            .service
            .list_instances(InstanceListRequest {
                user_id: "user::alice".to_string(),
                ..Default::default()
            })
            .await
            .expect("list failed");

        assert_eq!(response.instances.len(), 3);
        assert_eq!(response.instances[0].projected_old_balance, 100.0);
        assert_eq!(response.instances[0].projected_new_balance, 70.0);
        assert_eq!(response.instances[1].projected_new_balance, 40.0);
        assert_eq!(response.instances[2].projected_new_balance, 10.0);

        // Past-due pending instances were swept on the way in.
        assert!(response
            .instances
            .iter()
            .all(|i| i.instance.status == InstanceStatus::Overdue));
    }

    #[tokio::test]
    async fn test_list_instances_skips_terminal_in_projection() {
        let fx = setup_test().await;
        let rule = rule(Direction::Out, 30.0);
        let first = pending(&rule.id, "2024-02-01", 30.0);
        let mut second = pending(&rule.id, "2024-02-02", 30.0);
        second.status = InstanceStatus::Skipped;
        let third = pending(&rule.id, "2024-02-03", 30.0);
        seed(&fx, &rule, &[first, second, third]).await;

        let response = fx
            .service
            .list_instances(InstanceListRequest {
                user_id: "user::alice".to_string(),
                ..Default::default()
            })
            .await
            .expect("list failed");

        assert_eq!(response.instances.len(), 3);
        let skipped = &response.instances[1];
        assert_eq!(skipped.projected_old_balance, 70.0);
        assert_eq!(skipped.projected_new_balance, 70.0);
        assert_eq!(response.instances[2].projected_new_balance, 40.0);
    }

    #[tokio::test]
    async fn test_get_instance_sweeps_first() {
        let fx = setup_test().await;
        let rule = rule(Direction::Out, 30.0);
        let instance = pending(&rule.id, "2024-02-01", 30.0);
        seed(&fx, &rule, std::slice::from_ref(&instance)).await;

        let response = fx
            .service
            .get_instance("user::alice", &instance.id)
            .await
            .expect("get failed");
        assert_eq!(response.instance.status, InstanceStatus::Overdue);
    }
}
