use std::sync::Arc;

use chrono::Utc;
use shared::{
    CreateRuleRequest, CreateRuleResponse, GenerateInstancesRequest, GenerateInstancesResponse,
    GetRuleResponse, HistoryRecord, RecurrenceRule, RemoveRuleRequest, RemoveRuleResponse,
    RuleDefinition, RuleListRequest, RuleListResponse, RuleStatus, UpdateRuleRequest,
    UpdateRuleResponse,
};
use tracing::info;

use crate::domain::generator;
use crate::error::{EngineError, EngineResult};
use crate::storage::sqlite::{HistoryRepository, InstanceRepository, RuleRepository};
use crate::storage::{CardStore, CategoryStore, DbConnection};

/// Number of upcoming instances returned alongside a single rule.
const UPCOMING_LIMIT: i64 = 5;

/// Service owning the recurrence rule lifecycle: creation, listing,
/// updates, removal, and on-demand instance generation.
#[derive(Clone)]
pub struct RuleService {
    rules: RuleRepository,
    instances: InstanceRepository,
    history: HistoryRepository,
    cards: Arc<dyn CardStore>,
    categories: Arc<dyn CategoryStore>,
}

impl RuleService {
    pub fn new(db: DbConnection, cards: Arc<dyn CardStore>, categories: Arc<dyn CategoryStore>) -> Self {
        Self {
            rules: RuleRepository::new(db.clone()),
            instances: InstanceRepository::new(db.clone()),
            history: HistoryRepository::new(db),
            cards,
            categories,
        }
    }

    pub async fn create_rule(&self, request: CreateRuleRequest) -> EngineResult<CreateRuleResponse> {
        info!("Creating rule '{}' for {}", request.definition.name, request.user_id);

        validate_definition(&request.definition)?;
        self.check_collaborators(&request.user_id, &request.definition)
            .await?;

        let now = Utc::now().to_rfc3339();
        let rule = RecurrenceRule {
            id: RecurrenceRule::generate_id(),
            user_id: request.user_id,
            card_id: request.definition.card_id,
            category_id: request.definition.category_id,
            name: request.definition.name,
            direction: request.definition.direction,
            amount: request.definition.amount,
            frequency: request.definition.frequency,
            interval: request.definition.interval,
            start_date: request.definition.start_date,
            end_date: request.definition.end_date,
            status: RuleStatus::Active,
            created_at: now.clone(),
            updated_at: now.clone(),
        };

        let record = HistoryRecord {
            id: HistoryRecord::generate_id(),
            rule_id: rule.id.clone(),
            instance_id: None,
            action: "created".to_string(),
            changed_fields: "rule".to_string(),
            old_values: None,
            new_values: Some(serde_json::to_string(&rule)?),
            reason: None,
            created_at: now,
        };
        self.rules.store_rule(&rule, &record).await?;

        let today = Utc::now().date_naive();
        let instances_generated =
            generator::generate_for_rule(&self.instances, &rule, generator::DEFAULT_HORIZON_DAYS, today)
                .await?;

        Ok(CreateRuleResponse {
            success_message: format!(
                "Created rule '{}' with {} upcoming instances",
                rule.name, instances_generated
            ),
            rule,
            instances_generated,
        })
    }

    pub async fn list_rules(&self, request: RuleListRequest) -> EngineResult<RuleListResponse> {
        let rules = self.rules.list_rules(&request).await?;
        Ok(RuleListResponse { rules })
    }

    pub async fn get_rule(&self, user_id: &str, rule_id: &str) -> EngineResult<GetRuleResponse> {
        let rule = self.require_rule(user_id, rule_id).await?;
        let today = Utc::now().date_naive();
        let upcoming_instances = self
            .instances
            .upcoming_for_rule(rule_id, today, UPCOMING_LIMIT)
            .await?;
        Ok(GetRuleResponse {
            rule,
            upcoming_instances,
        })
    }

    /// Persist a new definition for an existing rule. Pending instances are
    /// deleted only when one of the option flags asks for it, and
    /// regenerated only under `recreate_instances`.
    pub async fn update_rule(
        &self,
        rule_id: &str,
        request: UpdateRuleRequest,
    ) -> EngineResult<UpdateRuleResponse> {
        info!("Updating rule {} for {}", rule_id, request.user_id);

        let existing = self.require_rule(&request.user_id, rule_id).await?;
        if existing.status == RuleStatus::Cancelled {
            return Err(EngineError::Conflict(format!(
                "Rule {} is cancelled and can no longer be updated",
                rule_id
            )));
        }

        validate_definition(&request.definition)?;
        self.check_collaborators(&request.user_id, &request.definition)
            .await?;

        let now = Utc::now().to_rfc3339();
        let updated = RecurrenceRule {
            id: existing.id.clone(),
            user_id: existing.user_id.clone(),
            card_id: request.definition.card_id,
            category_id: request.definition.category_id,
            name: request.definition.name,
            direction: request.definition.direction,
            amount: request.definition.amount,
            frequency: request.definition.frequency,
            interval: request.definition.interval,
            start_date: request.definition.start_date,
            end_date: request.definition.end_date,
            status: existing.status,
            created_at: existing.created_at.clone(),
            updated_at: now.clone(),
        };

        let record = HistoryRecord {
            id: HistoryRecord::generate_id(),
            rule_id: existing.id.clone(),
            instance_id: None,
            action: "updated".to_string(),
            changed_fields: changed_fields(&existing, &updated),
            old_values: Some(serde_json::to_string(&existing)?),
            new_values: Some(serde_json::to_string(&updated)?),
            reason: None,
            created_at: now,
        };

        let delete_pending = request.apply_to_future || request.recreate_instances;
        let instances_deleted = self
            .rules
            .apply_update(&updated, delete_pending, &record)
            .await?;

        let instances_generated = if request.recreate_instances {
            let today = Utc::now().date_naive();
            generator::generate_for_rule(
                &self.instances,
                &updated,
                generator::DEFAULT_HORIZON_DAYS,
                today,
            )
            .await?
        } else {
            0
        };

        Ok(UpdateRuleResponse {
            success_message: format!("Updated rule '{}'", updated.name),
            rule: updated,
            instances_deleted,
            instances_generated,
        })
    }

    /// Cancel a rule. By default instances survive as `cancelled`; the
    /// option flags switch to outright deletion, optionally limited to
    /// future dates or sparing completed instances.
    pub async fn remove_rule(
        &self,
        user_id: &str,
        rule_id: &str,
        options: RemoveRuleRequest,
    ) -> EngineResult<RemoveRuleResponse> {
        info!("Removing rule {} for {} ({:?})", rule_id, user_id, options);

        let rule = self.require_rule(user_id, rule_id).await?;
        let now = Utc::now().to_rfc3339();
        let today = Utc::now().date_naive();

        let record = HistoryRecord {
            id: HistoryRecord::generate_id(),
            rule_id: rule.id.clone(),
            instance_id: None,
            action: "cancelled".to_string(),
            changed_fields: "status".to_string(),
            old_values: Some(format!("{{\"status\":\"{}\"}}", rule.status.as_str())),
            new_values: Some("{\"status\":\"cancelled\"}".to_string()),
            reason: Some(serde_json::to_string(&options)?),
            created_at: now.clone(),
        };

        let (instances_cancelled, instances_deleted) = self
            .rules
            .cancel_rule(rule_id, &options, today, &now, &record)
            .await?;

        Ok(RemoveRuleResponse {
            instances_cancelled,
            instances_deleted,
            success_message: format!("Cancelled rule '{}'", rule.name),
        })
    }

    /// Hard-delete a rule and all of its instances. History is retained so
    /// the audit trail survives the rule itself.
    pub async fn delete_rule(&self, user_id: &str, rule_id: &str) -> EngineResult<()> {
        info!("Hard-deleting rule {} for {}", rule_id, user_id);

        let rule = self.require_rule(user_id, rule_id).await?;
        let record = HistoryRecord {
            id: HistoryRecord::generate_id(),
            rule_id: rule.id.clone(),
            instance_id: None,
            action: "deleted".to_string(),
            changed_fields: "rule".to_string(),
            old_values: Some(serde_json::to_string(&rule)?),
            new_values: None,
            reason: None,
            created_at: Utc::now().to_rfc3339(),
        };
        self.rules.delete_rule(rule_id, &record).await
    }

    /// Extend a rule's materialized instances on demand.
    pub async fn generate_instances(
        &self,
        rule_id: &str,
        request: GenerateInstancesRequest,
    ) -> EngineResult<GenerateInstancesResponse> {
        let rule = self.require_rule(&request.user_id, rule_id).await?;
        if rule.status != RuleStatus::Active {
            return Err(EngineError::Conflict(format!(
                "Cannot generate instances for a {} rule",
                rule.status.as_str()
            )));
        }

        let horizon = request
            .horizon_days
            .unwrap_or(generator::DEFAULT_HORIZON_DAYS);
        if horizon <= 0 {
            return Err(EngineError::Validation(
                "Generation horizon must be positive".to_string(),
            ));
        }

        let today = Utc::now().date_naive();
        let instances_generated =
            generator::generate_for_rule(&self.instances, &rule, horizon, today).await?;

        Ok(GenerateInstancesResponse {
            instances_generated,
            success_message: format!(
                "Generated {} instances for rule '{}'",
                instances_generated, rule.name
            ),
        })
    }

    /// Full audit trail for a rule, oldest first.
    pub async fn rule_history(
        &self,
        user_id: &str,
        rule_id: &str,
    ) -> EngineResult<Vec<HistoryRecord>> {
        // History outlives hard deletion, so a missing rule is not an
        // error as long as some history exists under the id.
        if self.rules.get_rule(user_id, rule_id).await?.is_none() {
            let records = self.history.list_for_rule(rule_id).await?;
            if records.is_empty() {
                return Err(EngineError::NotFound(format!("Rule not found: {}", rule_id)));
            }
            return Ok(records);
        }
        self.history.list_for_rule(rule_id).await
    }

    async fn require_rule(&self, user_id: &str, rule_id: &str) -> EngineResult<RecurrenceRule> {
        self.rules
            .get_rule(user_id, rule_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Rule not found: {}", rule_id)))
    }

    async fn check_collaborators(
        &self,
        user_id: &str,
        definition: &RuleDefinition,
    ) -> EngineResult<()> {
        if self
            .cards
            .get_owned_card(user_id, &definition.card_id)
            .await?
            .is_none()
        {
            return Err(EngineError::NotFound(format!(
                "Card not found: {}",
                definition.card_id
            )));
        }
        if let Some(category_id) = &definition.category_id {
            if !self.categories.owns_category(user_id, category_id).await? {
                return Err(EngineError::NotFound(format!(
                    "Category not found: {}",
                    category_id
                )));
            }
        }
        Ok(())
    }
}

fn validate_definition(definition: &RuleDefinition) -> EngineResult<()> {
    if definition.name.trim().is_empty() {
        return Err(EngineError::Validation("Rule name cannot be empty".to_string()));
    }
    if definition.amount <= 0.0 {
        return Err(EngineError::Validation(
            "Rule amount must be greater than zero".to_string(),
        ));
    }
    if definition.interval < 1 {
        return Err(EngineError::Validation(
            "Repeat interval must be at least 1".to_string(),
        ));
    }
    definition.frequency.validate().map_err(EngineError::Validation)?;
    if let Some(end_date) = definition.end_date {
        if end_date <= definition.start_date {
            return Err(EngineError::Validation(
                "End date must be after start date".to_string(),
            ));
        }
    }
    Ok(())
}

/// Comma-separated names of definition fields that differ between two
/// versions of a rule.
fn changed_fields(old: &RecurrenceRule, new: &RecurrenceRule) -> String {
    let mut fields = Vec::new();
    if old.card_id != new.card_id {
        fields.push("card_id");
    }
    if old.category_id != new.category_id {
        fields.push("category_id");
    }
    if old.name != new.name {
        fields.push("name");
    }
    if old.direction != new.direction {
        fields.push("direction");
    }
    if old.amount != new.amount {
        fields.push("amount");
    }
    if old.frequency != new.frequency {
        fields.push("frequency");
    }
    if old.interval != new.interval {
        fields.push("interval");
    }
    if old.start_date != new.start_date {
        fields.push("start_date");
    }
    if old.end_date != new.end_date {
        fields.push("end_date");
    }
    if fields.is_empty() {
        "none".to_string()
    } else {
        fields.join(",")
    }
}
