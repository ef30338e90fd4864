use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Direction of money movement relative to the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Money added to the card
    In,
    /// Money removed from the card
    Out,
}

impl Direction {
    /// Apply the direction's sign to an unsigned amount.
    pub fn signed(&self, amount: f64) -> f64 {
        match self {
            Direction::In => amount,
            Direction::Out => -amount,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }

    pub fn parse(s: &str) -> Option<Direction> {
        match s {
            "in" => Some(Direction::In),
            "out" => Some(Direction::Out),
            _ => None,
        }
    }
}

/// Status of a recurrence rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Active => "active",
            RuleStatus::Paused => "paused",
            RuleStatus::Completed => "completed",
            RuleStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<RuleStatus> {
        match s {
            "active" => Some(RuleStatus::Active),
            "paused" => Some(RuleStatus::Paused),
            "completed" => Some(RuleStatus::Completed),
            "cancelled" => Some(RuleStatus::Cancelled),
            _ => None,
        }
    }
}

/// Status of a single materialized occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Scheduled, not yet acted on
    Pending,
    /// Scheduled date has passed without completion or skip
    Overdue,
    /// Completed exactly as scheduled
    Completed,
    /// Completed with a different date or amount than scheduled
    Modified,
    /// Explicitly skipped by the user
    Skipped,
    /// Cancelled along with its rule
    Cancelled,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Overdue => "overdue",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Modified => "modified",
            InstanceStatus::Skipped => "skipped",
            InstanceStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<InstanceStatus> {
        match s {
            "pending" => Some(InstanceStatus::Pending),
            "overdue" => Some(InstanceStatus::Overdue),
            "completed" => Some(InstanceStatus::Completed),
            "modified" => Some(InstanceStatus::Modified),
            "skipped" => Some(InstanceStatus::Skipped),
            "cancelled" => Some(InstanceStatus::Cancelled),
            _ => None,
        }
    }

    /// An instance can only be completed or skipped while in one of these states.
    pub fn is_actionable(&self) -> bool {
        matches!(self, InstanceStatus::Pending | InstanceStatus::Overdue)
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed
                | InstanceStatus::Modified
                | InstanceStatus::Skipped
                | InstanceStatus::Cancelled
        )
    }
}

/// What to do when the nominal day does not exist in a given month/year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentPolicy {
    /// Clamp to the last valid day of the month
    Last,
    /// Roll over to the 1st of the following period
    Next,
    /// Omit that period's occurrence entirely
    Skip,
}

/// Frequency pattern of a recurrence rule, one variant per repeat type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly {
        /// Weekday indices, 0 = Sunday .. 6 = Saturday. Defaults to the
        /// start date's weekday when empty.
        days_of_week: Vec<u8>,
    },
    Monthly {
        day_of_month: u8,
        adjustment: AdjustmentPolicy,
    },
    Yearly {
        month: u8,
        day: u8,
        adjustment: AdjustmentPolicy,
    },
}

impl Frequency {
    /// Stable tag used for filtering and persistence.
    pub fn type_name(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly { .. } => "weekly",
            Frequency::Monthly { .. } => "monthly",
            Frequency::Yearly { .. } => "yearly",
        }
    }

    /// Check the frequency-specific configuration for out-of-range values.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Frequency::Daily => Ok(()),
            Frequency::Weekly { days_of_week } => {
                for day in days_of_week {
                    if *day > 6 {
                        return Err(format!("Invalid weekday index: {}", day));
                    }
                }
                Ok(())
            }
            Frequency::Monthly { day_of_month, .. } => {
                if *day_of_month < 1 || *day_of_month > 31 {
                    return Err(format!("Invalid day of month: {}", day_of_month));
                }
                Ok(())
            }
            Frequency::Yearly { month, day, .. } => {
                if *month < 1 || *month > 12 {
                    return Err(format!("Invalid month: {}", month));
                }
                if *day < 1 || *day > 31 {
                    return Err(format!("Invalid day: {}", day));
                }
                Ok(())
            }
        }
    }
}

/// Persistent definition of a repeating financial event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    /// Rule ID in format: "rule::<uuid>"
    pub id: String,
    pub user_id: String,
    pub card_id: String,
    pub category_id: Option<String>,
    pub name: String,
    pub direction: Direction,
    /// Unsigned amount, always > 0; sign comes from `direction`
    pub amount: f64,
    pub frequency: Frequency,
    /// Repeat every N frequency units, N >= 1
    pub interval: u32,
    pub start_date: NaiveDate,
    /// Open-ended if absent; strictly after `start_date` when present
    pub end_date: Option<NaiveDate>,
    pub status: RuleStatus,
    /// RFC 3339 timestamp
    pub created_at: String,
    /// RFC 3339 timestamp
    pub updated_at: String,
}

/// One concrete, dated materialization of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrenceInstance {
    /// Instance ID in format: "instance::<uuid>"
    pub id: String,
    pub rule_id: String,
    pub scheduled_date: NaiveDate,
    /// Copied from the rule at generation time, never recomputed
    pub scheduled_amount: f64,
    pub status: InstanceStatus,
    /// Linked ledger transaction, set only on ledger-backed completion
    pub transaction_id: Option<String>,
    pub actual_date: Option<NaiveDate>,
    pub actual_amount: Option<f64>,
    pub notes: Option<String>,
    pub skip_reason: Option<String>,
    /// RFC 3339 timestamp, set on completion
    pub completed_at: Option<String>,
}

/// Append-only audit entry for a rule or instance mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// History ID in format: "history::<uuid>"
    pub id: String,
    pub rule_id: String,
    pub instance_id: Option<String>,
    /// Action tag, e.g. "created", "updated", "completed", "skipped", "cancelled"
    pub action: String,
    /// Comma-separated list of changed field names
    pub changed_fields: String,
    /// JSON snapshot before the change
    pub old_values: Option<String>,
    /// JSON snapshot after the change
    pub new_values: Option<String>,
    pub reason: Option<String>,
    /// RFC 3339 timestamp
    pub created_at: String,
}

/// A card as seen by the engine: ownership plus the stored balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub balance: f64,
}

/// A spending category; the engine only checks ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub user_id: String,
    pub name: String,
}

/// A committed ledger transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    /// Transaction ID in format: "transaction::<uuid>"
    pub id: String,
    pub user_id: String,
    pub card_id: String,
    pub category_id: Option<String>,
    pub direction: Direction,
    pub amount: f64,
    pub date: NaiveDate,
    pub note: Option<String>,
}

/// Client-supplied fields of a rule, shared by create and update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub card_id: String,
    pub category_id: Option<String>,
    pub name: String,
    pub direction: Direction,
    pub amount: f64,
    pub frequency: Frequency,
    pub interval: u32,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

/// Request to create a new recurrence rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRuleRequest {
    pub user_id: String,
    pub definition: RuleDefinition,
}

/// Response after creating a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRuleResponse {
    pub rule: RecurrenceRule,
    /// Number of instances materialized on creation
    pub instances_generated: usize,
    pub success_message: String,
}

/// Query filters for listing rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleListRequest {
    pub user_id: String,
    pub status: Option<RuleStatus>,
    pub is_active: Option<bool>,
    pub card_id: Option<String>,
    /// Frequency type tag: "daily", "weekly", "monthly", "yearly"
    pub frequency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleListResponse {
    pub rules: Vec<RecurrenceRule>,
}

/// Response for a single rule plus its upcoming instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetRuleResponse {
    pub rule: RecurrenceRule,
    pub upcoming_instances: Vec<RecurrenceInstance>,
}

/// Request to update a rule's definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRuleRequest {
    pub user_id: String,
    pub definition: RuleDefinition,
    /// Delete still-pending instances generated under the old definition
    #[serde(default)]
    pub apply_to_future: bool,
    /// Also regenerate instances from the updated definition
    #[serde(default)]
    pub recreate_instances: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRuleResponse {
    pub rule: RecurrenceRule,
    /// Pending instances deleted as part of the update
    pub instances_deleted: usize,
    /// Instances regenerated under the new definition
    pub instances_generated: usize,
    pub success_message: String,
}

/// Options controlling rule removal, combinable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RemoveRuleRequest {
    /// Delete instances outright instead of soft-cancelling them
    #[serde(default)]
    pub delete_instances: bool,
    /// Restrict deletion to future-dated instances only
    #[serde(default)]
    pub future_only: bool,
    /// Preserve instances already in a completed/modified state
    #[serde(default)]
    pub keep_completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveRuleResponse {
    /// Instances moved to cancelled by the soft-cancel path
    pub instances_cancelled: usize,
    /// Instances deleted by the delete path
    pub instances_deleted: usize,
    pub success_message: String,
}

/// Request to materialize new instances for a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateInstancesRequest {
    pub user_id: String,
    /// Generation horizon in days for open-ended rules (default 90)
    pub horizon_days: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateInstancesResponse {
    pub instances_generated: usize,
    pub success_message: String,
}

/// Query filters for listing instances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceListRequest {
    pub user_id: String,
    pub status: Option<InstanceStatus>,
    pub card_id: Option<String>,
    pub rule_id: Option<String>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    /// Shorthand for `to_date = today + days_ahead`
    pub days_ahead: Option<i64>,
}

/// An instance augmented with the projected running balance of its card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceWithBalance {
    pub instance: RecurrenceInstance,
    pub rule_name: String,
    pub card_id: String,
    pub direction: Direction,
    /// Card balance before this instance is applied
    pub projected_old_balance: f64,
    /// Card balance after this instance is applied
    pub projected_new_balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceListResponse {
    pub instances: Vec<InstanceWithBalance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetInstanceResponse {
    pub instance: RecurrenceInstance,
}

/// Optional overrides supplied when completing an instance. Absent fields
/// fall back to the scheduled values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteInstanceRequest {
    pub user_id: String,
    pub actual_date: Option<NaiveDate>,
    pub actual_amount: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteInstanceResponse {
    pub instance: RecurrenceInstance,
    pub success_message: String,
}

/// Completion payload for the ledger-backed variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTransactionFromInstanceRequest {
    pub user_id: String,
    pub actual_date: Option<NaiveDate>,
    pub actual_amount: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTransactionFromInstanceResponse {
    pub transaction_id: String,
    pub instance: RecurrenceInstance,
    /// Card balance after the ledger write
    pub new_balance: f64,
    pub success_message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipInstanceRequest {
    pub user_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipInstanceResponse {
    pub instance: RecurrenceInstance,
    pub success_message: String,
}

/// Query for a forward balance projection over a card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRequest {
    pub user_id: String,
    pub card_id: String,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
}

/// One step of a balance projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedEntry {
    pub instance_id: String,
    pub rule_name: String,
    pub date: NaiveDate,
    pub direction: Direction,
    pub amount: f64,
    /// Balance before this entry is applied
    pub old_balance: f64,
    /// Balance after this entry is applied
    pub new_balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionResponse {
    pub card_id: String,
    pub current_balance: f64,
    pub entries: Vec<ProjectedEntry>,
    pub final_balance: f64,
}

impl RecurrenceRule {
    /// Generate a new rule ID
    pub fn generate_id() -> String {
        format!("rule::{}", Uuid::new_v4())
    }

    /// Parse a rule ID, validating the prefix
    pub fn parse_id(id: &str) -> Result<Uuid, EntityIdError> {
        parse_prefixed_id(id, "rule")
    }
}

impl RecurrenceInstance {
    /// Generate a new instance ID
    pub fn generate_id() -> String {
        format!("instance::{}", Uuid::new_v4())
    }

    /// Parse an instance ID, validating the prefix
    pub fn parse_id(id: &str) -> Result<Uuid, EntityIdError> {
        parse_prefixed_id(id, "instance")
    }
}

impl HistoryRecord {
    /// Generate a new history record ID
    pub fn generate_id() -> String {
        format!("history::{}", Uuid::new_v4())
    }
}

impl LedgerTransaction {
    /// Generate a new ledger transaction ID
    pub fn generate_id() -> String {
        format!("transaction::{}", Uuid::new_v4())
    }

    /// Parse a transaction ID, validating the prefix
    pub fn parse_id(id: &str) -> Result<Uuid, EntityIdError> {
        parse_prefixed_id(id, "transaction")
    }
}

fn parse_prefixed_id(id: &str, prefix: &str) -> Result<Uuid, EntityIdError> {
    let parts: Vec<&str> = id.split("::").collect();
    if parts.len() != 2 {
        return Err(EntityIdError::InvalidFormat);
    }
    if parts[0] != prefix {
        return Err(EntityIdError::InvalidPrefix);
    }
    Uuid::parse_str(parts[1]).map_err(|_| EntityIdError::InvalidUuid)
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntityIdError {
    InvalidFormat,
    InvalidPrefix,
    InvalidUuid,
}

impl fmt::Display for EntityIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityIdError::InvalidFormat => write!(f, "Invalid entity ID format"),
            EntityIdError::InvalidPrefix => write!(f, "Unexpected entity ID prefix"),
            EntityIdError::InvalidUuid => write!(f, "Invalid UUID in entity ID"),
        }
    }
}

impl std::error::Error for EntityIdError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_parse_rule_id() {
        let id = RecurrenceRule::generate_id();
        assert!(id.starts_with("rule::"));
        assert!(RecurrenceRule::parse_id(&id).is_ok());

        // Wrong prefix
        assert_eq!(
            RecurrenceInstance::parse_id(&id),
            Err(EntityIdError::InvalidPrefix)
        );

        // Malformed
        assert_eq!(
            RecurrenceRule::parse_id("rule"),
            Err(EntityIdError::InvalidFormat)
        );
        assert_eq!(
            RecurrenceRule::parse_id("rule::not-a-uuid"),
            Err(EntityIdError::InvalidUuid)
        );
    }

    #[test]
    fn test_direction_signed() {
        assert_eq!(Direction::In.signed(25.0), 25.0);
        assert_eq!(Direction::Out.signed(25.0), -25.0);
    }

    #[test]
    fn test_direction_round_trip() {
        for dir in [Direction::In, Direction::Out] {
            assert_eq!(Direction::parse(dir.as_str()), Some(dir));
        }
        assert_eq!(Direction::parse("sideways"), None);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            RuleStatus::Active,
            RuleStatus::Paused,
            RuleStatus::Completed,
            RuleStatus::Cancelled,
        ] {
            assert_eq!(RuleStatus::parse(status.as_str()), Some(status));
        }

        for status in [
            InstanceStatus::Pending,
            InstanceStatus::Overdue,
            InstanceStatus::Completed,
            InstanceStatus::Modified,
            InstanceStatus::Skipped,
            InstanceStatus::Cancelled,
        ] {
            assert_eq!(InstanceStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_instance_status_classification() {
        assert!(InstanceStatus::Pending.is_actionable());
        assert!(InstanceStatus::Overdue.is_actionable());
        assert!(!InstanceStatus::Completed.is_actionable());

        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Modified.is_terminal());
        assert!(InstanceStatus::Skipped.is_terminal());
        assert!(InstanceStatus::Cancelled.is_terminal());
        assert!(!InstanceStatus::Pending.is_terminal());
        assert!(!InstanceStatus::Overdue.is_terminal());
    }

    #[test]
    fn test_frequency_serde_tagged() {
        let weekly = Frequency::Weekly {
            days_of_week: vec![1, 5],
        };
        let json = serde_json::to_string(&weekly).unwrap();
        assert!(json.contains("\"type\":\"weekly\""));
        let back: Frequency = serde_json::from_str(&json).unwrap();
        assert_eq!(back, weekly);

        let monthly = Frequency::Monthly {
            day_of_month: 31,
            adjustment: AdjustmentPolicy::Last,
        };
        let json = serde_json::to_string(&monthly).unwrap();
        assert!(json.contains("\"adjustment\":\"last\""));
        let back: Frequency = serde_json::from_str(&json).unwrap();
        assert_eq!(back, monthly);
    }

    #[test]
    fn test_frequency_validate() {
        assert!(Frequency::Daily.validate().is_ok());
        assert!(Frequency::Weekly {
            days_of_week: vec![0, 6]
        }
        .validate()
        .is_ok());
        assert!(Frequency::Weekly {
            days_of_week: vec![7]
        }
        .validate()
        .is_err());
        assert!(Frequency::Monthly {
            day_of_month: 0,
            adjustment: AdjustmentPolicy::Skip
        }
        .validate()
        .is_err());
        assert!(Frequency::Monthly {
            day_of_month: 32,
            adjustment: AdjustmentPolicy::Skip
        }
        .validate()
        .is_err());
        assert!(Frequency::Yearly {
            month: 13,
            day: 1,
            adjustment: AdjustmentPolicy::Next
        }
        .validate()
        .is_err());
        assert!(Frequency::Yearly {
            month: 2,
            day: 29,
            adjustment: AdjustmentPolicy::Next
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn test_frequency_type_name() {
        assert_eq!(Frequency::Daily.type_name(), "daily");
        assert_eq!(
            Frequency::Weekly {
                days_of_week: vec![]
            }
            .type_name(),
            "weekly"
        );
        assert_eq!(
            Frequency::Monthly {
                day_of_month: 15,
                adjustment: AdjustmentPolicy::Last
            }
            .type_name(),
            "monthly"
        );
        assert_eq!(
            Frequency::Yearly {
                month: 2,
                day: 29,
                adjustment: AdjustmentPolicy::Skip
            }
            .type_name(),
            "yearly"
        );
    }
}
