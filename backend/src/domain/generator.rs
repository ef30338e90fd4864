//! Materializes rule occurrences into pending instances.

use chrono::{Duration, NaiveDate};
use shared::{InstanceStatus, RecurrenceInstance, RecurrenceRule};
use tracing::info;

use crate::domain::schedule;
use crate::error::EngineResult;
use crate::storage::sqlite::InstanceRepository;

/// Default generation horizon for open-ended rules, in days.
pub const DEFAULT_HORIZON_DAYS: i64 = 90;

/// Generate new instances for a rule up to its end date, or `horizon_days`
/// past today for open-ended rules. Returns the number of rows inserted.
///
/// Idempotent by construction: the window starts strictly after the latest
/// scheduled date already stored for the rule, so re-running with an
/// unchanged rule and no elapsed time inserts nothing.
pub async fn generate_for_rule(
    instances: &InstanceRepository,
    rule: &RecurrenceRule,
    horizon_days: i64,
    today: NaiveDate,
) -> EngineResult<usize> {
    let window_start = match instances.max_scheduled_date(&rule.id).await? {
        Some(latest) => latest + Duration::days(1),
        None => rule.start_date,
    };
    let window_end = rule
        .end_date
        .unwrap_or_else(|| today + Duration::days(horizon_days));

    if window_start > window_end {
        return Ok(0);
    }

    let dates = schedule::compute_occurrences(&rule.frequency, rule.interval, window_start, window_end);

    let batch: Vec<RecurrenceInstance> = dates
        .into_iter()
        .map(|date| RecurrenceInstance {
            id: RecurrenceInstance::generate_id(),
            rule_id: rule.id.clone(),
            scheduled_date: date,
            scheduled_amount: rule.amount,
            status: InstanceStatus::Pending,
            transaction_id: None,
            actual_date: None,
            actual_amount: None,
            notes: None,
            skip_reason: None,
            completed_at: None,
        })
        .collect();

    let inserted = instances.store_batch(&batch).await?;
    info!(
        "Generated {} instances for rule {} ({} to {})",
        inserted, rule.id, window_start, window_end
    );
    Ok(inserted)
}
