//! Forward balance projection: fold signed instance amounts onto a card's
//! current balance.

use std::sync::Arc;

use chrono::Utc;
use shared::{InstanceListRequest, ProjectedEntry, ProjectionRequest, ProjectionResponse};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::storage::sqlite::{InstanceRepository, InstanceRow};
use crate::storage::{CardStore, DbConnection};

#[derive(Clone)]
pub struct ProjectionService {
    instances: InstanceRepository,
    cards: Arc<dyn CardStore>,
}

impl ProjectionService {
    pub fn new(db: DbConnection, cards: Arc<dyn CardStore>) -> Self {
        Self {
            instances: InstanceRepository::new(db),
            cards,
        }
    }

    /// Project a card's balance across its actionable instances in the
    /// requested window.
    pub async fn get_projected_balance(
        &self,
        request: ProjectionRequest,
    ) -> EngineResult<ProjectionResponse> {
        info!(
            "Projecting balance for card {} from {} to {}",
            request.card_id, request.from_date, request.to_date
        );

        if request.to_date < request.from_date {
            return Err(EngineError::Validation(
                "Projection end date must not precede the start date".to_string(),
            ));
        }

        let card = self
            .cards
            .get_owned_card(&request.user_id, &request.card_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("Card not found: {}", request.card_id))
            })?;

        let today = Utc::now().date_naive();
        self.instances.mark_overdue(&request.user_id, today).await?;

        let rows = self
            .instances
            .list_instances(
                &request.user_id,
                &InstanceListRequest {
                    user_id: request.user_id.clone(),
                    card_id: Some(request.card_id.clone()),
                    from_date: Some(request.from_date),
                    to_date: Some(request.to_date),
                    ..Default::default()
                },
                None,
            )
            .await?;
        let actionable: Vec<InstanceRow> = rows
            .into_iter()
            .filter(|row| row.instance.status.is_actionable())
            .collect();

        let entries = project(card.balance, actionable);
        let final_balance = entries
            .last()
            .map(|entry| entry.new_balance)
            .unwrap_or(card.balance);

        Ok(ProjectionResponse {
            card_id: request.card_id,
            current_balance: card.balance,
            entries,
            final_balance,
        })
    }
}

/// Fold instances onto `current_balance` in scheduled-date order,
/// recording the balance before and after each step.
pub fn project(current_balance: f64, mut rows: Vec<InstanceRow>) -> Vec<ProjectedEntry> {
    rows.sort_by(|a, b| {
        a.instance
            .scheduled_date
            .cmp(&b.instance.scheduled_date)
            .then_with(|| a.instance.id.cmp(&b.instance.id))
    });

    let mut running = current_balance;
    rows.into_iter()
        .map(|row| {
            let old_balance = running;
            running += row.direction.signed(row.instance.scheduled_amount);
            ProjectedEntry {
                instance_id: row.instance.id,
                rule_name: row.rule_name,
                date: row.instance.scheduled_date,
                direction: row.direction,
                amount: row.instance.scheduled_amount,
                old_balance,
                new_balance: running,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use shared::{Direction, InstanceStatus, RecurrenceInstance};

    fn date(s: &str) -> NaiveDate {
        s.parse().expect("bad date literal")
    }

    fn row(scheduled: &str, direction: Direction, amount: f64) -> InstanceRow {
        InstanceRow {
            instance: RecurrenceInstance {
                id: RecurrenceInstance::generate_id(),
                rule_id: "rule::test".to_string(),
                scheduled_date: date(scheduled),
                scheduled_amount: amount,
                status: InstanceStatus::Pending,
                transaction_id: None,
                actual_date: None,
                actual_amount: None,
                notes: None,
                skip_reason: None,
                completed_at: None,
            },
            rule_name: "Test rule".to_string(),
            card_id: "card::main".to_string(),
            direction,
        }
    }

    #[test]
    fn test_project_empty_returns_current_balance() {
        let entries = project(250.0, Vec::new());
        assert!(entries.is_empty());
    }

    #[test]
    fn test_project_folds_signed_amounts() {
        let entries = project(
            100.0,
            vec![
                row("2024-03-01", Direction::Out, 40.0),
                row("2024-03-05", Direction::In, 60.0),
                row("2024-03-10", Direction::Out, 10.0),
            ],
        );

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].old_balance, 100.0);
        assert_eq!(entries[0].new_balance, 60.0);
        assert_eq!(entries[1].new_balance, 120.0);
        assert_eq!(entries[2].new_balance, 110.0);

        // Final balance equals start plus the signed sum.
        let signed_sum: f64 = [-40.0, 60.0, -10.0].iter().sum();
        assert_eq!(entries[2].new_balance, 100.0 + signed_sum);
    }

    #[test]
    fn test_project_sorts_by_date_before_folding() {
        let entries = project(
            0.0,
            vec![
                row("2024-03-10", Direction::In, 3.0),
                row("2024-03-01", Direction::In, 1.0),
                row("2024-03-05", Direction::In, 2.0),
            ],
        );

        assert_eq!(entries[0].date, date("2024-03-01"));
        assert_eq!(entries[1].date, date("2024-03-05"));
        assert_eq!(entries[2].date, date("2024-03-10"));
        assert_eq!(entries[2].new_balance, 6.0);
    }
}
