//! Sqlite-backed repositories for the engine's own state and the
//! collaborator seams it consumes.

pub mod card_repository;
pub mod category_repository;
pub mod history_repository;
pub mod instance_repository;
pub mod ledger_repository;
pub mod rule_repository;

pub use card_repository::SqliteCardStore;
pub use category_repository::SqliteCategoryStore;
pub use history_repository::HistoryRepository;
pub use instance_repository::{InstanceRepository, InstanceRow};
pub use ledger_repository::SqliteLedgerStore;
pub use rule_repository::RuleRepository;

use chrono::NaiveDate;
use shared::{Direction, InstanceStatus, RuleStatus};

use crate::error::{EngineError, EngineResult};

pub(crate) fn parse_date(value: &str, column: &str) -> EngineResult<NaiveDate> {
    value.parse().map_err(|_| {
        EngineError::Persistence(format!("invalid date in column {}: {}", column, value))
    })
}

pub(crate) fn parse_direction(value: &str) -> EngineResult<Direction> {
    Direction::parse(value)
        .ok_or_else(|| EngineError::Persistence(format!("invalid direction: {}", value)))
}

pub(crate) fn parse_rule_status(value: &str) -> EngineResult<RuleStatus> {
    RuleStatus::parse(value)
        .ok_or_else(|| EngineError::Persistence(format!("invalid rule status: {}", value)))
}

pub(crate) fn parse_instance_status(value: &str) -> EngineResult<InstanceStatus> {
    InstanceStatus::parse(value)
        .ok_or_else(|| EngineError::Persistence(format!("invalid instance status: {}", value)))
}
