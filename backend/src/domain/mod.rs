//! Domain services for the recurrence engine: pure date math, instance
//! generation, rule and instance lifecycles, and balance projection.

pub mod generator;
pub mod instance_service;
pub mod projection;
pub mod rule_service;
pub mod schedule;

pub use instance_service::InstanceService;
pub use projection::ProjectionService;
pub use rule_service::RuleService;
