//! Recurring-transaction engine: rule definitions, instance generation,
//! lifecycle management, and forward balance projection, exposed over a
//! small REST API.

pub mod domain;
pub mod error;
pub mod rest;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;
use axum::{
    http::Method,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub use rest::AppState;

use domain::{InstanceService, ProjectionService, RuleService};
use storage::sqlite::{SqliteCardStore, SqliteCategoryStore, SqliteLedgerStore};
use storage::DbConnection;

/// Initialize the engine with all required services.
pub async fn initialize_backend() -> Result<AppState> {
    info!("Setting up database");
    let db = DbConnection::init().await?;

    info!("Setting up domain services");
    let cards = Arc::new(SqliteCardStore::new(db.clone()));
    let categories = Arc::new(SqliteCategoryStore::new(db.clone()));
    let ledger = Arc::new(SqliteLedgerStore::new(db.clone()));

    let rule_service = RuleService::new(db.clone(), cards.clone(), categories);
    let instance_service = InstanceService::new(db.clone(), cards.clone(), ledger);
    let projection_service = ProjectionService::new(db, cards);

    Ok(AppState::new(
        rule_service,
        instance_service,
        projection_service,
    ))
}

/// Create the Axum router with all routes configured.
pub fn create_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/rules", get(rest::list_rules).post(rest::create_rule))
        .route(
            "/rules/:id",
            get(rest::get_rule)
                .put(rest::update_rule)
                .delete(rest::remove_rule),
        )
        .route("/rules/:id/hard", delete(rest::delete_rule))
        .route("/rules/:id/generate", post(rest::generate_instances))
        .route("/rules/:id/history", get(rest::rule_history))
        .route("/instances", get(rest::list_instances))
        .route("/instances/:id", get(rest::get_instance))
        .route("/instances/:id/complete", post(rest::complete_instance))
        .route(
            "/instances/:id/transaction",
            post(rest::create_transaction_from_instance),
        )
        .route("/instances/:id/skip", post(rest::skip_instance))
        .route("/projection", get(rest::get_projection));

    Router::new()
        .nest("/api", api_routes)
        .layer(cors)
        .with_state(app_state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_router_builds() {
        let db = DbConnection::init_test()
            .await
            .expect("Failed to create test database");
        let cards = Arc::new(SqliteCardStore::new(db.clone()));
        let categories = Arc::new(SqliteCategoryStore::new(db.clone()));
        let ledger = Arc::new(SqliteLedgerStore::new(db.clone()));

        let state = AppState::new(
            RuleService::new(db.clone(), cards.clone(), categories),
            InstanceService::new(db.clone(), cards.clone(), ledger),
            ProjectionService::new(db, cards),
        );
        let _router = create_router(state);
    }
}
