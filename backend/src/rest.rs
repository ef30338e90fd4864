use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use shared::{
    CompleteInstanceRequest, CreateRuleRequest, CreateTransactionFromInstanceRequest,
    GenerateInstancesRequest, InstanceListRequest, InstanceStatus, ProjectionRequest,
    RemoveRuleRequest, RuleListRequest, RuleStatus, SkipInstanceRequest, UpdateRuleRequest,
};
use tracing::{error, info, warn};

use crate::domain::{InstanceService, ProjectionService, RuleService};
use crate::error::EngineError;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub rule_service: RuleService,
    pub instance_service: InstanceService,
    pub projection_service: ProjectionService,
}

impl AppState {
    pub fn new(
        rule_service: RuleService,
        instance_service: InstanceService,
        projection_service: ProjectionService,
    ) -> Self {
        Self {
            rule_service,
            instance_service,
            projection_service,
        }
    }
}

/// Map an engine error onto an HTTP status, logging server-side failures.
fn error_response(err: EngineError) -> Response {
    let status = match &err {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Conflict(_) => StatusCode::CONFLICT,
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Request failed: {}", err);
    } else {
        warn!("Request rejected: {}", err);
    }
    (status, err.to_string()).into_response()
}

/// Query parameters carrying only the requesting user.
#[derive(Deserialize, Debug)]
pub struct UserQuery {
    pub user_id: String,
}

/// Query parameters for the rule list endpoint.
#[derive(Deserialize, Debug)]
pub struct RuleListQuery {
    pub user_id: String,
    pub status: Option<RuleStatus>,
    pub is_active: Option<bool>,
    pub card_id: Option<String>,
    pub frequency: Option<String>,
}

/// Query parameters for rule removal.
#[derive(Deserialize, Debug)]
pub struct RemoveRuleQuery {
    pub user_id: String,
    #[serde(default)]
    pub delete_instances: bool,
    #[serde(default)]
    pub future_only: bool,
    #[serde(default)]
    pub keep_completed: bool,
}

/// Query parameters for the instance list endpoint.
#[derive(Deserialize, Debug)]
pub struct InstanceListQuery {
    pub user_id: String,
    pub status: Option<InstanceStatus>,
    pub card_id: Option<String>,
    pub rule_id: Option<String>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub days_ahead: Option<i64>,
}

/// Query parameters for the balance projection endpoint.
#[derive(Deserialize, Debug)]
pub struct ProjectionQuery {
    pub user_id: String,
    pub card_id: String,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
}

/// Axum handler for GET /api/rules
pub async fn list_rules(
    State(state): State<AppState>,
    Query(query): Query<RuleListQuery>,
) -> impl IntoResponse {
    info!("GET /api/rules - query: {:?}", query);

    let request = RuleListRequest {
        user_id: query.user_id,
        status: query.status,
        is_active: query.is_active,
        card_id: query.card_id,
        frequency: query.frequency,
    };

    match state.rule_service.list_rules(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Axum handler for POST /api/rules
pub async fn create_rule(
    State(state): State<AppState>,
    Json(request): Json<CreateRuleRequest>,
) -> impl IntoResponse {
    info!("POST /api/rules - rule: {}", request.definition.name);

    match state.rule_service.create_rule(request).await {
        Ok(response) => (StatusCode::CREATED, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Axum handler for GET /api/rules/:id
pub async fn get_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> impl IntoResponse {
    info!("GET /api/rules/{}", rule_id);

    match state.rule_service.get_rule(&query.user_id, &rule_id).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Axum handler for PUT /api/rules/:id
pub async fn update_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    Json(request): Json<UpdateRuleRequest>,
) -> impl IntoResponse {
    info!("PUT /api/rules/{}", rule_id);

    match state.rule_service.update_rule(&rule_id, request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Axum handler for DELETE /api/rules/:id (soft cancel with options)
pub async fn remove_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    Query(query): Query<RemoveRuleQuery>,
) -> impl IntoResponse {
    info!("DELETE /api/rules/{} - query: {:?}", rule_id, query);

    let options = RemoveRuleRequest {
        delete_instances: query.delete_instances,
        future_only: query.future_only,
        keep_completed: query.keep_completed,
    };

    match state
        .rule_service
        .remove_rule(&query.user_id, &rule_id, options)
        .await
    {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Axum handler for DELETE /api/rules/:id/hard
pub async fn delete_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> impl IntoResponse {
    info!("DELETE /api/rules/{}/hard", rule_id);

    match state
        .rule_service
        .delete_rule(&query.user_id, &rule_id)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

/// Axum handler for POST /api/rules/:id/generate
pub async fn generate_instances(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    Json(request): Json<GenerateInstancesRequest>,
) -> impl IntoResponse {
    info!("POST /api/rules/{}/generate", rule_id);

    match state
        .rule_service
        .generate_instances(&rule_id, request)
        .await
    {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Axum handler for GET /api/rules/:id/history
pub async fn rule_history(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> impl IntoResponse {
    info!("GET /api/rules/{}/history", rule_id);

    match state
        .rule_service
        .rule_history(&query.user_id, &rule_id)
        .await
    {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Axum handler for GET /api/instances
pub async fn list_instances(
    State(state): State<AppState>,
    Query(query): Query<InstanceListQuery>,
) -> impl IntoResponse {
    info!("GET /api/instances - query: {:?}", query);

    let request = InstanceListRequest {
        user_id: query.user_id,
        status: query.status,
        card_id: query.card_id,
        rule_id: query.rule_id,
        from_date: query.from_date,
        to_date: query.to_date,
        days_ahead: query.days_ahead,
    };

    match state.instance_service.list_instances(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Axum handler for GET /api/instances/:id
pub async fn get_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> impl IntoResponse {
    info!("GET /api/instances/{}", instance_id);

    match state
        .instance_service
        .get_instance(&query.user_id, &instance_id)
        .await
    {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Axum handler for POST /api/instances/:id/complete
pub async fn complete_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(request): Json<CompleteInstanceRequest>,
) -> impl IntoResponse {
    info!("POST /api/instances/{}/complete", instance_id);

    match state
        .instance_service
        .complete_instance(&instance_id, request)
        .await
    {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Axum handler for POST /api/instances/:id/transaction
pub async fn create_transaction_from_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(request): Json<CreateTransactionFromInstanceRequest>,
) -> impl IntoResponse {
    info!("POST /api/instances/{}/transaction", instance_id);

    match state
        .instance_service
        .create_transaction_from_instance(&instance_id, request)
        .await
    {
        Ok(response) => (StatusCode::CREATED, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Axum handler for POST /api/instances/:id/skip
pub async fn skip_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(request): Json<SkipInstanceRequest>,
) -> impl IntoResponse {
    info!("POST /api/instances/{}/skip", instance_id);

    match state
        .instance_service
        .skip_instance(&instance_id, request)
        .await
    {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Axum handler for GET /api/projection
pub async fn get_projection(
    State(state): State<AppState>,
    Query(query): Query<ProjectionQuery>,
) -> impl IntoResponse {
    info!("GET /api/projection - query: {:?}", query);

    let request = ProjectionRequest {
        user_id: query.user_id,
        card_id: query.card_id,
        from_date: query.from_date,
        to_date: query.to_date,
    };

    match state.projection_service.get_projected_balance(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}
