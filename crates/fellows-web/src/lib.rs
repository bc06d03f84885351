//! Axum JSON API over the fellowship pipeline.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fellows_core::{distribute_fairly, Category, Opportunity, PipelineError};
use fellows_pipeline::Pipeline;
use fellows_storage::CatalogError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "fellows-web";

/// Header the upstream auth layer uses to carry the caller identity.
pub const IDENTITY_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(pipeline: Pipeline, admin_token: Option<String>) -> Self {
        Self {
            pipeline,
            admin_token,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct CatalogQuery {
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryBody {
    query: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

/// Failure mapped onto an HTTP status and the `{error, message}` body.
#[derive(Debug)]
pub enum ApiError {
    Pipeline(PipelineError),
    Conflict(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError::Pipeline(err)
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::DuplicateId(_) => ApiError::Conflict(err.to_string()),
            other => ApiError::Pipeline(other.into()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Pipeline(PipelineError::Validation(rejection.body_text()))
    }
}

pub fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::Unauthorized => StatusCode::UNAUTHORIZED,
        PipelineError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        PipelineError::NoResults => StatusCode::NOT_FOUND,
        PipelineError::NoContent => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::UpstreamFailure(_) | PipelineError::MalformedOutput(_) => {
            StatusCode::BAD_GATEWAY
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Pipeline(err) => (status_for(err), err.code(), err.to_string()),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, "conflict", message.clone()),
        };
        if status.is_server_error() {
            warn!(%status, code, %message, "request failed");
        }
        (status, Json(ErrorBody { error: code, message })).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/opportunities", get(opportunities_handler))
        .route("/api/opportunities/{id}", get(opportunity_detail_handler))
        .route("/api/match", post(match_handler))
        .route("/api/admin/search-extract", post(search_extract_handler))
        .route("/api/admin/opportunities", post(create_opportunity_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let (pipeline, config) = fellows_pipeline::pipeline_from_env().await?;
    if config.admin_token.is_none() {
        warn!("FELLOWS_ADMIN_TOKEN unset; admin routes will reject every request");
    }
    let sweeper =
        fellows_storage::maybe_build_sweeper(pipeline.counters.clone(), &config.counter_sweep).await?;
    if let Some(sched) = &sweeper {
        sched.start().await.context("starting counter sweep scheduler")?;
        info!(cron = %config.counter_sweep.cron, "counter sweep scheduled");
    }
    serve(AppState::new(pipeline, config.admin_token), config.web_port).await
}

fn caller_identity(headers: &HeaderMap) -> Option<&str> {
    headers.get(IDENTITY_HEADER).and_then(|v| v.to_str().ok())
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match (state.admin_token.as_deref(), presented) {
        (Some(expected), Some(presented)) if expected == presented => Ok(()),
        _ => Err(PipelineError::Unauthorized.into()),
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn opportunities_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CatalogQuery>,
) -> Result<Json<Vec<Opportunity>>, ApiError> {
    let category = query
        .category
        .as_deref()
        .filter(|c| !c.is_empty())
        .map(Category::from_str)
        .transpose()?;

    let catalog = state.pipeline.catalog.list().await?;
    let filtered = catalog
        .into_iter()
        .filter(|o| category.map_or(true, |c| o.category == c))
        .collect::<Vec<_>>();
    Ok(Json(distribute_fairly(filtered)))
}

async fn opportunity_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.pipeline.catalog.get(&id).await {
        Ok(Some(opportunity)) => Json(opportunity).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: "not_found",
                message: format!("no opportunity `{id}`"),
            }),
        )
            .into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

async fn match_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<QueryBody>, JsonRejection>,
) -> Result<Json<JsonValue>, ApiError> {
    let identity = caller_identity(&headers);
    let Json(body) = body?;
    let recommendations = state.pipeline.matcher.recommend(identity, &body.query).await?;
    Ok(Json(serde_json::json!({ "recommendations": recommendations })))
}

async fn search_extract_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<QueryBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers)?;
    let Json(body) = body?;
    let assisted = state.pipeline.assistant.assist(&body.query).await?;
    Ok(Json(assisted).into_response())
}

async fn create_opportunity_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<JsonValue>, JsonRejection>,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers)?;
    let Json(body) = body?;
    let opportunity: Opportunity = serde_json::from_value(body)
        .map_err(|e| PipelineError::Validation(format!("invalid opportunity: {e}")))?;
    opportunity.validate()?;

    let catalog = &state.pipeline.catalog;
    if catalog.exists(&opportunity.id).await? {
        return Err(CatalogError::DuplicateId(opportunity.id).into());
    }
    catalog.insert(&opportunity).await?;
    info!(id = %opportunity.id, "opportunity created");
    Ok((StatusCode::CREATED, Json(opportunity)).into_response())
}
