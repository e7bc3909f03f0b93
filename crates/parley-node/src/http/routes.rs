// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Request/response surface for operations that do not fit the stream:
//! conversations, documents, tabular bindings and queries, settings, usage.
//!
//! Every handler resolves the authenticated user from the request extension
//! placed there by the auth middleware; the storage gateway re-checks the
//! scope on every query regardless.
use axum::{
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use tower_http::cors::CorsLayer;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use parley_core::{BudgetGovernor, ErrorCode};
use parley_retrieval::RetrievalError;
use parley_store::StoreError;
use parley_tabular::TabularError;

use crate::{http::ws::ws_handler, state::AppState};

/// The authenticated user, inserted by [`require_auth`].
#[derive(Clone)]
pub struct AuthedUser(pub String);

/// Structured API error carrying a stable code.
#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    fn status(&self) -> StatusCode {
        match self.code {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::BudgetExceeded => StatusCode::PAYMENT_REQUIRED,
            ErrorCode::Validation | ErrorCode::TabularUnsafe => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::UpstreamUnavailable | ErrorCode::TabularExecution => {
                StatusCode::BAD_GATEWAY
            }
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "code": self.code, "message": self.message }));
        (self.status(), body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Self::new(ErrorCode::NotFound, "not found"),
            StoreError::Conflict(_) => Self::new(ErrorCode::Conflict, "conflicting update"),
            StoreError::ScopeViolation => Self::new(ErrorCode::Validation, "missing user scope"),
            other => {
                error!(error = %other, "storage failure");
                Self::new(ErrorCode::Internal, "something went wrong")
            }
        }
    }
}

impl From<RetrievalError> for ApiError {
    fn from(e: RetrievalError) -> Self {
        match e {
            RetrievalError::EmptyDocument => {
                Self::new(ErrorCode::Validation, "the upload contains no extractable text")
            }
            RetrievalError::Embedding(_) => {
                Self::new(ErrorCode::UpstreamUnavailable, "embedding provider unavailable")
            }
            RetrievalError::Store(e) => e.into(),
        }
    }
}

impl From<TabularError> for ApiError {
    fn from(e: TabularError) -> Self {
        match &e {
            TabularError::GenerationInvalid(_) | TabularError::ValidationRejected(_) => {
                Self::new(ErrorCode::TabularUnsafe, e.to_string())
            }
            TabularError::ExecutionTimeout | TabularError::Execution(_) => {
                Self::new(ErrorCode::TabularExecution, e.to_string())
            }
            TabularError::Connection(_) => {
                Self::new(ErrorCode::TabularExecution, "database connection failed")
            }
            TabularError::Provider(_) => {
                Self::new(ErrorCode::UpstreamUnavailable, "model provider unavailable")
            }
            TabularError::Store(se) => match se {
                StoreError::NotFound => Self::new(ErrorCode::NotFound, "not found"),
                _ => Self::new(ErrorCode::Internal, "something went wrong"),
            },
        }
    }
}

/// Bearer-auth middleware for the REST surface.
async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let bearer = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::new(ErrorCode::Unauthorized, "missing credential"))?
        .to_string();
    let user_id = state
        .identity
        .verify(&bearer)
        .await
        .map_err(|_| ApiError::new(ErrorCode::Unauthorized, "invalid credential"))?;
    req.extensions_mut().insert(AuthedUser(user_id));
    Ok(next.run(req).await)
}

/// Assemble the full router: the WebSocket endpoint plus the REST surface.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/conversations", post(create_conversation).get(list_conversations))
        .route("/conversations/:id", get(get_conversation).delete(delete_conversation))
        .route("/conversations/:id/messages", get(list_messages))
        .route("/documents", post(upload_document).get(list_documents))
        .route("/documents/:id", get(get_document).delete(delete_document))
        .route("/bindings", post(create_binding).get(list_bindings))
        .route("/bindings/:id", delete(delete_binding))
        .route("/bindings/:id/test", post(test_binding))
        .route("/bindings/:id/query", post(tabular_query))
        .route("/bindings/:id/generate", post(tabular_generate))
        .route("/bindings/:id/validate", post(tabular_validate))
        .route("/bindings/:id/explain", post(tabular_explain))
        .route("/settings", get(get_settings).put(update_settings))
        .route("/usage", get(get_usage))
        .route("/research/:id", get(get_research_job))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/ws", get(ws_handler))
        .nest("/api/v1", api)
        .layer(axum::extract::DefaultBodyLimit::max(state.max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Conversations ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateConversationBody {
    title: Option<String>,
}

async fn create_conversation(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Json(body): Json<CreateConversationBody>,
) -> Result<impl IntoResponse, ApiError> {
    let conv = state.store.create_conversation(&user, body.title.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(conv)))
}

#[derive(Deserialize)]
struct ListConversationsQuery {
    /// Caller's wall clock; listing buckets are computed against it.
    now: Option<DateTime<Utc>>,
}

async fn list_conversations(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Query(q): Query<ListConversationsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let listed = state.store.list_conversations(&user, q.now.unwrap_or_else(Utc::now)).await?;
    Ok(Json(listed))
}

async fn get_conversation(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.get_conversation(&user, id).await?))
}

async fn delete_conversation(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.delete_conversation(&user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ListMessagesQuery {
    limit: Option<usize>,
}

async fn list_messages(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Path(id): Path<Uuid>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let msgs = state.store.last_messages(&user, id, q.limit.unwrap_or(50)).await?;
    Ok(Json(msgs))
}

// ── Documents ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct UploadQuery {
    filename: String,
}

async fn upload_document(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Query(q): Query<UploadQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if body.len() > state.max_upload_bytes {
        return Err(ApiError::new(ErrorCode::Validation, "upload too large"));
    }
    let outcome = state.ingestor.ingest_bytes(&user, &q.filename, &body).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "document_id": outcome.document.id,
            "status": outcome.document.status,
            "dedup": outcome.deduplicated,
        })),
    ))
}

async fn list_documents(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_documents(&user).await?))
}

async fn get_document(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.get_document(&user, id).await?))
}

async fn delete_document(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.delete_document(&user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Tabular bindings and queries ──────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateBindingBody {
    display_name: String,
    engine_tag: String,
    credential: String,
}

async fn create_binding(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Json(body): Json<CreateBindingBody>,
) -> Result<impl IntoResponse, ApiError> {
    let binding = state
        .tabular
        .register_binding(&user, &body.display_name, &body.engine_tag, &body.credential)
        .await?;
    Ok((StatusCode::CREATED, Json(binding)))
}

async fn list_bindings(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list_bindings(&user).await?))
}

async fn test_binding(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.tabular.refresh_binding(&user, id).await?))
}

async fn delete_binding(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.delete_binding(&user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct QuestionBody {
    question: String,
}

#[derive(Deserialize)]
struct SqlBody {
    sql: String,
}

async fn model_tag_for(state: &AppState, user: &str) -> Result<String, ApiError> {
    let settings = state.store.get_settings(user).await?;
    Ok(settings.default_model_tag.unwrap_or_else(|| state.default_model_tag.clone()))
}

async fn tabular_query(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Path(id): Path<Uuid>,
    Json(body): Json<QuestionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let tag = model_tag_for(&state, &user).await?;
    let answer = state.tabular.answer(&user, id, &body.question, "", &tag).await?;
    Ok(Json(json!({
        "generated_sql": answer.generated_sql,
        "columns": answer.columns,
        "rows": answer.rows,
        "row_count": answer.row_count,
        "wall_ms": answer.wall_ms,
    })))
}

async fn tabular_generate(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Path(id): Path<Uuid>,
    Json(body): Json<QuestionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let tag = model_tag_for(&state, &user).await?;
    let generated = state.tabular.generate(&user, id, &body.question, "", &tag).await?;
    Ok(Json(json!({ "generated_sql": generated.sql })))
}

async fn tabular_validate(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Path(id): Path<Uuid>,
    Json(body): Json<SqlBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.tabular.validate(&user, id, &body.sql).await?;
    Ok(Json(json!({ "valid": true })))
}

async fn tabular_explain(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Path(id): Path<Uuid>,
    Json(body): Json<SqlBody>,
) -> Result<impl IntoResponse, ApiError> {
    let tag = model_tag_for(&state, &user).await?;
    let (explanation, _) = state.tabular.explain(&user, id, &body.sql, &tag).await?;
    Ok(Json(json!({ "explanation": explanation })))
}

// ── Settings and usage ────────────────────────────────────────────────────────

async fn get_settings(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.get_settings(&user).await?))
}

#[derive(Deserialize)]
struct SettingsBody {
    default_model_tag: Option<String>,
    per_agent_overrides: Option<serde_json::Value>,
    monthly_budget: Option<i64>,
}

async fn update_settings(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Json(body): Json<SettingsBody>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(budget) = body.monthly_budget {
        if budget < 0 {
            return Err(ApiError::new(ErrorCode::Validation, "monthly_budget must be ≥ 0"));
        }
    }
    // Partial update: absent fields keep their stored value.
    let mut settings = state.store.get_settings(&user).await?;
    if body.default_model_tag.is_some() {
        settings.default_model_tag = body.default_model_tag;
    }
    if let Some(overrides) = body.per_agent_overrides {
        settings.per_agent_overrides = overrides;
    }
    if body.monthly_budget.is_some() {
        settings.monthly_budget = body.monthly_budget;
    }
    state.store.update_settings(&user, &settings).await?;
    Ok(Json(settings))
}

#[derive(Deserialize)]
struct UsageQuery {
    month: Option<String>,
}

async fn get_usage(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Query(q): Query<UsageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let month = q.month.unwrap_or_else(|| BudgetGovernor::month_key(Utc::now()));
    let record = state.store.usage_record(&user, &month).await?;
    let settings = state.store.get_settings(&user).await?;
    Ok(Json(json!({
        "month": month,
        "usage": record,
        "monthly_budget": settings.monthly_budget,
    })))
}

// ── Research ──────────────────────────────────────────────────────────────────

async fn get_research_job(
    State(state): State<AppState>,
    Extension(AuthedUser(user)): Extension<AuthedUser>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.store.get_research_job(&user, id).await?;
    let sections = state.store.job_sections(&user, id).await?;
    let sources = state.store.job_sources(&user, id).await?;
    Ok(Json(json!({ "job": job, "sections": sections, "sources": sources })))
}
