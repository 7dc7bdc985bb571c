pub mod auth;
mod config;
mod policy;
pub mod recovery;

use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue};
use axum::middleware;
use axum::response::Response as AxumResponse;
use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::{Method, StatusCode, header},
    routing::{get, patch, post},
};
use bcrypt::verify;
pub use config::AppConfig;
use famtask_shared::api;
use famtask_shared::domain::{self, FamilyRole, TaskKind, TaskStatus};
use recovery::{LogMailer, Mailer, RecoveryCodes};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info_span;
use uuid::Uuid;

use crate::storage::{StorageError, TaskChanges, TaskInput, models};

use self::auth::AuthCtx;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: crate::storage::Store,
    recovery: RecoveryCodes,
    mailer: Arc<dyn Mailer>,
    // Sweep invocations are mutually exclusive; see api_tasks_sweep.
    sweep_lock: Arc<Mutex<()>>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: AppConfig, store: crate::storage::Store) -> Self {
        Self {
            config,
            store,
            recovery: RecoveryCodes::new(),
            mailer: Arc::new(LogMailer),
            sweep_lock: Arc::new(Mutex::new(())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[derive(Clone, Debug)]
struct ReqId(pub String);

pub fn router(state: AppState) -> Router {
    let private = Router::new()
        .route("/api/v1/auth/logout", post(api_auth_logout))
        .route("/api/v1/families", post(api_family_create))
        .route("/api/v1/families/join", post(api_family_join))
        .route("/api/v1/families/leave", post(api_family_leave))
        .route("/api/v1/families/mine", get(api_family_mine))
        .route(
            "/api/v1/families/members/{user_id}/promote",
            post(api_member_promote),
        )
        .route(
            "/api/v1/families/rewards",
            get(api_rewards_get).put(api_rewards_put),
        )
        .route("/api/v1/tasks", get(api_tasks_list).post(api_task_create))
        .route("/api/v1/tasks/sweep", post(api_tasks_sweep))
        .route(
            "/api/v1/tasks/{id}",
            patch(api_task_patch).delete(api_task_delete),
        )
        .route("/api/v1/tasks/{id}/status", post(api_task_status))
        .route("/api/v1/members/{user_id}/allowance", get(api_member_balance))
        .route(
            "/api/v1/members/{user_id}/allowance/entries",
            get(api_member_allowance_entries),
        )
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    // Trace with request context (method, path, request_id)
    let trace = TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
        let request_id = req
            .extensions()
            .get::<ReqId>()
            .map(|r| r.0.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        info_span!(
            "request",
            method = %req.method(),
            path = %req.uri().path(),
            request_id = %request_id,
            username = tracing::field::Empty
        )
    });

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/api/v1/auth/register", post(api_auth_register))
        .route("/api/v1/auth/login", post(api_auth_login))
        .route("/api/v1/auth/recover", post(api_auth_recover))
        .route("/api/v1/auth/reset", post(api_auth_reset))
        .merge(private)
        .with_state(state.clone())
        .layer(trace)
        .layer(middleware::from_fn(add_security_headers))
        .layer(middleware::from_fn(add_request_id));

    // Optionally add CORS for dev if configured

    if let Some(origin) = &state.config.dev_cors_origin {
        let hv = header::HeaderValue::from_str(origin)
            .unwrap_or(header::HeaderValue::from_static("http://localhost:5173"));
        let cors = CorsLayer::new()
            .allow_origin(hv)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);
        app.layer(cors)
    } else {
        app
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn add_request_id(
    mut req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    let hdr = HeaderName::from_static("x-request-id");
    // Use provided x-request-id if present, else generate
    let rid = req
        .headers()
        .get(&hdr)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    // Put into request extensions for trace layer & handlers
    req.extensions_mut().insert(ReqId(rid.clone()));
    // Call next
    let mut resp = next.run(req).await;
    // Set header on response
    if let Ok(hv) = HeaderValue::from_str(&rid) {
        resp.headers_mut().insert(hdr, hv);
    }
    Ok(resp)
}

async fn add_security_headers(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<AxumResponse, AppError> {
    let path = req.uri().path().to_string();
    let mut resp = next.run(req).await;

    // General security headers for all responses
    let headers = resp.headers_mut();
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("SAMEORIGIN"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
    // HSTS is only honored on HTTPS; harmless otherwise
    headers.insert(
        HeaderName::from_static("strict-transport-security"),
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );

    // Disable caching for API and health endpoints
    if path == "/healthz" || path.starts_with("/api/") {
        headers.insert(
            HeaderName::from_static("cache-control"),
            HeaderValue::from_static("no-store, no-cache, must-revalidate, private"),
        );
        headers.insert(
            HeaderName::from_static("pragma"),
            HeaderValue::from_static("no-cache"),
        );
    }

    Ok(resp)
}

// Auth handlers

async fn api_auth_register(
    State(state): State<AppState>,
    Json(body): Json<api::RegisterReq>,
) -> Result<Json<api::AuthResp>, AppError> {
    let username = body.username.trim();
    let email = body.email.trim();
    if username.is_empty() || email.is_empty() || body.password.is_empty() {
        return Err(AppError::bad_request(
            "username, email and password are required",
        ));
    }
    let display_name = if body.display_name.trim().is_empty() {
        username
    } else {
        body.display_name.trim()
    };
    let hash = bcrypt::hash(&body.password, bcrypt::DEFAULT_COST).map_err(AppError::internal)?;
    let user = state
        .store
        .create_user(username, display_name, email, &hash)
        .await?;
    let token = auth::issue_jwt_for_user(&state, &user).await?;
    Ok(Json(api::AuthResp { token }))
}

async fn api_auth_login(
    State(state): State<AppState>,
    Json(body): Json<api::AuthReq>,
) -> Result<Json<api::AuthResp>, AppError> {
    let user = state
        .store
        .find_user_by_username(&body.username)
        .await?
        .ok_or_else(|| {
            tracing::warn!(username=%body.username, "login: unknown username");
            AppError::unauthorized()
        })?;
    if !verify(&body.password, &user.password_hash).map_err(|e| {
        tracing::error!(username=%body.username, error=%e, "login: bcrypt verify failed");
        AppError::internal(e)
    })? {
        tracing::warn!(username=%body.username, "login: invalid password");
        return Err(AppError::unauthorized());
    }
    let token = auth::issue_jwt_for_user(&state, &user).await?;
    Ok(Json(api::AuthResp { token }))
}

async fn api_auth_logout(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
) -> Result<Json<api::OkResp>, AppError> {
    state.store.delete_session(&auth.jti).await?;
    Ok(Json(api::OkResp { ok: true }))
}

async fn api_auth_recover(
    State(state): State<AppState>,
    Json(body): Json<api::RecoverReq>,
) -> Result<Json<api::OkResp>, AppError> {
    // Always answer ok so the endpoint cannot be used to probe for
    // registered addresses.
    if let Some(user) = state.store.find_user_by_email(body.email.trim()).await? {
        let code = state.recovery.issue(user.id).await;
        state.mailer.send(
            &user.email,
            "Password recovery code",
            &format!("<p>Your recovery code is <b>{}</b>.</p>", code),
        );
    }
    Ok(Json(api::OkResp { ok: true }))
}

async fn api_auth_reset(
    State(state): State<AppState>,
    Json(body): Json<api::ResetReq>,
) -> Result<Json<api::OkResp>, AppError> {
    if body.new_password.is_empty() {
        return Err(AppError::bad_request("new password is required"));
    }
    let user = state
        .store
        .find_user_by_email(body.email.trim())
        .await?
        .ok_or_else(AppError::unauthorized)?;
    if !state.recovery.consume(user.id, body.code.trim()).await {
        tracing::warn!(username=%user.username, "reset: invalid or expired recovery code");
        return Err(AppError::unauthorized());
    }
    let hash =
        bcrypt::hash(&body.new_password, bcrypt::DEFAULT_COST).map_err(AppError::internal)?;
    state.store.set_password_hash(user.id, &hash).await?;
    Ok(Json(api::OkResp { ok: true }))
}

// Family handlers

async fn family_dto(
    state: &AppState,
    family: models::Family,
) -> Result<api::FamilyDto, AppError> {
    let members = state.store.list_members(family.id).await?;
    let members = members
        .into_iter()
        .map(|(m, u)| {
            let role: FamilyRole = m.role.parse().map_err(AppError::internal)?;
            Ok(api::MemberDto {
                user_id: u.id,
                username: u.username,
                display_name: u.display_name,
                role,
            })
        })
        .collect::<Result<Vec<_>, AppError>>()?;
    Ok(api::FamilyDto {
        id: family.id,
        name: family.name,
        join_code: family.join_code,
        members,
    })
}

async fn api_family_create(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Json(body): Json<api::CreateFamilyReq>,
) -> Result<Json<api::FamilyDto>, AppError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("family name is required"));
    }
    let family = state.store.create_family(auth.user_id, name).await?;
    Ok(Json(family_dto(&state, family).await?))
}

async fn api_family_join(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Json(body): Json<api::JoinFamilyReq>,
) -> Result<Json<api::FamilyDto>, AppError> {
    if body.code.trim().is_empty() {
        return Err(AppError::bad_request("join code is required"));
    }
    let family = state.store.join_family(auth.user_id, &body.code).await?;
    Ok(Json(family_dto(&state, family).await?))
}

async fn api_family_mine(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
) -> Result<Json<api::FamilyDto>, AppError> {
    let (family, _) = policy::require_member(&state, &auth).await?;
    Ok(Json(family_dto(&state, family).await?))
}

async fn api_family_leave(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
) -> Result<Json<api::LeaveFamilyResp>, AppError> {
    let family_deleted = state.store.leave_family(auth.user_id).await?;
    Ok(Json(api::LeaveFamilyResp { family_deleted }))
}

async fn api_member_promote(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(user_id): Path<i32>,
) -> Result<Json<api::OkResp>, AppError> {
    state.store.transfer_admin(auth.user_id, user_id).await?;
    Ok(Json(api::OkResp { ok: true }))
}

async fn api_rewards_get(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
) -> Result<Json<Vec<api::RewardValueDto>>, AppError> {
    let (family, _) = policy::require_member(&state, &auth).await?;
    let rows = state.store.reward_table(family.id).await?;
    Ok(Json(reward_table_dto(rows)?))
}

async fn api_rewards_put(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Json(body): Json<Vec<api::RewardValueDto>>,
) -> Result<Json<Vec<api::RewardValueDto>>, AppError> {
    let (family, _) = policy::require_admin(&state, &auth).await?;
    if body.is_empty() {
        return Err(AppError::bad_request("at least one reward value is required"));
    }
    let mut pairs = Vec::with_capacity(body.len());
    for entry in &body {
        if entry.value_cents <= 0 {
            return Err(AppError::bad_request("reward values must be positive"));
        }
        if pairs.iter().any(|(p, _)| *p == entry.priority) {
            return Err(AppError::bad_request(format!(
                "duplicate priority: {}",
                entry.priority
            )));
        }
        pairs.push((entry.priority, entry.value_cents));
    }
    state.store.set_reward_values(family.id, pairs).await?;
    let rows = state.store.reward_table(family.id).await?;
    Ok(Json(reward_table_dto(rows)?))
}

fn reward_table_dto(rows: Vec<models::RewardValue>) -> Result<Vec<api::RewardValueDto>, AppError> {
    rows.into_iter()
        .map(|r| {
            Ok(api::RewardValueDto {
                priority: r.priority.parse().map_err(AppError::internal)?,
                value_cents: r.value_cents,
            })
        })
        .collect()
}

// Task handlers

fn task_dto_with_name(
    task: models::Task,
    member_name: Option<String>,
) -> Result<api::TaskDto, AppError> {
    Ok(api::TaskDto {
        id: task.id,
        family_id: task.family_id,
        member_id: task.member_id,
        member_name,
        for_all: task.for_all,
        title: task.title,
        description: task.description,
        priority: task.priority.parse().map_err(AppError::internal)?,
        status: task.status.parse().map_err(AppError::internal)?,
        kind: task.kind.parse().map_err(AppError::internal)?,
        date_start: task.date_start,
        date_end: task.date_end,
        days: task.days,
        completed_at: task.completed_at.map(|dt| {
            chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(dt, chrono::Utc)
                .to_rfc3339()
        }),
    })
}

async fn task_dto(state: &AppState, task: models::Task) -> Result<api::TaskDto, AppError> {
    let member_name = match task.member_id {
        Some(uid) => state.store.get_user(uid).await?.map(|u| u.display_name),
        None => None,
    };
    task_dto_with_name(task, member_name)
}

async fn api_tasks_list(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
) -> Result<Json<Vec<api::TaskDto>>, AppError> {
    let (family, _) = policy::require_member(&state, &auth).await?;
    let rows = state.store.list_tasks(family.id).await?;
    let items = rows
        .into_iter()
        .map(|(task, name)| task_dto_with_name(task, name))
        .collect::<Result<Vec<_>, AppError>>()?;
    Ok(Json(items))
}

async fn api_task_create(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Json(body): Json<api::CreateTaskReq>,
) -> Result<Json<api::TaskDto>, AppError> {
    let (family, membership) = policy::require_member(&state, &auth).await?;
    let title = body.title.trim();
    if title.is_empty() {
        return Err(AppError::bad_request("task title is required"));
    }

    let is_admin = membership.role == FamilyRole::Admin.as_str();
    if !is_admin {
        // Plain members may only create one-off tasks for themselves.
        if body.member_id != Some(auth.user_id) {
            tracing::warn!(username=%auth.username, "create task: member may only self-assign");
            return Err(AppError::forbidden());
        }
        if body.kind != TaskKind::Pontual {
            tracing::warn!(username=%auth.username, "create task: member may only create pontual tasks");
            return Err(AppError::forbidden());
        }
    }

    if let Some(assignee) = body.member_id
        && assignee != auth.user_id
    {
        match state.store.membership(assignee).await? {
            Some((assignee_family, _)) if assignee_family.id == family.id => {}
            _ => {
                return Err(AppError::not_found(format!(
                    "member not in family: {}",
                    assignee
                )));
            }
        }
    }

    let days = domain::day_span(body.date_start, body.date_end)
        .map_err(|e| AppError::bad_request(e.to_string()))?;

    let task = state
        .store
        .insert_task(TaskInput {
            family_id: family.id,
            member_id: body.member_id,
            title: title.to_string(),
            description: body.description.trim().to_string(),
            priority: body.priority,
            kind: body.kind,
            date_start: body.date_start,
            date_end: body.date_end,
            days,
        })
        .await?;
    Ok(Json(task_dto(&state, task).await?))
}

async fn api_task_status(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(id): Path<i32>,
    Json(body): Json<api::UpdateTaskStatusReq>,
) -> Result<Json<api::TaskDto>, AppError> {
    let (family, _) = policy::require_member(&state, &auth).await?;
    let status: TaskStatus = body
        .status
        .parse()
        .map_err(|e: domain::UnknownValue| AppError::bad_request(e.to_string()))?;
    let task = state
        .store
        .update_task_status(id, auth.user_id, family.id, status)
        .await?;
    Ok(Json(task_dto(&state, task).await?))
}

async fn api_task_patch(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(id): Path<i32>,
    Json(body): Json<api::TaskPatchReq>,
) -> Result<Json<api::TaskDto>, AppError> {
    let (family, _) = policy::require_admin(&state, &auth).await?;
    if let api::FieldUpdate::Set(title) = &body.title
        && title.trim().is_empty()
    {
        return Err(AppError::bad_request("task title cannot be empty"));
    }
    let changes = TaskChanges {
        title: body.title,
        description: body.description,
        priority: body.priority,
        status: body.status,
        kind: body.kind,
        member: body.member,
        date_start: body.date_start,
        date_end: body.date_end,
    };
    let task = state.store.patch_task(id, family.id, changes).await?;
    Ok(Json(task_dto(&state, task).await?))
}

async fn api_task_delete(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(id): Path<i32>,
) -> Result<Json<api::OkResp>, AppError> {
    let (family, _) = policy::require_admin(&state, &auth).await?;
    state.store.delete_task(id, family.id).await?;
    Ok(Json(api::OkResp { ok: true }))
}

async fn api_tasks_sweep(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
) -> Result<Json<api::SweepResp>, AppError> {
    let (family, _) = policy::require_member(&state, &auth).await?;
    // Single-flight: a second sweep triggered while one is running
    // waits instead of racing it.
    let _guard = state.sweep_lock.lock().await;
    let today = state.config.today();
    let flagged = state
        .store
        .expire_stale_daily_tasks(Some(family.id), today)
        .await?;
    Ok(Json(api::SweepResp { flagged }))
}

// Allowance handlers

#[derive(Deserialize)]
struct PageOpts {
    page: Option<usize>,
    per_page: Option<usize>,
}

async fn api_member_balance(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(user_id): Path<i32>,
) -> Result<Json<api::BalanceDto>, AppError> {
    policy::require_same_family(&state, &auth, user_id).await?;
    let balance_cents = state.store.balance_for_member(user_id).await?;
    Ok(Json(api::BalanceDto {
        member_id: user_id,
        balance_cents,
    }))
}

async fn api_member_allowance_entries(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthCtx>,
    Path(user_id): Path<i32>,
    Query(opts): Query<PageOpts>,
) -> Result<Json<Vec<api::LedgerEntryDto>>, AppError> {
    policy::require_same_family(&state, &auth, user_id).await?;
    let page = opts.page.unwrap_or(1);
    let per_page = opts.per_page.unwrap_or(10);
    let rows = state
        .store
        .list_allowance_entries(user_id, page, per_page)
        .await?;
    let items = rows
        .into_iter()
        .map(|(entry, task_title)| api::LedgerEntryDto {
            time: chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(
                entry.created_at,
                chrono::Utc,
            )
            .to_rfc3339(),
            task_id: entry.task_id,
            task_title: Some(task_title),
            value_cents: entry.value_cents,
        })
        .collect();
    Ok(Json(items))
}

// Errors

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized,
    Forbidden,
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl AppError {
    fn bad_request<T: Into<String>>(msg: T) -> Self {
        Self::BadRequest(msg.into())
    }
    fn unauthorized() -> Self {
        Self::Unauthorized
    }
    fn forbidden() -> Self {
        Self::Forbidden
    }
    fn not_found<T: Into<String>>(msg: T) -> Self {
        Self::NotFound(msg.into())
    }
    fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::InvalidInput(m) => AppError::BadRequest(m),
            StorageError::NotFound(m) => AppError::NotFound(m),
            StorageError::Conflict(m) => AppError::Conflict(m),
            StorageError::Forbidden(m) => {
                tracing::warn!(reason = %m, "storage: denied");
                AppError::Forbidden
            }
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, kind, detail) = match self {
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m, "bad_request", None),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized".into(),
                "unauthorized",
                None,
            ),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "forbidden".into(), "forbidden", None),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m, "not_found", None),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m, "conflict", None),
            // Do not leak internal error details to clients, but log them
            AppError::Internal(m) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".into(),
                "internal",
                Some(m),
            ),
        };
        // Log any error responses at ERROR level for troubleshooting
        if let Some(detail) = detail {
            tracing::error!(status = %status, kind = kind, message = %msg, detail = %detail, "request failed");
        } else {
            tracing::error!(status = %status, kind = kind, message = %msg, "request failed");
        }
        let body = axum::Json(ErrorBody { error: msg });
        (status, body).into_response()
    }
}
