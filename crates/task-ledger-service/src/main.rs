use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use task_ledger_api::{
    ledger_error, DeleteTaskResult, MigrateResult, ReviseTaskRequest, SetCurrentRevisionRequest,
    SetStatusRequest, TaskLedgerApi, UpsertEntryRequest, UpsertEntryResult, API_CONTRACT_VERSION,
};
use task_ledger_core::{
    parse_date, Actor, LedgerError, RequirementEntry, RequirementId, Role, TaskDayStatus,
    TaskDetails, TaskDraft, TaskFilter, TaskId, TaskSkeleton, TaskSnapshot, TaskSummary, UserId,
};
use task_ledger_store_sqlite::SchemaStatus;
use time::Date;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const USER_ID_HEADER: &str = "x-user-id";
const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone)]
struct ServiceState {
    api: TaskLedgerApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    code: &'static str,
    error: String,
    #[serde(skip)]
    status: StatusCode,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ListTasksQuery {
    #[serde(default)]
    active: bool,
    #[serde(default)]
    archived: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AsOfQuery {
    as_of: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct EntryRangeQuery {
    start: String,
    end: String,
}

#[derive(Debug, Parser)]
#[command(name = "task-ledger-service")]
#[command(about = "Local HTTP service for the task ledger")]
struct Args {
    #[arg(long, default_value = "./task_ledger.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long = "request-timeout-ms", default_value_t = 5_000)]
    request_timeout_ms: u64,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            code,
            error: message.into(),
            status,
        }
    }

    fn from_api(err: &anyhow::Error) -> Self {
        let Some(kind) = ledger_error(err) else {
            let message = format!("{err:#}");
            warn!(error = %message, "request failed");
            return Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message);
        };
        let status = match kind {
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::Forbidden(_) => StatusCode::FORBIDDEN,
            LedgerError::InvalidOperation(_) | LedgerError::Duplicate(_) => StatusCode::CONFLICT,
            LedgerError::Validation(_)
            | LedgerError::Eval(_)
            | LedgerError::UnsupportedDataType(_) => StatusCode::UNPROCESSABLE_ENTITY,
            LedgerError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            LedgerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, kind.code(), kind.to_string())
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Identity is asserted by the fronting proxy; this service only reads it.
fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, ServiceError> {
    let unauthenticated = |message: String| {
        ServiceError::new(StatusCode::UNAUTHORIZED, "unauthenticated", message)
    };

    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| unauthenticated(format!("missing {USER_ID_HEADER} header")))?;
    let user_id = user_id
        .trim()
        .parse::<i64>()
        .map_err(|err| unauthenticated(format!("invalid {USER_ID_HEADER} header: {err}")))?;

    let role = match headers.get(USER_ROLE_HEADER).and_then(|value| value.to_str().ok()) {
        None => Role::User,
        Some(raw) => Role::parse(raw)
            .ok_or_else(|| unauthenticated(format!("invalid {USER_ROLE_HEADER} header: {raw}")))?,
    };

    Ok(Actor::new(UserId(user_id), role))
}

fn date_param(name: &str, raw: &str) -> Result<Date, ServiceError> {
    parse_date(raw).map_err(|err| {
        ServiceError::new(StatusCode::UNPROCESSABLE_ENTITY, err.code(), format!("{name}: {err}"))
    })
}

/// Run one API call on the blocking pool under the configured request budget.
async fn blocking<T, F>(
    state: &ServiceState,
    call: F,
) -> Result<Json<ServiceEnvelope<T>>, ServiceError>
where
    T: Serialize + Send + 'static,
    F: FnOnce(&TaskLedgerApi) -> Result<T> + Send + 'static,
{
    let api = state.api.clone();
    let budget = api.request_timeout();
    let task = tokio::task::spawn_blocking(move || call(&api));

    match tokio::time::timeout(budget, task).await {
        Ok(Ok(Ok(data))) => Ok(Json(envelope(data))),
        Ok(Ok(Err(err))) => Err(ServiceError::from_api(&err)),
        Ok(Err(join_err)) => Err(ServiceError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            format!("request task failed: {join_err}"),
        )),
        Err(_) => Err(ServiceError::new(
            StatusCode::GATEWAY_TIMEOUT,
            "deadline_exceeded",
            format!("request exceeded {} ms", budget.as_millis()),
        )),
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/tasks", post(task_create).get(task_list))
        .route("/v1/tasks/:task_id", get(task_show).delete(task_delete))
        .route("/v1/tasks/:task_id/revisions", get(task_revisions).post(task_revise))
        .route("/v1/tasks/:task_id/current-revision", post(task_set_current))
        .route("/v1/tasks/:task_id/status", post(task_set_status))
        .route("/v1/tasks/:task_id/days/:date", get(task_day))
        .route("/v1/requirements/:requirement_id/entries", post(entry_upsert).get(entry_list))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let api = TaskLedgerApi::new(args.db.clone())
        .with_request_timeout(Duration::from_millis(args.request_timeout_ms));
    let state = ServiceState { api };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, db = %args.db.display(), "task ledger service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    blocking(&state, TaskLedgerApi::schema_status).await
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    blocking(&state, move |api| api.migrate(request.dry_run)).await
}

async fn task_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(draft): Json<TaskDraft>,
) -> Result<(StatusCode, Json<ServiceEnvelope<TaskDetails>>), ServiceError> {
    let actor = actor_from_headers(&headers)?;
    let created = blocking(&state, move |api| api.create_task(&actor, &draft)).await?;
    Ok((StatusCode::CREATED, created))
}

async fn task_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<ServiceEnvelope<Vec<TaskSummary>>>, ServiceError> {
    let actor = actor_from_headers(&headers)?;
    let filter = TaskFilter { active: query.active, archived: query.archived };
    blocking(&state, move |api| api.list_tasks(&actor, filter)).await
}

async fn task_show(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(task_id): Path<i64>,
    Query(query): Query<AsOfQuery>,
) -> Result<Json<ServiceEnvelope<TaskDetails>>, ServiceError> {
    let actor = actor_from_headers(&headers)?;
    let as_of = query.as_of.as_deref().map(|raw| date_param("as_of", raw)).transpose()?;
    blocking(&state, move |api| api.get_task(&actor, TaskId(task_id), as_of)).await
}

async fn task_delete(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(task_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<DeleteTaskResult>>, ServiceError> {
    let actor = actor_from_headers(&headers)?;
    blocking(&state, move |api| api.delete_task(&actor, TaskId(task_id))).await
}

async fn task_revisions(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(task_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<Vec<TaskSnapshot>>>, ServiceError> {
    let actor = actor_from_headers(&headers)?;
    blocking(&state, move |api| api.list_revisions(&actor, TaskId(task_id))).await
}

async fn task_revise(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(task_id): Path<i64>,
    Json(request): Json<ReviseTaskRequest>,
) -> Result<(StatusCode, Json<ServiceEnvelope<TaskDetails>>), ServiceError> {
    let actor = actor_from_headers(&headers)?;
    let revised =
        blocking(&state, move |api| api.revise_task(&actor, TaskId(task_id), &request)).await?;
    Ok((StatusCode::CREATED, revised))
}

async fn task_set_current(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(task_id): Path<i64>,
    Json(request): Json<SetCurrentRevisionRequest>,
) -> Result<Json<ServiceEnvelope<TaskSnapshot>>, ServiceError> {
    let actor = actor_from_headers(&headers)?;
    blocking(&state, move |api| api.set_current_revision(&actor, TaskId(task_id), request)).await
}

async fn task_set_status(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(task_id): Path<i64>,
    Json(request): Json<SetStatusRequest>,
) -> Result<Json<ServiceEnvelope<TaskSkeleton>>, ServiceError> {
    let actor = actor_from_headers(&headers)?;
    blocking(&state, move |api| api.set_task_status(&actor, TaskId(task_id), request)).await
}

async fn task_day(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path((task_id, date)): Path<(i64, String)>,
) -> Result<Json<ServiceEnvelope<TaskDayStatus>>, ServiceError> {
    let actor = actor_from_headers(&headers)?;
    let date = date_param("date", &date)?;
    blocking(&state, move |api| api.task_day_status(&actor, TaskId(task_id), date)).await
}

async fn entry_upsert(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(requirement_id): Path<i64>,
    Json(request): Json<UpsertEntryRequest>,
) -> Result<Json<ServiceEnvelope<UpsertEntryResult>>, ServiceError> {
    let actor = actor_from_headers(&headers)?;
    blocking(&state, move |api| api.upsert_entry(&actor, RequirementId(requirement_id), request))
        .await
}

async fn entry_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(requirement_id): Path<i64>,
    Query(query): Query<EntryRangeQuery>,
) -> Result<Json<ServiceEnvelope<Vec<RequirementEntry>>>, ServiceError> {
    let actor = actor_from_headers(&headers)?;
    let start = date_param("start", &query.start)?;
    let end = date_param("end", &query.end)?;
    blocking(&state, move |api| api.list_entries(&actor, RequirementId(requirement_id), start, end))
        .await
}
