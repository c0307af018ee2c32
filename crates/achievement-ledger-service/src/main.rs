use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use achievement_ledger_core::{
    AchievementError, AchievementPatch, AchievementStatistics, AchievementStatus, AchievementView,
    Actor, AttachmentBlobStore, AuditEntry, ConsistencyReport, DocumentId, NewAchievement, Page,
    PageRequest, RequestScope, StudentId, StudentStatistics,
};
use achievement_ledger_engine::LifecycleEngine;
use achievement_ledger_store_sqlite::{
    LedgerStores, StoreConfig, DEFAULT_STORE_TIMEOUT_MS, MAX_STORE_TIMEOUT_MS,
};
use anyhow::Result;
use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "achievement.v1";
const CREDENTIAL_HEADER: &str = "x-actor-credential";

#[derive(Clone)]
struct ServiceState {
    engine: LifecycleEngine,
    blobs: Arc<dyn AttachmentBlobStore>,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    retryable: bool,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ListQuery {
    page: Option<i64>,
    page_size: Option<i64>,
    status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AttachmentQuery {
    file_name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RejectRequest {
    note: String,
}

#[derive(Debug, Clone, Serialize)]
struct DeleteResponse {
    document_id: DocumentId,
    deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    missing_credential_total: AtomicU64,
    validation_error_total: AtomicU64,
    not_found_total: AtomicU64,
    forbidden_total: AtomicU64,
    invalid_state_total: AtomicU64,
    store_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    missing_credential_total: u64,
    validation_error_total: u64,
    not_found_total: u64,
    forbidden_total: u64,
    invalid_state_total: u64,
    store_unavailable_total: u64,
    internal_error_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "achievement-ledger-service")]
#[command(about = "HTTP service for the student achievement ledger")]
struct Args {
    #[arg(
        long,
        env = "ACHIEVEMENT_DOCUMENT_DB",
        default_value = "./achievement_documents.sqlite3"
    )]
    document_db: PathBuf,
    #[arg(
        long,
        env = "ACHIEVEMENT_REFERENCE_DB",
        default_value = "./achievement_references.sqlite3"
    )]
    reference_db: PathBuf,
    #[arg(long, env = "ACHIEVEMENT_UPLOAD_DIR", default_value = "./uploads")]
    upload_dir: PathBuf,
    #[arg(long, env = "ACHIEVEMENT_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(
        long,
        env = "ACHIEVEMENT_STORE_TIMEOUT_MS",
        default_value_t = DEFAULT_STORE_TIMEOUT_MS,
        value_parser = clap::value_parser!(u64).range(1..=MAX_STORE_TIMEOUT_MS)
    )]
    store_timeout_ms: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                retryable: self.retryable,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            retryable: false,
            details,
        }
    }

    fn from_engine_error(err: &AchievementError) -> ServiceFailure {
        let status = match err {
            AchievementError::Validation(_) => StatusCode::BAD_REQUEST,
            AchievementError::NotFound(_) => StatusCode::NOT_FOUND,
            AchievementError::Forbidden(_) => StatusCode::FORBIDDEN,
            AchievementError::InvalidState(_) => StatusCode::CONFLICT,
            AchievementError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        ServiceFailure {
            status,
            code: err.code(),
            message: err.to_string(),
            retryable: err.is_retryable(),
            details: None,
        }
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_query_with_telemetry(&self, rejection: &QueryRejection) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        Self::failure(
            StatusCode::BAD_REQUEST,
            "validation_error",
            rejection.body_text(),
            None,
        )
    }

    /// Opaque credential from the request header; the engine resolves it.
    fn credential(&self, headers: &HeaderMap) -> Result<String, ServiceFailure> {
        let value = headers
            .get(CREDENTIAL_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        match value {
            Some(credential) => Ok(credential.to_string()),
            None => {
                self.telemetry.record_failure("missing_credential", false);
                Err(Self::failure(
                    StatusCode::UNAUTHORIZED,
                    "missing_credential",
                    format!("{CREDENTIAL_HEADER} header MUST be provided"),
                    None,
                ))
            }
        }
    }

    /// Resolves the actor and runs `op` on a blocking thread under a fresh
    /// request scope. When the deadline elapses first the scope is cancelled,
    /// so the engine issues no further store calls.
    async fn run_engine<T, F>(
        &self,
        operation_label: &'static str,
        credential: String,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(&LifecycleEngine, &RequestScope, &Actor) -> Result<T, AchievementError>
            + Send
            + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let engine = self.engine.clone();
        let scope = RequestScope::with_timeout(self.operation_timeout);
        let request_scope = scope.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let actor = engine.resolve_actor(&scope, &credential)?;
            op(&engine, &scope, &actor)
        });

        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                request_scope.cancel();
                self.telemetry.record_failure("store_unavailable", true);
                tracing::warn!(
                    operation = operation_label,
                    timeout_ms = self.timeout_ms(),
                    "request deadline elapsed; scope cancelled"
                );
                ServiceFailure {
                    retryable: true,
                    ..Self::failure(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "store_unavailable",
                        format!(
                            "{operation_label} timed out after {} ms",
                            self.timeout_ms()
                        ),
                        Some(json!({ "timeout_ms": self.timeout_ms() })),
                    )
                }
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::from_engine_error(&err);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "invalid_json" => &self.invalid_json_total,
            "missing_credential" => &self.missing_credential_total,
            "validation_error" => &self.validation_error_total,
            "not_found" => &self.not_found_total,
            "forbidden" => &self.forbidden_total,
            "invalid_state" => &self.invalid_state_total,
            "store_unavailable" => &self.store_unavailable_total,
            _ => &self.internal_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            missing_credential_total: self.missing_credential_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            forbidden_total: self.forbidden_total.load(Ordering::Relaxed),
            invalid_state_total: self.invalid_state_total.load(Ordering::Relaxed),
            store_unavailable_total: self.store_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route(
            "/v1/achievements",
            get(list_achievements).post(create_achievement),
        )
        .route(
            "/v1/achievements/:id",
            get(get_achievement)
                .put(update_achievement)
                .delete(delete_achievement),
        )
        .route("/v1/achievements/:id/submit", post(submit_achievement))
        .route("/v1/achievements/:id/verify", post(verify_achievement))
        .route("/v1/achievements/:id/reject", post(reject_achievement))
        .route("/v1/achievements/:id/history", get(achievement_history))
        .route("/v1/achievements/:id/attachments", post(upload_attachment))
        .route("/v1/reports/statistics", get(report_statistics))
        .route("/v1/reports/students/:id", get(report_student))
        .route("/v1/consistency", get(consistency_check))
        .with_state(state)
}

fn build_state(config: &StoreConfig) -> Result<ServiceState> {
    let stores = LedgerStores::open(config)?;
    let engine = LifecycleEngine::new(
        Arc::new(stores.documents),
        Arc::new(stores.relational.references()),
        Arc::new(stores.relational.audit_log()),
        Arc::new(stores.relational.directory()),
    );
    Ok(ServiceState {
        engine,
        blobs: Arc::new(stores.attachments),
        operation_timeout: config.store_timeout,
        telemetry: Arc::new(ServiceTelemetry::default()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "achievement_ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = StoreConfig::new(
        args.document_db,
        args.reference_db,
        args.upload_dir,
        Duration::from_millis(args.store_timeout_ms),
    );
    let state = build_state(&config)?;
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "achievement ledger service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms: state.timeout_ms(),
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn list_achievements(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<Page<AchievementView>>>, ServiceFailure> {
    let credential = state.credential(&headers)?;
    let Query(query) = query.map_err(|rejection| state.invalid_query_with_telemetry(&rejection))?;
    let page = state
        .run_engine("list", credential, move |engine, scope, actor| {
            let status = query
                .status
                .as_deref()
                .map(|raw| {
                    AchievementStatus::parse(raw).ok_or_else(|| {
                        AchievementError::Validation(format!("unknown status `{raw}`"))
                    })
                })
                .transpose()?;
            let request = PageRequest::new(query.page.unwrap_or(1), query.page_size.unwrap_or(0));
            engine.list(scope, actor, request, status)
        })
        .await?;
    Ok(Json(envelope(page)))
}

async fn create_achievement(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<NewAchievement>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<AchievementView>>, ServiceFailure> {
    let credential = state.credential(&headers)?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let view = state
        .run_engine("create", credential, move |engine, scope, actor| {
            engine.create(scope, actor, request)
        })
        .await?;
    Ok(Json(envelope(view)))
}

async fn get_achievement(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<AchievementView>>, ServiceFailure> {
    let credential = state.credential(&headers)?;
    let view = state
        .run_engine("get", credential, move |engine, scope, actor| {
            engine.get(scope, actor, &DocumentId::new(id))
        })
        .await?;
    Ok(Json(envelope(view)))
}

async fn update_achievement(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    payload: Result<Json<AchievementPatch>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<AchievementView>>, ServiceFailure> {
    let credential = state.credential(&headers)?;
    let Json(patch) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let view = state
        .run_engine("update", credential, move |engine, scope, actor| {
            engine.update(scope, actor, &DocumentId::new(id), patch)
        })
        .await?;
    Ok(Json(envelope(view)))
}

async fn delete_achievement(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<DeleteResponse>>, ServiceFailure> {
    let credential = state.credential(&headers)?;
    let document_id = DocumentId::new(id);
    let target = document_id.clone();
    state
        .run_engine("delete", credential, move |engine, scope, actor| {
            engine.delete(scope, actor, &target)
        })
        .await?;
    Ok(Json(envelope(DeleteResponse {
        document_id,
        deleted: true,
    })))
}

async fn submit_achievement(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<AchievementView>>, ServiceFailure> {
    let credential = state.credential(&headers)?;
    let view = state
        .run_engine("submit", credential, move |engine, scope, actor| {
            engine.submit(scope, actor, &DocumentId::new(id))
        })
        .await?;
    Ok(Json(envelope(view)))
}

async fn verify_achievement(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<AchievementView>>, ServiceFailure> {
    let credential = state.credential(&headers)?;
    let view = state
        .run_engine("verify", credential, move |engine, scope, actor| {
            engine.verify(scope, actor, &DocumentId::new(id))
        })
        .await?;
    Ok(Json(envelope(view)))
}

async fn reject_achievement(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    payload: Result<Json<RejectRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<AchievementView>>, ServiceFailure> {
    let credential = state.credential(&headers)?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let view = state
        .run_engine("reject", credential, move |engine, scope, actor| {
            engine.reject(scope, actor, &DocumentId::new(id), &request.note)
        })
        .await?;
    Ok(Json(envelope(view)))
}

async fn achievement_history(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<AuditEntry>>>, ServiceFailure> {
    let credential = state.credential(&headers)?;
    let history = state
        .run_engine("history", credential, move |engine, scope, actor| {
            engine.history(scope, actor, &DocumentId::new(id))
        })
        .await?;
    Ok(Json(envelope(history)))
}

async fn upload_attachment(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    query: Result<Query<AttachmentQuery>, QueryRejection>,
    body: Bytes,
) -> Result<Json<ServiceEnvelope<AchievementView>>, ServiceFailure> {
    let credential = state.credential(&headers)?;
    let Query(query) = query.map_err(|rejection| state.invalid_query_with_telemetry(&rejection))?;
    let blobs = Arc::clone(&state.blobs);
    let view = state
        .run_engine("attach file", credential, move |engine, scope, actor| {
            engine.upload_attachment(
                scope,
                actor,
                &DocumentId::new(id),
                &query.file_name,
                &body,
                blobs.as_ref(),
            )
        })
        .await?;
    Ok(Json(envelope(view)))
}

async fn report_statistics(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<AchievementStatistics>>, ServiceFailure> {
    let credential = state.credential(&headers)?;
    let statistics = state
        .run_engine("statistics", credential, |engine, scope, actor| {
            engine.statistics(scope, actor)
        })
        .await?;
    Ok(Json(envelope(statistics)))
}

async fn report_student(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<StudentStatistics>>, ServiceFailure> {
    let credential = state.credential(&headers)?;
    let statistics = state
        .run_engine("student statistics", credential, move |engine, scope, actor| {
            let student_id = StudentId::parse(&id)?;
            engine.student_statistics(scope, actor, student_id)
        })
        .await?;
    Ok(Json(envelope(statistics)))
}

async fn consistency_check(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<ConsistencyReport>>, ServiceFailure> {
    let credential = state.credential(&headers)?;
    let report = state
        .run_engine("consistency check", credential, |engine, scope, actor| {
            engine.consistency_check(scope, actor)
        })
        .await?;
    Ok(Json(envelope(report)))
}
