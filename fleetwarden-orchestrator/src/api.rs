use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use fleetwarden_common::FleetError;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::actions::{self, OperatorAction};
use crate::fleet::{Fleet, RegisterInstance};
use crate::heartbeat::{self, HeartbeatReport};

/// HTTP face of [`FleetError`].
pub struct ApiError(pub FleetError);

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        ApiError(e)
    }
}

pub fn status_for(err: &FleetError) -> StatusCode {
    match err {
        FleetError::NotFound(_) => StatusCode::NOT_FOUND,
        FleetError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        FleetError::PolicyViolation(_) => StatusCode::FORBIDDEN,
        FleetError::ConcurrentSession(_) => StatusCode::CONFLICT,
        FleetError::PermanentProvider(_) => StatusCode::UNPROCESSABLE_ENTITY,
        FleetError::TransientProvider(_) => StatusCode::SERVICE_UNAVAILABLE,
        FleetError::StaleData(_) | FleetError::Cancelled(_) | FleetError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::warn!("⚠️ [api] {}", self.0);
        }
        (
            status,
            Json(json!({ "error": self.0.code(), "message": self.0.to_string() })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(fleet: Arc<Fleet>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/internal/heartbeat", post(ingest_heartbeat))
        .route("/fleet/status", get(fleet_status))
        .route("/instances", post(register_instance))
        .route("/instances/{id}", get(get_instance).delete(delete_instance))
        .route("/instances/{id}/pause", post(pause_instance))
        .route("/instances/{id}/resume", post(resume_instance))
        .route("/instances/{id}/keepalive", post(keepalive))
        .route("/instances/{id}/sync", post(sync_now))
        .route("/instances/{id}/standby", post(request_standby).delete(teardown_standby))
        .route("/failover/sessions", get(list_sessions))
        .route("/failover/{id}/cancel", post(cancel_failover))
        .route("/reliability/{provider}/{machine}", get(reliability))
        .route("/admin/policy/reload", post(reload_policy))
        .route("/internal/test/simulate-failover/{id}", post(simulate_failover))
        .fallback(not_found)
        .with_state(fleet)
}

async fn root() -> &'static str {
    "FleetWarden Orchestrator Online"
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not_found" })))
}

async fn ingest_heartbeat(
    State(fleet): State<Arc<Fleet>>,
    Json(report): Json<HeartbeatReport>,
) -> ApiResult<impl IntoResponse> {
    let ack = heartbeat::ingest(&fleet, report, Utc::now()).await?;
    Ok(Json(ack))
}

async fn fleet_status(State(fleet): State<Arc<Fleet>>) -> impl IntoResponse {
    Json(fleet.status(Utc::now()).await)
}

async fn register_instance(
    State(fleet): State<Arc<Fleet>>,
    Json(req): Json<RegisterInstance>,
) -> ApiResult<impl IntoResponse> {
    let instance = fleet.register(req).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

async fn get_instance(State(fleet): State<Arc<Fleet>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    let (instance, tracking) = fleet
        .roster
        .get_with_tracking(id)
        .await
        .ok_or_else(|| FleetError::NotFound(format!("instance {}", id)))?;
    Ok(Json(json!({
        "instance": instance,
        "last_state": tracking.last_state,
        "last_action": tracking.last_action,
        "keepalive_until": tracking.keepalive_until,
        "standby": fleet.standby.get(id).await,
        "active_failover": fleet.failover.active_session(id),
    })))
}

#[derive(Deserialize, Default)]
struct DeleteParams {
    #[serde(default)]
    keep_standby: bool,
}

async fn delete_instance(
    State(fleet): State<Arc<Fleet>>,
    Path(id): Path<Uuid>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<impl IntoResponse> {
    let changed = actions::run_operator_action(
        &fleet,
        id,
        OperatorAction::Delete {
            keep_standby: params.keep_standby,
        },
    )
    .await?;
    Ok(Json(json!({ "status": "ok", "changed": changed })))
}

async fn pause_instance(State(fleet): State<Arc<Fleet>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    let changed = actions::run_operator_action(&fleet, id, OperatorAction::Pause).await?;
    Ok(Json(json!({ "status": "ok", "changed": changed })))
}

async fn resume_instance(State(fleet): State<Arc<Fleet>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    let changed = actions::run_operator_action(&fleet, id, OperatorAction::Resume).await?;
    Ok(Json(json!({ "status": "ok", "changed": changed })))
}

#[derive(Deserialize)]
struct KeepAliveRequest {
    minutes: i64,
}

async fn keepalive(
    State(fleet): State<Arc<Fleet>>,
    Path(id): Path<Uuid>,
    Json(req): Json<KeepAliveRequest>,
) -> ApiResult<impl IntoResponse> {
    let until = fleet.keepalive(id, req.minutes).await?;
    Ok(Json(json!({ "instance_id": id, "keepalive_until": until })))
}

async fn sync_now(State(fleet): State<Arc<Fleet>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    let result = fleet.sync.sync_now(id).await?;
    Ok(Json(result))
}

async fn request_standby(State(fleet): State<Arc<Fleet>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    let assoc = fleet.request_standby(id).await?;
    Ok((StatusCode::CREATED, Json(assoc)))
}

async fn teardown_standby(State(fleet): State<Arc<Fleet>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    fleet.sync.cancel(id);
    let assoc = fleet
        .standby
        .teardown_for(id, "operator request")
        .await?
        .ok_or_else(|| FleetError::NotFound(format!("no standby for {}", id)))?;
    Ok(Json(assoc))
}

async fn list_sessions(State(fleet): State<Arc<Fleet>>) -> impl IntoResponse {
    Json(fleet.failover.sessions())
}

#[derive(Deserialize, Default)]
struct CancelRequest {
    reason: Option<String>,
}

/// `id` may be the primary's id or the session's id. The body is optional.
async fn cancel_failover(
    State(fleet): State<Arc<Fleet>>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let req: CancelRequest = if body.is_empty() {
        CancelRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| FleetError::InvalidRequest(format!("cancel body: {}", e)))?
    };
    let reason = req.reason.unwrap_or_else(|| "operator cancelled".to_string());
    let session_id = fleet.failover.cancel(id, &reason)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "cancelling", "session_id": session_id })),
    ))
}

async fn reliability(
    State(fleet): State<Arc<Fleet>>,
    Path((provider, machine)): Path<(String, String)>,
) -> impl IntoResponse {
    let score = fleet.ledger.score(&provider, &machine).await;
    let blacklisted = fleet.ledger.is_blacklisted(&provider, &machine).await;
    let records = fleet.ledger.records(&provider, &machine).await;
    Json(json!({
        "provider": provider,
        "machine_id": machine,
        "score": score,
        "blacklisted": blacklisted,
        "records": records,
    }))
}

async fn reload_policy(State(fleet): State<Arc<Fleet>>) -> ApiResult<impl IntoResponse> {
    let policy = fleet.reload_policy()?;
    Ok(Json(json!({ "status": "reloaded", "policy": policy.as_ref() })))
}

/// Test-only synthetic `gpu_lost`. Hidden unless ENABLE_TEST_ENDPOINTS=true.
async fn simulate_failover(State(fleet): State<Arc<Fleet>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    if !fleet.settings.enable_test_endpoints {
        return Err(FleetError::NotFound("not found".to_string()).into());
    }
    tracing::warn!(instance_id = %id, "🧪 [api] synthetic gpu_lost injected");
    let session_id = fleet.failover.simulate_gpu_lost(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "started", "session_id": session_id, "synthetic": true })),
    ))
}
