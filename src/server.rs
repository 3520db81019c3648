//! REST surface over the same storage layer the CLI uses.
//!
//! Every handler opens its own connection on a blocking thread, so the
//! server is just another writer process as far as SQLite is concerned.
//! All responses carry permissive CORS headers and every error body is
//! `{"error": "..."}`.

use crate::checkpoint::{self, mirror};
use crate::config::{activity_threshold_ms, mirror_dir};
use crate::error::{Error, ErrorCode, Result};
use crate::model::{AcquireRequest, CheckpointInput, CheckpointQuery, MissionStatus, PruneOptions};
use crate::recovery::{self, RestoreOptions};
use crate::storage::events::{NewEvent, MAILBOX_STREAM};
use crate::storage::{checkpoints, missions, SqliteStorage};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

const SERVER_ACTOR: &str = "api";

/// Shared server state. Only paths; connections are per request.
#[derive(Debug, Clone)]
pub struct AppState {
    db_path: Arc<PathBuf>,
    mirror_root: Arc<PathBuf>,
    activity_threshold_ms: i64,
}

impl AppState {
    /// State for the database at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `FLEET_ACTIVITY_THRESHOLD_MS` is malformed.
    pub fn new(db_path: PathBuf) -> Result<Self> {
        Ok(Self {
            mirror_root: Arc::new(mirror_dir(&db_path)),
            db_path: Arc::new(db_path),
            activity_threshold_ms: activity_threshold_ms()?,
        })
    }

    /// Run `f` against a fresh connection on the blocking pool.
    async fn with_storage<T, F>(&self, f: F) -> std::result::Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteStorage, &std::path::Path) -> Result<T> + Send + 'static,
    {
        let db_path = Arc::clone(&self.db_path);
        let mirror_root = Arc::clone(&self.mirror_root);
        let out = tokio::task::spawn_blocking(move || {
            let mut storage = SqliteStorage::open(&db_path)?;
            f(&mut storage, &mirror_root)
        })
        .await
        .map_err(|e| ApiError(Error::Other(format!("request task failed: {e}"))))??;
        Ok(out)
    }
}

// ==================
// Errors
// ==================

/// `Error` rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code.exit_code() {
        3 => StatusCode::NOT_FOUND,
        4 => StatusCode::BAD_REQUEST,
        5 => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.error_code());
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// ==================
// Router
// ==================

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/mailbox/append", post(append_handler))
        .route("/mailbox/{stream_id}", get(stream_handler))
        .route("/cursor/advance", post(cursor_advance_handler))
        .route("/cursor/{cursor_id}", get(cursor_get_handler))
        .route("/lock/acquire", post(lock_acquire_handler))
        .route("/lock/release", post(lock_release_handler))
        .route("/locks", get(locks_handler))
        .route(
            "/checkpoints",
            get(list_checkpoints_handler).post(create_checkpoint_handler),
        )
        .route("/checkpoints/prune", post(prune_handler))
        .route("/checkpoints/latest/{mission_id}", get(latest_checkpoint_handler))
        .route("/checkpoints/{id}", get(get_checkpoint_handler))
        .route("/checkpoints/{id}/resume", post(resume_handler))
        .route("/missions", get(missions_handler))
        .route("/recovery", get(recovery_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API on `bind` until Ctrl-C.
///
/// # Errors
///
/// Returns an I/O error if the address cannot be bound.
pub async fn serve(db_path: PathBuf, bind: &str) -> Result<()> {
    let state = AppState::new(db_path)?;
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %bind, db = %state.db_path.display(), "Fleet API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Fleet API stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ==================
// Handlers
// ==================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "service": "fleet"}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendBody {
    #[serde(default = "default_stream_type")]
    stream_type: String,
    stream_id: String,
    events: Vec<NewEvent>,
    #[serde(default)]
    expected_head: Option<i64>,
}

fn default_stream_type() -> String {
    MAILBOX_STREAM.to_string()
}

#[derive(Serialize)]
struct AppendResponse {
    positions: Vec<i64>,
}

async fn append_handler(
    State(state): State<AppState>,
    Json(body): Json<AppendBody>,
) -> ApiResult<AppendResponse> {
    let positions = state
        .with_storage(move |storage, _| match body.expected_head {
            Some(head) => storage.append_expecting(
                &body.stream_type,
                &body.stream_id,
                head,
                &body.events,
                now_ms(),
            ),
            None => storage.append(&body.stream_type, &body.stream_id, &body.events, now_ms()),
        })
        .await?;
    Ok(Json(AppendResponse { positions }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamQuery {
    stream_type: Option<String>,
    from: Option<i64>,
}

async fn stream_handler(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    Query(q): Query<StreamQuery>,
) -> ApiResult<serde_json::Value> {
    let stream_type = q.stream_type.unwrap_or_else(default_stream_type);
    let events = state
        .with_storage(move |storage, _| storage.query_by_stream(&stream_type, &stream_id, q.from))
        .await?;
    Ok(Json(serde_json::json!({ "events": events })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorAdvanceBody {
    consumer_id: String,
    stream_id: String,
    position: i64,
}

async fn cursor_advance_handler(
    State(state): State<AppState>,
    Json(body): Json<CursorAdvanceBody>,
) -> ApiResult<crate::storage::events::Cursor> {
    let cursor = state
        .with_storage(move |storage, _| {
            storage.cursor_advance(&body.consumer_id, &body.stream_id, body.position, now_ms())
        })
        .await?;
    Ok(Json(cursor))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorQuery {
    stream_id: String,
}

/// `cursor_id` is the consumer id; the stream comes from `?streamId=`.
async fn cursor_get_handler(
    State(state): State<AppState>,
    Path(cursor_id): Path<String>,
    Query(q): Query<CursorQuery>,
) -> ApiResult<serde_json::Value> {
    let stream_id = q.stream_id;
    let (consumer_id, stream_id, position) = state
        .with_storage(move |storage, _| {
            let position = storage.cursor_get(&cursor_id, &stream_id)?;
            Ok((cursor_id, stream_id, position))
        })
        .await?;
    Ok(Json(serde_json::json!({
        "consumer_id": consumer_id,
        "stream_id": stream_id,
        "position": position,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcquireBody {
    resource: String,
    holder_id: String,
    #[serde(default)]
    timeout_ms: Option<i64>,
    #[serde(default)]
    purpose: Option<String>,
}

/// A held lock is `200 {granted: false, conflict}`, not an error.
async fn lock_acquire_handler(
    State(state): State<AppState>,
    Json(body): Json<AcquireBody>,
) -> ApiResult<crate::model::AcquireOutcome> {
    let outcome = state
        .with_storage(move |storage, _| {
            let timeout_ms = match body.timeout_ms {
                Some(t) => t,
                None => crate::config::default_lock_timeout_ms()?,
            };
            let mut req = AcquireRequest::new(body.resource, body.holder_id, timeout_ms);
            req.purpose = body.purpose;
            storage.acquire_lock(&req, now_ms())
        })
        .await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseBody {
    lock_id: String,
    holder_id: String,
}

async fn lock_release_handler(
    State(state): State<AppState>,
    Json(body): Json<ReleaseBody>,
) -> ApiResult<crate::model::Lock> {
    let lock = state
        .with_storage(move |storage, _| {
            storage.release_lock(&body.lock_id, &body.holder_id, now_ms())
        })
        .await?;
    Ok(Json(lock))
}

async fn locks_handler(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let locks = state
        .with_storage(|storage, _| storage.active_locks(now_ms()))
        .await?;
    Ok(Json(serde_json::json!({ "locks": locks })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListCheckpointsQuery {
    mission_id: Option<String>,
    limit: Option<u32>,
}

async fn list_checkpoints_handler(
    State(state): State<AppState>,
    Query(q): Query<ListCheckpointsQuery>,
) -> ApiResult<serde_json::Value> {
    let query = CheckpointQuery {
        mission_id: q.mission_id,
        limit: q.limit,
    };
    let list = state
        .with_storage(move |storage, _| checkpoints::list(storage.conn(), &query))
        .await?;
    Ok(Json(serde_json::json!({ "checkpoints": list })))
}

async fn create_checkpoint_handler(
    State(state): State<AppState>,
    Json(mut input): Json<CheckpointInput>,
) -> std::result::Result<(StatusCode, Json<crate::model::Checkpoint>), ApiError> {
    if input.created_by.trim().is_empty() {
        input.created_by = SERVER_ACTOR.to_string();
    }
    let cp = state
        .with_storage(move |storage, mirror_root| {
            let actor = input.created_by.clone();
            checkpoint::create(storage, &input, &actor, Some(mirror_root), now_ms())
        })
        .await?;
    Ok((StatusCode::CREATED, Json(cp)))
}

async fn get_checkpoint_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<crate::model::Checkpoint> {
    let cp = state
        .with_storage(move |storage, _| checkpoints::require(storage.conn(), &id))
        .await?;
    Ok(Json(cp))
}

async fn latest_checkpoint_handler(
    State(state): State<AppState>,
    Path(mission_id): Path<String>,
) -> ApiResult<crate::model::Checkpoint> {
    let cp = state
        .with_storage(move |storage, _| {
            checkpoints::get_latest_by_mission(storage.conn(), &mission_id)?
                .ok_or(Error::NoCheckpointForMission { mission_id })
        })
        .await?;
    Ok(Json(cp))
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct ResumeBody {
    force: bool,
    dry_run: bool,
}

/// Runs the restorer. A failed restore is still `200` with `success: false`.
async fn resume_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ResumeBody>>,
) -> ApiResult<serde_json::Value> {
    let Json(body) = body.unwrap_or_default();
    let opts = RestoreOptions {
        dry_run: body.dry_run,
        force_locks: body.force,
    };
    let (result, prompt) = state
        .with_storage(move |storage, mirror_root| {
            let result =
                recovery::restore_from_checkpoint(storage, &id, opts, SERVER_ACTOR, now_ms())?;
            if result.success && !result.dry_run {
                mirror::refresh_or_warn(Some(mirror_root), storage.conn(), &result.mission_id);
            }
            let prompt = recovery::format_recovery_prompt(&result);
            Ok((result, prompt))
        })
        .await?;
    let mut value = serde_json::to_value(&result).map_err(Error::from)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("prompt".into(), serde_json::Value::String(prompt));
    }
    Ok(Json(value))
}

#[derive(Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PruneBody {
    mission_id: Option<String>,
    older_than_days: u32,
    keep: u32,
    dry_run: bool,
}

impl Default for PruneBody {
    fn default() -> Self {
        let defaults = PruneOptions::default();
        Self {
            mission_id: None,
            older_than_days: defaults.older_than_days,
            keep: defaults.keep_per_mission,
            dry_run: true,
        }
    }
}

async fn prune_handler(
    State(state): State<AppState>,
    body: Option<Json<PruneBody>>,
) -> ApiResult<checkpoint::PruneReport> {
    let Json(body) = body.unwrap_or_default();
    let opts = PruneOptions {
        mission_id: body.mission_id,
        older_than_days: body.older_than_days,
        keep_per_mission: body.keep,
    };
    let report = state
        .with_storage(move |storage, mirror_root| {
            checkpoint::prune(storage, &opts, body.dry_run, Some(mirror_root), now_ms())
        })
        .await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct MissionsQuery {
    status: Option<String>,
}

async fn missions_handler(
    State(state): State<AppState>,
    Query(q): Query<MissionsQuery>,
) -> ApiResult<serde_json::Value> {
    let status: Option<MissionStatus> = q.status.as_deref().map(str::parse).transpose()?;
    let list = state
        .with_storage(move |storage, _| missions::list_missions(storage.conn(), status))
        .await?;
    Ok(Json(serde_json::json!({ "missions": list })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecoveryQuery {
    threshold_ms: Option<i64>,
}

async fn recovery_handler(
    State(state): State<AppState>,
    Query(q): Query<RecoveryQuery>,
) -> ApiResult<recovery::Detection> {
    let threshold = q.threshold_ms.unwrap_or(state.activity_threshold_ms);
    let detection = state
        .with_storage(move |storage, _| {
            recovery::detect_recovery_candidates(storage.conn(), threshold, now_ms())
        })
        .await?;
    Ok(Json(detection))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorCode::CheckpointNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorCode::LockNotHeld), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorCode::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorCode::DatabaseError), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_prune_body_defaults_to_dry_run() {
        let body: PruneBody = serde_json::from_str("{}").unwrap();
        assert!(body.dry_run);
        assert_eq!(body.older_than_days, 7);
        assert_eq!(body.keep, 3);
    }

    #[test]
    fn test_append_body_defaults_to_mailbox() {
        let body: AppendBody = serde_json::from_str(
            r#"{"streamId": "agent-1", "events": [{"type": "note", "data": {}}]}"#,
        )
        .unwrap();
        assert_eq!(body.stream_type, MAILBOX_STREAM);
        assert_eq!(body.events[0].event_type, "note");
    }
}
