//! JSON HTTP surface.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::adapter::Command;
use crate::controller::{LoadOrigin, PlayerController};
use crate::error::{AdapterError, ControllerError, ScheduleError, StoreError};
use crate::media::MediaFile;
use crate::playlist::{Playlist, PlaylistInput, PlaylistStore, UpsertOutcome};
use crate::schedule::{Conflict, Schedule, ScheduleInput, ScheduleStore, ScheduleView};
use crate::scheduler::ScheduleEngine;
use crate::status::{PlaybackStatus, StatusCache};

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub controller: Arc<PlayerController>,
    pub cache: Arc<StatusCache>,
    pub engine: Arc<ScheduleEngine>,
    pub schedules: ScheduleStore,
    pub playlists: PlaylistStore,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/ping", get(ping))
        .route("/api/v1/player/command", post(player_command))
        .route("/api/v1/player/status", get(player_status))
        .route("/api/v1/player/backend", get(backend_get).post(backend_set))
        .route("/api/v1/schedules", get(schedules_list).post(schedules_create))
        .route(
            "/api/v1/schedules/:id",
            get(schedules_get).put(schedules_update).delete(schedules_delete),
        )
        .route("/api/v1/schedules/:id/toggle", post(schedules_toggle))
        .route("/api/v1/schedules/engine", get(schedules_engine))
        .route("/api/v1/playlists", get(playlists_list).post(playlists_upsert))
        .route("/api/v1/playlists/:name", get(playlists_get).delete(playlists_delete))
        .route("/api/v1/playlists/:name/rename", post(playlists_rename))
        .route("/api/v1/media", get(media_list))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// --- Errors ---------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    /// Overlapping schedules behind a refused schedule write.
    conflicts: Option<Vec<Conflict>>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into(), conflicts: None }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!("api: {} {}", self.status, self.message);
        }
        let mut body = json!({ "success": false, "message": self.message });
        if let Some(conflicts) = self.conflicts {
            body["conflicts"] = json!(conflicts);
        }
        (self.status, Json(body)).into_response()
    }
}

fn adapter_status(e: &AdapterError) -> StatusCode {
    match e {
        AdapterError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        AdapterError::Unsupported { .. } => StatusCode::BAD_REQUEST,
        AdapterError::Unreachable(_) | AdapterError::MalformedResponse(_) | AdapterError::Rejected(_) => {
            StatusCode::BAD_GATEWAY
        }
    }
}

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::AlreadyExists(_) | StoreError::Referenced { .. } => StatusCode::CONFLICT,
        StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
        StoreError::Sqlite(_) | StoreError::Encoding(_) | StoreError::Join(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<ControllerError> for ApiError {
    fn from(e: ControllerError) -> Self {
        let status = match &e {
            ControllerError::AlreadySwitching => StatusCode::CONFLICT,
            ControllerError::UnknownBackend(_) | ControllerError::EmptyPlaylist(_) => StatusCode::BAD_REQUEST,
            ControllerError::PlaylistNotFound(_) | ControllerError::MediaNotFound(_) => StatusCode::NOT_FOUND,
            ControllerError::Adapter(a) => adapter_status(a),
            ControllerError::Store(s) => store_status(s),
        };
        Self::new(status, e.to_string())
    }
}

impl From<ScheduleError> for ApiError {
    fn from(e: ScheduleError) -> Self {
        let message = e.to_string();
        let status = match e {
            ScheduleError::Conflicts(conflicts) => {
                return Self { conflicts: Some(conflicts), ..Self::new(StatusCode::CONFLICT, message) };
            }
            ScheduleError::NotFound(_) => StatusCode::NOT_FOUND,
            ScheduleError::PlaylistNotFound(_)
            | ScheduleError::InvalidWindow(_)
            | ScheduleError::InvalidTime(_)
            | ScheduleError::InvalidDays(_) => StatusCode::BAD_REQUEST,
            ScheduleError::Store(ref s) => store_status(s),
        };
        Self::new(status, message)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::new(store_status(&e), e.to_string())
    }
}

// --- Player ---------------------------------------------------------------

async fn ping(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "version": state.version,
        "features": ["player", "schedules", "playlists"]
    }))
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PlaybackStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn param<'a>(params: &'a Value, key: &str) -> Result<&'a Value, ApiError> {
    params
        .get(key)
        .filter(|v| !v.is_null())
        .ok_or_else(|| ApiError::bad_request(format!("missing parameter '{key}'")))
}

fn param_f64(params: &Value, key: &str) -> Result<f64, ApiError> {
    param(params, key)?
        .as_f64()
        .ok_or_else(|| ApiError::bad_request(format!("parameter '{key}' must be a number")))
}

fn param_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, ApiError> {
    param(params, key)?
        .as_str()
        .ok_or_else(|| ApiError::bad_request(format!("parameter '{key}' must be a string")))
}

fn param_bool(params: &Value, key: &str) -> Result<bool, ApiError> {
    param(params, key)?
        .as_bool()
        .ok_or_else(|| ApiError::bad_request(format!("parameter '{key}' must be true or false")))
}

fn volume_percent(params: &Value) -> Result<u8, ApiError> {
    let v = param_f64(params, "volume")?;
    if !(0.0..=100.0).contains(&v) {
        return Err(ApiError::bad_request(format!("volume {v} is outside 0-100")));
    }
    Ok(v.round() as u8)
}

/// Run one `{action, params}` request. Returns an optional human message.
async fn dispatch(state: &AppState, action: &str, params: &Value) -> Result<Option<String>, ApiError> {
    let action = action.trim().to_ascii_lowercase().replace('-', "_");
    let simple = match action.as_str() {
        "play" => Some(Command::Play),
        "pause" => Some(Command::Pause),
        "stop" => Some(Command::Stop),
        "next" => Some(Command::Next),
        "previous" | "prev" => Some(Command::Previous),
        "seek" => Some(Command::Seek(param_f64(params, "position")?)),
        "volume" | "set_volume" => Some(Command::SetVolume(volume_percent(params)?)),
        "set_loop" | "loop" => Some(Command::SetLoop(param_bool(params, "enabled")?)),
        "set_shuffle" | "shuffle" | "set_random" | "random" => {
            Some(Command::SetShuffle(param_bool(params, "enabled")?))
        }
        "set_fullscreen" | "fullscreen" => Some(Command::SetFullscreen(param_bool(params, "enabled")?)),
        "clear_playlist" => Some(Command::ClearPlaylist),
        _ => None,
    };
    if let Some(cmd) = simple {
        if let Command::Seek(pos) = cmd {
            if !pos.is_finite() || pos < 0.0 {
                return Err(ApiError::bad_request(format!("invalid seek position {pos}")));
            }
        }
        state.controller.execute(cmd).await?;
        return Ok(None);
    }

    match action.as_str() {
        "load_playlist" => {
            let name = param_str(params, "name")?;
            let out = state.controller.load_playlist(name, LoadOrigin::User).await?;
            Ok(match (out.already_loaded, out.skipped.is_empty()) {
                (true, _) => Some(format!("playlist '{name}' is already loaded")),
                (false, false) => Some(format!("skipped missing media: {}", out.skipped.join(", "))),
                (false, true) => None,
            })
        }
        "play_file" => {
            state.controller.play_file(param_str(params, "file")?).await?;
            Ok(None)
        }
        "add_to_playlist" | "append" => {
            state.controller.append_file(param_str(params, "file")?).await?;
            Ok(None)
        }
        "switch_backend" | "switch_player" => {
            let named = params
                .get("backend")
                .or_else(|| params.get("player"))
                .filter(|v| !v.is_null());
            let backend = match named {
                Some(v) => v
                    .as_str()
                    .ok_or_else(|| ApiError::bad_request("parameter 'backend' must be a string"))?
                    .to_string(),
                // A bare switch_player flips to the other backend.
                None if action == "switch_player" => other_backend(&state.controller)?.to_string(),
                None => return Err(ApiError::bad_request("missing parameter 'backend'")),
            };
            let resume = params.get("resume").and_then(Value::as_bool).unwrap_or(true);
            let out = state.controller.switch_backend(&backend, resume).await?;
            Ok((!out.warnings.is_empty()).then(|| out.warnings.join("; ")))
        }
        other => Err(ApiError::bad_request(format!("unknown action '{other}'"))),
    }
}

fn other_backend(controller: &PlayerController) -> Result<crate::adapter::BackendKind, ApiError> {
    let active = controller.active_backend();
    controller
        .backends()
        .into_iter()
        .find(|k| *k != active)
        .ok_or_else(|| ApiError::bad_request(format!("no backend to switch to from {active}")))
}

async fn player_command(
    State(state): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let message = dispatch(&state, &req.action, &req.params).await?;
    Ok(Json(CommandResponse { success: true, status: Some(state.cache.get_status()), message }))
}

async fn player_status(State(state): State<AppState>) -> Json<Value> {
    let polls: BTreeMap<&'static str, _> = state
        .cache
        .stats()
        .into_iter()
        .map(|(k, v)| (k.as_str(), v))
        .collect();
    Json(json!({
        "success": true,
        "status": state.cache.get_status(),
        "backend": state.controller.active_backend(),
        "phase": state.controller.phase(),
        "loaded": state.controller.loaded(),
        "capabilities": state.controller.capabilities(),
        "polls": polls,
    }))
}

async fn backend_get(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "active": state.controller.active_backend(),
        "available": state.controller.backends(),
        "phase": state.controller.phase(),
        "capabilities": state.controller.capabilities(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct BackendRequest {
    pub backend: String,
    #[serde(default = "default_resume")]
    pub resume: bool,
}

fn default_resume() -> bool {
    true
}

async fn backend_set(
    State(state): State<AppState>,
    Json(req): Json<BackendRequest>,
) -> Result<Json<Value>, ApiError> {
    let out = state.controller.switch_backend(&req.backend, req.resume).await?;
    Ok(Json(json!({ "success": true, "switch": out })))
}

// --- Schedules ------------------------------------------------------------

async fn schedules_list(State(state): State<AppState>) -> Result<Json<Vec<ScheduleView>>, ApiError> {
    let now = state.engine.now();
    let list = state.schedules.list().await?;
    Ok(Json(list.into_iter().map(|s| s.view(now)).collect()))
}

async fn saved_schedule(state: &AppState, saved: Schedule) -> Result<Value, ApiError> {
    let conflicts = state.schedules.conflicts_for(&saved).await?;
    let view = saved.view(state.engine.now());
    Ok(json!({ "success": true, "schedule": view, "conflicts": conflicts }))
}

async fn schedules_create(
    State(state): State<AppState>,
    Json(input): Json<ScheduleInput>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let saved = state.schedules.create(input).await?;
    Ok((StatusCode::CREATED, Json(saved_schedule(&state, saved).await?)))
}

async fn schedules_get(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ScheduleView>, ApiError> {
    let s = state.schedules.get(id).await?;
    Ok(Json(s.view(state.engine.now())))
}

async fn schedules_update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(input): Json<ScheduleInput>,
) -> Result<Json<Value>, ApiError> {
    let saved = state.schedules.update(id, input).await?;
    Ok(Json(saved_schedule(&state, saved).await?))
}

async fn schedules_delete(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Value>, ApiError> {
    state.schedules.delete(id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn schedules_toggle(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ScheduleView>, ApiError> {
    let s = state.schedules.toggle(id).await?;
    Ok(Json(s.view(state.engine.now())))
}

async fn schedules_engine(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "clock": state.engine.clock().to_string(),
        "local_time": crate::schedule::format_local(state.engine.now()),
        "telemetry": state.engine.telemetry(),
    }))
}

// --- Playlists ------------------------------------------------------------

/// Drop any "already loaded" shortcut for a playlist whose content changed.
async fn playlist_touched(state: &AppState, name: &str) {
    state.controller.playlist_changed(name).await;
    state.engine.invalidate(name).await;
}

async fn playlists_list(State(state): State<AppState>) -> Result<Json<Vec<Playlist>>, ApiError> {
    Ok(Json(state.playlists.list().await?))
}

async fn playlists_upsert(
    State(state): State<AppState>,
    Json(input): Json<PlaylistInput>,
) -> Result<(StatusCode, Json<UpsertOutcome>), ApiError> {
    let out = state.playlists.upsert(input).await?;
    playlist_touched(&state, &out.playlist.name).await;
    let code = if out.created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((code, Json(out)))
}

async fn playlists_get(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Playlist>, ApiError> {
    state
        .playlists
        .get(&name)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("playlist '{name}' not found")))
}

async fn playlists_delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.playlists.delete(&name).await?;
    playlist_touched(&state, &name).await;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub new_name: String,
}

async fn playlists_rename(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<Playlist>, ApiError> {
    let renamed = state.playlists.rename(&name, &req.new_name).await?;
    playlist_touched(&state, &name).await;
    Ok(Json(renamed))
}

// --- Media ----------------------------------------------------------------

async fn media_list(State(state): State<AppState>) -> Result<Json<Vec<MediaFile>>, ApiError> {
    let media = state.playlists.media().clone();
    let files = tokio::task::spawn_blocking(move || media.list())
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(files))
}
