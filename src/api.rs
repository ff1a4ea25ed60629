//! HTTP control surface.
//!
//! Reads map controller errors onto status codes. Actions always answer
//! 200 with `success: false` and the error text when the controller refuses.

use crate::automation::config::{AutomationConfig, ConfigDraft};
use crate::automation::history::FeeUpdateRecord;
use crate::automation::{ChannelDetail, Controller, ManagerStatus, PassResult};
use crate::error::{ControlError, FieldError};
use crate::fees::setter::ApplyOutcome;
use crate::fees::FeeParameters;
use crate::state::{Channel, NodeInfo};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub controller: Controller,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/node/info", get(node_info_handler))
        .route("/api/channels", get(channels_handler))
        .route("/api/channel/:id", get(channel_detail_handler))
        .route("/api/channel/:id/fees", post(channel_fees_handler))
        .route("/api/fees/status", get(status_handler))
        .route("/api/fees/start", post(start_handler))
        .route("/api/fees/stop", post(stop_handler))
        .route("/api/fees/update", post(update_handler))
        .route("/api/fees/history", get(history_handler))
        .route("/api/config", get(get_config_handler).post(set_config_handler))
        .with_state(state)
}

/// Error body of the read endpoints.
pub struct ApiError(ControlError);

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControlError::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            ControlError::ChannelNotFound(_) => StatusCode::NOT_FOUND,
            ControlError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ControlError::Validation(_) => StatusCode::BAD_REQUEST,
            ControlError::AlreadyRunning
            | ControlError::NotRunning
            | ControlError::PassInProgress => StatusCode::CONFLICT,
        };
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Answer of the action endpoints.
#[derive(Debug, Default, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<PassResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ApplyOutcome>,
}

impl ActionResponse {
    fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    fn failed(err: ControlError) -> Self {
        Self {
            success: false,
            error: Some(err.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ConfigResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<AutomationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<FieldError>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct ChannelsResponse {
    pub channels: Vec<Channel>,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub records: Vec<FeeUpdateRecord>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

async fn node_info_handler(State(state): State<AppState>) -> Result<Json<NodeInfo>, ApiError> {
    Ok(Json(state.controller.node_info().await?))
}

async fn channels_handler(
    State(state): State<AppState>,
) -> Result<Json<ChannelsResponse>, ApiError> {
    let channels = state.controller.channels().await?;
    Ok(Json(ChannelsResponse { channels }))
}

async fn channel_detail_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChannelDetail>, ApiError> {
    Ok(Json(state.controller.channel_detail(&id).await?))
}

async fn status_handler(State(state): State<AppState>) -> Json<ManagerStatus> {
    Json(state.controller.status())
}

async fn start_handler(State(state): State<AppState>) -> Json<ActionResponse> {
    match state.controller.start() {
        Ok(()) => Json(ActionResponse::ok()),
        Err(e) => Json(ActionResponse::failed(e)),
    }
}

async fn stop_handler(State(state): State<AppState>) -> Json<ActionResponse> {
    match state.controller.stop() {
        Ok(()) => Json(ActionResponse::ok()),
        Err(e) => Json(ActionResponse::failed(e)),
    }
}

async fn update_handler(State(state): State<AppState>) -> Json<ActionResponse> {
    info!("API: manual fee update requested");
    match state.controller.run_once().await {
        Ok(result) => Json(ActionResponse {
            result: Some(result),
            ..ActionResponse::ok()
        }),
        Err(e) => {
            warn!("API: manual fee update refused: {}", e);
            Json(ActionResponse::failed(e))
        }
    }
}

async fn channel_fees_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(params): Json<FeeParameters>,
) -> Json<ActionResponse> {
    match state.controller.update_channel_fees(&id, params).await {
        Ok(outcome) => Json(ActionResponse {
            success: !matches!(outcome, ApplyOutcome::Failed(_)),
            outcome: Some(outcome),
            ..Default::default()
        }),
        Err(e) => Json(ActionResponse::failed(e)),
    }
}

async fn history_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let records = state.controller.history(limit)?;
    Ok(Json(HistoryResponse { records }))
}

async fn get_config_handler(State(state): State<AppState>) -> Json<AutomationConfig> {
    Json((*state.controller.config()).clone())
}

async fn set_config_handler(
    State(state): State<AppState>,
    Json(draft): Json<ConfigDraft>,
) -> Json<ConfigResponse> {
    match state.controller.set_config(draft) {
        Ok(config) => Json(ConfigResponse {
            success: true,
            config: Some((*config).clone()),
            ..Default::default()
        }),
        Err(ControlError::Validation(errors)) => {
            warn!("API: config rejected ({:?})", errors.fields());
            Json(ConfigResponse {
                success: false,
                error: Some(errors.to_string()),
                errors: Some(errors.0),
                ..Default::default()
            })
        }
        Err(e) => Json(ConfigResponse {
            success: false,
            error: Some(e.to_string()),
            ..Default::default()
        }),
    }
}
