//! HTTP surface: sampler triggers and entry-code checks for one instance.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::admission::AdmissionController;
use crate::entry_codes::EntryCodeService;
use crate::error::SamplerError;
use crate::models::SlotStatus;

#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<AdmissionController>,
    pub entry_codes: Arc<EntryCodeService>,
    pub allow_entry_code_upload: bool,
}

pub struct ApiError(SamplerError);

impl From<SamplerError> for ApiError {
    fn from(err: SamplerError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SamplerError::NotFound { .. } => StatusCode::NOT_FOUND,
            SamplerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SamplerError::Storage(_) | SamplerError::StorageTimeout(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            SamplerError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &self.0 {
            SamplerError::Storage(_) | SamplerError::StorageTimeout(_) => {
                error!(error = %self.0, "storage failure while handling request");
                "storage unavailable".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct ParticipantEvent {
    #[serde(rename = "participantID")]
    pub participant_id: String,
}

#[derive(Debug, Deserialize)]
pub struct InviteResponse {
    #[serde(rename = "participantID")]
    pub participant_id: String,
    pub accepted: bool,
}

#[derive(Debug, Deserialize)]
pub struct NewCodeList {
    pub codes: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CodeCheckQuery {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct CodeSubmission {
    #[serde(rename = "participantID")]
    pub participant_id: String,
    pub code: String,
}

pub fn router(state: AppState) -> Router {
    let mut entry_codes: Router<AppState> = Router::new()
        .route("/entry-codes/{instance_id}/is-valid", get(validate_entry_code))
        .route("/entry-codes/{instance_id}/submit", post(submit_entry_code));
    if state.allow_entry_code_upload {
        entry_codes = entry_codes.route("/entry-codes/{instance_id}", post(add_entry_codes));
    }

    Router::new()
        .route("/", get(health))
        .route("/sampler/{instance_id}/status", get(sampler_status))
        .route("/sampler/{instance_id}/is-selected", post(is_selected))
        .route("/sampler/{instance_id}/invite-response", post(invite_response))
        .merge(entry_codes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn check_instance(state: &AppState, instance_id: &str) -> ApiResult<()> {
    if instance_id != state.admission.instance_id() {
        return Err(SamplerError::InvalidRequest(format!("unexpected instanceID: {instance_id}")).into());
    }
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[tracing::instrument(skip_all)]
async fn sampler_status(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<SlotStatus>> {
    check_instance(&state, &instance_id)?;
    Ok(Json(state.admission.status().await?))
}

#[tracing::instrument(skip_all)]
async fn is_selected(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(event): Json<ParticipantEvent>,
) -> ApiResult<impl IntoResponse> {
    check_instance(&state, &instance_id)?;
    if event.participant_id.is_empty() {
        return Err(SamplerError::InvalidRequest("participantID must not be empty".to_string()).into());
    }
    let selected = state.admission.admit(&event.participant_id).await;
    Ok(Json(json!({ "value": selected })))
}

#[tracing::instrument(skip_all)]
async fn invite_response(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(response): Json<InviteResponse>,
) -> ApiResult<impl IntoResponse> {
    check_instance(&state, &instance_id)?;
    let reservation = state
        .admission
        .respond_to_invite(&response.participant_id, response.accepted)
        .await?;
    Ok(Json(reservation))
}

async fn add_entry_codes(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(request): Json<NewCodeList>,
) -> ApiResult<impl IntoResponse> {
    check_instance(&state, &instance_id)?;
    let saved = state.entry_codes.add_codes(&request.codes).await;
    Ok(Json(json!({
        "message": format!("{saved} / {} codes saved", request.codes.len())
    })))
}

async fn validate_entry_code(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<CodeCheckQuery>,
) -> ApiResult<impl IntoResponse> {
    check_instance(&state, &instance_id)?;
    state.entry_codes.validate(&query.uid, &query.code).await?;
    Ok(Json(json!({ "isValid": true })))
}

async fn submit_entry_code(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(submission): Json<CodeSubmission>,
) -> ApiResult<impl IntoResponse> {
    check_instance(&state, &instance_id)?;
    state
        .entry_codes
        .mark_used(&submission.code, &submission.participant_id)
        .await?;
    Ok(Json(json!({ "message": "entry code marked as used" })))
}
