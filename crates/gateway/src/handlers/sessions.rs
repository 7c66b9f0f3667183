//! Session lifecycle handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use validator::Validate;

use super::{validated, PartyContext};
use crate::AppState;
use parley_common::{
    engine::JoinResult,
    errors::Result,
    session::{Session, SessionKind},
};

/// Create session request
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[validate(length(min = 1, max = 128))]
    pub provider_id: String,

    pub kind: SessionKind,
}

/// Request a session with a provider; the caller is the requester
pub async fn create_session(
    State(state): State<AppState>,
    caller: PartyContext,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Session>)> {
    let request = validated(request)?;

    let session = state
        .engine
        .create_session(&caller.party_id, &request.provider_id, request.kind)
        .await?;

    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn get_session(
    State(state): State<AppState>,
    caller: PartyContext,
    Path(session_id): Path<String>,
) -> Result<Json<Session>> {
    let session = state
        .engine
        .get_session_for(&session_id, &caller.party_id)
        .await?;
    Ok(Json(session))
}

pub async fn confirm_session(
    State(state): State<AppState>,
    caller: PartyContext,
    Path(session_id): Path<String>,
) -> Result<Json<Session>> {
    let session = state.engine.confirm(&session_id, &caller.party_id).await?;
    Ok(Json(session))
}

pub async fn join_session(
    State(state): State<AppState>,
    caller: PartyContext,
    Path(session_id): Path<String>,
) -> Result<Json<JoinResult>> {
    let result = state.engine.join(&session_id, &caller.party_id).await?;
    Ok(Json(result))
}

pub async fn end_session(
    State(state): State<AppState>,
    caller: PartyContext,
    Path(session_id): Path<String>,
) -> Result<Json<Session>> {
    let session = state.engine.end(&session_id, &caller.party_id).await?;

    tracing::info!(
        session_id = %session_id,
        party_id = %caller.party_id,
        "Session ended by party"
    );

    Ok(Json(session))
}

pub async fn reject_session(
    State(state): State<AppState>,
    caller: PartyContext,
    Path(session_id): Path<String>,
) -> Result<Json<Session>> {
    let session = state.engine.reject(&session_id, &caller.party_id).await?;
    Ok(Json(session))
}
