use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use interview_proto::{generate_session_id, now_ms, ParticipantRole};
use invite_token::{InviteClaims, InviteTokenError};

use crate::config::Config;
use crate::storage::{SessionInfo, Storage};

pub type SharedStorage = Arc<Storage>;

/// State for the HTTP (non-websocket) routes.
#[derive(Clone)]
pub struct AppContext {
    pub storage: SharedStorage,
    pub config: Arc<Config>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub candidate_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub candidate_id: String,
    pub invite_token: String,
    pub invite_url: String,
    pub recruiter_ws_url: String,
}

#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JoinSessionRequest {
    pub invite_token: String,
}

#[derive(Debug, Serialize)]
pub struct JoinSessionResponse {
    pub session_id: String,
    pub candidate_id: String,
    pub ws_url: String,
}

#[derive(Debug, Deserialize)]
pub struct RevokeInviteRequest {
    #[serde(default)]
    pub candidate_id: Option<String>,
}

/// A join refusal with a machine-readable reason.
#[derive(Debug, Serialize)]
pub struct JoinRejection {
    #[serde(skip)]
    status: StatusCode,
    pub reason: &'static str,
    pub message: String,
}

impl JoinRejection {
    fn forbidden(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            reason,
            message: message.into(),
        }
    }

    fn not_found(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            reason,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            reason: "internal_error",
            message: message.into(),
        }
    }
}

impl IntoResponse for JoinRejection {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

/// Create a session and mint a signed candidate invitation.
pub async fn create_session(
    State(ctx): State<AppContext>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, JoinRejection> {
    let session_id = generate_session_id();
    let candidate_id = req
        .candidate_id
        .unwrap_or_else(|| format!("candidate-{}", uuid::Uuid::new_v4()));

    let session = SessionInfo::new(session_id.clone(), candidate_id.clone(), req.title);
    ctx.storage
        .register_session(session, initial_session_ttl(&ctx.config))
        .await
        .map_err(|err| JoinRejection::internal(format!("failed to store session: {err}")))?;

    let claims = InviteClaims::new(
        &session_id,
        &candidate_id,
        now_ms(),
        ctx.config.invite_ttl_seconds as i64 * 1_000,
    );
    let token = invite_token::issue(&claims, ctx.config.invite_secret.as_bytes())
        .map_err(|err| JoinRejection::internal(format!("failed to mint invite: {err}")))?;

    info!(session = %session_id, "created interview session");

    Ok(Json(CreateSessionResponse {
        invite_url: format!(
            "{}/sessions/{}/join?token={}",
            ctx.config.public_base_url, session_id, token
        ),
        recruiter_ws_url: websocket_url(
            &ctx.config.public_base_url,
            &session_id,
            ParticipantRole::Recruiter,
        ),
        session_id,
        candidate_id,
        invite_token: token,
    }))
}

pub async fn get_session(
    State(ctx): State<AppContext>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStatusResponse>, JoinRejection> {
    let session = ctx
        .storage
        .get_session(&session_id)
        .await
        .map_err(|err| JoinRejection::internal(format!("storage error: {err}")))?
        .ok_or_else(|| JoinRejection::not_found("unknown_session", "session not found"))?;

    Ok(Json(SessionStatusResponse {
        session_id: session.session_id,
        created_at: session.created_at,
        title: session.title,
    }))
}

/// Validate a candidate's invitation and hand back their websocket URL.
///
/// Every refusal carries a distinct reason so the join page can say why.
pub async fn join_session(
    State(ctx): State<AppContext>,
    Path(session_id): Path<String>,
    Json(req): Json<JoinSessionRequest>,
) -> Result<Json<JoinSessionResponse>, JoinRejection> {
    let session = ctx
        .storage
        .get_session(&session_id)
        .await
        .map_err(|err| JoinRejection::internal(format!("storage error: {err}")))?
        .ok_or_else(|| JoinRejection::not_found("unknown_session", "session not found"))?;

    let claims = invite_token::verify(
        &req.invite_token,
        ctx.config.invite_secret.as_bytes(),
        now_ms(),
    )
    .map_err(|err| {
        warn!(session = %session_id, %err, "rejected invite token");
        JoinRejection::forbidden(invite_reason(&err), err.to_string())
    })?;

    if claims.session_id != session.session_id || claims.candidate_id != session.candidate_id {
        return Err(JoinRejection::forbidden(
            "invite_mismatch",
            "invite was issued for a different session",
        ));
    }

    let revoked = ctx
        .storage
        .is_invite_revoked(&session_id, &claims.candidate_id)
        .await
        .map_err(|err| JoinRejection::internal(format!("storage error: {err}")))?;
    if revoked {
        return Err(JoinRejection::forbidden(
            "invite_revoked",
            "this invitation has been revoked",
        ));
    }

    Ok(Json(JoinSessionResponse {
        ws_url: websocket_url(
            &ctx.config.public_base_url,
            &session_id,
            ParticipantRole::Candidate,
        ),
        session_id,
        candidate_id: claims.candidate_id,
    }))
}

/// Revoke the candidate invitation for a session. Already-issued tokens stop
/// verifying at the join step from this point on.
pub async fn revoke_invite(
    State(ctx): State<AppContext>,
    Path(session_id): Path<String>,
    Json(req): Json<RevokeInviteRequest>,
) -> Result<StatusCode, JoinRejection> {
    let session = ctx
        .storage
        .get_session(&session_id)
        .await
        .map_err(|err| JoinRejection::internal(format!("storage error: {err}")))?
        .ok_or_else(|| JoinRejection::not_found("unknown_session", "session not found"))?;

    let candidate_id = req.candidate_id.unwrap_or(session.candidate_id);
    ctx.storage
        .revoke_invite(&session_id, &candidate_id)
        .await
        .map_err(|err| JoinRejection::internal(format!("storage error: {err}")))?;

    info!(session = %session_id, "revoked candidate invite");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_session(
    State(ctx): State<AppContext>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, JoinRejection> {
    ctx.storage
        .delete_session(&session_id)
        .await
        .map_err(|err| JoinRejection::internal(format!("storage error: {err}")))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Initial lifetime of a fresh session record. A session has to outlive the
/// invite minted for it, or a valid invite would point at an expired key;
/// activity-based refreshes take over once someone joins.
fn initial_session_ttl(config: &Config) -> u64 {
    config.session_ttl_seconds.max(config.invite_ttl_seconds)
}

fn invite_reason(err: &InviteTokenError) -> &'static str {
    match err {
        InviteTokenError::Malformed(_) => "invite_malformed",
        InviteTokenError::BadSignature => "invite_invalid",
        InviteTokenError::Expired { .. } => "invite_expired",
    }
}

/// Derive the websocket endpoint for a role from the public base URL.
fn websocket_url(base_url: &str, session_id: &str, role: ParticipantRole) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base_url.to_string()
    };
    format!("{}/ws/{}/{}", ws_base.trim_end_matches('/'), session_id, role)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_swaps_scheme_and_appends_role() {
        assert_eq!(
            websocket_url("http://localhost:8080", "s1", ParticipantRole::Recruiter),
            "ws://localhost:8080/ws/s1/recruiter"
        );
        assert_eq!(
            websocket_url("https://relay.example.com/", "s1", ParticipantRole::Candidate),
            "wss://relay.example.com/ws/s1/candidate"
        );
    }

    #[test]
    fn fresh_sessions_outlive_their_invites() {
        let config = Config::default();
        assert!(initial_session_ttl(&config) >= config.invite_ttl_seconds);

        // A longer session TTL is kept as-is.
        let long_sessions = Config {
            session_ttl_seconds: 2_000_000,
            ..Config::default()
        };
        assert_eq!(initial_session_ttl(&long_sessions), 2_000_000);
    }

    #[test]
    fn invite_reasons_are_distinct() {
        assert_eq!(
            invite_reason(&InviteTokenError::Malformed("x".into())),
            "invite_malformed"
        );
        assert_eq!(invite_reason(&InviteTokenError::BadSignature), "invite_invalid");
        assert_eq!(
            invite_reason(&InviteTokenError::Expired { expired_at_ms: 0 }),
            "invite_expired"
        );
    }
}
