//! Worker-token authentication extractors for Axum handlers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use flowgate_core::error::CoreError;
use flowgate_core::worker::WorkerIdentity;

use crate::auth::jwt::{validate_worker_token, WorkerClaims};
use crate::error::AppError;
use crate::state::AppState;

/// Authenticated worker extracted from a Bearer token in the `Authorization` header.
#[derive(Debug, Clone)]
pub struct WorkerAuth {
    pub identity: WorkerIdentity,
    /// The token's `jti`, for correlating worker activity in logs.
    pub token_id: String,
}

impl FromRequestParts<AppState> for WorkerAuth {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::Core(CoreError::Unauthorized(
                    "Missing Authorization header".into(),
                ))
            })?;

        let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
            AppError::Core(CoreError::Unauthorized(
                "Invalid Authorization format. Expected: Bearer <token>".into(),
            ))
        })?;

        let claims = validate(token, state)?;

        Ok(WorkerAuth {
            identity: claims.identity(),
            token_id: claims.jti,
        })
    }
}

/// Authenticated WebSocket client.
///
/// Browsers cannot set headers on a WebSocket handshake, so the worker
/// token may arrive as a `token` query parameter instead of a Bearer header.
#[derive(Debug, Clone)]
pub struct SocketAuth {
    /// The token's subject, recorded on the connection.
    pub subject: String,
    pub token_id: String,
}

impl FromRequestParts<AppState> for SocketAuth {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let from_query = parts.uri.query().and_then(token_param);
        let from_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);

        let token = from_query.or(from_header).ok_or_else(|| {
            AppError::Core(CoreError::Unauthorized("Missing worker token".into()))
        })?;

        let claims = validate(&token, state)?;

        Ok(SocketAuth {
            subject: claims.sub,
            token_id: claims.jti,
        })
    }
}

fn validate(token: &str, state: &AppState) -> Result<WorkerClaims, AppError> {
    validate_worker_token(token, &state.config.jwt).map_err(|_| {
        AppError::Core(CoreError::Unauthorized(
            "Invalid or expired worker token".into(),
        ))
    })
}

/// Value of the first non-empty `token` pair in a query string.
///
/// Worker tokens are JWTs, whose alphabet needs no percent-decoding.
fn token_param(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, value)| *key == "token" && !value.is_empty())
        .map(|(_, value)| value.to_string())
}
