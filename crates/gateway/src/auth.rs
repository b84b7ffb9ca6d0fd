//! Shared bearer-token check for the client-facing HTTP surface. The gateway
//! binary is a thin router (spec §1 non-goal); auth here is a single shared
//! token, not the multi-mode scheme a public-facing deployment would want.

use axum::http::HeaderMap;

use crate::app::AppState;

/// Returns true if the request is authorized. `None` configured token means
/// auth is disabled (local development).
pub fn check_auth(state: &AppState, headers: &HeaderMap) -> bool {
    match &state.config.server.auth_token {
        None => true,
        Some(expected) => extract_bearer(headers).map(|t| t == expected).unwrap_or(false),
    }
}

pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
