//! Admin HTTP surface (spec §4.9): local endpoints to view health and
//! accept pushed config, carrying the same bearer auth as outbound calls.
//! Built on the same `axum` + `tower-http` stack the teacher uses for its
//! own service surface (`TraceLayer`, `TimeoutLayer`).

use crate::config::AgentConfig;
use crate::config_manager::{ConfigManager, ConfigUpdateSource};
use crate::health::HealthReporter;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AdminState {
    pub config_manager: Arc<ConfigManager>,
    pub health_reporter: Arc<HealthReporter>,
    pub api_key: String,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/api/configuration/current", get(get_current_config))
        .route("/api/configuration/update", post(post_update_config))
        .route("/api/configuration/validate", post(post_validate_config))
        .route("/api/configuration/backup", post(post_backup_config))
        .route("/api/configuration/restore", post(post_restore_config))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        )
        .with_state(state)
}

/// Constant-time bearer-token check, consistent with the security posture
/// the teacher applies to its own bearer-auth middleware.
fn authorized(headers: &HeaderMap, expected_key: &str) -> bool {
    let Some(header) = headers.get(axum::http::header::AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = header.to_str() else {
        return false;
    };
    let Some(token) = value.strip_prefix("Bearer ") else {
        return false;
    };
    if token.len() != expected_key.len() {
        return false;
    }
    token.as_bytes().ct_eq(expected_key.as_bytes()).into()
}

async fn get_health(State(state): State<AdminState>) -> Json<Value> {
    let snapshot = state.health_reporter.snapshot().await;
    Json(json!(snapshot))
}

async fn get_current_config(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<Json<AgentConfig>, StatusCode> {
    if !authorized(&headers, &state.api_key) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(state.config_manager.current()))
}

async fn post_update_config(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Json(candidate): Json<AgentConfig>,
) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers, &state.api_key) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    match state
        .config_manager
        .apply(candidate, ConfigUpdateSource::AdminPush)
        .await
    {
        Ok(update) => Ok(Json(json!({
            "applied": true,
            "restartRequired": update.restart_required,
        }))),
        Err(err) => Ok(Json(json!({
            "applied": false,
            "error": err.to_string(),
        }))),
    }
}

async fn post_validate_config(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Json(candidate): Json<AgentConfig>,
) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers, &state.api_key) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let (errors, warnings, restart_required) = state.config_manager.validate(&candidate);
    Ok(Json(json!({
        "valid": errors.is_empty(),
        "errors": errors,
        "warnings": warnings,
        "restartRequired": restart_required,
    })))
}

async fn post_backup_config(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers, &state.api_key) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    match state.config_manager.backup().await {
        Ok(()) => Ok(Json(json!({ "backedUp": true }))),
        Err(err) => Ok(Json(json!({ "backedUp": false, "error": err.to_string() }))),
    }
}

async fn post_restore_config(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers, &state.api_key) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    match state.config_manager.restore().await {
        Ok(_) => Ok(Json(json!({ "restored": true }))),
        Err(err) => Ok(Json(json!({ "restored": false, "error": err.to_string() }))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    #[test]
    fn missing_header_is_unauthorized() {
        let headers = HeaderMap::new();
        assert!(!authorized(&headers, "secret"));
    }

    #[test]
    fn correct_bearer_token_authorizes() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer secret".parse().unwrap());
        assert!(authorized(&headers, "secret"));
    }

    #[test]
    fn wrong_bearer_token_is_unauthorized() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer wrong".parse().unwrap());
        assert!(!authorized(&headers, "secret"));
    }
}
