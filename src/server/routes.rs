//! HTTP surface: the state document endpoints, account endpoints, and the
//! health probe. Error bodies are always `{"error": CODE}` (plus a
//! `details` object where there is more to say) so clients can switch on
//! the code without parsing prose.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use super::auth::{extract_token, AuthError};
use super::store::StoreError;
use super::AppState;
use crate::state::normalize;

/// Assemble the router. The caller owns listening and shutdown.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/state", get(get_state).put(put_state))
        .route("/health", get(health))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(status: StatusCode, code: &str) -> Response {
    (status, Json(json!({ "error": code }))).into_response()
}

/// Resolve the request's credential to an account email, in the order
/// bearer header, `token` query parameter, session cookie.
async fn authenticate(
    app: &AppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<String, Response> {
    let Some(token) = extract_token(headers, query, &app.session_cookie) else {
        return Err(error_response(StatusCode::UNAUTHORIZED, "UNAUTHORIZED"));
    };
    match app.auth.verify_token(&token).await {
        Ok(Some(email)) => Ok(email),
        Ok(None) => Err(error_response(StatusCode::UNAUTHORIZED, "UNAUTHORIZED")),
        Err(e) => {
            log::error!("Token verification failed: {}", e);
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
            ))
        }
    }
}

async fn get_state(
    State(app): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let email = match authenticate(&app, &headers, &query).await {
        Ok(email) => email,
        Err(resp) => return resp,
    };
    match app.store.load(&email).await {
        Ok(Some(doc)) => Json(doc).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "NOT_FOUND"),
        Err(e) => {
            log::error!("Failed to load state for {}: {}", email, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL")
        }
    }
}

async fn put_state(
    State(app): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let email = match authenticate(&app, &headers, &query).await {
        Ok(email) => email,
        Err(resp) => return resp,
    };
    let Ok(body) = serde_json::from_slice::<Value>(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_BODY");
    };
    let expected_version = match body.get("expectedVersion") {
        None | Some(Value::Null) => None,
        Some(value) => match value.as_u64() {
            Some(v) => Some(v),
            None => return error_response(StatusCode::BAD_REQUEST, "INVALID_BODY"),
        },
    };
    let Some(raw_state) = body.get("state").filter(|s| s.is_object()) else {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_BODY");
    };

    // Whatever arrives is normalized before it is stored; a valid document
    // passes through unchanged.
    let doc = normalize(raw_state);
    match app.store.save(&email, doc, expected_version).await {
        Ok(meta) => {
            log::info!("Stored state v{} for {}", meta.version, email);
            (StatusCode::OK, Json(json!({ "ok": true, "meta": meta }))).into_response()
        }
        Err(StoreError::Conflict { current_version }) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "VERSION_CONFLICT",
                "details": { "currentVersion": current_version },
            })),
        )
            .into_response(),
        Err(e) => {
            log::error!("Failed to store state for {}: {}", email, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL")
        }
    }
}

async fn health(State(app): State<Arc<AppState>>) -> Response {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
        "uptimeSecs": app.started_at.elapsed().as_secs(),
    }))
    .into_response()
}

#[derive(Deserialize)]
struct CredentialsBody {
    email: Option<String>,
    password: Option<String>,
}

fn token_response(cookie_name: &str, token: String) -> Response {
    let cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax",
        cookie_name, token
    );
    (
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(json!({ "ok": true, "token": token })),
    )
        .into_response()
}

async fn register(State(app): State<Arc<AppState>>, body: Bytes) -> Response {
    let Some((email, password)) = credentials(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_BODY");
    };
    match app.auth.register(&email, &password).await {
        Ok(token) => {
            log::info!("Registered account {}", email);
            token_response(&app.session_cookie, token)
        }
        Err(AuthError::EmailTaken) => error_response(StatusCode::CONFLICT, "EMAIL_TAKEN"),
        Err(e) => {
            log::error!("Registration failed for {}: {}", email, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL")
        }
    }
}

async fn login(State(app): State<Arc<AppState>>, body: Bytes) -> Response {
    let Some((email, password)) = credentials(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_BODY");
    };
    match app.auth.login(&email, &password).await {
        Ok(token) => token_response(&app.session_cookie, token),
        Err(AuthError::InvalidCredentials) => {
            error_response(StatusCode::UNAUTHORIZED, "INVALID_CREDENTIALS")
        }
        Err(e) => {
            log::error!("Login failed for {}: {}", email, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL")
        }
    }
}

async fn logout(
    State(app): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Some(token) = extract_token(&headers, &query, &app.session_cookie) {
        if let Err(e) = app.auth.logout(&token).await {
            log::error!("Logout failed: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL");
        }
    }
    let clear = format!("{}=; Path=/; HttpOnly; Max-Age=0", app.session_cookie);
    (
        StatusCode::OK,
        [(header::SET_COOKIE, clear)],
        Json(json!({ "ok": true })),
    )
        .into_response()
}

fn credentials(raw: &[u8]) -> Option<(String, String)> {
    let body: CredentialsBody = serde_json::from_slice(raw).ok()?;
    let email = body.email.filter(|e| !e.trim().is_empty())?;
    let password = body.password.filter(|p| !p.is_empty())?;
    Some((email, password))
}
