use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde_json::json;
use tracing::error;

use herald_alerts::admin::Admin;
use herald_alerts::Tick;
use herald_common::types::Realm;
use herald_common::{Config, HeraldError};

use crate::auth::check_admin_auth;

pub struct AppState {
    pub admin: Admin,
    pub tick: Arc<Tick>,
    pub config: Arc<Config>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/admin", get(admin_handler))
        .route("/tick", get(tick_handler))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    match state.admin.health(Utc::now()).await {
        Ok(health) => Json(health).into_response(),
        Err(e) => {
            error!(error = %e, "Health check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": "health check failed" })),
            )
                .into_response()
        }
    }
}

/// Manually trigger one pipeline pass. 502 when the upstream fetch fails so
/// monitors can tell "Herald is down" from "we broke".
async fn tick_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    match state.tick.run(Utc::now()).await {
        Ok(stats) => Json(json!({ "ok": true, "stats": stats.to_string() })).into_response(),
        Err(HeraldError::Fetch(msg)) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "ok": false, "error": msg })),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Manual tick failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn admin_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    let Some(action) = params.get("action").map(String::as_str) else {
        return bad_request("action parameter is required");
    };
    let now = Utc::now();

    let result = match action {
        "strict-on" => state.admin.set_strict(true).await,
        "strict-off" => state.admin.set_strict(false).await,
        "clear-cooldowns" => state.admin.clear_cooldowns().await,
        "clear-metrics" => state.admin.clear_metrics().await,
        "reset-all-ua" => state.admin.reset_all_ua().await,
        "dump" => match params.get("prefix") {
            Some(prefix) => state.admin.dump(prefix).await,
            None => return bad_request("dump requires prefix"),
        },
        "reset-ua" => match params.get("keep") {
            Some(keep) => state.admin.reset_ua(keep).await,
            None => return bad_request("reset-ua requires keep"),
        },
        "clear-cap" => {
            let Some(keep) = params.get("keep") else {
                return bad_request("clear-cap requires keep");
            };
            let Some(realm) = realm_param(&params, "realm") else {
                return bad_request("clear-cap requires realm");
            };
            let prev = realm_param(&params, "prev");
            state.admin.clear_cap(keep, realm, prev).await
        }
        "sim-ua" => {
            let Some(keep) = params.get("keep") else {
                return bad_request("sim-ua requires keep");
            };
            let Some(realm) = realm_param(&params, "realm") else {
                return bad_request("sim-ua requires realm");
            };
            state.admin.simulate_ua(keep, realm, now).await
        }
        "sim-capture" => {
            let Some(keep) = params.get("keep") else {
                return bad_request("sim-capture requires keep");
            };
            let Some(realm) = realm_param(&params, "realm") else {
                return bad_request("sim-capture requires realm");
            };
            state
                .admin
                .simulate_capture(keep, realm, params.get("leader").cloned(), now)
                .await
        }
        "sim-flip" => {
            let Some(keep) = params.get("keep") else {
                return bad_request("sim-flip requires keep");
            };
            let Some(realm) = realm_param(&params, "realm") else {
                return bad_request("sim-flip requires realm");
            };
            state.admin.simulate_flip(keep, realm, now).await
        }
        "sim-player" => {
            let Some(player) = params.get("player") else {
                return bad_request("sim-player requires player");
            };
            let Some(delta) = params.get("delta").and_then(|d| d.parse::<u64>().ok()) else {
                return bad_request("sim-player requires a numeric delta");
            };
            state.admin.simulate_player(player, delta, now).await
        }
        _ => return bad_request("unknown action"),
    };

    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => {
            error!(action, error = %e, "Admin action failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

fn realm_param(params: &HashMap<String, String>, name: &str) -> Option<Realm> {
    params.get(name).and_then(|v| Realm::from_marker(v))
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    check_admin_auth(
        headers,
        &state.config.admin_username,
        &state.config.admin_password,
    )
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"admin\"")],
        "Unauthorized",
    )
        .into_response()
}

fn bad_request(msg: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "ok": false, "error": msg })),
    )
        .into_response()
}
