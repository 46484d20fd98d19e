//! Admin HTTP surface
//!
//! Serves the dynamic-broker CRUD endpoints plus metrics and readiness:
//!
//! - `GET    /inputs`              - map of id → uptime + config
//! - `GET    /inputs/{id}`         - config of one child
//! - `POST   /inputs/{id}`         - create or replace a child (JSON body)
//! - `DELETE /inputs/{id}`         - drain and remove a child
//! - `GET    /inputs/{id}/uptime`  - duration string, or `stopped`
//! - the same five under `/outputs`
//! - `GET    /metrics`             - prometheus exposition
//! - `GET    /ready`               - readiness probe
//!
//! POST bodies are component fragments. A lint failure answers 400, a
//! construction failure 500; a successful swap answers 200 once the old
//! child has drained.

use crate::config::ComponentConfig;
use crate::manager::Manager;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::time::Duration;
use virta_core::Error;

/// Shared state for the admin handlers.
#[derive(Clone)]
pub struct AdminState {
    mgr: Manager,
}

/// Build the admin router.
pub fn router(mgr: Manager) -> Router {
    let state = AdminState { mgr };
    Router::new()
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/inputs", get(list_inputs))
        .route(
            "/inputs/{id}",
            get(get_input).post(set_input).delete(delete_input),
        )
        .route("/inputs/{id}/uptime", get(input_uptime))
        .route("/outputs", get(list_outputs))
        .route(
            "/outputs/{id}",
            get(get_output).post(set_output).delete(delete_output),
        )
        .route("/outputs/{id}/uptime", get(output_uptime))
        .with_state(state)
}

/// Serve the router until the shutdown future resolves.
pub async fn serve(
    router: Router,
    address: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> virta_core::Result<()> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .map_err(|e| Error::Io(format!("bind {address}: {e}")))?;
    tracing::info!(address = %address, "admin API listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Io(format!("admin server: {e}")))
}

/// Format a duration the way uptime strings read: `72h3m0.5s`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs_f64();
    let hours = (total / 3600.0) as u64;
    let minutes = ((total % 3600.0) / 60.0) as u64;
    let seconds = total % 60.0;
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds:.1}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds:.1}s")
    } else {
        format!("{seconds:.1}s")
    }
}

fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::ResourceMissing(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

async fn ready() -> &'static str {
    "OK"
}

async fn metrics() -> String {
    crate::metrics::Metrics::render()
}

// ────────────────────────────────────────────────────────────────────────
// Dynamic inputs
// ────────────────────────────────────────────────────────────────────────

async fn list_inputs(State(state): State<AdminState>) -> Response {
    let Some(control) = state.mgr.dynamic_input_control() else {
        return error_response(Error::ResourceMissing("dynamic input".into()));
    };
    let mut body = serde_json::Map::new();
    for (id, uptime) in control.list() {
        body.insert(
            id.clone(),
            serde_json::json!({
                "uptime": format_duration(uptime),
                "config": control.config(&id),
            }),
        );
    }
    axum::Json(serde_json::Value::Object(body)).into_response()
}

async fn get_input(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    let Some(control) = state.mgr.dynamic_input_control() else {
        return error_response(Error::ResourceMissing("dynamic input".into()));
    };
    match control.config(&id) {
        Some(config) => axum::Json(config).into_response(),
        None => error_response(Error::ResourceMissing(id)),
    }
}

async fn set_input(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    body: String,
) -> Response {
    let Some(control) = state.mgr.dynamic_input_control() else {
        return error_response(Error::ResourceMissing("dynamic input".into()));
    };

    let conf = match parse_fragment(&body) {
        Ok(conf) => conf,
        Err(err) => return error_response(err),
    };
    let input = match state.mgr.into_path(&["dynamic", &id]).new_input(&conf) {
        Ok(input) => input,
        Err(err) => return error_response(err),
    };
    match control.set(&id, input, conf.to_value()).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(err),
    }
}

async fn delete_input(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    let Some(control) = state.mgr.dynamic_input_control() else {
        return error_response(Error::ResourceMissing("dynamic input".into()));
    };
    match control.remove(&id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(err),
    }
}

async fn input_uptime(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    let Some(control) = state.mgr.dynamic_input_control() else {
        return error_response(Error::ResourceMissing("dynamic input".into()));
    };
    match control.uptime(&id) {
        Some(uptime) => format_duration(uptime).into_response(),
        None => "stopped".into_response(),
    }
}

// ────────────────────────────────────────────────────────────────────────
// Dynamic outputs
// ────────────────────────────────────────────────────────────────────────

async fn list_outputs(State(state): State<AdminState>) -> Response {
    let Some(control) = state.mgr.dynamic_output_control() else {
        return error_response(Error::ResourceMissing("dynamic output".into()));
    };
    let mut body = serde_json::Map::new();
    for (id, uptime) in control.list() {
        body.insert(
            id.clone(),
            serde_json::json!({
                "uptime": format_duration(uptime),
                "config": control.config(&id),
            }),
        );
    }
    axum::Json(serde_json::Value::Object(body)).into_response()
}

async fn get_output(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    let Some(control) = state.mgr.dynamic_output_control() else {
        return error_response(Error::ResourceMissing("dynamic output".into()));
    };
    match control.config(&id) {
        Some(config) => axum::Json(config).into_response(),
        None => error_response(Error::ResourceMissing(id)),
    }
}

async fn set_output(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    body: String,
) -> Response {
    let Some(control) = state.mgr.dynamic_output_control() else {
        return error_response(Error::ResourceMissing("dynamic output".into()));
    };

    let conf = match parse_fragment(&body) {
        Ok(conf) => conf,
        Err(err) => return error_response(err),
    };
    let output = match state.mgr.into_path(&["dynamic", &id]).new_output(&conf) {
        Ok(output) => output,
        Err(err) => return error_response(err),
    };
    match control.set(&id, output, conf.to_value()).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(err),
    }
}

async fn delete_output(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    let Some(control) = state.mgr.dynamic_output_control() else {
        return error_response(Error::ResourceMissing("dynamic output".into()));
    };
    match control.remove(&id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(err),
    }
}

async fn output_uptime(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    let Some(control) = state.mgr.dynamic_output_control() else {
        return error_response(Error::ResourceMissing("dynamic output".into()));
    };
    match control.uptime(&id) {
        Some(uptime) => format_duration(uptime).into_response(),
        None => "stopped".into_response(),
    }
}

fn parse_fragment(body: &str) -> virta_core::Result<ComponentConfig> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| Error::Config(format!("invalid body: {e}")))?;
    ComponentConfig::from_value(&value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_millis(500)), "0.5s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30.0s");
        assert_eq!(
            format_duration(Duration::from_secs(3 * 3600 + 60 + 1)),
            "3h1m1.0s"
        );
    }

    #[test]
    fn fragment_parsing_maps_to_lint_error() {
        assert!(matches!(parse_fragment("not json"), Err(Error::Config(_))));
        let conf = parse_fragment(r#"{"generate": {"mapping": "root = 1"}}"#).unwrap();
        assert_eq!(conf.type_name, "generate");
    }

    #[tokio::test]
    async fn router_wires_without_dynamic_brokers() {
        // Building the router must work before any dynamic component is
        // registered; handlers answer 404 at request time.
        let mgr = Manager::for_tests();
        let _router = router(mgr);
    }
}
