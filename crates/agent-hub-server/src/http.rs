//! HTTP transport for the tool surface (§4.11): a thin axum app exposing
//! `list_tools` and `call_tool` over the same [`crate::AppState::dispatch`]
//! table the stdio transport uses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::AppState;

#[derive(Debug, Deserialize)]
struct CallToolRequest {
    name: String,
    #[serde(default)]
    arguments: Value,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "tool surface listening");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/tools/list", post(list_tools))
        .route("/tools/call", post(call_tool))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

async fn list_tools(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "tools": state.list_tools() }))
}

async fn call_tool(State(state): State<Arc<AppState>>, Json(req): Json<CallToolRequest>) -> impl IntoResponse {
    let started = Instant::now();
    let default_timeout = std::time::Duration::from_secs(30);
    let timeout = req.timeout_ms.map(std::time::Duration::from_millis).unwrap_or(default_timeout);

    let outcome = tokio::time::timeout(timeout, state.dispatch(&req.name, req.arguments)).await;

    match outcome {
        Ok(Ok(result)) => (
            StatusCode::OK,
            Json(json!({ "result": result, "elapsed_ms": started.elapsed().as_millis() })),
        ),
        Ok(Err(err)) => (
            StatusCode::OK,
            Json(json!({ "error": err.to_json() })),
        ),
        Err(_) => (
            StatusCode::OK,
            Json(json!({ "error": { "code": -32001, "message": format!("call to {} timed out", req.name) } })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_hub_audit::AuditLog;
    use agent_hub_breaker::ComponentBreaker;
    use agent_hub_budget::BudgetManager;
    use agent_hub_bus::{FileBus, MessageBus};
    use agent_hub_storage::WorkspaceLayout;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn test_state() -> AppState {
        let root = std::env::temp_dir().join(format!("agent-hub-http-test-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&root).await.unwrap();
        let layout = WorkspaceLayout::new(&root);
        let bus: std::sync::Arc<dyn MessageBus> = std::sync::Arc::new(FileBus::in_memory());
        let budget = std::sync::Arc::new(
            BudgetManager::load_or_init(root.join("budget.json"), "session-1", 1.0, 5.0)
                .await
                .unwrap(),
        );
        let breaker = std::sync::Arc::new(
            ComponentBreaker::load_or_init(root.join("breaker.json"), root.join("HALT.md"), 5, 3, 3)
                .await
                .unwrap(),
        );
        let audit = std::sync::Arc::new(AuditLog::new(root.join("audit.ndjson"), "session-1"));
        AppState::new(layout, bus, budget, breaker, audit)
    }

    #[tokio::test]
    async fn list_tools_endpoint_returns_array() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/tools/list").method("POST").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn call_tool_unknown_method_returns_error_envelope() {
        let app = build_router(test_state().await);
        let body = serde_json::to_vec(&json!({ "name": "nope", "arguments": {} })).unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/tools/call")
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"]["code"], json!(-32601));
    }
}
