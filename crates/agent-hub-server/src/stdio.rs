//! Line-delimited-JSON stdio transport for the tool surface (§4.11: "any
//! transport... is sufficient"), layered on the same dispatch table as
//! [`crate::http`] for drivers that prefer pipes over HTTP.

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::AppState;

#[derive(Debug, Deserialize)]
struct StdioRequest {
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Reads one JSON request per line from `reader`, dispatches it, and writes
/// one JSON response per line to `writer`. Returns once the reader hits EOF.
pub async fn run<R, W>(state: &AppState, reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<StdioRequest>(&line) {
            Ok(request) => {
                let outcome = state.dispatch(&request.method, request.params).await;
                match outcome {
                    Ok(result) => json!({ "id": request.id, "result": result }),
                    Err(err) => json!({ "id": request.id, "error": err.to_json() }),
                }
            }
            Err(parse_err) => json!({
                "id": Value::Null,
                "error": { "code": -32700, "message": format!("parse error: {parse_err}") },
            }),
        };
        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
        writer.flush().await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_hub_audit::AuditLog;
    use agent_hub_breaker::ComponentBreaker;
    use agent_hub_budget::BudgetManager;
    use agent_hub_bus::{FileBus, MessageBus};
    use agent_hub_storage::WorkspaceLayout;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn test_state() -> AppState {
        let root = std::env::temp_dir().join(format!("agent-hub-stdio-test-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&root).await.unwrap();
        let layout = WorkspaceLayout::new(&root);
        let bus: Arc<dyn MessageBus> = Arc::new(FileBus::in_memory());
        let budget = Arc::new(
            BudgetManager::load_or_init(root.join("budget.json"), "session-1", 1.0, 5.0)
                .await
                .unwrap(),
        );
        let breaker = Arc::new(
            ComponentBreaker::load_or_init(root.join("breaker.json"), root.join("HALT.md"), 5, 3, 3)
                .await
                .unwrap(),
        );
        let audit = Arc::new(AuditLog::new(root.join("audit.ndjson"), "session-1"));
        AppState::new(layout, bus, budget, breaker, audit)
    }

    #[tokio::test]
    async fn dispatches_one_request_per_line() {
        let state = test_state().await;
        let input = b"{\"id\": 1, \"method\": \"budget_get_status\", \"params\": {}}\n".to_vec();
        let mut output = Vec::new();
        run(&state, input.as_slice(), &mut output).await.unwrap();
        let line = String::from_utf8(output).unwrap();
        let value: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["id"], json!(1));
        assert!(value["result"]["session_limit"].is_number());
    }

    #[tokio::test]
    async fn malformed_line_yields_parse_error() {
        let state = test_state().await;
        let input = b"not json\n".to_vec();
        let mut output = Vec::new();
        run(&state, input.as_slice(), &mut output).await.unwrap();
        let value: Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(value["error"]["code"], json!(-32700));
    }
}
