//! Tool surface (§4.11): the request/response protocol external drivers use
//! to reach the rest of the core. `AppState::dispatch` is the single
//! dispatch table; [`http::serve`] and [`stdio::run`] are two transports
//! layered on top of it, sharing one dispatch table between the axum app
//! and the line-delimited-JSON stdio mode.

mod http;
mod stdio;

use std::path::PathBuf;
use std::sync::Arc;

use agent_hub_audit::{AuditLog, EventType};
use agent_hub_breaker::ComponentBreaker;
use agent_hub_budget::BudgetManager;
use agent_hub_bus::{MessageBus, MessageType};
use agent_hub_contract::{apply_transition, NoopCheckpoint};
use agent_hub_sandbox::{draft_path, submission_path, validate_sandbox_write, DraftSubmission};
use agent_hub_storage::{atomic_write_json, safe_read_json, WorkspaceLayout};
use agent_hub_types::{TaskContract, TaskEvent, ToolSchema};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use thiserror::Error;

pub use http::serve;
pub use stdio::run as run_stdio;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ToolError {
    pub fn code(&self) -> i32 {
        match self {
            ToolError::MethodNotFound(_) => -32601,
            ToolError::InvalidParams(_) => -32602,
            ToolError::Internal(_) => -32000,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({ "code": self.code(), "message": self.to_string() })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub layout: WorkspaceLayout,
    pub bus: Arc<dyn MessageBus>,
    pub budget: Arc<BudgetManager>,
    pub breaker: Arc<ComponentBreaker>,
    pub audit: Arc<AuditLog>,
}

impl AppState {
    pub fn new(
        layout: WorkspaceLayout,
        bus: Arc<dyn MessageBus>,
        budget: Arc<BudgetManager>,
        breaker: Arc<ComponentBreaker>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self { layout, bus, budget, breaker, audit }
    }

    /// The stable, wire-identifier tool set (tool surface, concrete tool set).
    pub fn list_tools(&self) -> Vec<ToolSchema> {
        [
            ("hub_connect", "Registers an agent_id as connected and records its first heartbeat."),
            ("hub_send_message", "Sends a typed hub envelope from one agent to another."),
            ("hub_receive_messages", "Atomically drains unread envelopes addressed to an agent."),
            ("hub_record_heartbeat", "Upserts an agent's last-seen timestamp and progress note."),
            ("hub_ask_parent", "Inserts a PENDING worker question for the supervisor to answer."),
            ("hub_reply_to_worker", "Answers a PENDING question (PENDING -> ANSWERED)."),
            ("hub_check_answer", "Retrieves an ANSWERED question's answer (ANSWERED -> RETRIEVED)."),
            ("worker_submit_draft", "Stages a draft + submission pointer in the sandbox and signals DRAFT_READY."),
            ("budget_get_status", "Returns the current session/day budget accounting."),
            ("budget_request_override", "Opens a time-boxed budget override window."),
            ("budget_clear_override", "Closes an active budget override window early."),
            ("breaker_get_status", "Returns the component-layer circuit-breaker counters."),
            ("breaker_reset", "Clears all component failure counters and lifts a halt."),
            ("contract_get", "Returns the active task contract."),
            ("contract_transition", "Applies a state-machine event to the active task contract."),
        ]
        .into_iter()
        .map(|(name, description)| ToolSchema {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: json!({ "type": "object" }),
        })
        .collect()
    }

    pub async fn dispatch(&self, method: &str, params: Value) -> Result<Value, ToolError> {
        self.audit
            .log(EventType::MessageReceived, "tool_surface", json!({ "method": method }), None)
            .await
            .ok();

        match method {
            "list_tools" => Ok(json!(self.list_tools())),
            "hub_connect" => self.hub_connect(params).await,
            "hub_send_message" => self.hub_send_message(params).await,
            "hub_receive_messages" => self.hub_receive_messages(params).await,
            "hub_record_heartbeat" => self.hub_record_heartbeat(params).await,
            "hub_ask_parent" => self.hub_ask_parent(params).await,
            "hub_reply_to_worker" => self.hub_reply_to_worker(params).await,
            "hub_check_answer" => self.hub_check_answer(params).await,
            "worker_submit_draft" => self.worker_submit_draft(params).await,
            "budget_get_status" => Ok(json!(self.budget.get_status().await)),
            "budget_request_override" => self.budget_request_override(params).await,
            "budget_clear_override" => {
                self.budget.clear_override().await?;
                Ok(json!({ "cleared": true }))
            }
            "breaker_get_status" => Ok(json!(self.breaker.snapshot().await)),
            "breaker_reset" => {
                self.breaker.reset().await?;
                Ok(json!({ "reset": true }))
            }
            "contract_get" => self.contract_get().await,
            "contract_transition" => self.contract_transition(params).await,
            other => Err(ToolError::MethodNotFound(other.to_string())),
        }
    }

    async fn hub_connect(&self, params: Value) -> Result<Value, ToolError> {
        let agent_id = require_str(&params, "agent_id")?;
        self.bus
            .record_heartbeat(&agent_id, Some("connected"))
            .await
            .map_err(|e| ToolError::Internal(e.into()))?;
        Ok(json!({ "agent_id": agent_id, "connected": true }))
    }

    async fn hub_send_message(&self, params: Value) -> Result<Value, ToolError> {
        let from = require_str(&params, "from")?;
        let to = require_str(&params, "to")?;
        let message_type_raw = require_str(&params, "type")?;
        let message_type: MessageType = serde_json::from_value(json!(message_type_raw))
            .map_err(|_| ToolError::InvalidParams(format!("unknown message type {message_type_raw}")))?;
        let payload = params.get("payload").cloned().unwrap_or(Value::Null);
        let id = self
            .bus
            .send_hub_message(&from, &to, message_type, payload)
            .await
            .map_err(|e| ToolError::Internal(e.into()))?;
        Ok(json!({ "id": id }))
    }

    async fn hub_receive_messages(&self, params: Value) -> Result<Value, ToolError> {
        let to = require_str(&params, "to")?;
        let since: Option<DateTime<Utc>> = params
            .get("since")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let messages = self
            .bus
            .receive_hub_messages(&to, since)
            .await
            .map_err(|e| ToolError::Internal(e.into()))?;
        Ok(json!({ "messages": messages }))
    }

    async fn hub_record_heartbeat(&self, params: Value) -> Result<Value, ToolError> {
        let agent_id = require_str(&params, "agent_id")?;
        let progress = params.get("progress").and_then(|v| v.as_str());
        self.bus
            .record_heartbeat(&agent_id, progress)
            .await
            .map_err(|e| ToolError::Internal(e.into()))?;
        Ok(json!({ "recorded": true }))
    }

    async fn hub_ask_parent(&self, params: Value) -> Result<Value, ToolError> {
        let run_id = require_str(&params, "run_id")?;
        let subagent_id = require_str(&params, "subagent_id")?;
        let question = require_str(&params, "question")?;
        let message_id = self
            .bus
            .ask_parent(&run_id, &subagent_id, &question)
            .await
            .map_err(|e| ToolError::Internal(e.into()))?;
        Ok(json!({ "message_id": message_id }))
    }

    async fn hub_reply_to_worker(&self, params: Value) -> Result<Value, ToolError> {
        let message_id = require_str(&params, "message_id")?;
        let answer = require_str(&params, "answer")?;
        let replied = self
            .bus
            .reply_to_worker(&message_id, &answer)
            .await
            .map_err(|e| ToolError::Internal(e.into()))?;
        Ok(json!({ "replied": replied }))
    }

    async fn hub_check_answer(&self, params: Value) -> Result<Value, ToolError> {
        let message_id = require_str(&params, "message_id")?;
        let answer = self
            .bus
            .check_answer(&message_id)
            .await
            .map_err(|e| ToolError::Internal(e.into()))?;
        Ok(json!({ "answer": answer }))
    }

    /// Stages a submission pointer for the sandbox gate (worker question
    /// record is a distinct mechanism; this is the draft path) and signals
    /// `DRAFT_READY` so the pipeline supervisor picks it up on its next
    /// poll, exactly as a worker process would after writing its draft.
    async fn worker_submit_draft(&self, params: Value) -> Result<Value, ToolError> {
        let task_id = require_str(&params, "task_id")?;
        let original_path = PathBuf::from(require_str(&params, "original_path")?);
        let draft_path_raw = PathBuf::from(require_str(&params, "draft_path")?);
        let original_hash = require_str(&params, "original_hash")?;

        let sandbox_dir = self.layout.sandbox_dir();
        let source_basename = original_path
            .file_name()
            .ok_or_else(|| ToolError::InvalidParams("original_path has no file name".into()))?
            .to_string_lossy()
            .to_string();
        let expected_draft = draft_path(&sandbox_dir, &source_basename, &task_id);
        if draft_path_raw != expected_draft {
            return Err(ToolError::InvalidParams(format!(
                "draft_path must be {}",
                expected_draft.display()
            )));
        }
        validate_sandbox_write(&expected_draft, &sandbox_dir)
            .map_err(|e| ToolError::InvalidParams(e.to_string()))?;

        let submission = DraftSubmission {
            task_id: task_id.clone(),
            original_path,
            draft_path: expected_draft,
            original_hash,
        };
        let sub_path = submission_path(&sandbox_dir, &task_id);
        validate_sandbox_write(&sub_path, &sandbox_dir).map_err(|e| ToolError::InvalidParams(e.to_string()))?;
        atomic_write_json(&sub_path, &submission).await?;

        let message_id = self
            .bus
            .send_hub_message("worker", "supervisor", MessageType::DraftReady, json!({ "task_id": task_id }))
            .await
            .map_err(|e| ToolError::Internal(e.into()))?;
        Ok(json!({ "message_id": message_id, "submission_path": sub_path }))
    }

    async fn budget_request_override(&self, params: Value) -> Result<Value, ToolError> {
        let reason = require_str(&params, "reason")?;
        let duration_minutes = params
            .get("duration_minutes")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ToolError::InvalidParams("duration_minutes is required".into()))?;
        self.budget.request_override(reason, duration_minutes).await?;
        Ok(json!({ "active": true }))
    }

    async fn contract_get(&self) -> Result<Value, ToolError> {
        let contract: Option<TaskContract> = safe_read_json(&self.layout.contract_path()).await?;
        match contract {
            Some(c) => Ok(json!(c)),
            None => Ok(Value::Null),
        }
    }

    async fn contract_transition(&self, params: Value) -> Result<Value, ToolError> {
        let event_raw = require_str(&params, "event")?;
        let event: TaskEvent = serde_json::from_value(json!(event_raw))
            .map_err(|_| ToolError::InvalidParams(format!("unknown event {event_raw}")))?;

        let mut contract: TaskContract = safe_read_json(&self.layout.contract_path())
            .await?
            .ok_or_else(|| ToolError::InvalidParams("no active contract".into()))?;

        apply_transition(&self.layout, &mut contract, event, &NoopCheckpoint, &self.audit, None)
            .await
            .map_err(|e| ToolError::Internal(e.into()))?;

        Ok(json!(contract))
    }
}

fn require_str(params: &Value, key: &str) -> Result<String, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ToolError::InvalidParams(format!("missing or non-string field: {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_hub_bus::FileBus;
    use uuid::Uuid;

    async fn state() -> AppState {
        let root = std::env::temp_dir().join(format!("agent-hub-server-test-{}", Uuid::new_v4()));
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
    async fn list_tools_includes_contract_transition() {
        let state = state().await;
        let tools = state.list_tools();
        assert!(tools.iter().any(|t| t.name == "contract_transition"));
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let state = state().await;
        let err = state.dispatch("no_such_method", json!({})).await.unwrap_err();
        assert_eq!(err.code(), -32601);
    }

    #[tokio::test]
    async fn hub_roundtrip_send_then_receive() {
        let state = state().await;
        state
            .dispatch(
                "hub_send_message",
                json!({ "from": "worker", "to": "supervisor", "type": "HEARTBEAT", "payload": {} }),
            )
            .await
            .unwrap();
        let out = state.dispatch("hub_receive_messages", json!({ "to": "supervisor" })).await.unwrap();
        assert_eq!(out["messages"].as_array().unwrap().len(), 1);
        let out2 = state.dispatch("hub_receive_messages", json!({ "to": "supervisor" })).await.unwrap();
        assert_eq!(out2["messages"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn contract_get_with_no_contract_is_null() {
        let state = state().await;
        let out = state.dispatch("contract_get", json!({})).await.unwrap();
        assert!(out.is_null());
    }

    #[tokio::test]
    async fn budget_status_reports_configured_limits() {
        let state = state().await;
        let out = state.dispatch("budget_get_status", json!({})).await.unwrap();
        assert_eq!(out["session_limit"], json!(1.0));
    }
}
