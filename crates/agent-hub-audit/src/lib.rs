//! Cost/audit log (cost/audit log): every model call, budget check, and
//! state transition is appended here, never mutated.

use std::collections::HashMap;
use std::path::PathBuf;

use agent_hub_storage::EventLog;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The stable wire strings used across the budget manager, circuit breaker,
/// degradation manager, router, and message bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ModelCallStart,
    ModelCallSuccess,
    ModelCallFailure,
    ModelFallback,
    CircuitBreakerFailure,
    CircuitBreakerHalt,
    CircuitBreakerReset,
    DegradationEntered,
    DegradationRecovered,
    BudgetCheckPass,
    BudgetCheckFail,
    BudgetOverrideRequested,
    BudgetOverrideCleared,
    MessageSent,
    MessageReceived,
    QuestionAsked,
    QuestionAnswered,
    QuestionRetrieved,
    QuestionExpired,
    SessionStart,
    SessionEnd,
    DraftApplied,
    DraftRejected,
    DraftEscalated,
    Transition,
    StopTaskCancelled,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::ModelCallStart => "model_call_start",
            EventType::ModelCallSuccess => "model_call_success",
            EventType::ModelCallFailure => "model_call_failure",
            EventType::ModelFallback => "model_fallback",
            EventType::CircuitBreakerFailure => "circuit_breaker_failure",
            EventType::CircuitBreakerHalt => "circuit_breaker_halt",
            EventType::CircuitBreakerReset => "circuit_breaker_reset",
            EventType::DegradationEntered => "degradation_entered",
            EventType::DegradationRecovered => "degradation_recovered",
            EventType::BudgetCheckPass => "budget_check_pass",
            EventType::BudgetCheckFail => "budget_check_fail",
            EventType::BudgetOverrideRequested => "budget_override_requested",
            EventType::BudgetOverrideCleared => "budget_override_cleared",
            EventType::MessageSent => "message_sent",
            EventType::MessageReceived => "message_received",
            EventType::QuestionAsked => "question_asked",
            EventType::QuestionAnswered => "question_answered",
            EventType::QuestionRetrieved => "question_retrieved",
            EventType::QuestionExpired => "question_expired",
            EventType::SessionStart => "session_start",
            EventType::SessionEnd => "session_end",
            EventType::DraftApplied => "draft_applied",
            EventType::DraftRejected => "draft_rejected",
            EventType::DraftEscalated => "draft_escalated",
            EventType::Transition => "transition",
            EventType::StopTaskCancelled => "stop_task_cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub run_id: Option<String>,
    pub event_type: String,
    pub source: String,
    pub data: Value,
}

pub struct AuditLog {
    event_log: EventLog,
    session_id: String,
}

impl AuditLog {
    pub fn new(path: PathBuf, session_id: impl Into<String>) -> Self {
        Self {
            event_log: EventLog::new(path),
            session_id: session_id.into(),
        }
    }

    pub async fn log(
        &self,
        event_type: EventType,
        source: &str,
        data: Value,
        run_id: Option<&str>,
    ) -> anyhow::Result<()> {
        let event = AuditEvent {
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            run_id: run_id.map(|s| s.to_string()),
            event_type: event_type.as_str().to_string(),
            source: source.to_string(),
            data,
        };
        self.event_log.append(&event).await
    }

    /// Filters by event type / source / recency, newest-first, capped at
    /// `limit`.
    pub async fn get_events(
        &self,
        event_type: Option<EventType>,
        source: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> anyhow::Result<Vec<AuditEvent>> {
        let all = self.event_log.read_all().await?;
        let mut out = Vec::new();
        for raw in all {
            let Ok(event) = serde_json::from_value::<AuditEvent>(raw) else {
                continue;
            };
            if let Some(et) = event_type {
                if event.event_type != et.as_str() {
                    continue;
                }
            }
            if let Some(src) = source {
                if event.source != src {
                    continue;
                }
            }
            if let Some(cutoff) = since {
                if event.timestamp < cutoff {
                    continue;
                }
            }
            out.push(event);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Counts by event type for the current session.
    pub async fn get_session_summary(&self) -> anyhow::Result<HashMap<String, u64>> {
        let all = self.event_log.read_all().await?;
        let mut counts = HashMap::new();
        for raw in all {
            let Ok(event) = serde_json::from_value::<AuditEvent>(raw) else {
                continue;
            };
            if event.session_id != self.session_id {
                continue;
            }
            *counts.entry(event.event_type).or_insert(0u64) += 1;
        }
        Ok(counts)
    }
}

/// Helper used by the router: logs a model call result and, when the call
/// landed on a model other than the caller's preferred one, emits both a
/// success and a fallback event (model router, fallback behavior).
pub async fn log_model_call_outcome(
    audit: &AuditLog,
    source: &str,
    run_id: Option<&str>,
    model_used: &str,
    preferred_model: &str,
    success: bool,
    detail: Value,
) -> anyhow::Result<()> {
    let event_type = if success {
        EventType::ModelCallSuccess
    } else {
        EventType::ModelCallFailure
    };
    audit
        .log(event_type, source, detail.clone(), run_id)
        .await?;

    if success && model_used != preferred_model {
        audit
            .log(
                EventType::ModelFallback,
                source,
                serde_json::json!({ "preferred": preferred_model, "used": model_used }),
                run_id,
            )
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("agent-hub-audit-test-{}.ndjson", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn logs_and_filters_by_event_type() {
        let audit = AuditLog::new(temp_path(), "session-1");
        audit
            .log(EventType::SessionStart, "supervisor", serde_json::json!({}), None)
            .await
            .unwrap();
        audit
            .log(EventType::ModelCallFailure, "router", serde_json::json!({"model": "x"}), None)
            .await
            .unwrap();

        let failures = audit
            .get_events(Some(EventType::ModelCallFailure), None, None, 10)
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].source, "router");
    }

    #[tokio::test]
    async fn fallback_helper_emits_success_then_fallback() {
        let audit = AuditLog::new(temp_path(), "session-2");
        log_model_call_outcome(
            &audit,
            "router",
            Some("run-1"),
            "cloud-fast",
            "local-coder",
            true,
            serde_json::json!({}),
        )
        .await
        .unwrap();

        let summary = audit.get_session_summary().await.unwrap();
        assert_eq!(summary.get("model_call_success"), Some(&1));
        assert_eq!(summary.get("model_fallback"), Some(&1));
    }

    #[tokio::test]
    async fn session_summary_counts_current_session_only() {
        let path = temp_path();
        let audit_a = AuditLog::new(path.clone(), "session-a");
        audit_a
            .log(EventType::SessionStart, "supervisor", serde_json::json!({}), None)
            .await
            .unwrap();
        let audit_b = AuditLog::new(path, "session-b");
        let summary = audit_b.get_session_summary().await.unwrap();
        assert!(summary.is_empty());
    }
}
