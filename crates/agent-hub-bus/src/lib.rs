//! The message bus (message bus): hub envelopes, worker questions, and agent
//! heartbeats, with exactly-once consumption semantics for a recipient.
//!
//! The bus is modeled as a capability trait with two concrete backends
//! (SQLite-backed, file-backed), selected once at process startup by
//! configuration — callers never inspect which backend they were handed.

mod file_bus;
mod sqlite_bus;

pub use file_bus::FileBus;
pub use sqlite_bus::SqliteBus;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// The finite set of envelope types the bus will accept (message envelope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    ProposalReady,
    ReviewNeeded,
    StopTask,
    Question,
    Answer,
    VerdictSignal,
    Heartbeat,
    DraftReady,
    DraftAccepted,
    DraftRejected,
    DraftEscalated,
}

impl MessageType {
    pub fn as_wire_str(self) -> &'static str {
        match self {
            MessageType::ProposalReady => "PROPOSAL_READY",
            MessageType::ReviewNeeded => "REVIEW_NEEDED",
            MessageType::StopTask => "STOP_TASK",
            MessageType::Question => "QUESTION",
            MessageType::Answer => "ANSWER",
            MessageType::VerdictSignal => "VERDICT_SIGNAL",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::DraftReady => "DRAFT_READY",
            MessageType::DraftAccepted => "DRAFT_ACCEPTED",
            MessageType::DraftRejected => "DRAFT_REJECTED",
            MessageType::DraftEscalated => "DRAFT_ESCALATED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub read_flag: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionStatus {
    Pending,
    Answered,
    Retrieved,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerQuestion {
    pub message_id: String,
    pub run_id: String,
    pub subagent_id: String,
    pub question: String,
    pub answer: Option<String>,
    pub status: QuestionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub agent_id: String,
    pub last_seen: DateTime<Utc>,
    pub progress: Option<String>,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus backend failure: {0}")]
    Backend(#[source] anyhow::Error),
    #[error("invalid message type: {0}")]
    InvalidMessageType(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// The capability every bus backend implements (message bus operations).
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn send_hub_message(
        &self,
        from: &str,
        to: &str,
        message_type: MessageType,
        payload: Value,
    ) -> BusResult<String>;

    /// Atomically selects unread messages for `to`, marks them read, and
    /// returns them in timestamp order. A message is never delivered twice.
    async fn receive_hub_messages(
        &self,
        to: &str,
        since: Option<DateTime<Utc>>,
    ) -> BusResult<Vec<HubMessage>>;

    async fn ask_parent(&self, run_id: &str, subagent_id: &str, question: &str) -> BusResult<String>;

    /// PENDING -> ANSWERED. Returns `false` if no matching PENDING row (a
    /// lost race against `expire_old_messages` is acceptable).
    async fn reply_to_worker(&self, message_id: &str, answer: &str) -> BusResult<bool>;

    /// ANSWERED -> RETRIEVED, returning the answer exactly once.
    async fn check_answer(&self, message_id: &str) -> BusResult<Option<String>>;

    async fn get_pending_questions(&self, run_id: Option<&str>) -> BusResult<Vec<WorkerQuestion>>;

    async fn record_heartbeat(&self, agent_id: &str, progress: Option<&str>) -> BusResult<()>;

    /// Bulk PENDING -> EXPIRED for questions older than `max_age`. Returns
    /// the number of rows expired.
    async fn expire_old_messages(&self, max_age: chrono::Duration) -> BusResult<u64>;
}

pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Default TTL used by `expire_old_messages` when the caller does not name
/// one explicitly.
pub const DEFAULT_QUESTION_TTL_HOURS: i64 = 24;

#[cfg(test)]
mod shared_tests {
    //! Backend-agnostic behavior both `SqliteBus` and `FileBus` must satisfy.
    //! Each backend's own module additionally runs these against itself.
    use super::*;

    pub async fn exercise_exactly_once_delivery(bus: &dyn MessageBus) {
        bus.send_hub_message("worker-1", "supervisor", MessageType::Heartbeat, serde_json::json!({}))
            .await
            .unwrap();
        let first = bus.receive_hub_messages("supervisor", None).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = bus.receive_hub_messages("supervisor", None).await.unwrap();
        assert!(second.is_empty());
    }

    pub async fn exercise_question_roundtrip(bus: &dyn MessageBus) {
        let id = bus.ask_parent("run-1", "sub-1", "which option?").await.unwrap();
        assert!(bus.check_answer(&id).await.unwrap().is_none());
        assert!(bus.reply_to_worker(&id, "option-b").await.unwrap());
        let answer = bus.check_answer(&id).await.unwrap();
        assert_eq!(answer.as_deref(), Some("option-b"));
        // Second retrieval must not return the answer again.
        assert!(bus.check_answer(&id).await.unwrap().is_none());
    }
}
