//! File-backed bus fallback (selected when `UAS_SQLITE_BUS` is disabled):
//! same logical rows as the SQLite backend, held as in-process state guarded
//! by a `tokio::sync::RwLock`, giving the same exactly-once semantics within
//! a single process.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{BusError, BusResult, Heartbeat, HubMessage, MessageBus, MessageType, QuestionStatus, WorkerQuestion};

#[derive(Default, Serialize, Deserialize)]
struct FileBusState {
    messages: Vec<HubMessage>,
    questions: HashMap<String, WorkerQuestion>,
    heartbeats: HashMap<String, Heartbeat>,
}

pub struct FileBus {
    state: RwLock<FileBusState>,
    persist_path: Option<PathBuf>,
}

impl FileBus {
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(FileBusState::default()),
            persist_path: None,
        }
    }

    pub async fn open(persist_path: PathBuf) -> anyhow::Result<Self> {
        let state = match agent_hub_storage::safe_read(&persist_path).await? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => FileBusState::default(),
        };
        Ok(Self {
            state: RwLock::new(state),
            persist_path: Some(persist_path),
        })
    }

    async fn persist(&self, state: &FileBusState) -> BusResult<()> {
        if let Some(path) = &self.persist_path {
            agent_hub_storage::atomic_write_json(path, state)
                .await
                .map_err(BusError::Backend)?;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for FileBus {
    async fn send_hub_message(
        &self,
        from: &str,
        to: &str,
        message_type: MessageType,
        payload: Value,
    ) -> BusResult<String> {
        let id = crate::new_message_id();
        let mut state = self.state.write().await;
        state.messages.push(HubMessage {
            id: id.clone(),
            from: from.to_string(),
            to: to.to_string(),
            message_type,
            payload,
            timestamp: Utc::now(),
            read_flag: false,
        });
        self.persist(&state).await?;
        Ok(id)
    }

    async fn receive_hub_messages(
        &self,
        to: &str,
        since: Option<DateTime<Utc>>,
    ) -> BusResult<Vec<HubMessage>> {
        let mut state = self.state.write().await;
        let mut matched: Vec<usize> = state
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                m.to == to && !m.read_flag && since.map(|s| m.timestamp >= s).unwrap_or(true)
            })
            .map(|(i, _)| i)
            .collect();
        matched.sort_by_key(|&i| state.messages[i].timestamp);

        let mut out = Vec::with_capacity(matched.len());
        for i in &matched {
            state.messages[*i].read_flag = true;
            out.push(state.messages[*i].clone());
        }
        self.persist(&state).await?;
        Ok(out)
    }

    async fn ask_parent(&self, run_id: &str, subagent_id: &str, question: &str) -> BusResult<String> {
        let message_id = crate::new_message_id();
        let now = Utc::now();
        let mut state = self.state.write().await;
        state.questions.insert(
            message_id.clone(),
            WorkerQuestion {
                message_id: message_id.clone(),
                run_id: run_id.to_string(),
                subagent_id: subagent_id.to_string(),
                question: question.to_string(),
                answer: None,
                status: QuestionStatus::Pending,
                created_at: now,
                updated_at: now,
            },
        );
        self.persist(&state).await?;
        Ok(message_id)
    }

    async fn reply_to_worker(&self, message_id: &str, answer: &str) -> BusResult<bool> {
        let mut state = self.state.write().await;
        let replied = match state.questions.get_mut(message_id) {
            Some(q) if q.status == QuestionStatus::Pending => {
                q.answer = Some(answer.to_string());
                q.status = QuestionStatus::Answered;
                q.updated_at = Utc::now();
                true
            }
            _ => false,
        };
        if replied {
            self.persist(&state).await?;
        }
        Ok(replied)
    }

    async fn check_answer(&self, message_id: &str) -> BusResult<Option<String>> {
        let mut state = self.state.write().await;
        let answer = match state.questions.get_mut(message_id) {
            Some(q) if q.status == QuestionStatus::Answered => {
                q.status = QuestionStatus::Retrieved;
                q.updated_at = Utc::now();
                q.answer.clone()
            }
            _ => None,
        };
        if answer.is_some() {
            self.persist(&state).await?;
        }
        Ok(answer)
    }

    async fn get_pending_questions(&self, run_id: Option<&str>) -> BusResult<Vec<WorkerQuestion>> {
        let state = self.state.read().await;
        let mut pending: Vec<WorkerQuestion> = state
            .questions
            .values()
            .filter(|q| {
                q.status == QuestionStatus::Pending && run_id.map(|r| r == q.run_id).unwrap_or(true)
            })
            .cloned()
            .collect();
        pending.sort_by_key(|q| q.created_at);
        Ok(pending)
    }

    async fn record_heartbeat(&self, agent_id: &str, progress: Option<&str>) -> BusResult<()> {
        let mut state = self.state.write().await;
        state.heartbeats.insert(
            agent_id.to_string(),
            Heartbeat {
                agent_id: agent_id.to_string(),
                last_seen: Utc::now(),
                progress: progress.map(|p| p.to_string()),
            },
        );
        self.persist(&state).await?;
        Ok(())
    }

    async fn expire_old_messages(&self, max_age: chrono::Duration) -> BusResult<u64> {
        let cutoff = Utc::now() - max_age;
        let mut state = self.state.write().await;
        let mut count = 0u64;
        for q in state.questions.values_mut() {
            if q.status == QuestionStatus::Pending && q.created_at < cutoff {
                q.status = QuestionStatus::Expired;
                q.updated_at = Utc::now();
                count += 1;
            }
        }
        if count > 0 {
            self.persist(&state).await?;
        }
        Ok(count)
    }
}
