//! SQLite-backed bus (`data/hub.db`), one connection per process with
//! `IMMEDIATE` transaction isolation and a 30 second busy timeout.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{BusError, BusResult, Heartbeat, HubMessage, MessageBus, MessageType, WorkerQuestion};

pub struct SqliteBus {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBus {
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS subagent_messages (
                message_id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                subagent_id TEXT NOT NULL,
                question TEXT NOT NULL,
                answer TEXT,
                status TEXT NOT NULL DEFAULT 'PENDING',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_run_id ON subagent_messages(run_id);
            CREATE INDEX IF NOT EXISTS idx_status ON subagent_messages(status);
            CREATE INDEX IF NOT EXISTS idx_subagent_id ON subagent_messages(subagent_id);

            CREATE TABLE IF NOT EXISTS hub_messages (
                id TEXT PRIMARY KEY,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                msg_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                read INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_recipient ON hub_messages(recipient, read);

            CREATE TABLE IF NOT EXISTS agent_heartbeats (
                agent_id TEXT PRIMARY KEY,
                last_seen TEXT NOT NULL,
                progress TEXT
            );",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn wire_type(message_type: MessageType) -> &'static str {
        message_type.as_wire_str()
    }

    fn parse_type(raw: &str) -> BusResult<MessageType> {
        use MessageType::*;
        Ok(match raw {
            "PROPOSAL_READY" => ProposalReady,
            "REVIEW_NEEDED" => ReviewNeeded,
            "STOP_TASK" => StopTask,
            "QUESTION" => Question,
            "ANSWER" => Answer,
            "VERDICT_SIGNAL" => VerdictSignal,
            "HEARTBEAT" => Heartbeat,
            "DRAFT_READY" => DraftReady,
            "DRAFT_ACCEPTED" => DraftAccepted,
            "DRAFT_REJECTED" => DraftRejected,
            "DRAFT_ESCALATED" => DraftEscalated,
            other => return Err(BusError::InvalidMessageType(other.to_string())),
        })
    }
}

#[async_trait]
impl MessageBus for SqliteBus {
    async fn send_hub_message(
        &self,
        from: &str,
        to: &str,
        message_type: MessageType,
        payload: Value,
    ) -> BusResult<String> {
        let id = crate::new_message_id();
        let now = Utc::now();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO hub_messages (id, sender, recipient, msg_type, payload, timestamp, read)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                id,
                from,
                to,
                Self::wire_type(message_type),
                payload.to_string(),
                now.to_rfc3339(),
            ],
        )
        .map_err(|e| BusError::Backend(e.into()))?;
        Ok(id)
    }

    async fn receive_hub_messages(
        &self,
        to: &str,
        since: Option<DateTime<Utc>>,
    ) -> BusResult<Vec<HubMessage>> {
        let conn = self.conn.lock().await;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| BusError::Backend(e.into()))?;

        let ids: Vec<String> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM hub_messages WHERE recipient = ?1 AND read = 0
                     AND (?2 IS NULL OR timestamp >= ?2) ORDER BY timestamp ASC",
                )
                .map_err(|e| BusError::Backend(e.into()))?;
            let rows = stmt
                .query_map(params![to, since.map(|d| d.to_rfc3339())], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(|e| BusError::Backend(e.into()))?;
            rows.collect::<Result<_, _>>()
                .map_err(|e| BusError::Backend(e.into()))?
        };

        let mut out = Vec::with_capacity(ids.len());
        for id in &ids {
            let row = tx
                .query_row(
                    "SELECT id, sender, recipient, msg_type, payload, timestamp FROM hub_messages WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .map_err(|e| BusError::Backend(e.into()))?;

            tx.execute("UPDATE hub_messages SET read = 1 WHERE id = ?1", params![id])
                .map_err(|e| BusError::Backend(e.into()))?;

            let (id, sender, recipient, msg_type, payload, timestamp) = row;
            out.push(HubMessage {
                id,
                from: sender,
                to: recipient,
                message_type: Self::parse_type(&msg_type)?,
                payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                read_flag: true,
            });
        }

        tx.commit().map_err(|e| BusError::Backend(e.into()))?;
        Ok(out)
    }

    async fn ask_parent(&self, run_id: &str, subagent_id: &str, question: &str) -> BusResult<String> {
        let message_id = crate::new_message_id();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO subagent_messages (message_id, run_id, subagent_id, question, answer, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, NULL, 'PENDING', ?5, ?5)",
            params![message_id, run_id, subagent_id, question, now],
        )
        .map_err(|e| BusError::Backend(e.into()))?;
        Ok(message_id)
    }

    async fn reply_to_worker(&self, message_id: &str, answer: &str) -> BusResult<bool> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                "UPDATE subagent_messages SET answer = ?1, status = 'ANSWERED', updated_at = ?2
                 WHERE message_id = ?3 AND status = 'PENDING'",
                params![answer, now, message_id],
            )
            .map_err(|e| BusError::Backend(e.into()))?;
        Ok(updated > 0)
    }

    async fn check_answer(&self, message_id: &str) -> BusResult<Option<String>> {
        let conn = self.conn.lock().await;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| BusError::Backend(e.into()))?;

        let answer: Option<String> = tx
            .query_row(
                "SELECT answer FROM subagent_messages WHERE message_id = ?1 AND status = 'ANSWERED'",
                params![message_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| BusError::Backend(e.into()))?;

        if let Some(answer) = &answer {
            let now = Utc::now().to_rfc3339();
            tx.execute(
                "UPDATE subagent_messages SET status = 'RETRIEVED', updated_at = ?1 WHERE message_id = ?2",
                params![now, message_id],
            )
            .map_err(|e| BusError::Backend(e.into()))?;
            let _ = answer;
        }
        tx.commit().map_err(|e| BusError::Backend(e.into()))?;
        Ok(answer)
    }

    async fn get_pending_questions(&self, run_id: Option<&str>) -> BusResult<Vec<WorkerQuestion>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT message_id, run_id, subagent_id, question, answer, status, created_at, updated_at
                 FROM subagent_messages WHERE status = 'PENDING' AND (?1 IS NULL OR run_id = ?1)
                 ORDER BY created_at ASC",
            )
            .map_err(|e| BusError::Backend(e.into()))?;
        let rows = stmt
            .query_map(params![run_id], row_to_question)
            .map_err(|e| BusError::Backend(e.into()))?;
        rows.collect::<Result<_, _>>()
            .map_err(|e| BusError::Backend(e.into()))
    }

    async fn record_heartbeat(&self, agent_id: &str, progress: Option<&str>) -> BusResult<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO agent_heartbeats (agent_id, last_seen, progress) VALUES (?1, ?2, ?3)
             ON CONFLICT(agent_id) DO UPDATE SET last_seen = excluded.last_seen, progress = excluded.progress",
            params![agent_id, now, progress],
        )
        .map_err(|e| BusError::Backend(e.into()))?;
        Ok(())
    }

    async fn expire_old_messages(&self, max_age: chrono::Duration) -> BusResult<u64> {
        let cutoff = (Utc::now() - max_age).to_rfc3339();
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                "UPDATE subagent_messages SET status = 'EXPIRED' WHERE status = 'PENDING' AND created_at < ?1",
                params![cutoff],
            )
            .map_err(|e| BusError::Backend(e.into()))?;
        Ok(updated as u64)
    }
}

fn row_to_question(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkerQuestion> {
    let status_raw: String = row.get(5)?;
    Ok(WorkerQuestion {
        message_id: row.get(0)?,
        run_id: row.get(1)?,
        subagent_id: row.get(2)?,
        question: row.get(3)?,
        answer: row.get(4)?,
        status: parse_question_status(&status_raw),
        created_at: parse_ts(row.get::<_, String>(6)?),
        updated_at: parse_ts(row.get::<_, String>(7)?),
    })
}

fn parse_question_status(raw: &str) -> crate::QuestionStatus {
    use crate::QuestionStatus::*;
    match raw {
        "ANSWERED" => Answered,
        "RETRIEVED" => Retrieved,
        "EXPIRED" => Expired,
        _ => Pending,
    }
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
