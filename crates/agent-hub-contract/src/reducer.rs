//! Contract mutation: lock acquisition, transition application (with audit
//! logging and an optional git checkpoint), and the breaker trigger check
//! that runs before every persisted transition (I4).

use std::path::Path;
use std::process::Stdio;

use agent_hub_audit::{AuditLog, EventType};
use agent_hub_breaker::{evaluate_task_triggers, trip_task, JudgeReport, TaskTrigger, TriggerContext};
use agent_hub_storage::atomic_write::atomic_write_json;
use agent_hub_storage::storage_paths::WorkspaceLayout;
use agent_hub_types::{HistoryEntry, Lock, TaskContract, TaskEvent, TaskStatus};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tokio::process::Command;

use crate::transitions::{next_status, TransitionError};

#[derive(Debug, Error)]
pub enum ReducerError {
    #[error("lock held by {holder} until {expires_at}")]
    LockHeld { holder: String, expires_at: chrono::DateTime<Utc> },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("breaker is tripped; no transitions are accepted until it is reset")]
    BreakerTripped,
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// (I4) checked before any transition other than the halt itself.
fn ensure_not_tripped(contract: &TaskContract) -> Result<(), ReducerError> {
    if agent_hub_breaker::breaker_is_tripped(contract) {
        Err(ReducerError::BreakerTripped)
    } else {
        Ok(())
    }
}

/// `acquire_lock(actor)` succeeds if there is no holder, the holder is
/// already `actor`, or the current lock has expired.
pub fn acquire_lock(contract: &mut TaskContract, actor: &str, role_timeout_minutes: i64) -> Result<(), ReducerError> {
    let now = Utc::now();
    if let Some(lock) = &contract.lock {
        if lock.held_by != actor && now < lock.expires_at {
            return Err(ReducerError::LockHeld {
                holder: lock.held_by.clone(),
                expires_at: lock.expires_at,
            });
        }
    }
    contract.lock = Some(Lock {
        held_by: actor.to_string(),
        acquired_at: now,
        expires_at: now + chrono::Duration::minutes(role_timeout_minutes),
    });
    Ok(())
}

pub fn release_lock(contract: &mut TaskContract, actor: &str) -> bool {
    match &contract.lock {
        Some(lock) if lock.held_by == actor => {
            contract.lock = None;
            true
        }
        _ => false,
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("git checkpoint failed: {0}")]
    CommandFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Each transition performs a checkpoint commit when a git manager is
/// present; merging the task branch happens only on the `merged -> finalize`
/// action, and a merge conflict is surfaced as a halt-equivalent error.
#[async_trait]
pub trait CheckpointCapability: Send + Sync {
    async fn checkpoint(&self, repo_root: &Path, task_id: &str, message: &str) -> Result<(), CheckpointError>;
    async fn merge(&self, repo_root: &Path, task_branch: &str, base_branch: &str) -> Result<(), CheckpointError>;
}

/// Used when no git repository backs the workspace (e.g. tests, or tasks
/// running outside a repo).
pub struct NoopCheckpoint;

#[async_trait]
impl CheckpointCapability for NoopCheckpoint {
    async fn checkpoint(&self, _repo_root: &Path, _task_id: &str, _message: &str) -> Result<(), CheckpointError> {
        Ok(())
    }

    async fn merge(&self, _repo_root: &Path, _task_branch: &str, _base_branch: &str) -> Result<(), CheckpointError> {
        Ok(())
    }
}

/// Shells out to the system `git` binary, the same mechanism the rest of
/// this codebase uses for repository operations.
pub struct GitCheckpoint;

impl GitCheckpoint {
    async fn run(&self, repo_root: &Path, args: &[&str]) -> Result<(), CheckpointError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(repo_root)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(CheckpointError::CommandFailed(String::from_utf8_lossy(&output.stderr).to_string()))
        }
    }
}

#[async_trait]
impl CheckpointCapability for GitCheckpoint {
    async fn checkpoint(&self, repo_root: &Path, task_id: &str, message: &str) -> Result<(), CheckpointError> {
        self.run(repo_root, &["add", "-A"]).await?;
        let commit_message = format!("[TASK: {task_id}] {message}");
        self.run(repo_root, &["commit", "-m", &commit_message, "--allow-empty"]).await
    }

    async fn merge(&self, repo_root: &Path, task_branch: &str, base_branch: &str) -> Result<(), CheckpointError> {
        self.run(repo_root, &["checkout", base_branch]).await?;
        self.run(repo_root, &["merge", "--no-ff", task_branch]).await
    }
}

/// Applies `event` to `contract`: validates the transition, runs the
/// task-layer breaker triggers, checkpoints, persists, and audits — in that
/// order, so a tripped breaker or a failed checkpoint never leaves a
/// half-applied contract on disk.
pub async fn apply_transition(
    layout: &WorkspaceLayout,
    contract: &mut TaskContract,
    event: TaskEvent,
    checkpoint: &dyn CheckpointCapability,
    audit: &AuditLog,
    judge_report: Option<&JudgeReport>,
) -> Result<(), ReducerError> {
    ensure_not_tripped(contract)?;

    let target = next_status(contract.status, event, contract.attempt)?;

    if let Some(trigger) = evaluate_triggers_for(contract, judge_report) {
        trip_task(layout, contract, trigger).await?;
        audit
            .log(
                EventType::CircuitBreakerHalt,
                "contract",
                json!({ "task_id": contract.task_id, "reason": contract.status_reason }),
                None,
            )
            .await?;
        return Ok(());
    }

    if matches!(event, TaskEvent::Retry) {
        contract.attempt += 1;
    }

    contract.status = target;
    contract.timestamps.updated_at = Some(Utc::now());
    contract.history.push(HistoryEntry {
        event: format!("{event:?}"),
        file_hash: contract.handoff_data.current_file_hash.clone(),
        verdict: contract.handoff_data.judge_verdict.clone(),
        recorded_at: Utc::now(),
    });

    if let Some(repo_root) = contract.git.repo_root.clone() {
        let message = format!("Transition: {target:?} (Event: {event:?})");
        checkpoint.checkpoint(Path::new(&repo_root), &contract.task_id, &message).await?;

        if matches!(target, TaskStatus::Merged) {
            if let (Some(task_branch), Some(base_branch)) =
                (contract.git.task_branch.clone(), contract.git.base_branch.clone())
            {
                checkpoint.merge(Path::new(&repo_root), &task_branch, &base_branch).await?;
            }
        }
    }

    atomic_write_json(&layout.contract_path(), contract).await?;

    audit
        .log(
            EventType::Transition,
            "contract",
            json!({ "task_id": contract.task_id, "event": format!("{event:?}"), "status": format!("{target:?}") }),
            None,
        )
        .await?;

    Ok(())
}

fn evaluate_triggers_for(contract: &TaskContract, judge_report: Option<&JudgeReport>) -> Option<TaskTrigger> {
    let ctx = TriggerContext {
        current_file_lines: None,
        lines_deleted: None,
        judge_report,
    };
    evaluate_task_triggers(contract, &ctx)
}

/// The compound stall-retry behavior (§4.9/§4.10): a stalled task is moved
/// through `timeout` and then `retry` as two separately audited transitions,
/// never as one combined event.
pub async fn retry_after_stall(
    layout: &WorkspaceLayout,
    contract: &mut TaskContract,
    checkpoint: &dyn CheckpointCapability,
    audit: &AuditLog,
) -> Result<(), ReducerError> {
    apply_transition(layout, contract, TaskEvent::Timeout, checkpoint, audit, None).await?;
    if matches!(contract.status, TaskStatus::TimeoutImplementer | TaskStatus::TimeoutJudge) {
        apply_transition(layout, contract, TaskEvent::Retry, checkpoint, audit, None).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_hub_types::Complexity;
    use uuid::Uuid;

    fn base_contract() -> TaskContract {
        TaskContract::new("task-1", "proj", Complexity::Minor)
    }

    fn temp_layout() -> WorkspaceLayout {
        WorkspaceLayout::new(std::env::temp_dir().join(format!("agent-hub-reducer-test-{}", Uuid::new_v4())))
    }

    #[test]
    fn acquire_lock_succeeds_when_unheld() {
        let mut c = base_contract();
        acquire_lock(&mut c, "implementer-1", 15).unwrap();
        assert_eq!(c.lock.as_ref().unwrap().held_by, "implementer-1");
    }

    #[test]
    fn acquire_lock_rejects_different_live_holder() {
        let mut c = base_contract();
        acquire_lock(&mut c, "implementer-1", 15).unwrap();
        let err = acquire_lock(&mut c, "implementer-2", 15).unwrap_err();
        assert!(matches!(err, ReducerError::LockHeld { .. }));
    }

    #[test]
    fn acquire_lock_allows_reacquire_by_same_actor() {
        let mut c = base_contract();
        acquire_lock(&mut c, "implementer-1", 15).unwrap();
        acquire_lock(&mut c, "implementer-1", 15).unwrap();
    }

    #[test]
    fn acquire_lock_allows_takeover_after_expiry() {
        let mut c = base_contract();
        c.lock = Some(Lock {
            held_by: "implementer-1".to_string(),
            acquired_at: Utc::now() - chrono::Duration::minutes(30),
            expires_at: Utc::now() - chrono::Duration::minutes(15),
        });
        acquire_lock(&mut c, "implementer-2", 15).unwrap();
        assert_eq!(c.lock.as_ref().unwrap().held_by, "implementer-2");
    }

    #[test]
    fn release_lock_only_clears_own_lock() {
        let mut c = base_contract();
        acquire_lock(&mut c, "implementer-1", 15).unwrap();
        assert!(!release_lock(&mut c, "implementer-2"));
        assert!(release_lock(&mut c, "implementer-1"));
        assert!(c.lock.is_none());
    }

    #[tokio::test]
    async fn apply_transition_advances_status_and_persists() {
        let layout = temp_layout();
        let mut c = base_contract();
        let audit = AuditLog::new(layout.audit_log_path(), "session-1");

        apply_transition(&layout, &mut c, TaskEvent::LockAcquired, &NoopCheckpoint, &audit, None)
            .await
            .unwrap();
        assert_eq!(c.status, TaskStatus::ImplementationInProgress);

        let persisted: TaskContract = serde_json::from_slice(
            &tokio::fs::read(layout.contract_path()).await.unwrap(),
        )
        .unwrap();
        assert_eq!(persisted.status, TaskStatus::ImplementationInProgress);
        tokio::fs::remove_dir_all(&layout.workspace_root).await.ok();
    }

    #[tokio::test]
    async fn apply_transition_trips_breaker_instead_of_advancing() {
        let layout = temp_layout();
        let mut c = base_contract();
        c.limits.max_rebuttals = Some(1);
        c.breaker.rebuttal_count = 2;
        c.status = TaskStatus::ReviewComplete;
        let audit = AuditLog::new(layout.audit_log_path(), "session-1");

        apply_transition(&layout, &mut c, TaskEvent::FailDisagree, &NoopCheckpoint, &audit, None)
            .await
            .unwrap();

        assert_eq!(c.status, TaskStatus::ErikConsultation);
        assert!(agent_hub_breaker::breaker_is_tripped(&c));
        tokio::fs::remove_dir_all(&layout.workspace_root).await.ok();
    }

    #[tokio::test]
    async fn retry_after_stall_runs_timeout_then_retry() {
        let layout = temp_layout();
        let mut c = base_contract();
        c.status = TaskStatus::ImplementationInProgress;
        let audit = AuditLog::new(layout.audit_log_path(), "session-1");

        retry_after_stall(&layout, &mut c, &NoopCheckpoint, &audit).await.unwrap();
        assert_eq!(c.status, TaskStatus::PendingImplementer);
        assert_eq!(c.attempt, 2);
        tokio::fs::remove_dir_all(&layout.workspace_root).await.ok();
    }
}
