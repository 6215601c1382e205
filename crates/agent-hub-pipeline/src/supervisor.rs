//! The pipeline supervisor (§4.10): subscribes to the message bus, emits a
//! heartbeat on a fixed interval, polls for new envelopes adaptively, and
//! dispatches each to the handler for its message type. A handler panic is
//! isolated to its own task and logged rather than killing the run loop.
//! `PROPOSAL_READY` pipelines run detached so the loop keeps polling for
//! `STOP_TASK` and ticking heartbeats while stages are in flight (§5).

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_hub_audit::{AuditLog, EventType};
use agent_hub_breaker::{ComponentBreaker, ComponentKind};
use agent_hub_bus::{HubMessage, MessageBus, MessageType};
use agent_hub_contract::{
    acquire_lock, apply_transition, retry_after_stall, CheckpointCapability, NoopCheckpoint,
};
use agent_hub_sandbox::{run_gate, GateDecision};
use agent_hub_storage::{archive_file, atomic_write_json, safe_read_json, WorkspaceLayout};
use agent_hub_types::{TaskContract, TaskEvent, TaskStatus};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::poller::AdaptivePoller;
use crate::proposal::proposal_to_contract;
use crate::stage::{PipelineStage, StageRunner};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub agent_id: String,
    pub heartbeat_interval: Duration,
    pub stage_timeout: Duration,
    pub role_timeout_minutes: i64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            agent_id: "supervisor".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            stage_timeout: Duration::from_secs(1800),
            role_timeout_minutes: 30,
        }
    }
}

struct ActivePipeline {
    task_id: String,
    cancelled: Arc<AtomicBool>,
}

pub struct PipelineSupervisor {
    config: SupervisorConfig,
    layout: WorkspaceLayout,
    bus: Arc<dyn MessageBus>,
    stage_runner: Arc<dyn StageRunner>,
    checkpoint: Arc<dyn CheckpointCapability>,
    breaker: Arc<ComponentBreaker>,
    audit: Arc<AuditLog>,
    /// Parent-owned pipeline table keyed by task_id (design notes: cyclic
    /// references resolved via a parent-owned table rather than back-
    /// pointers); one in-flight pipeline per task, many tasks at once.
    active: Mutex<HashMap<String, ActivePipeline>>,
}

impl PipelineSupervisor {
    pub fn new(
        config: SupervisorConfig,
        layout: WorkspaceLayout,
        bus: Arc<dyn MessageBus>,
        stage_runner: Arc<dyn StageRunner>,
        checkpoint: Arc<dyn CheckpointCapability>,
        breaker: Arc<ComponentBreaker>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            config,
            layout,
            bus,
            stage_runner,
            checkpoint,
            breaker,
            audit,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_noop_checkpoint(
        config: SupervisorConfig,
        layout: WorkspaceLayout,
        bus: Arc<dyn MessageBus>,
        stage_runner: Arc<dyn StageRunner>,
        breaker: Arc<ComponentBreaker>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self::new(config, layout, bus, stage_runner, Arc::new(NoopCheckpoint), breaker, audit)
    }

    /// Runs until the process is cancelled; never returns `Ok`.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let mut poller = AdaptivePoller::default();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(err) = self.bus.record_heartbeat(&self.config.agent_id, None).await {
                        tracing::warn!(error = %err, "failed to record heartbeat");
                    }
                }
                _ = tokio::time::sleep(poller.next_delay()) => {
                    match self.bus.receive_hub_messages(&self.config.agent_id, None).await {
                        Ok(messages) if !messages.is_empty() => {
                            poller.reset();
                            self.breaker.record_success(ComponentKind::MessageBus).await.ok();
                            for msg in messages {
                                Arc::clone(&self).handle_message(msg).await;
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to receive hub messages");
                            self.breaker.record_failure(ComponentKind::MessageBus).await.ok();
                        }
                    }
                }
            }
        }
    }

    /// Dispatches one envelope. `PROPOSAL_READY` drives a whole pipeline
    /// (up to five stages at `stage_timeout` each) so it is detached with
    /// `tokio::spawn` and left to run in its own per-pipeline worker (§5);
    /// waiting on it here would starve the run loop's `select!` of every
    /// other poll and heartbeat tick for the pipeline's entire duration,
    /// which is exactly what makes `STOP_TASK` unreachable while a task is
    /// running. The other handlers are short-lived, so they are still
    /// spawned-and-joined for panic isolation without blocking the loop for
    /// long.
    async fn handle_message(self: Arc<Self>, msg: HubMessage) {
        if matches!(msg.message_type, MessageType::ProposalReady) {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.handle_proposal_ready(&msg).await;
            });
            return;
        }

        let this = Arc::clone(&self);
        let join = tokio::spawn(async move {
            match msg.message_type {
                MessageType::DraftReady => this.handle_draft_ready(&msg).await,
                MessageType::StopTask => this.handle_stop_task(&msg).await,
                MessageType::Question => this.handle_question(&msg).await,
                other => {
                    tracing::debug!(?other, "message type has no supervisor handler");
                }
            }
        });
        if let Err(err) = join.await {
            tracing::error!(error = %err, "message handler task panicked");
        }
    }

    async fn handle_proposal_ready(&self, msg: &HubMessage) {
        self.audit
            .log(EventType::MessageReceived, "pipeline", json!({"type": "PROPOSAL_READY"}), None)
            .await
            .ok();

        let task_id = msg
            .payload
            .get("task_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        {
            let active = self.active.lock().await;
            if active.contains_key(&task_id) {
                tracing::debug!(task_id = %task_id, "duplicate PROPOSAL_READY ignored");
                return;
            }
        }

        let mut contract = match proposal_to_contract(&self.layout, &msg.payload).await {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(error = %err, "proposal rejected");
                return;
            }
        };

        if let Err(err) = acquire_lock(&mut contract, &self.config.agent_id, self.config.role_timeout_minutes) {
            tracing::warn!(error = %err, "could not acquire lock for new task");
            return;
        }

        if let Err(err) = atomic_write_json(&self.layout.contract_path(), &contract).await {
            tracing::warn!(error = %err, "failed to persist new contract");
            return;
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut active = self.active.lock().await;
            active.insert(
                contract.task_id.clone(),
                ActivePipeline {
                    task_id: contract.task_id.clone(),
                    cancelled: cancelled.clone(),
                },
            );
        }

        self.run_pipeline(contract, cancelled).await;
    }

    async fn run_pipeline(&self, mut contract: TaskContract, cancelled: Arc<AtomicBool>) {
        let task_id = contract.task_id.clone();
        let workspace_root = self.layout.workspace_root.clone();

        for stage in PipelineStage::ordered() {
            if cancelled.load(Ordering::SeqCst) {
                break;
            }

            let result = self
                .stage_runner
                .run(stage, &task_id, &workspace_root, self.config.stage_timeout)
                .await;

            match result {
                Ok(()) => {
                    if let Err(err) = self.advance_on_success(&mut contract, stage).await {
                        tracing::warn!(task_id = %task_id, stage = stage.as_str(), error = %err, "failed to advance contract");
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(task_id = %task_id, stage = stage.as_str(), error = %err, "pipeline stage failed");
                    if matches!(stage, PipelineStage::RunLocalReview) {
                        let _ = apply_transition(
                            &self.layout,
                            &mut contract,
                            TaskEvent::CriticalFlaw,
                            self.checkpoint.as_ref(),
                            &self.audit,
                            None,
                        )
                        .await;
                    } else {
                        let _ = retry_after_stall(&self.layout, &mut contract, self.checkpoint.as_ref(), &self.audit).await;
                    }
                    break;
                }
            }
        }

        let mut active = self.active.lock().await;
        active.remove(&task_id);
    }

    async fn advance_on_success(
        &self,
        contract: &mut TaskContract,
        stage: PipelineStage,
    ) -> Result<(), agent_hub_contract::ReducerError> {
        match stage {
            PipelineStage::SetupTask => {
                apply_transition(&self.layout, contract, TaskEvent::LockAcquired, self.checkpoint.as_ref(), &self.audit, None).await
            }
            PipelineStage::RunImplementer => {
                apply_transition(&self.layout, contract, TaskEvent::CodeWritten, self.checkpoint.as_ref(), &self.audit, None).await
            }
            PipelineStage::RunLocalReview => {
                apply_transition(&self.layout, contract, TaskEvent::LocalPass, self.checkpoint.as_ref(), &self.audit, None).await
            }
            PipelineStage::ReportJudge => {
                apply_transition(&self.layout, contract, TaskEvent::ReviewStarted, self.checkpoint.as_ref(), &self.audit, None).await?;
                apply_transition(&self.layout, contract, TaskEvent::JudgeComplete, self.checkpoint.as_ref(), &self.audit, None).await?;
                apply_transition(&self.layout, contract, TaskEvent::Pass, self.checkpoint.as_ref(), &self.audit, None).await
            }
            PipelineStage::FinalizeTask => {
                if matches!(contract.status, TaskStatus::Merged) {
                    let _ = archive_file(&self.layout.contract_path(), &self.layout.archive_dir(&contract.task_id)).await;
                }
                Ok(())
            }
        }
    }

    async fn handle_draft_ready(&self, msg: &HubMessage) {
        self.audit
            .log(EventType::MessageReceived, "pipeline", json!({"type": "DRAFT_READY"}), None)
            .await
            .ok();

        let Some(submission_path) = msg.payload.get("submission_path").and_then(Value::as_str) else {
            tracing::warn!("DRAFT_READY payload missing submission_path");
            return;
        };

        let decision = match run_gate(&self.layout, Path::new(submission_path), &self.audit, None).await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(error = %err, "draft gate evaluation failed");
                return;
            }
        };

        let (message_type, payload) = match decision {
            GateDecision::Accept { diff, summary } => (
                MessageType::DraftAccepted,
                json!({ "summary": summary, "added": diff.added, "removed": diff.removed }),
            ),
            GateDecision::Reject { reason } => (MessageType::DraftRejected, json!({ "reason": reason })),
            GateDecision::Escalate { reason } => (MessageType::DraftEscalated, json!({ "reason": reason })),
        };

        if let Err(err) = self.bus.send_hub_message(&self.config.agent_id, &msg.from, message_type, payload).await {
            tracing::warn!(error = %err, "failed to notify worker of gate decision");
        }
    }

    async fn handle_stop_task(&self, msg: &HubMessage) {
        self.audit
            .log(EventType::MessageReceived, "pipeline", json!({"type": "STOP_TASK"}), None)
            .await
            .ok();

        let task_id = msg.payload.get("task_id").and_then(Value::as_str).unwrap_or_default();
        // The scenario and the worker/proposal contracts name this flag
        // `all_tasks`; accept the older `broadcast` alias too.
        let all_tasks = msg.payload.get("all_tasks").and_then(Value::as_bool).unwrap_or(false)
            || msg.payload.get("broadcast").and_then(Value::as_bool).unwrap_or(false);
        let reason = msg
            .payload
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("stopped by operator")
            .to_string();

        let targets: Vec<String> = {
            let active = self.active.lock().await;
            active
                .values()
                .filter(|running| all_tasks || running.task_id == task_id)
                .filter_map(|running| {
                    if running.cancelled.swap(true, Ordering::SeqCst) {
                        None // already cancelled: no-op for this one
                    } else {
                        Some(running.task_id.clone())
                    }
                })
                .collect()
        };

        for running_task_id in targets {
            self.stage_runner.cancel(&running_task_id).await;

            if let Ok(Some(mut contract)) = safe_read_json::<TaskContract>(&self.layout.contract_path()).await {
                if contract.task_id == running_task_id {
                    contract.status_reason = Some(reason.clone());
                    let _ = apply_transition(
                        &self.layout,
                        &mut contract,
                        TaskEvent::CircuitBreakerHalt,
                        self.checkpoint.as_ref(),
                        &self.audit,
                        None,
                    )
                    .await;
                }
            }

            self.audit
                .log(
                    EventType::StopTaskCancelled,
                    "pipeline",
                    json!({ "task_id": running_task_id, "reason": reason }),
                    None,
                )
                .await
                .ok();
        }
    }

    async fn handle_question(&self, msg: &HubMessage) {
        self.audit
            .log(EventType::MessageReceived, "pipeline", json!({"type": "QUESTION"}), None)
            .await
            .ok();

        let options = msg.payload.get("options").and_then(Value::as_array).cloned().unwrap_or_default();
        let selected = options.first().cloned().unwrap_or(Value::Null);
        let payload = json!({
            "task_id": msg.payload.get("task_id"),
            "selected_index": 0,
            "answer": selected,
        });

        if let Err(err) = self.bus.send_hub_message(&self.config.agent_id, &msg.from, MessageType::Answer, payload).await {
            tracing::warn!(error = %err, "failed to answer question");
        }
    }
}
