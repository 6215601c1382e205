//! The task contract: the central durable object describing one task's
//! lifecycle (data model, task contract).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SCHEMA_VERSION: &str = "2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    Minor,
    Major,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    PendingImplementer,
    ImplementationInProgress,
    PendingLocalReview,
    PendingJudgeReview,
    JudgeReviewInProgress,
    ReviewComplete,
    PendingRebuttal,
    Merged,
    TimeoutImplementer,
    TimeoutJudge,
    ErikConsultation,
}

/// Events accepted by the transition table (contract and state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    LockAcquired,
    CodeWritten,
    Timeout,
    Retry,
    Escalate,
    LocalPass,
    CriticalFlaw,
    ReviewStarted,
    JudgeComplete,
    Pass,
    FailAgree,
    FailDisagree,
    Conditional,
    RebuttalAccepted,
    RebuttalLimitExceeded,
    CircuitBreakerHalt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerArmStatus {
    Armed,
    Tripped,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractTimestamps {
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GitInfo {
    pub repo_root: Option<String>,
    pub base_branch: Option<String>,
    pub task_branch: Option<String>,
    pub base_commit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Roles {
    #[serde(default)]
    pub implementer: Option<String>,
    #[serde(default)]
    pub local_reviewer: Option<String>,
    #[serde(default)]
    pub judge: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Limits {
    #[serde(default)]
    pub max_rebuttals: Option<u32>,
    #[serde(default)]
    pub max_review_cycles: Option<u32>,
    #[serde(default)]
    pub timeout_minutes: HashMap<String, u64>,
    #[serde(default)]
    pub token_budget: Option<u64>,
    #[serde(default)]
    pub cost_ceiling_usd: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Constraints {
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub forbidden_paths: Vec<String>,
    #[serde(default)]
    pub allowed_operations: Vec<String>,
    #[serde(default)]
    pub delete_allowed: bool,
    #[serde(default)]
    pub max_diff_lines: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourceFile {
    pub path: String,
    #[serde(default)]
    pub expected_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Specification {
    #[serde(default)]
    pub source_files: Vec<SourceFile>,
    #[serde(default)]
    pub target_file: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HandoffData {
    #[serde(default)]
    pub implementer_notes: Option<String>,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default)]
    pub diff_summary: Option<String>,
    #[serde(default)]
    pub local_review_passed: Option<bool>,
    #[serde(default)]
    pub local_review_issues: Vec<String>,
    #[serde(default)]
    pub judge_report_json_path: Option<String>,
    #[serde(default)]
    pub judge_report_md_path: Option<String>,
    #[serde(default)]
    pub rebuttal_path: Option<String>,
    #[serde(default)]
    pub current_file_hash: Option<String>,
    #[serde(default)]
    pub judge_verdict: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub held_by: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Breaker {
    pub status: Option<BreakerArmStatus>,
    #[serde(default)]
    pub triggered_by: Option<String>,
    #[serde(default)]
    pub trigger_reason: Option<String>,
    #[serde(default)]
    pub rebuttal_count: u32,
    #[serde(default)]
    pub review_cycle_count: u32,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub event: String,
    #[serde(default)]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub verdict: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContract {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub task_id: String,
    pub project: String,
    pub complexity: Complexity,
    pub status: TaskStatus,
    pub status_reason: Option<String>,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    pub last_transition_id: Option<String>,
    pub timestamps: ContractTimestamps,
    pub git: GitInfo,
    pub roles: Roles,
    pub limits: Limits,
    pub constraints: Constraints,
    pub specification: Specification,
    #[serde(default)]
    pub handoff_data: HandoffData,
    pub lock: Option<Lock>,
    #[serde(default)]
    pub breaker: Breaker,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

fn default_attempt() -> u32 {
    1
}

impl TaskContract {
    pub fn new(task_id: impl Into<String>, project: impl Into<String>, complexity: Complexity) -> Self {
        let now = Utc::now();
        Self {
            schema_version: default_schema_version(),
            task_id: task_id.into(),
            project: project.into(),
            complexity,
            status: TaskStatus::PendingImplementer,
            status_reason: None,
            attempt: 1,
            last_transition_id: None,
            timestamps: ContractTimestamps {
                created_at: Some(now),
                updated_at: Some(now),
                deadline_at: None,
            },
            git: GitInfo::default(),
            roles: Roles::default(),
            limits: Limits::default(),
            constraints: Constraints::default(),
            specification: Specification::default(),
            handoff_data: HandoffData::default(),
            lock: None,
            breaker: Breaker::default(),
            history: Vec::new(),
            extra: HashMap::new(),
        }
    }

    /// (I3) `allowed_paths ∩ forbidden_paths = ∅`.
    pub fn paths_disjoint(&self) -> bool {
        !self
            .constraints
            .allowed_paths
            .iter()
            .any(|p| self.constraints.forbidden_paths.contains(p))
    }
}
