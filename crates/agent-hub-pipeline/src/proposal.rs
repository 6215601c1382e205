//! Converts a `PROPOSAL_READY` payload into a [`TaskContract`]. Rejects
//! proposals missing required fields or violating (I3) `paths_disjoint`,
//! writing a human-readable rejection note to `PROPOSAL_REJECTED.md` instead
//! of constructing a contract.

use agent_hub_storage::{atomic_write, WorkspaceLayout};
use agent_hub_types::{Complexity, TaskContract};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Deserialize)]
pub struct ProposalPayload {
    pub task_id: String,
    pub project: String,
    #[serde(default)]
    pub complexity: Option<String>,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub forbidden_paths: Vec<String>,
    #[serde(default)]
    pub target_file: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ProposalError {
    #[error("proposal payload did not match the expected shape: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("proposal is missing required field: {0}")]
    MissingField(&'static str),
    #[error("proposal's allowed_paths and forbidden_paths overlap")]
    PathsOverlap,
    #[error("unknown complexity value: {0}")]
    UnknownComplexity(String),
}

fn parse_complexity(raw: Option<&str>) -> Result<Complexity, ProposalError> {
    match raw.unwrap_or("minor") {
        "trivial" => Ok(Complexity::Trivial),
        "minor" => Ok(Complexity::Minor),
        "major" => Ok(Complexity::Major),
        "critical" => Ok(Complexity::Critical),
        other => Err(ProposalError::UnknownComplexity(other.to_string())),
    }
}

/// Validates a raw `PROPOSAL_READY` payload and builds the initial contract
/// for the task. On rejection, writes `PROPOSAL_REJECTED.md` explaining why
/// and returns the error so the caller can also notify the bus.
pub async fn proposal_to_contract(
    layout: &WorkspaceLayout,
    payload: &Value,
) -> Result<TaskContract, ProposalError> {
    match build_contract(payload) {
        Ok(contract) => Ok(contract),
        Err(err) => {
            let note = format!(
                "# Proposal rejected\n\n{err}\n\nRaw payload:\n\n```json\n{}\n```\n",
                serde_json::to_string_pretty(payload).unwrap_or_default()
            );
            let _ = atomic_write(&layout.proposal_rejected_path(), &note).await;
            Err(err)
        }
    }
}

fn build_contract(payload: &Value) -> Result<TaskContract, ProposalError> {
    let proposal: ProposalPayload = serde_json::from_value(payload.clone())?;

    if proposal.task_id.trim().is_empty() {
        return Err(ProposalError::MissingField("task_id"));
    }
    if proposal.project.trim().is_empty() {
        return Err(ProposalError::MissingField("project"));
    }

    let complexity = parse_complexity(proposal.complexity.as_deref())?;
    let mut contract = TaskContract::new(proposal.task_id, proposal.project, complexity);
    contract.constraints.allowed_paths = proposal.allowed_paths;
    contract.constraints.forbidden_paths = proposal.forbidden_paths;
    contract.specification.target_file = proposal.target_file;
    contract.specification.requirements = proposal.requirements;
    contract.specification.acceptance_criteria = proposal.acceptance_criteria;

    if !contract.paths_disjoint() {
        return Err(ProposalError::PathsOverlap);
    }

    Ok(contract)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn temp_layout() -> WorkspaceLayout {
        let dir = std::env::temp_dir().join(format!("agent-hub-proposal-test-{}", Uuid::new_v4()));
        WorkspaceLayout::new(dir)
    }

    #[tokio::test]
    async fn builds_contract_from_well_formed_payload() {
        let layout = temp_layout();
        let payload = json!({
            "task_id": "task-1",
            "project": "demo",
            "complexity": "major",
            "allowed_paths": ["src/lib.rs"],
            "forbidden_paths": ["secrets/"],
        });
        let contract = proposal_to_contract(&layout, &payload).await.unwrap();
        assert_eq!(contract.task_id, "task-1");
        assert_eq!(contract.complexity, Complexity::Major);
    }

    #[tokio::test]
    async fn overlapping_paths_are_rejected_and_noted() {
        let layout = temp_layout();
        let payload = json!({
            "task_id": "task-2",
            "project": "demo",
            "allowed_paths": ["src/lib.rs"],
            "forbidden_paths": ["src/lib.rs"],
        });
        let result = proposal_to_contract(&layout, &payload).await;
        assert!(matches!(result, Err(ProposalError::PathsOverlap)));
        let rejected: PathBuf = layout.proposal_rejected_path();
        assert!(tokio::fs::try_exists(&rejected).await.unwrap());
        tokio::fs::remove_dir_all(&layout.workspace_root).await.ok();
    }

    #[tokio::test]
    async fn missing_task_id_is_rejected() {
        let layout = temp_layout();
        let payload = json!({"task_id": "", "project": "demo"});
        let result = proposal_to_contract(&layout, &payload).await;
        assert!(matches!(result, Err(ProposalError::MissingField("task_id"))));
        tokio::fs::remove_dir_all(&layout.workspace_root).await.ok();
    }
}
