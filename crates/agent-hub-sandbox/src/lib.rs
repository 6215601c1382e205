//! Sandbox and draft gate: the sole write entry points workers have into a
//! task's workspace. Workers stage edits as `.draft` files plus a
//! `.submission.json` pointer; the gate re-validates, diffs, and scans them
//! before anything touches the real file tree.

mod diff;
mod patterns;

use std::path::{Path, PathBuf};

use agent_hub_audit::{AuditLog, EventType};
use agent_hub_storage::atomic_write::{atomic_write, safe_read};
use agent_hub_storage::storage_paths::{is_within_root, sanitize_task_id, WorkspaceLayout};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use diff::{diff_lines, LineDiff};

pub const MAX_DELETION_RATIO: f64 = 0.5;
pub const MAX_LINES_CHANGED: usize = 500;
pub const MAX_FILES_PER_TASK: usize = 20;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("path {0} escapes the sandbox")]
    OutsideSandbox(PathBuf),
    #[error("path {0} escapes the workspace")]
    OutsideWorkspace(PathBuf),
    #[error("path must end in .draft or .submission.json, got {0}")]
    BadDraftSuffix(PathBuf),
    #[error("source path {0} matches a sensitive filename pattern")]
    SensitiveSourceName(PathBuf),
    #[error("source path {0} does not exist or is not a regular file")]
    SourceNotFound(PathBuf),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Must resolve inside the sandbox, contain no `..` segments, and end in
/// `.draft` or `.submission.json`.
pub fn validate_sandbox_write(path: &Path, sandbox_dir: &Path) -> Result<(), SandboxError> {
    if path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(SandboxError::OutsideSandbox(path.to_path_buf()));
    }
    if !is_within_root(path, sandbox_dir) {
        return Err(SandboxError::OutsideSandbox(path.to_path_buf()));
    }
    let name = path.to_string_lossy();
    if name.ends_with(".submission.json") {
        Ok(())
    } else if name.ends_with(".draft") {
        Ok(())
    } else {
        Err(SandboxError::BadDraftSuffix(path.to_path_buf()))
    }
}

/// Must resolve inside the workspace, exist as a regular file, and not
/// match a sensitive-name pattern.
pub async fn validate_source_read(path: &Path, workspace_root: &Path) -> Result<(), SandboxError> {
    if !is_within_root(path, workspace_root) {
        return Err(SandboxError::OutsideWorkspace(path.to_path_buf()));
    }
    if patterns::is_sensitive_filename(path) {
        return Err(SandboxError::SensitiveSourceName(path.to_path_buf()));
    }
    let metadata = tokio::fs::metadata(path).await.map_err(|e| anyhow::anyhow!(e))?;
    if !metadata.is_file() {
        return Err(SandboxError::SourceNotFound(path.to_path_buf()));
    }
    Ok(())
}

pub fn draft_path(sandbox_dir: &Path, source_basename: &str, task_id: &str) -> PathBuf {
    sandbox_dir.join(format!("{}.{}.draft", source_basename, sanitize_task_id(task_id)))
}

pub fn submission_path(sandbox_dir: &Path, task_id: &str) -> PathBuf {
    sandbox_dir.join(format!("{}.submission.json", sanitize_task_id(task_id)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftSubmission {
    pub task_id: String,
    pub original_path: PathBuf,
    pub draft_path: PathBuf,
    pub original_hash: String,
}

#[derive(Debug, Clone)]
pub struct SafetyReport {
    pub secret_hits: Vec<String>,
    pub path_hits: Vec<String>,
}

impl SafetyReport {
    pub fn is_clean(&self) -> bool {
        self.secret_hits.is_empty() && self.path_hits.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum GateDecision {
    Accept { diff: LineDiff, summary: String },
    Reject { reason: String },
    Escalate { reason: String },
}

fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Runs the 8-step gate decision procedure against a submission already
/// written to `submission_path`. Does not apply the result; callers act on
/// the returned decision via [`run_gate`], or call `apply_accept` /
/// `apply_reject` / `apply_escalate` directly.
pub async fn evaluate_submission(submission_path: &Path, layout: &WorkspaceLayout) -> GateDecision {
    let raw = match safe_read(submission_path).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return GateDecision::Reject { reason: "submission file missing".to_string() },
        Err(e) => return GateDecision::Reject { reason: format!("failed to read submission: {e}") },
    };
    let submission: DraftSubmission = match serde_json::from_slice(&raw) {
        Ok(s) => s,
        Err(e) => return GateDecision::Reject { reason: format!("malformed submission JSON: {e}") },
    };

    if validate_sandbox_write(&submission.draft_path, &layout.sandbox_dir()).is_err() {
        return GateDecision::Reject { reason: "draft path failed re-validation".to_string() };
    }
    if submission.original_path.exists()
        && validate_source_read(&submission.original_path, &layout.workspace_root).await.is_err()
    {
        return GateDecision::Reject { reason: "original path failed re-validation".to_string() };
    }

    if !tokio::fs::try_exists(&submission.draft_path).await.unwrap_or(false) {
        return GateDecision::Reject { reason: "draft file does not exist".to_string() };
    }

    let draft_content = match tokio::fs::read_to_string(&submission.draft_path).await {
        Ok(c) => c,
        Err(e) => return GateDecision::Reject { reason: format!("failed to read draft: {e}") },
    };

    if !tokio::fs::try_exists(&submission.original_path).await.unwrap_or(false) {
        return GateDecision::Reject { reason: "original file does not exist".to_string() };
    }

    let original_content = match tokio::fs::read_to_string(&submission.original_path).await {
        Ok(c) => c,
        Err(e) => return GateDecision::Reject { reason: format!("failed to read original: {e}") },
    };
    let original_hash = sha256_hex(&original_content);
    if original_hash != submission.original_hash {
        return GateDecision::Escalate {
            reason: "original file changed since the draft was produced (hash conflict)".to_string(),
        };
    }

    let diff = diff_lines(&original_content, &draft_content);
    let summary = format!("+{}/-{} lines", diff.added, diff.removed);

    let safety = patterns::scan(&draft_content);
    if !safety.secret_hits.is_empty() {
        return GateDecision::Reject {
            reason: format!("secret pattern detected: {}", safety.secret_hits.join(", ")),
        };
    }
    if !safety.path_hits.is_empty() {
        return GateDecision::Reject {
            reason: format!("hardcoded home-directory path detected: {}", safety.path_hits.join(", ")),
        };
    }

    let original_lines = original_content.lines().count().max(1);
    if (diff.removed as f64 / original_lines as f64) > MAX_DELETION_RATIO {
        return GateDecision::Escalate {
            reason: format!(
                "destructive diff: removed {} of {} original lines",
                diff.removed, original_lines
            ),
        };
    }

    if diff.added + diff.removed > MAX_LINES_CHANGED {
        return GateDecision::Escalate {
            reason: format!("large change: {} lines touched exceeds the {MAX_LINES_CHANGED}-line scope limit", diff.added + diff.removed),
        };
    }

    GateDecision::Accept { diff, summary }
}

/// Applies an `Accept` decision: atomic copy-then-rename of the draft over
/// the original, then cleans up the draft/submission pair.
pub async fn apply_accept(
    submission: &DraftSubmission,
    audit: &AuditLog,
    run_id: Option<&str>,
) -> anyhow::Result<()> {
    let draft_content = tokio::fs::read_to_string(&submission.draft_path).await?;
    atomic_write(&submission.original_path, &draft_content).await?;
    cleanup_artifacts(submission).await?;
    audit
        .log(
            EventType::DraftApplied,
            "sandbox",
            json!({ "task_id": submission.task_id, "original_path": submission.original_path }),
            run_id,
        )
        .await
}

pub async fn apply_reject(
    submission: &DraftSubmission,
    reason: &str,
    audit: &AuditLog,
    run_id: Option<&str>,
) -> anyhow::Result<()> {
    cleanup_artifacts(submission).await?;
    audit
        .log(
            EventType::DraftRejected,
            "sandbox",
            json!({ "task_id": submission.task_id, "reason": reason }),
            run_id,
        )
        .await
}

/// Leaves both artefacts in place for human inspection.
pub async fn apply_escalate(
    submission: &DraftSubmission,
    reason: &str,
    audit: &AuditLog,
    run_id: Option<&str>,
) -> anyhow::Result<()> {
    audit
        .log(
            EventType::DraftEscalated,
            "sandbox",
            json!({ "task_id": submission.task_id, "reason": reason }),
            run_id,
        )
        .await
}

async fn cleanup_artifacts(submission: &DraftSubmission) -> anyhow::Result<()> {
    if tokio::fs::try_exists(&submission.draft_path).await.unwrap_or(false) {
        tokio::fs::remove_file(&submission.draft_path).await?;
    }
    let sandbox_dir = submission
        .draft_path
        .parent()
        .unwrap_or_else(|| Path::new("."));
    let sub_path = submission_path(sandbox_dir, &submission.task_id);
    if tokio::fs::try_exists(&sub_path).await.unwrap_or(false) {
        tokio::fs::remove_file(&sub_path).await?;
    }
    Ok(())
}

/// Runs the full gate and applies the resulting decision in one call,
/// mirroring the `DRAFT_READY` handler in the pipeline supervisor (§4.10).
pub async fn run_gate(
    layout: &WorkspaceLayout,
    submission_path: &Path,
    audit: &AuditLog,
    run_id: Option<&str>,
) -> anyhow::Result<GateDecision> {
    let decision = evaluate_submission(submission_path, layout).await;

    let raw = safe_read(submission_path).await.ok().flatten();
    let submission: Option<DraftSubmission> = raw.and_then(|bytes| serde_json::from_slice(&bytes).ok());

    if let Some(submission) = submission {
        match &decision {
            GateDecision::Accept { .. } => apply_accept(&submission, audit, run_id).await?,
            GateDecision::Reject { reason } => apply_reject(&submission, reason, audit, run_id).await?,
            GateDecision::Escalate { reason } => apply_escalate(&submission, reason, audit, run_id).await?,
        }
    }

    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_workspace() -> PathBuf {
        std::env::temp_dir().join(format!("agent-hub-sandbox-test-{}", Uuid::new_v4()))
    }

    #[test]
    fn validate_sandbox_write_rejects_parent_escape() {
        let sandbox = PathBuf::from("/workspace/_handoff/drafts");
        let escaping = sandbox.join("../../etc/passwd.draft");
        assert!(validate_sandbox_write(&escaping, &sandbox).is_err());
    }

    #[test]
    fn validate_sandbox_write_requires_known_suffix() {
        let sandbox = PathBuf::from("/workspace/_handoff/drafts");
        let bad = sandbox.join("main.rs.task1.txt");
        assert!(validate_sandbox_write(&bad, &sandbox).is_err());
        let good = sandbox.join("main.rs.task1.draft");
        assert!(validate_sandbox_write(&good, &sandbox).is_ok());
    }

    #[tokio::test]
    async fn accept_path_applies_draft_over_original() {
        let root = temp_workspace();
        let sandbox_dir = root.join("_handoff").join("drafts");
        tokio::fs::create_dir_all(&sandbox_dir).await.unwrap();

        let original_path = root.join("src").join("lib.rs");
        tokio::fs::create_dir_all(original_path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&original_path, "fn old() {}\n").await.unwrap();

        let draft = draft_path(&sandbox_dir, "lib.rs", "task-1");
        tokio::fs::write(&draft, "fn old() {}\nfn new() {}\n").await.unwrap();

        let submission = DraftSubmission {
            task_id: "task-1".to_string(),
            original_path: original_path.clone(),
            draft_path: draft.clone(),
            original_hash: sha256_hex("fn old() {}\n"),
        };
        let sub_path = submission_path(&sandbox_dir, "task-1");
        tokio::fs::write(&sub_path, serde_json::to_vec(&submission).unwrap()).await.unwrap();

        let decision = evaluate_submission(&sub_path, &WorkspaceLayout::new(&root)).await;
        assert!(matches!(decision, GateDecision::Accept { .. }));

        let audit = AuditLog::new(root.join("audit.ndjson"), "session-1");
        apply_accept(&submission, &audit, None).await.unwrap();

        let applied = tokio::fs::read_to_string(&original_path).await.unwrap();
        assert_eq!(applied, "fn old() {}\nfn new() {}\n");
        assert!(!tokio::fs::try_exists(&draft).await.unwrap());
        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn hash_mismatch_escalates_as_conflict() {
        let root = temp_workspace();
        let sandbox_dir = root.join("_handoff").join("drafts");
        tokio::fs::create_dir_all(&sandbox_dir).await.unwrap();
        let original_path = root.join("src").join("lib.rs");
        tokio::fs::create_dir_all(original_path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&original_path, "fn changed_since() {}\n").await.unwrap();

        let draft = draft_path(&sandbox_dir, "lib.rs", "task-1");
        tokio::fs::write(&draft, "fn new() {}\n").await.unwrap();

        let submission = DraftSubmission {
            task_id: "task-1".to_string(),
            original_path,
            draft_path: draft.clone(),
            original_hash: sha256_hex("fn old() {}\n"),
        };
        let sub_path = submission_path(&sandbox_dir, "task-1");
        tokio::fs::write(&sub_path, serde_json::to_vec(&submission).unwrap()).await.unwrap();

        let decision = evaluate_submission(&sub_path, &WorkspaceLayout::new(&root)).await;
        assert!(matches!(decision, GateDecision::Escalate { .. }));
        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn secret_in_draft_rejects() {
        let root = temp_workspace();
        let sandbox_dir = root.join("_handoff").join("drafts");
        tokio::fs::create_dir_all(&sandbox_dir).await.unwrap();
        let original_path = root.join("src").join("lib.rs");
        tokio::fs::create_dir_all(original_path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&original_path, "fn old() {}\n").await.unwrap();

        let draft = draft_path(&sandbox_dir, "lib.rs", "task-1");
        tokio::fs::write(&draft, "let api_key = \"sk-abcdefghijklmnopqrstuvwxyz\";\n")
            .await
            .unwrap();

        let submission = DraftSubmission {
            task_id: "task-1".to_string(),
            original_path,
            draft_path: draft.clone(),
            original_hash: sha256_hex("fn old() {}\n"),
        };
        let sub_path = submission_path(&sandbox_dir, "task-1");
        tokio::fs::write(&sub_path, serde_json::to_vec(&submission).unwrap()).await.unwrap();

        let decision = evaluate_submission(&sub_path, &WorkspaceLayout::new(&root)).await;
        assert!(matches!(decision, GateDecision::Reject { .. }));
        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn missing_original_file_rejects_instead_of_escalating() {
        let root = temp_workspace();
        let sandbox_dir = root.join("_handoff").join("drafts");
        tokio::fs::create_dir_all(&sandbox_dir).await.unwrap();

        // original_path deliberately never created.
        let original_path = root.join("src").join("lib.rs");

        let draft = draft_path(&sandbox_dir, "lib.rs", "task-1");
        tokio::fs::write(&draft, "fn new() {}\n").await.unwrap();

        let submission = DraftSubmission {
            task_id: "task-1".to_string(),
            original_path,
            draft_path: draft.clone(),
            original_hash: sha256_hex("fn old() {}\n"),
        };
        let sub_path = submission_path(&sandbox_dir, "task-1");
        tokio::fs::write(&sub_path, serde_json::to_vec(&submission).unwrap()).await.unwrap();

        let decision = evaluate_submission(&sub_path, &WorkspaceLayout::new(&root)).await;
        assert!(matches!(decision, GateDecision::Reject { .. }));
        tokio::fs::remove_dir_all(&root).await.ok();
    }
}
