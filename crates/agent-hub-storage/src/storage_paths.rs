//! Well-known filesystem layout beneath a workspace root (see external
//! interfaces: filesystem layout).

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    pub workspace_root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    pub fn handoff_dir(&self) -> PathBuf {
        self.workspace_root.join("_handoff")
    }

    pub fn contract_path(&self) -> PathBuf {
        self.handoff_dir().join("TASK_CONTRACT.json")
    }

    pub fn contract_lock_path(&self) -> PathBuf {
        self.handoff_dir().join("TASK_CONTRACT.json.lock")
    }

    pub fn proposal_final_path(&self) -> PathBuf {
        self.handoff_dir().join("PROPOSAL_FINAL.md")
    }

    pub fn proposal_rejected_path(&self) -> PathBuf {
        self.handoff_dir().join("PROPOSAL_REJECTED.md")
    }

    pub fn sandbox_dir(&self) -> PathBuf {
        self.handoff_dir().join("drafts")
    }

    pub fn archive_dir(&self, task_id: &str) -> PathBuf {
        self.handoff_dir().join("archive").join(task_id)
    }

    pub fn transition_log_path(&self) -> PathBuf {
        self.handoff_dir().join("transition.ndjson")
    }

    pub fn judge_report_json_path(&self) -> PathBuf {
        self.handoff_dir().join("JUDGE_REPORT.json")
    }

    pub fn judge_report_md_path(&self) -> PathBuf {
        self.handoff_dir().join("JUDGE_REPORT.md")
    }

    pub fn rebuttal_path(&self) -> PathBuf {
        self.handoff_dir().join("REBUTTAL.md")
    }

    pub fn review_request_path(&self) -> PathBuf {
        self.handoff_dir().join("REVIEW_REQUEST.md")
    }

    pub fn halt_sentinel_path(&self) -> PathBuf {
        if let Ok(path) = std::env::var("UAS_HALT_FILE") {
            return PathBuf::from(path);
        }
        self.workspace_root.join("ERIK_HALT.md")
    }

    pub fn stall_report_path(&self) -> PathBuf {
        self.handoff_dir().join("STALL_REPORT.md")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.workspace_root.join("data")
    }

    pub fn hub_db_path(&self) -> PathBuf {
        self.data_dir().join("hub.db")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir().join("audit.ndjson")
    }

    pub fn budget_state_path(&self) -> PathBuf {
        self.data_dir().join("budget_state.json")
    }

    pub fn circuit_breaker_state_path(&self) -> PathBuf {
        self.data_dir().join("circuit_breaker_state.json")
    }

    pub fn low_power_mode_path(&self) -> PathBuf {
        self.data_dir().join("LOW_POWER_MODE.txt")
    }
}

/// True if `candidate` resolves to a path inside `root`, rejecting any
/// escape via `..` segments or symlink tricks. Both paths are canonicalized
/// when they exist; non-existent candidates are resolved relative to `root`.
pub fn is_within_root(candidate: &Path, root: &Path) -> bool {
    let root_canon = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let candidate_canon = if candidate.exists() {
        match candidate.canonicalize() {
            Ok(p) => p,
            Err(_) => return false,
        }
    } else if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root_canon.join(candidate)
    };
    candidate_canon.starts_with(&root_canon)
}

/// Sanitizes a task id to `[A-Za-z0-9_]`, matching the naming scheme used
/// for draft and submission filenames.
pub fn sanitize_task_id(task_id: &str) -> String {
    task_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}
