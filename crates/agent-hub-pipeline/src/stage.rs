//! Pipeline stages (§4.10): each runs as an external process with a
//! timeout. Timeout escalates from SIGTERM to SIGKILL after a short grace
//! period, mirroring the kill pattern the rest of this codebase uses for
//! child processes (`Child::kill`), extended here with a graceful step.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};

const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    SetupTask,
    RunImplementer,
    RunLocalReview,
    ReportJudge,
    FinalizeTask,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::SetupTask => "setup-task",
            PipelineStage::RunImplementer => "run-implementer",
            PipelineStage::RunLocalReview => "run-local-review",
            PipelineStage::ReportJudge => "report-judge",
            PipelineStage::FinalizeTask => "finalize-task",
        }
    }

    pub fn ordered() -> [PipelineStage; 5] {
        [
            PipelineStage::SetupTask,
            PipelineStage::RunImplementer,
            PipelineStage::RunLocalReview,
            PipelineStage::ReportJudge,
            PipelineStage::FinalizeTask,
        ]
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage {0} timed out")]
    Timeout(String),
    #[error("stage {stage} exited with a failure status: {detail}")]
    Failed { stage: String, detail: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Runs one named pipeline stage for a task; injectable so tests and
/// alternate executors never shell out for real.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(
        &self,
        stage: PipelineStage,
        task_id: &str,
        workspace_root: &Path,
        timeout: Duration,
    ) -> Result<(), StageError>;

    /// Called by the `STOP_TASK` handler to kill whatever process is
    /// currently backing `task_id`, if any.
    async fn cancel(&self, task_id: &str);
}

/// Shells out to a configured executable, passing `<stage> <task_id>` as
/// arguments and the workspace root as the current directory.
pub struct ProcessStageRunner {
    executable: String,
    running: tokio::sync::Mutex<std::collections::HashMap<String, u32>>,
}

impl ProcessStageRunner {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            running: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    async fn terminate(mut child: Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            tokio::time::sleep(TERMINATE_GRACE).await;
            if child.try_wait().ok().flatten().is_none() {
                let _ = child.start_kill();
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
        let _ = child.wait().await;
    }
}

#[async_trait]
impl StageRunner for ProcessStageRunner {
    async fn run(
        &self,
        stage: PipelineStage,
        task_id: &str,
        workspace_root: &Path,
        timeout: Duration,
    ) -> Result<(), StageError> {
        let mut child = Command::new(&self.executable)
            .arg(stage.as_str())
            .arg(task_id)
            .current_dir(workspace_root)
            .kill_on_drop(true)
            .spawn()?;

        if let Some(pid) = child.id() {
            self.running.lock().await.insert(task_id.to_string(), pid);
        }

        let result = tokio::time::timeout(timeout, child.wait()).await;
        self.running.lock().await.remove(task_id);

        match result {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(StageError::Failed {
                stage: stage.as_str().to_string(),
                detail: format!("exit status {status}"),
            }),
            Ok(Err(e)) => Err(StageError::Io(e)),
            Err(_) => {
                Self::terminate(child).await;
                Err(StageError::Timeout(stage.as_str().to_string()))
            }
        }
    }

    async fn cancel(&self, task_id: &str) {
        let pid = self.running.lock().await.remove(task_id);
        if let Some(_pid) = pid {
            #[cfg(unix)]
            unsafe {
                libc::kill(_pid as i32, libc::SIGTERM);
            }
            tokio::time::sleep(TERMINATE_GRACE).await;
            #[cfg(unix)]
            unsafe {
                // best effort: if the process never exited, force it.
                libc::kill(_pid as i32, libc::SIGKILL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn successful_stage_returns_ok() {
        let runner = ProcessStageRunner::new("true");
        let result = runner
            .run(PipelineStage::SetupTask, "task-1", Path::new("."), StdDuration::from_secs(5))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn failing_stage_returns_failed() {
        let runner = ProcessStageRunner::new("false");
        let result = runner
            .run(PipelineStage::RunImplementer, "task-1", Path::new("."), StdDuration::from_secs(5))
            .await;
        assert!(matches!(result, Err(StageError::Failed { .. })));
    }

    #[tokio::test]
    async fn slow_stage_times_out() {
        let runner = ProcessStageRunner::new("sleep");
        let result = runner
            .run(PipelineStage::RunImplementer, "5", Path::new("."), StdDuration::from_millis(50))
            .await;
        assert!(matches!(result, Err(StageError::Timeout(_))));
    }
}
