//! Task layer: checked whenever a contract is about to be persisted. Ten
//! triggers in numeric order, first match wins.

use agent_hub_storage::atomic_write::atomic_write;
use agent_hub_storage::storage_paths::WorkspaceLayout;
use agent_hub_types::{Breaker, BreakerArmStatus, HistoryEntry, TaskContract, TaskStatus};
use chrono::Utc;

const DEFAULT_MAX_REBUTTALS: u32 = 2;
const DEFAULT_MAX_REVIEW_CYCLES: u32 = 5;
const DEFAULT_COST_CEILING_USD: f64 = 0.50;
const SCOPE_CREEP_FILE_LIMIT: usize = 20;
const DESTRUCTIVE_DIFF_RATIO: f64 = 0.5;
const GLOBAL_TIMEOUT_HOURS: i64 = 4;
const NITPICK_KEYWORDS: &[&str] = &["style", "formatting", "indentation", "spacing", "naming", "whitespace"];

#[derive(Debug, Clone)]
pub struct JudgeIssue {
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct JudgeReport {
    pub verdict: String,
    pub issues: Vec<JudgeIssue>,
}

#[derive(Debug, Clone)]
pub struct TaskTrigger {
    pub index: u8,
    pub reason: String,
}

/// Inputs the triggers need beyond what's already on the contract: the
/// diff being evaluated (for trigger 2), and the latest judge report (for
/// triggers 3 and 5).
#[derive(Debug, Clone, Default)]
pub struct TriggerContext<'a> {
    pub current_file_lines: Option<u64>,
    pub lines_deleted: Option<u64>,
    pub judge_report: Option<&'a JudgeReport>,
}

/// Evaluates the ten numeric triggers in order; the first match wins.
pub fn evaluate_task_triggers(contract: &TaskContract, ctx: &TriggerContext<'_>) -> Option<TaskTrigger> {
    let max_rebuttals = contract.limits.max_rebuttals.unwrap_or(DEFAULT_MAX_REBUTTALS);
    let max_review_cycles = contract.limits.max_review_cycles.unwrap_or(DEFAULT_MAX_REVIEW_CYCLES);
    let cost_ceiling = contract.limits.cost_ceiling_usd.unwrap_or(DEFAULT_COST_CEILING_USD);

    // 1. rebuttal_count > max_rebuttals
    if contract.breaker.rebuttal_count > max_rebuttals {
        return Some(TaskTrigger {
            index: 1,
            reason: format!(
                "rebuttal_count {} exceeds max_rebuttals {}",
                contract.breaker.rebuttal_count, max_rebuttals
            ),
        });
    }

    // 2. destructive diff
    if let (Some(current_lines), Some(deleted)) = (ctx.current_file_lines, ctx.lines_deleted) {
        let denominator = (current_lines + deleted) as f64;
        if denominator > 0.0 && (deleted as f64 / denominator) > DESTRUCTIVE_DIFF_RATIO {
            return Some(TaskTrigger {
                index: 2,
                reason: format!(
                    "destructive diff: {deleted} of {} lines removed ({:.0}%)",
                    current_lines + deleted,
                    (deleted as f64 / denominator) * 100.0
                ),
            });
        }
    }

    // 3. logical paradox: local review failed but judge passed
    if contract.handoff_data.local_review_passed == Some(false) {
        if let Some(report) = ctx.judge_report {
            if report.verdict.eq_ignore_ascii_case("PASS") {
                return Some(TaskTrigger {
                    index: 3,
                    reason: "local review failed but judge verdict is PASS".to_string(),
                });
            }
        }
    }

    // 4. hallucination loop: current_file_hash already failed once before
    if let Some(hash) = &contract.handoff_data.current_file_hash {
        let seen_failing = contract.history.iter().any(|entry| {
            entry.file_hash.as_deref() == Some(hash.as_str())
                && entry.verdict.as_deref() == Some("FAIL")
        });
        if seen_failing {
            return Some(TaskTrigger {
                index: 4,
                reason: format!("file hash {hash} previously failed review and reappeared unchanged"),
            });
        }
    }

    // 5. nitpicking: review_cycle_count >= 3 and every issue is style-class
    if contract.breaker.review_cycle_count >= 3 {
        if let Some(report) = ctx.judge_report {
            if !report.issues.is_empty()
                && report.issues.iter().all(|issue| is_style_issue(&issue.description))
            {
                return Some(TaskTrigger {
                    index: 5,
                    reason: "review cycle >= 3 with only style-class issues remaining".to_string(),
                });
            }
        }
    }

    // 6. inactivity
    if let Some(updated_at) = contract.timestamps.updated_at {
        let max_role_timeout_minutes = contract
            .limits
            .timeout_minutes
            .values()
            .copied()
            .max()
            .unwrap_or(30);
        let inactivity_limit = chrono::Duration::minutes(2 * max_role_timeout_minutes as i64);
        if Utc::now() > updated_at + inactivity_limit {
            return Some(TaskTrigger {
                index: 6,
                reason: format!("no activity for over {} minutes", 2 * max_role_timeout_minutes),
            });
        }
    }

    // 7. budget
    if contract.breaker.cost_usd > cost_ceiling {
        return Some(TaskTrigger {
            index: 7,
            reason: format!(
                "cost_usd {:.4} exceeds cost_ceiling_usd {:.4}",
                contract.breaker.cost_usd, cost_ceiling
            ),
        });
    }

    // 8. scope creep
    if contract.handoff_data.changed_files.len() > SCOPE_CREEP_FILE_LIMIT {
        return Some(TaskTrigger {
            index: 8,
            reason: format!(
                "{} changed files exceeds the {SCOPE_CREEP_FILE_LIMIT}-file scope limit",
                contract.handoff_data.changed_files.len()
            ),
        });
    }

    // 9. review cycles
    if contract.breaker.review_cycle_count > max_review_cycles {
        return Some(TaskTrigger {
            index: 9,
            reason: format!(
                "review_cycle_count {} exceeds max_review_cycles {}",
                contract.breaker.review_cycle_count, max_review_cycles
            ),
        });
    }

    // 10. global timeout
    if let Some(created_at) = contract.timestamps.created_at {
        if Utc::now() > created_at + chrono::Duration::hours(GLOBAL_TIMEOUT_HOURS) {
            return Some(TaskTrigger {
                index: 10,
                reason: format!("task has run past the {GLOBAL_TIMEOUT_HOURS}h global timeout"),
            });
        }
    }

    None
}

fn is_style_issue(description: &str) -> bool {
    let lowered = description.to_ascii_lowercase();
    NITPICK_KEYWORDS.iter().any(|kw| lowered.contains(kw))
}

/// Applies a trigger's effect: moves the contract to `erik_consultation`,
/// trips the breaker, renames the contract to its `.json.lock` sidecar, and
/// writes the halt file.
pub async fn trip_task(
    layout: &WorkspaceLayout,
    contract: &mut TaskContract,
    trigger: TaskTrigger,
) -> anyhow::Result<()> {
    contract.breaker.status = Some(BreakerArmStatus::Tripped);
    contract.breaker.triggered_by = Some(format!("task_trigger_{}", trigger.index));
    contract.breaker.trigger_reason = Some(trigger.reason.clone());
    contract.status = TaskStatus::ErikConsultation;
    contract.status_reason = Some(trigger.reason.clone());
    contract.timestamps.updated_at = Some(Utc::now());
    contract.history.push(HistoryEntry {
        event: "circuit_breaker_halt".to_string(),
        file_hash: contract.handoff_data.current_file_hash.clone(),
        verdict: None,
        recorded_at: Utc::now(),
    });

    let lock_path = layout.contract_lock_path();
    agent_hub_storage::atomic_write::atomic_write_json(&lock_path, contract).await?;
    let contract_path = layout.contract_path();
    if tokio::fs::try_exists(&contract_path).await.unwrap_or(false) {
        tokio::fs::remove_file(&contract_path).await?;
    }

    let halt_body = format!(
        "# Task halted: {}\n\n\
         **Trigger {}:** {}\n\n\
         ## Resolution\n\n\
         1. Review `{}`.\n\
         2. Fix the condition described above.\n\
         3. Call `breaker_reset` (or rename the `.lock` sidecar back) to resume.\n",
        contract.task_id,
        trigger.index,
        trigger.reason,
        lock_path.display(),
    );
    atomic_write(&layout.halt_sentinel_path(), &halt_body).await
}

/// (I4) Checked by callers before attempting any transition except the
/// halt transition itself.
pub fn breaker_is_tripped(contract: &TaskContract) -> bool {
    matches!(contract.breaker.status, Some(BreakerArmStatus::Tripped))
}

pub fn default_breaker() -> Breaker {
    Breaker {
        status: Some(BreakerArmStatus::Armed),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_hub_types::Complexity;

    fn base_contract() -> TaskContract {
        TaskContract::new("task-1", "proj", Complexity::Minor)
    }

    #[test]
    fn trigger_1_rebuttal_limit_exceeded() {
        let mut c = base_contract();
        c.limits.max_rebuttals = Some(2);
        c.breaker.rebuttal_count = 3;
        let trigger = evaluate_task_triggers(&c, &TriggerContext::default()).unwrap();
        assert_eq!(trigger.index, 1);
    }

    #[test]
    fn trigger_2_destructive_diff() {
        let c = base_contract();
        let ctx = TriggerContext {
            current_file_lines: Some(1),
            lines_deleted: Some(99),
            judge_report: None,
        };
        let trigger = evaluate_task_triggers(&c, &ctx).unwrap();
        assert_eq!(trigger.index, 2);
    }

    #[test]
    fn trigger_8_scope_creep() {
        let mut c = base_contract();
        c.handoff_data.changed_files = (0..21).map(|i| format!("f{i}.rs")).collect();
        let trigger = evaluate_task_triggers(&c, &TriggerContext::default()).unwrap();
        assert_eq!(trigger.index, 8);
    }

    #[test]
    fn trigger_5_requires_all_issues_to_be_style_class() {
        let mut c = base_contract();
        c.breaker.review_cycle_count = 3;
        let report = JudgeReport {
            verdict: "FAIL".to_string(),
            issues: vec![
                JudgeIssue { description: "inconsistent naming".to_string() },
                JudgeIssue { description: "logic error in loop bound".to_string() },
            ],
        };
        let ctx = TriggerContext {
            judge_report: Some(&report),
            ..Default::default()
        };
        assert!(evaluate_task_triggers(&c, &ctx).is_none());

        let all_style = JudgeReport {
            verdict: "FAIL".to_string(),
            issues: vec![JudgeIssue { description: "minor whitespace nit".to_string() }],
        };
        let ctx2 = TriggerContext {
            judge_report: Some(&all_style),
            ..Default::default()
        };
        let trigger = evaluate_task_triggers(&c, &ctx2).unwrap();
        assert_eq!(trigger.index, 5);
    }

    #[test]
    fn no_trigger_fires_for_healthy_contract() {
        let c = base_contract();
        assert!(evaluate_task_triggers(&c, &TriggerContext::default()).is_none());
    }

    #[tokio::test]
    async fn trip_task_renames_contract_to_lock_sidecar() {
        let dir = std::env::temp_dir().join(format!("agent-hub-breaker-trip-{}", uuid::Uuid::new_v4()));
        let layout = WorkspaceLayout::new(&dir);
        let mut c = base_contract();
        agent_hub_storage::atomic_write::atomic_write_json(&layout.contract_path(), &c)
            .await
            .unwrap();

        let trigger = TaskTrigger { index: 8, reason: "too many files".to_string() };
        trip_task(&layout, &mut c, trigger).await.unwrap();

        assert!(!tokio::fs::try_exists(layout.contract_path()).await.unwrap());
        assert!(tokio::fs::try_exists(layout.contract_lock_path()).await.unwrap());
        assert!(tokio::fs::try_exists(layout.halt_sentinel_path()).await.unwrap());
        assert_eq!(c.status, TaskStatus::ErikConsultation);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
