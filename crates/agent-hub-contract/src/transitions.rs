//! The task contract's state machine (contract and state machine): a single
//! table of valid `(source status, event) -> target status` moves, checked
//! before any transition is applied or persisted.

use agent_hub_types::{TaskEvent, TaskStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("{event:?} is not a valid transition from {from:?}")]
    Invalid { from: TaskStatus, event: TaskEvent },
    #[error("retry from timeout_implementer requires attempt < 2, got attempt={attempt}")]
    RetryExhausted { attempt: u32 },
}

/// Looks up the target status for `(from, event)`, enforcing the
/// `attempt < 2` guard on the single conditional row in the table.
pub fn next_status(
    from: TaskStatus,
    event: TaskEvent,
    attempt: u32,
) -> Result<TaskStatus, TransitionError> {
    use TaskEvent::*;
    use TaskStatus::*;

    // `any state -> circuit_breaker_halt -> erik_consultation` short-circuits
    // the rest of the table.
    if matches!(event, CircuitBreakerHalt) {
        return Ok(ErikConsultation);
    }

    let target = match (from, event) {
        (PendingImplementer, LockAcquired) => ImplementationInProgress,
        (ImplementationInProgress, CodeWritten) => PendingLocalReview,
        (ImplementationInProgress, Timeout) => TimeoutImplementer,
        (TimeoutImplementer, Retry) => {
            if attempt >= 2 {
                return Err(TransitionError::RetryExhausted { attempt });
            }
            PendingImplementer
        }
        (TimeoutImplementer, Escalate) => ErikConsultation,
        (PendingLocalReview, LocalPass) => PendingJudgeReview,
        (PendingLocalReview, CriticalFlaw) => ErikConsultation,
        (PendingJudgeReview, ReviewStarted) => JudgeReviewInProgress,
        (JudgeReviewInProgress, JudgeComplete) => ReviewComplete,
        (JudgeReviewInProgress, Timeout) => TimeoutJudge,
        (TimeoutJudge, Escalate) => ErikConsultation,
        (ReviewComplete, Pass) => Merged,
        (ReviewComplete, FailAgree) => PendingImplementer,
        (ReviewComplete, FailDisagree) => PendingRebuttal,
        (ReviewComplete, Conditional) => PendingImplementer,
        (PendingRebuttal, RebuttalAccepted) => PendingJudgeReview,
        (PendingRebuttal, RebuttalLimitExceeded) => ErikConsultation,
        _ => return Err(TransitionError::Invalid { from, event }),
    };

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implementer_lock_then_code_written_advances_to_local_review() {
        let s = next_status(TaskStatus::PendingImplementer, TaskEvent::LockAcquired, 1).unwrap();
        assert_eq!(s, TaskStatus::ImplementationInProgress);
        let s = next_status(s, TaskEvent::CodeWritten, 1).unwrap();
        assert_eq!(s, TaskStatus::PendingLocalReview);
    }

    #[test]
    fn retry_allowed_once_then_exhausted() {
        let s = next_status(TaskStatus::TimeoutImplementer, TaskEvent::Retry, 1).unwrap();
        assert_eq!(s, TaskStatus::PendingImplementer);

        let err = next_status(TaskStatus::TimeoutImplementer, TaskEvent::Retry, 2).unwrap_err();
        assert!(matches!(err, TransitionError::RetryExhausted { attempt: 2 }));
    }

    #[test]
    fn circuit_breaker_halt_always_lands_on_erik_consultation() {
        for from in [
            TaskStatus::PendingImplementer,
            TaskStatus::JudgeReviewInProgress,
            TaskStatus::Merged,
        ] {
            let s = next_status(from, TaskEvent::CircuitBreakerHalt, 1).unwrap();
            assert_eq!(s, TaskStatus::ErikConsultation);
        }
    }

    #[test]
    fn unlisted_transition_is_rejected() {
        let err = next_status(TaskStatus::Merged, TaskEvent::CodeWritten, 1).unwrap_err();
        assert!(matches!(err, TransitionError::Invalid { .. }));
    }

    #[test]
    fn review_complete_branches_on_verdict() {
        assert_eq!(
            next_status(TaskStatus::ReviewComplete, TaskEvent::Pass, 1).unwrap(),
            TaskStatus::Merged
        );
        assert_eq!(
            next_status(TaskStatus::ReviewComplete, TaskEvent::FailDisagree, 1).unwrap(),
            TaskStatus::PendingRebuttal
        );
    }
}
