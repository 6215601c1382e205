//! Task contract state machine, lock semantics, and checkpoint integration
//! (contract and state machine, §4.9).

pub mod reducer;
pub mod transitions;

pub use reducer::{
    acquire_lock, apply_transition, release_lock, retry_after_stall, CheckpointCapability, CheckpointError,
    GitCheckpoint, NoopCheckpoint, ReducerError,
};
pub use transitions::{next_status, TransitionError};
