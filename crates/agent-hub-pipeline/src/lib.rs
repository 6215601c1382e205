//! Pipeline supervisor (§4.10): adaptive polling, proposal-to-contract
//! conversion, the five-stage task pipeline, and the supervisor that binds
//! them to the message bus.

mod poller;
mod proposal;
mod stage;
mod supervisor;

pub use poller::AdaptivePoller;
pub use proposal::{proposal_to_contract, ProposalError, ProposalPayload};
pub use stage::{PipelineStage, ProcessStageRunner, StageError, StageRunner};
pub use supervisor::{PipelineSupervisor, SupervisorConfig};
