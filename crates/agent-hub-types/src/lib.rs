pub mod contract;
pub mod provider;

pub use contract::{
    Breaker, BreakerArmStatus, Complexity, Constraints, ContractTimestamps, GitInfo, HandoffData,
    HistoryEntry, Limits, Lock, Roles, SourceFile, Specification, TaskContract, TaskEvent, TaskStatus,
};
pub use provider::{ModelInfo, ModelSpec, ProviderInfo};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool's JSON-RPC-style schema, shared between the tool surface and the
/// clients that dispatch against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: String,
    pub metadata: Value,
}
