//! Component layer: consecutive-failure counters for the router, message
//! bus, and local inference endpoint. Router/bus thresholds trigger a halt;
//! the local-inference threshold instead flips degraded mode (handled by
//! `agent-hub-degradation`, which reads this breaker's counters).

use std::path::PathBuf;

use agent_hub_storage::atomic_write::{atomic_write, atomic_write_json, safe_read_json};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Router,
    MessageBus,
    LocalInference,
}

/// Wider than the three auto-counted failure kinds: `BudgetExceeded`,
/// `ModelCooldownCascade`, and `MessageBusCorrupt` are triggered explicitly
/// by callers that detect those conditions rather than by a dedicated
/// counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    RouterFailures,
    SqliteFailures,
    OllamaFailures,
    BudgetExceeded,
    ModelCooldownCascade,
    MessageBusCorrupt,
}

impl HaltReason {
    fn human_label(self) -> &'static str {
        match self {
            HaltReason::RouterFailures => "router exhausted its fallback chain repeatedly",
            HaltReason::SqliteFailures => "the message bus backend failed repeatedly",
            HaltReason::OllamaFailures => "the local inference endpoint failed repeatedly",
            HaltReason::BudgetExceeded => "a budget ceiling was exceeded",
            HaltReason::ModelCooldownCascade => "every configured model entered cooldown simultaneously",
            HaltReason::MessageBusCorrupt => "the message bus reported corrupt state",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentBreakerState {
    pub router_failures: u32,
    pub sqlite_failures: u32,
    pub ollama_failures: u32,
    pub last_ollama_check: Option<chrono::DateTime<chrono::Utc>>,
    pub is_halted: bool,
    pub halt_reason: Option<String>,
}

impl Default for ComponentBreakerState {
    fn default() -> Self {
        Self {
            router_failures: 0,
            sqlite_failures: 0,
            ollama_failures: 0,
            last_ollama_check: None,
            is_halted: false,
            halt_reason: None,
        }
    }
}

pub struct ComponentBreaker {
    state: RwLock<ComponentBreakerState>,
    state_path: PathBuf,
    halt_file_path: PathBuf,
    router_limit: u32,
    bus_limit: u32,
    ollama_limit: u32,
}

impl ComponentBreaker {
    pub async fn load_or_init(
        state_path: PathBuf,
        halt_file_path: PathBuf,
        router_limit: u32,
        bus_limit: u32,
        ollama_limit: u32,
    ) -> anyhow::Result<Self> {
        let state = safe_read_json::<ComponentBreakerState>(&state_path)
            .await?
            .unwrap_or_default();
        Ok(Self {
            state: RwLock::new(state),
            state_path,
            halt_file_path,
            router_limit,
            bus_limit,
            ollama_limit,
        })
    }

    pub async fn snapshot(&self) -> ComponentBreakerState {
        self.state.read().await.clone()
    }

    async fn persist(&self, state: &ComponentBreakerState) -> anyhow::Result<()> {
        atomic_write_json(&self.state_path, state).await
    }

    /// Records a consecutive failure for `component`; halts (router/bus) or
    /// returns `true` once the threshold is crossed (caller decides what a
    /// local-inference threshold breach means — degraded mode, not halt).
    pub async fn record_failure(&self, component: ComponentKind) -> anyhow::Result<bool> {
        let mut state = self.state.write().await;
        let (count, limit, halt_reason) = match component {
            ComponentKind::Router => {
                state.router_failures += 1;
                (state.router_failures, self.router_limit, HaltReason::RouterFailures)
            }
            ComponentKind::MessageBus => {
                state.sqlite_failures += 1;
                (state.sqlite_failures, self.bus_limit, HaltReason::SqliteFailures)
            }
            ComponentKind::LocalInference => {
                state.ollama_failures += 1;
                (state.ollama_failures, self.ollama_limit, HaltReason::OllamaFailures)
            }
        };

        let threshold_crossed = count >= limit;
        if threshold_crossed && matches!(component, ComponentKind::Router | ComponentKind::MessageBus) {
            self.halt_locked(&mut state, halt_reason).await?;
        } else {
            self.persist(&state).await?;
        }
        Ok(threshold_crossed)
    }

    pub async fn record_success(&self, component: ComponentKind) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        match component {
            ComponentKind::Router => state.router_failures = 0,
            ComponentKind::MessageBus => state.sqlite_failures = 0,
            ComponentKind::LocalInference => {
                state.ollama_failures = 0;
                state.last_ollama_check = Some(chrono::Utc::now());
            }
        }
        self.persist(&state).await
    }

    pub async fn halt(&self, reason: HaltReason) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        self.halt_locked(&mut state, reason).await
    }

    async fn halt_locked(&self, state: &mut ComponentBreakerState, reason: HaltReason) -> anyhow::Result<()> {
        state.is_halted = true;
        state.halt_reason = Some(reason.human_label().to_string());
        self.persist(state).await?;
        self.write_halt_file(state, reason).await
    }

    async fn write_halt_file(&self, state: &ComponentBreakerState, reason: HaltReason) -> anyhow::Result<()> {
        let body = format!(
            "# Agent Hub halted\n\n\
             **Reason:** {}\n\n\
             ## Counters\n\n\
             - router_failures: {}\n\
             - sqlite_failures: {}\n\
             - ollama_failures: {}\n\n\
             ## Resolution\n\n\
             1. Investigate and fix the underlying failure.\n\
             2. Call the `breaker_reset` tool (or run `agent-hub breaker reset`) to clear this halt.\n\
             3. Delete this file once resolved; its existence alone keeps the pipeline halted.\n",
            reason.human_label(),
            state.router_failures,
            state.sqlite_failures,
            state.ollama_failures,
        );
        atomic_write(&self.halt_file_path, &body).await
    }

    /// Halt file existence is the source of truth; `reset` clears both.
    pub async fn is_halted(&self) -> bool {
        self.halt_file_path.exists() || self.state.read().await.is_halted
    }

    pub async fn reset(&self) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        *state = ComponentBreakerState::default();
        self.persist(&state).await?;
        if self.halt_file_path.exists() {
            tokio::fs::remove_file(&self.halt_file_path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("agent-hub-breaker-test-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn router_halts_at_threshold() {
        let dir = temp_dir();
        let breaker = ComponentBreaker::load_or_init(
            dir.join("state.json"),
            dir.join("HALT.md"),
            2,
            3,
            3,
        )
        .await
        .unwrap();

        assert!(!breaker.record_failure(ComponentKind::Router).await.unwrap());
        assert!(breaker.record_failure(ComponentKind::Router).await.unwrap());
        assert!(breaker.is_halted().await);
        assert!(dir.join("HALT.md").exists());
    }

    #[tokio::test]
    async fn success_resets_counter() {
        let dir = temp_dir();
        let breaker = ComponentBreaker::load_or_init(dir.join("state.json"), dir.join("HALT.md"), 3, 3, 3)
            .await
            .unwrap();
        breaker.record_failure(ComponentKind::MessageBus).await.unwrap();
        breaker.record_success(ComponentKind::MessageBus).await.unwrap();
        let snapshot = breaker.snapshot().await;
        assert_eq!(snapshot.sqlite_failures, 0);
    }

    #[tokio::test]
    async fn reset_clears_halt_file() {
        let dir = temp_dir();
        let breaker = ComponentBreaker::load_or_init(dir.join("state.json"), dir.join("HALT.md"), 1, 1, 1)
            .await
            .unwrap();
        breaker.halt(HaltReason::BudgetExceeded).await.unwrap();
        assert!(breaker.is_halted().await);
        breaker.reset().await.unwrap();
        assert!(!breaker.is_halted().await);
        assert!(!dir.join("HALT.md").exists());
    }
}
