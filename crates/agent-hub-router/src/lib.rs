//! Model router and fallback engine (model router): resolves a task type to
//! a fallback chain, consults degradation and budget, and attempts each
//! candidate model in order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_hub_audit::{log_model_call_outcome, AuditLog, EventType};
use agent_hub_breaker::{ComponentBreaker, ComponentKind};
use agent_hub_budget::BudgetManager;
use agent_hub_degradation::DegradationManager;
use agent_hub_providers::{ChatMessage, CompletionOutcome, InferenceClient};
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// task type -> ordered model chain
    pub chains: HashMap<String, Vec<String>>,
    pub allowed_fails: u32,
    pub cooldown_seconds: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let mut chains = HashMap::new();
        chains.insert(
            "default".to_string(),
            vec!["local-fast".into(), "cloud-fast".into(), "cloud-premium".into()],
        );
        chains.insert(
            "code".to_string(),
            vec!["local-coder".into(), "cloud-fast".into(), "cloud-premium".into()],
        );
        chains.insert(
            "reasoning".to_string(),
            vec!["local-reasoning".into(), "cloud-premium".into()],
        );
        Self {
            chains,
            allowed_fails: default_allowed_fails(),
            cooldown_seconds: default_cooldown_seconds(),
        }
    }
}

fn default_allowed_fails() -> u32 {
    std::env::var("UAS_ALLOWED_FAILS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3)
}

fn default_cooldown_seconds() -> u64 {
    std::env::var("UAS_COOLDOWN_SECONDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60)
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("every candidate model was skipped: budget exhausted")]
    BudgetExhausted,
    #[error("every candidate model failed or was in cooldown")]
    RouterExhausted,
}

#[derive(Debug, Clone)]
pub struct RouterOutcome {
    pub model: String,
    pub text: String,
    pub usage: agent_hub_providers::TokenUsage,
    pub fallback_used: bool,
}

struct Cooldown {
    consecutive_fails: u32,
    cooldown_until: Option<Instant>,
}

pub struct ModelRouter {
    config: RouterConfig,
    cooldowns: RwLock<HashMap<String, Cooldown>>,
    degradation: Arc<DegradationManager>,
    budget: Arc<BudgetManager>,
    breaker: Arc<ComponentBreaker>,
    audit: Arc<AuditLog>,
    inference: Arc<dyn InferenceClient>,
}

impl ModelRouter {
    pub fn new(
        config: RouterConfig,
        degradation: Arc<DegradationManager>,
        budget: Arc<BudgetManager>,
        breaker: Arc<ComponentBreaker>,
        audit: Arc<AuditLog>,
        inference: Arc<dyn InferenceClient>,
    ) -> Self {
        Self {
            config,
            cooldowns: RwLock::new(HashMap::new()),
            degradation,
            budget,
            breaker,
            audit,
            inference,
        }
    }

    async fn resolve_chain(&self, task_type: &str, preferred: Option<&str>) -> Vec<String> {
        let mut chain = self
            .config
            .chains
            .get(task_type)
            .or_else(|| self.config.chains.get("default"))
            .cloned()
            .unwrap_or_default();

        if let Some(preferred) = preferred {
            chain.retain(|m| m != preferred);
            chain.insert(0, preferred.to_string());
        }

        // degraded mode: drop local entries, rewriting the rest through the
        // degradation manager (a no-op for already-cloud entries).
        if self.degradation.is_low_power_mode() {
            let mut rewritten = Vec::with_capacity(chain.len());
            for model in chain {
                let resolved = self.degradation.get_best_available_model(&model).await;
                if !rewritten.contains(&resolved) {
                    rewritten.push(resolved);
                }
            }
            chain = rewritten;
        }
        chain
    }

    async fn in_cooldown(&self, model: &str) -> bool {
        let cooldowns = self.cooldowns.read().await;
        match cooldowns.get(model) {
            Some(c) => c.cooldown_until.map(|until| Instant::now() < until).unwrap_or(false),
            None => false,
        }
    }

    async fn record_success(&self, model: &str) {
        let mut cooldowns = self.cooldowns.write().await;
        cooldowns.entry(model.to_string()).or_insert_with(|| Cooldown {
            consecutive_fails: 0,
            cooldown_until: None,
        });
        if let Some(entry) = cooldowns.get_mut(model) {
            entry.consecutive_fails = 0;
            entry.cooldown_until = None;
        }
    }

    async fn record_failure(&self, model: &str) {
        let mut cooldowns = self.cooldowns.write().await;
        let entry = cooldowns.entry(model.to_string()).or_insert_with(|| Cooldown {
            consecutive_fails: 0,
            cooldown_until: None,
        });
        entry.consecutive_fails += 1;
        if entry.consecutive_fails >= self.config.allowed_fails {
            entry.cooldown_until = Some(Instant::now() + Duration::from_secs(self.config.cooldown_seconds));
            entry.consecutive_fails = 0;
        }
    }

    /// Resolves the chain for `task_type`, consults degradation + budget,
    /// and attempts each candidate in order (model router, the core loop).
    pub async fn route(
        &self,
        task_type: &str,
        preferred: Option<&str>,
        messages: &[ChatMessage],
        run_id: Option<&str>,
    ) -> Result<RouterOutcome, RouterError> {
        self.degradation.probe().await.ok();
        let chain = self.resolve_chain(task_type, preferred).await;

        let mut any_attempted = false;
        let mut cooldown_skips = 0u32;
        let mut budget_skips = 0u32;
        for (idx, model) in chain.iter().enumerate() {
            if self.in_cooldown(model).await {
                cooldown_skips += 1;
                continue;
            }

            let estimate_tokens = 1_000u64;
            let (affordable, reason) = self.budget.can_afford(model, estimate_tokens, estimate_tokens).await;
            if !affordable {
                budget_skips += 1;
                self.audit
                    .log(
                        EventType::BudgetCheckFail,
                        "router",
                        json!({ "model": model, "reason": reason }),
                        run_id,
                    )
                    .await
                    .ok();
                continue;
            }
            self.audit
                .log(EventType::BudgetCheckPass, "router", json!({ "model": model }), run_id)
                .await
                .ok();

            any_attempted = true;
            self.audit
                .log(EventType::ModelCallStart, "router", json!({ "model": model }), run_id)
                .await
                .ok();

            match self.inference.complete(model, messages).await {
                Ok(CompletionOutcome { text, usage }) => {
                    self.record_success(model).await;
                    self.breaker.record_success(ComponentKind::Router).await.ok();
                    let was_fallback = idx > 0;
                    self.budget
                        .record_cost(model, usage.prompt_tokens, usage.completion_tokens, Some(task_type), was_fallback)
                        .await
                        .ok();
                    log_model_call_outcome(
                        &self.audit,
                        "router",
                        run_id,
                        model,
                        chain.first().map(String::as_str).unwrap_or(model),
                        true,
                        json!({ "model": model }),
                    )
                    .await
                    .ok();

                    return Ok(RouterOutcome {
                        model: model.clone(),
                        text,
                        usage,
                        fallback_used: was_fallback,
                    });
                }
                Err(err) => {
                    self.record_failure(model).await;
                    self.audit
                        .log(
                            EventType::ModelCallFailure,
                            "router",
                            json!({ "model": model, "error": err.to_string() }),
                            run_id,
                        )
                        .await
                        .ok();
                }
            }
        }

        self.breaker.record_failure(ComponentKind::Router).await.ok();
        if !any_attempted && budget_skips > 0 && cooldown_skips == 0 {
            Err(RouterError::BudgetExhausted)
        } else {
            Err(RouterError::RouterExhausted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_hub_providers::EchoInferenceClient;
    use std::path::PathBuf;
    use uuid::Uuid;

    async fn router_with(config: RouterConfig) -> ModelRouter {
        let dir = std::env::temp_dir().join(format!("agent-hub-router-test-{}", Uuid::new_v4()));
        let breaker = Arc::new(
            ComponentBreaker::load_or_init(dir.join("breaker.json"), dir.join("HALT.md"), 5, 3, 3)
                .await
                .unwrap(),
        );
        let audit = Arc::new(AuditLog::new(dir.join("audit.ndjson"), "session-1"));
        let degradation = Arc::new(agent_hub_degradation::DegradationManager::new(
            "http://127.0.0.1:1",
            1,
            dir.join("LOW_POWER_MODE.txt"),
            "cloud-fast",
            breaker.clone(),
            audit.clone(),
        ));
        let budget = Arc::new(
            BudgetManager::load_or_init(dir.join("budget.json"), "session-1", 1.0, 5.0)
                .await
                .unwrap(),
        );
        ModelRouter::new(
            config,
            degradation,
            budget,
            breaker,
            audit,
            Arc::new(EchoInferenceClient),
        )
    }

    fn messages() -> Vec<ChatMessage> {
        vec![ChatMessage { role: "user".into(), content: "hi".into() }]
    }

    #[tokio::test]
    async fn routes_to_first_candidate_on_success() {
        let router = router_with(RouterConfig::default()).await;
        let outcome = router.route("default", None, &messages(), None).await.unwrap();
        assert_eq!(outcome.model, "local-fast");
        assert!(!outcome.fallback_used);
    }

    #[tokio::test]
    async fn preferred_model_is_promoted_to_front() {
        let router = router_with(RouterConfig::default()).await;
        let outcome = router
            .route("default", Some("cloud-premium"), &messages(), None)
            .await
            .unwrap();
        assert_eq!(outcome.model, "cloud-premium");
    }

    #[tokio::test]
    async fn budget_exhausted_when_every_cloud_candidate_is_unaffordable() {
        let mut config = RouterConfig::default();
        config.chains.insert("default".to_string(), vec!["cloud-premium".into()]);
        let dir = std::env::temp_dir().join(format!("agent-hub-router-budget-{}", Uuid::new_v4()));
        let breaker = Arc::new(
            ComponentBreaker::load_or_init(dir.join("breaker.json"), dir.join("HALT.md"), 5, 3, 3)
                .await
                .unwrap(),
        );
        let audit = Arc::new(AuditLog::new(dir.join("audit.ndjson"), "session-1"));
        let degradation = Arc::new(agent_hub_degradation::DegradationManager::new(
            "http://127.0.0.1:1",
            1,
            dir.join("LOW_POWER_MODE.txt"),
            "cloud-fast",
            breaker.clone(),
            audit.clone(),
        ));
        let budget = Arc::new(
            BudgetManager::load_or_init(dir.join("budget.json"), "session-1", 0.00001, 0.00001)
                .await
                .unwrap(),
        );
        let router = ModelRouter::new(config, degradation, budget, breaker, audit, Arc::new(EchoInferenceClient));

        let err = router.route("default", None, &messages(), None).await.unwrap_err();
        assert!(matches!(err, RouterError::BudgetExhausted));
        let _ = PathBuf::new();
    }

    #[tokio::test]
    async fn router_exhausted_when_every_candidate_is_in_cooldown() {
        let mut config = RouterConfig::default();
        config.chains.insert("default".to_string(), vec!["local-fast".into()]);
        config.allowed_fails = 1;
        let dir = std::env::temp_dir().join(format!("agent-hub-router-cooldown-{}", Uuid::new_v4()));
        let breaker = Arc::new(
            ComponentBreaker::load_or_init(dir.join("breaker.json"), dir.join("HALT.md"), 5, 3, 3)
                .await
                .unwrap(),
        );
        let audit = Arc::new(AuditLog::new(dir.join("audit.ndjson"), "session-1"));
        let degradation = Arc::new(agent_hub_degradation::DegradationManager::new(
            "http://127.0.0.1:1",
            1,
            dir.join("LOW_POWER_MODE.txt"),
            "cloud-fast",
            breaker.clone(),
            audit.clone(),
        ));
        let budget = Arc::new(
            BudgetManager::load_or_init(dir.join("budget.json"), "session-1", 1.0, 5.0)
                .await
                .unwrap(),
        );
        let router = ModelRouter::new(
            config,
            degradation,
            budget,
            breaker,
            audit,
            Arc::new(agent_hub_providers::AlwaysFailInferenceClient),
        );

        // first call trips the model into cooldown after one failure.
        let _ = router.route("default", None, &messages(), None).await;
        let err = router.route("default", None, &messages(), None).await.unwrap_err();
        assert!(matches!(err, RouterError::RouterExhausted));
    }
}
