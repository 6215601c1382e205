//! Budget manager (budget manager): pricing table, session/day accounting,
//! override windows, and pre-flight affordability checks.

use std::path::PathBuf;

use agent_hub_storage::atomic_write::{atomic_write_json, safe_read_json};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Local,
    Cloud,
}

#[derive(Debug, Clone, Copy)]
pub struct ModelPrice {
    pub input_usd_per_million: f64,
    pub output_usd_per_million: f64,
    pub tier: ModelTier,
}

const UNKNOWN_MODEL_FALLBACK: ModelPrice = ModelPrice {
    input_usd_per_million: 0.10,
    output_usd_per_million: 0.40,
    tier: ModelTier::Cloud,
};

/// The authoritative default pricing table (model pricing table, §3).
pub fn lookup_price(model: &str) -> ModelPrice {
    match model {
        "ollama/llama3.2:1b"
        | "ollama/qwen2.5-coder:14b"
        | "ollama/deepseek-r1-distill-qwen:32b"
        | "local-fast"
        | "local-coder"
        | "local-reasoning" => ModelPrice {
            input_usd_per_million: 0.0,
            output_usd_per_million: 0.0,
            tier: ModelTier::Local,
        },
        "gemini/gemini-2.0-flash" | "cloud-fast" => ModelPrice {
            input_usd_per_million: 0.075,
            output_usd_per_million: 0.30,
            tier: ModelTier::Cloud,
        },
        "claude-3-5-sonnet-20241022" | "cloud-premium" => ModelPrice {
            input_usd_per_million: 3.00,
            output_usd_per_million: 15.00,
            tier: ModelTier::Cloud,
        },
        other => {
            tracing::warn!(model = other, "unknown model, using conservative cloud pricing fallback");
            UNKNOWN_MODEL_FALLBACK
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudEscape {
    pub model: String,
    pub cost_usd: f64,
    pub task_type: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetState {
    pub session_id: String,
    pub session_start: DateTime<Utc>,
    pub session_cloud_cost: f64,
    pub daily_cloud_cost: f64,
    pub session_local_calls: u64,
    pub session_local_tokens: u64,
    pub session_limit: f64,
    pub daily_limit: f64,
    pub current_date: NaiveDate,
    pub cloud_escapes: Vec<CloudEscape>,
    pub override_active: bool,
    pub override_reason: Option<String>,
    pub override_expires: Option<DateTime<Utc>>,
}

impl BudgetState {
    fn new(session_id: String, session_limit: f64, daily_limit: f64) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            session_start: now,
            session_cloud_cost: 0.0,
            daily_cloud_cost: 0.0,
            session_local_calls: 0,
            session_local_tokens: 0,
            session_limit,
            daily_limit,
            current_date: now.date_naive(),
            cloud_escapes: Vec::new(),
            override_active: false,
            override_reason: None,
            override_expires: None,
        }
    }

    fn roll_day_if_needed(&mut self) {
        let today = Utc::now().date_naive();
        if today != self.current_date {
            self.current_date = today;
            self.daily_cloud_cost = 0.0;
        }
    }

    fn expire_override_if_needed(&mut self) {
        if let Some(expires) = self.override_expires {
            if Utc::now() >= expires {
                self.override_active = false;
                self.override_reason = None;
                self.override_expires = None;
            }
        }
    }
}

pub const DEFAULT_SESSION_BUDGET_USD: f64 = 1.00;
pub const DEFAULT_DAILY_BUDGET_USD: f64 = 5.00;

pub struct BudgetManager {
    state: RwLock<BudgetState>,
    path: PathBuf,
    disable_check: bool,
}

impl BudgetManager {
    pub async fn load_or_init(
        path: PathBuf,
        session_id: impl Into<String>,
        session_limit: f64,
        daily_limit: f64,
    ) -> anyhow::Result<Self> {
        let state = match safe_read_json::<BudgetState>(&path).await? {
            Some(mut loaded) => {
                loaded.roll_day_if_needed();
                loaded.expire_override_if_needed();
                loaded
            }
            None => BudgetState::new(session_id.into(), session_limit, daily_limit),
        };
        let disable_check = std::env::var("UAS_DISABLE_BUDGET_CHECK")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Ok(Self {
            state: RwLock::new(state),
            path,
            disable_check,
        })
    }

    async fn persist(&self, state: &BudgetState) -> anyhow::Result<()> {
        atomic_write_json(&self.path, state).await
    }

    pub fn estimate_cost(model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
        let price = lookup_price(model);
        if matches!(price.tier, ModelTier::Local) {
            return 0.0;
        }
        (tokens_in as f64 / 1_000_000.0) * price.input_usd_per_million
            + (tokens_out as f64 / 1_000_000.0) * price.output_usd_per_million
    }

    /// (a) global disable -> ok. (b) override active -> ok. (c) local tier
    /// -> ok. (d) otherwise session+day running totals plus estimate must
    /// stay under both limits.
    pub async fn can_afford(&self, model: &str, est_in: u64, est_out: u64) -> (bool, String) {
        if self.disable_check {
            return (true, "budget checks disabled".to_string());
        }

        let mut state = self.state.write().await;
        state.roll_day_if_needed();
        state.expire_override_if_needed();

        if state.override_active {
            return (true, "override window active".to_string());
        }

        let price = lookup_price(model);
        if matches!(price.tier, ModelTier::Local) {
            return (true, "local tier is free".to_string());
        }

        let estimate = Self::estimate_cost(model, est_in, est_out);
        if state.session_cloud_cost + estimate > state.session_limit {
            return (
                false,
                format!(
                    "Session limit exceeded: ${:.4} + ${:.4} > ${:.2}",
                    state.session_cloud_cost, estimate, state.session_limit
                ),
            );
        }
        if state.daily_cloud_cost + estimate > state.daily_limit {
            return (
                false,
                format!(
                    "Daily limit exceeded: ${:.4} + ${:.4} > ${:.2}",
                    state.daily_cloud_cost, estimate, state.daily_limit
                ),
            );
        }
        (true, "within budget".to_string())
    }

    pub async fn record_cost(
        &self,
        model: &str,
        tokens_in: u64,
        tokens_out: u64,
        task_type: Option<&str>,
        was_fallback: bool,
    ) -> anyhow::Result<f64> {
        let price = lookup_price(model);
        let cost = Self::estimate_cost(model, tokens_in, tokens_out);

        let mut state = self.state.write().await;
        state.roll_day_if_needed();

        match price.tier {
            ModelTier::Local => {
                state.session_local_calls += 1;
                state.session_local_tokens += tokens_in + tokens_out;
            }
            ModelTier::Cloud => {
                state.session_cloud_cost += cost;
                state.daily_cloud_cost += cost;
                if was_fallback {
                    state.cloud_escapes.push(CloudEscape {
                        model: model.to_string(),
                        cost_usd: cost,
                        task_type: task_type.map(|s| s.to_string()),
                        at: Utc::now(),
                    });
                }
            }
        }
        self.persist(&state).await?;
        Ok(cost)
    }

    pub async fn request_override(&self, reason: impl Into<String>, duration_minutes: i64) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        state.override_active = true;
        state.override_reason = Some(reason.into());
        state.override_expires = Some(Utc::now() + chrono::Duration::minutes(duration_minutes));
        self.persist(&state).await
    }

    pub async fn clear_override(&self) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        state.override_active = false;
        state.override_reason = None;
        state.override_expires = None;
        self.persist(&state).await
    }

    pub async fn is_override_active(&self) -> bool {
        let mut state = self.state.write().await;
        state.expire_override_if_needed();
        state.override_active
    }

    pub async fn reset_session(&self) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        let session_id = state.session_id.clone();
        let session_limit = state.session_limit;
        let daily_limit = state.daily_limit;
        let daily_cloud_cost = state.daily_cloud_cost;
        let current_date = state.current_date;
        *state = BudgetState::new(session_id, session_limit, daily_limit);
        state.daily_cloud_cost = daily_cloud_cost;
        state.current_date = current_date;
        self.persist(&state).await
    }

    pub async fn get_status(&self) -> BudgetState {
        let mut state = self.state.write().await;
        state.roll_day_if_needed();
        state.expire_override_if_needed();
        state.clone()
    }

    pub async fn get_cloud_escapes(&self) -> Vec<CloudEscape> {
        self.state.read().await.cloud_escapes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("agent-hub-budget-test-{}.json", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn local_tier_is_always_affordable() {
        let mgr = BudgetManager::load_or_init(temp_path(), "s1", 0.01, 0.01).await.unwrap();
        let (ok, _) = mgr.can_afford("local-coder", 100_000, 100_000).await;
        assert!(ok);
    }

    #[tokio::test]
    async fn session_limit_blocks_expensive_cloud_call() {
        let mgr = BudgetManager::load_or_init(temp_path(), "s1", 0.01, 5.0).await.unwrap();
        let (ok, reason) = mgr.can_afford("cloud-premium", 1_000_000, 1_000_000).await;
        assert!(!ok);
        assert!(reason.contains("Session limit"));
    }

    #[tokio::test]
    async fn override_window_bypasses_limits_until_expiry() {
        let mgr = BudgetManager::load_or_init(temp_path(), "s1", 0.01, 0.01).await.unwrap();
        mgr.request_override("manual review", 60).await.unwrap();
        let (ok, _) = mgr.can_afford("cloud-premium", 1_000_000, 1_000_000).await;
        assert!(ok);
        assert!(mgr.is_override_active().await);
    }

    #[tokio::test]
    async fn record_cost_tracks_fallback_escapes() {
        let mgr = BudgetManager::load_or_init(temp_path(), "s1", 5.0, 5.0).await.unwrap();
        mgr.record_cost("cloud-fast", 1000, 1000, Some("code"), true).await.unwrap();
        let escapes = mgr.get_cloud_escapes().await;
        assert_eq!(escapes.len(), 1);
        assert_eq!(escapes[0].model, "cloud-fast");
    }

    #[tokio::test]
    async fn unknown_model_uses_conservative_cloud_fallback() {
        let price = lookup_price("some-new-provider/model-x");
        assert_eq!(price.tier, ModelTier::Cloud);
        assert_eq!(price.input_usd_per_million, 0.10);
    }
}
