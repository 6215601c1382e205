//! Degradation manager (degradation manager): probes the local inference
//! endpoint and declares Low-Power Mode after two consecutive failures.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use agent_hub_audit::{AuditLog, EventType};
use agent_hub_breaker::{ComponentBreaker, ComponentKind};
use agent_hub_budget::{lookup_price, ModelTier};
use agent_hub_storage::atomic_write::atomic_write;
use serde_json::json;
use tokio::sync::RwLock;

const CONSECUTIVE_FAILURES_FOR_LOW_POWER: u32 = 2;
const HEALTHY_CACHE_SECONDS: u64 = 30;

pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_SECONDS: u64 = 5;
pub const DEFAULT_CLOUD_FALLBACK_MODEL: &str = "cloud-fast";

struct HealthCache {
    healthy_until: Option<Instant>,
    consecutive_failures: u32,
    low_power_mode: bool,
}

pub struct DegradationManager {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    notification_path: PathBuf,
    cloud_fallback_model: String,
    cache: RwLock<HealthCache>,
    breaker: std::sync::Arc<ComponentBreaker>,
    audit: std::sync::Arc<AuditLog>,
}

impl DegradationManager {
    pub fn new(
        base_url: impl Into<String>,
        timeout_seconds: u64,
        notification_path: PathBuf,
        cloud_fallback_model: impl Into<String>,
        breaker: std::sync::Arc<ComponentBreaker>,
        audit: std::sync::Arc<AuditLog>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout: Duration::from_secs(timeout_seconds),
            notification_path,
            cloud_fallback_model: cloud_fallback_model.into(),
            cache: RwLock::new(HealthCache {
                healthy_until: None,
                consecutive_failures: 0,
                low_power_mode: false,
            }),
            breaker,
            audit,
        }
    }

    pub fn is_low_power_mode(&self) -> bool {
        // best-effort synchronous read; callers that need a guaranteed
        // up-to-date value should call `probe` first.
        self.cache.try_read().map(|c| c.low_power_mode).unwrap_or(false)
    }

    /// Probes the endpoint with a cheap GET; cached for 30s while healthy.
    /// Records the outcome with the component-layer breaker either way.
    pub async fn probe(&self) -> anyhow::Result<bool> {
        {
            let cache = self.cache.read().await;
            if let Some(until) = cache.healthy_until {
                if Instant::now() < until {
                    return Ok(true);
                }
            }
        }

        let healthy = self.perform_probe().await;
        let mut cache = self.cache.write().await;

        if healthy {
            cache.consecutive_failures = 0;
            cache.healthy_until = Some(Instant::now() + Duration::from_secs(HEALTHY_CACHE_SECONDS));
            self.breaker.record_success(ComponentKind::LocalInference).await?;

            if cache.low_power_mode {
                cache.low_power_mode = false;
                if self.notification_path.exists() {
                    tokio::fs::remove_file(&self.notification_path).await?;
                }
                self.audit
                    .log(EventType::DegradationRecovered, "degradation", json!({ "base_url": self.base_url }), None)
                    .await
                    .ok();
            }
        } else {
            cache.consecutive_failures += 1;
            cache.healthy_until = None;
            self.breaker.record_failure(ComponentKind::LocalInference).await?;

            if cache.consecutive_failures >= CONSECUTIVE_FAILURES_FOR_LOW_POWER && !cache.low_power_mode {
                cache.low_power_mode = true;
                let body = format!(
                    "# Low-Power Mode\n\n\
                     The local inference endpoint at {} failed {} consecutive health checks.\n\
                     All local-tier requests are being rewritten to `{}` until recovery.\n",
                    self.base_url, cache.consecutive_failures, self.cloud_fallback_model
                );
                atomic_write(&self.notification_path, &body).await?;
                self.audit
                    .log(
                        EventType::DegradationEntered,
                        "degradation",
                        json!({ "base_url": self.base_url, "consecutive_failures": cache.consecutive_failures }),
                        None,
                    )
                    .await
                    .ok();
            }
        }

        Ok(healthy)
    }

    async fn perform_probe(&self) -> bool {
        let url = format!("{}/api/version", self.base_url.trim_end_matches('/'));
        match self.client.get(url).timeout(self.timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Rewrites any local-tier request to the configured cloud fallback
    /// while in Low-Power Mode; otherwise returns `preferred` unchanged.
    pub async fn get_best_available_model(&self, preferred: &str) -> String {
        if !self.cache.read().await.low_power_mode {
            return preferred.to_string();
        }
        if matches!(lookup_price(preferred).tier, ModelTier::Local) {
            self.cloud_fallback_model.clone()
        } else {
            preferred.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_hub_breaker::ComponentBreaker;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn manager_with_unreachable_endpoint() -> DegradationManager {
        let dir = std::env::temp_dir().join(format!("agent-hub-degradation-test-{}", Uuid::new_v4()));
        let breaker = Arc::new(
            ComponentBreaker::load_or_init(dir.join("breaker.json"), dir.join("HALT.md"), 5, 3, 3)
                .await
                .unwrap(),
        );
        let audit = Arc::new(AuditLog::new(dir.join("audit.ndjson"), "session-1"));
        DegradationManager::new(
            "http://127.0.0.1:1", // nothing listens here
            1,
            dir.join("LOW_POWER_MODE.txt"),
            DEFAULT_CLOUD_FALLBACK_MODEL,
            breaker,
            audit,
        )
    }

    #[tokio::test]
    async fn two_consecutive_failures_enter_low_power_mode() {
        let mgr = manager_with_unreachable_endpoint().await;
        assert!(!mgr.probe().await.unwrap());
        assert!(!mgr.is_low_power_mode());
        assert!(!mgr.probe().await.unwrap());
        assert!(mgr.is_low_power_mode());
        assert!(tokio::fs::try_exists(&mgr.notification_path).await.unwrap());
    }

    #[tokio::test]
    async fn local_model_rewritten_to_cloud_fallback_in_low_power_mode() {
        let mgr = manager_with_unreachable_endpoint().await;
        mgr.probe().await.unwrap();
        mgr.probe().await.unwrap();
        assert!(mgr.is_low_power_mode());
        let resolved = mgr.get_best_available_model("local-coder").await;
        assert_eq!(resolved, DEFAULT_CLOUD_FALLBACK_MODEL);

        let resolved_cloud = mgr.get_best_available_model("cloud-premium").await;
        assert_eq!(resolved_cloud, "cloud-premium");
    }

    #[tokio::test]
    async fn entering_low_power_mode_emits_a_degradation_entered_audit_event() {
        let mgr = manager_with_unreachable_endpoint().await;
        mgr.probe().await.unwrap();
        mgr.probe().await.unwrap();
        assert!(mgr.is_low_power_mode());

        let events = mgr.audit.get_events(Some(EventType::DegradationEntered), None, None, 10).await.unwrap();
        assert_eq!(events.len(), 1);
    }
}
