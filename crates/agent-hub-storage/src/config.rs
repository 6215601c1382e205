//! Layered configuration: global -> project -> managed -> environment ->
//! runtime -> cli, deep-merged in that order (see external interfaces,
//! configuration layering).
//!
//! The environment layer is populated from the `UAS_*` / `AGENT_HUB_*`
//! variables. It sits after the file-backed layers (global/project/managed)
//! so that environment overrides dominate configuration files, while an
//! in-process runtime patch or an explicit CLI flag still wins for
//! programmatic embedding, since those layers are applied last.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use crate::atomic_write::atomic_write;

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    managed: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    managed_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(project_path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let project_path = project_path.as_ref().to_path_buf();
        if let Some(parent) = project_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let managed_path = project_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("managed_config.json");
        let global_path = resolve_global_config_path();

        let global = read_json_file(&global_path).await;
        let project = read_json_file(&project_path).await;
        let managed = read_json_file(&managed_path).await;

        let layers = ConfigLayers {
            global,
            project,
            managed,
            env: env_layer(),
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        Ok(Self {
            project_path,
            global_path,
            managed_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn effective(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.managed);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn project_layer(&self) -> Value {
        self.layers.read().await.project.clone()
    }

    pub async fn global_layer(&self) -> Value {
        self.layers.read().await.global.clone()
    }

    pub async fn layers_snapshot(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "managed": layers.managed,
            "env": layers.env,
            "runtime": layers.runtime,
            "cli": layers.cli,
        })
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.effective().await)
    }

    pub async fn patch_global(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.global, &patch);
        }
        self.save_global().await?;
        Ok(self.effective().await)
    }

    pub async fn patch_runtime(&self, patch: Value) -> Value {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        self.effective().await
    }

    /// Re-reads process environment into the env layer. Used by tests and by
    /// the supervisor after handling a configuration-override request.
    pub async fn refresh_env_layer(&self) {
        self.layers.write().await.env = env_layer();
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }

    async fn save_global(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.global.clone();
        write_json_file(&self.global_path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    atomic_write(path, &serde_json::to_string_pretty(value)?).await
}

async fn read_json_file(path: &Path) -> Value {
    if !path.exists() {
        return empty_object();
    }
    match fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()),
        Err(_) => empty_object(),
    }
}

fn resolve_global_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("AGENT_HUB_GLOBAL_CONFIG") {
        return PathBuf::from(path);
    }
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("agent-hub").join("config.json");
    }
    PathBuf::from(".agent-hub/global_config.json")
}

/// Builds the environment configuration layer from the `UAS_*` /
/// `AGENT_HUB_*` variables named in the external interfaces section.
fn env_layer() -> Value {
    let mut root = empty_object();

    set_bool_env(&mut root, "bus.sqlite_enabled", "UAS_SQLITE_BUS");
    set_bool_env(&mut root, "polling.adaptive", "UAS_ADAPTIVE_POLL");
    set_bool_env(&mut root, "router.litellm_routing", "UAS_LITELLM_ROUTING");
    set_bool_env(&mut root, "tool_surface.persistent_mcp", "UAS_PERSISTENT_MCP");
    set_bool_env(&mut root, "degradation.ollama_http", "UAS_OLLAMA_HTTP");

    set_f64_env(&mut root, "budget.session_limit_usd", "UAS_SESSION_BUDGET");
    set_f64_env(&mut root, "budget.daily_limit_usd", "UAS_DAILY_BUDGET");
    set_bool_env(&mut root, "budget.disable_check", "UAS_DISABLE_BUDGET_CHECK");

    set_u32_env(&mut root, "breaker.router_failure_limit", "UAS_ROUTER_FAILURE_LIMIT");
    set_u32_env(&mut root, "breaker.sqlite_failure_limit", "UAS_SQLITE_FAILURE_LIMIT");
    set_u32_env(&mut root, "breaker.ollama_failure_limit", "UAS_OLLAMA_FAILURE_LIMIT");

    set_u32_env(&mut root, "router.cooldown_seconds", "UAS_COOLDOWN_SECONDS");
    set_u32_env(&mut root, "router.allowed_fails", "UAS_ALLOWED_FAILS");

    if let Ok(url) = std::env::var("OLLAMA_BASE_URL") {
        deep_merge(&mut root, &json!({ "degradation": { "ollama_base_url": url } }));
    }
    set_f64_env(&mut root, "degradation.health_check_timeout_seconds", "UAS_HEALTH_CHECK_TIMEOUT");

    set_bool_env(&mut root, "dry_run", "AGENT_HUB_DRY_RUN");
    if let Ok(path) = std::env::var("UAS_HALT_FILE") {
        deep_merge(&mut root, &json!({ "halt_file_path": path }));
    }

    root
}

fn set_bool_env(root: &mut Value, dotted_key: &str, env_var: &str) {
    if let Ok(raw) = std::env::var(env_var) {
        if let Some(v) = parse_bool_like(&raw) {
            deep_merge(root, &nest(dotted_key, Value::Bool(v)));
        }
    }
}

fn set_f64_env(root: &mut Value, dotted_key: &str, env_var: &str) {
    if let Ok(raw) = std::env::var(env_var) {
        if let Ok(v) = raw.parse::<f64>() {
            deep_merge(root, &nest(dotted_key, json!(v)));
        }
    }
}

fn set_u32_env(root: &mut Value, dotted_key: &str, env_var: &str) {
    if let Ok(raw) = std::env::var(env_var) {
        if let Ok(v) = raw.parse::<u32>() {
            deep_merge(root, &nest(dotted_key, json!(v)));
        }
    }
}

fn nest(dotted_key: &str, leaf: Value) -> Value {
    let mut value = leaf;
    for segment in dotted_key.split('.').rev() {
        value = json!({ segment: value });
    }
    value
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn unique_temp_file(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("agent-hub-config-{name}-{}.json", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn env_layer_overrides_project_file_budget() {
        let project_path = unique_temp_file("project");
        fs::write(
            &project_path,
            serde_json::to_string(&json!({ "budget": { "session_limit_usd": 1.0 } })).unwrap(),
        )
        .await
        .unwrap();

        std::env::set_var("UAS_SESSION_BUDGET", "9.5");
        let store = ConfigStore::new(&project_path, None).await.unwrap();
        let effective = store.effective().await;
        assert_eq!(effective["budget"]["session_limit_usd"], json!(9.5));
        std::env::remove_var("UAS_SESSION_BUDGET");
        fs::remove_file(&project_path).await.ok();
    }

    #[tokio::test]
    async fn cli_layer_overrides_env_layer() {
        let project_path = unique_temp_file("project-cli");
        std::env::set_var("UAS_SESSION_BUDGET", "9.5");
        let store = ConfigStore::new(
            &project_path,
            Some(json!({ "budget": { "session_limit_usd": 42.0 } })),
        )
        .await
        .unwrap();
        let effective = store.effective().await;
        assert_eq!(effective["budget"]["session_limit_usd"], json!(42.0));
        std::env::remove_var("UAS_SESSION_BUDGET");
        fs::remove_file(&project_path).await.ok();
    }

    #[tokio::test]
    async fn patch_project_persists_and_merges() {
        let project_path = unique_temp_file("patch");
        let store = ConfigStore::new(&project_path, None).await.unwrap();
        store
            .patch_project(json!({ "budget": { "daily_limit_usd": 3.0 } }))
            .await
            .unwrap();
        let effective = store.effective().await;
        assert_eq!(effective["budget"]["daily_limit_usd"], json!(3.0));
        fs::remove_file(&project_path).await.ok();
    }
}
