use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub drift: DriftConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderConfig {
    pub id: String,
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Per-call timeout in seconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Retries for retryable provider failures.
    #[serde(default = "default_retries")]
    pub max_retries: u32,
    /// USD-equivalent per 1k tokens, used only for the cost stop condition.
    #[serde(default = "default_usd_per_1k")]
    pub usd_per_1k_tokens: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DefaultsConfig {
    /// Workspace the operator delegates against, unless given per session.
    pub workspace: Option<PathBuf>,
    /// Default auth method for new roles: "pin" | "totp".
    #[serde(default = "default_auth_method")]
    pub auth_method: String,
    #[serde(default = "default_max_hours")]
    pub max_session_hours: f64,
    #[serde(default = "default_max_cost")]
    pub max_cost_per_session: f64,
    /// Sandbox backend: "shadow" (local directory) is the only built-in.
    #[serde(default = "default_sandbox_mode")]
    pub sandbox_mode: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GuardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GateConfig {
    /// Block promotion on any non-allowlisted secret finding.
    #[serde(default = "default_true")]
    pub block_on_any_finding: bool,
    /// Secret-scanner allowlist (pattern names and file globs).
    #[serde(default)]
    pub allowlist: crate::secrets::SecretAllowlist,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DriftConfig {
    /// Seconds between workspace re-fingerprints while a session runs.
    #[serde(default = "default_drift_interval")]
    pub poll_interval_secs: u64,
    /// Files at or under this size get a content hash in the baseline.
    #[serde(default = "default_hash_threshold")]
    pub hash_threshold_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CheckpointConfig {
    /// Checkpoint after every N completed tasks.
    #[serde(default = "default_checkpoint_interval")]
    pub interval_tasks: usize,
    /// Keep at least this many recent checkpoints when pruning.
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
}

fn default_call_timeout() -> u64 {
    120
}
fn default_retries() -> u32 {
    3
}
fn default_usd_per_1k() -> f64 {
    0.01
}
fn default_auth_method() -> String {
    "pin".to_string()
}
fn default_max_hours() -> f64 {
    8.0
}
fn default_max_cost() -> f64 {
    5.0
}
fn default_sandbox_mode() -> String {
    "shadow".to_string()
}
fn default_true() -> bool {
    true
}
fn default_drift_interval() -> u64 {
    60
}
fn default_hash_threshold() -> u64 {
    1024 * 1024
}
fn default_checkpoint_interval() -> usize {
    3
}
fn default_keep_last() -> usize {
    5
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            url: "http://127.0.0.1:11434/v1".to_string(),
            model: "qwen3-coder".to_string(),
            api_key: None,
            call_timeout_secs: default_call_timeout(),
            max_retries: default_retries(),
            usd_per_1k_tokens: default_usd_per_1k(),
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            workspace: None,
            auth_method: default_auth_method(),
            max_session_hours: default_max_hours(),
            max_cost_per_session: default_max_cost(),
            sandbox_mode: default_sandbox_mode(),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            block_on_any_finding: true,
            allowlist: crate::secrets::SecretAllowlist::default(),
        }
    }
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_drift_interval(),
            hash_threshold_bytes: default_hash_threshold(),
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_tasks: default_checkpoint_interval(),
            keep_last: default_keep_last(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            defaults: DefaultsConfig::default(),
            guard: GuardConfig::default(),
            audit: AuditConfig::default(),
            gate: GateConfig::default(),
            drift: DriftConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl Config {
    /// Load `~/.ara/config.toml`, then overlay environment variables.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_file(&crate::paths::config_file())?;
        config.apply_env();
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Environment overrides. Unset or unparseable values are ignored.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ARA_WORKSPACE") {
            if !v.is_empty() {
                self.defaults.workspace = Some(PathBuf::from(v));
            }
        }
        if let Ok(v) = std::env::var("ARA_AUTH_METHOD") {
            if v == "pin" || v == "totp" {
                self.defaults.auth_method = v;
            }
        }
        if let Ok(v) = std::env::var("ARA_MAX_COST") {
            if let Ok(n) = v.parse::<f64>() {
                self.defaults.max_cost_per_session = n;
            }
        }
        if let Ok(v) = std::env::var("ARA_MAX_HOURS") {
            if let Ok(n) = v.parse::<f64>() {
                self.defaults.max_session_hours = n;
            }
        }
        if let Ok(v) = std::env::var("ARA_SANDBOX_MODE") {
            if !v.is_empty() {
                self.defaults.sandbox_mode = v;
            }
        }
        if let Ok(v) = std::env::var("ARA_PROMPT_GUARD") {
            self.guard.enabled = v != "0" && v != "false";
        }
        if let Ok(v) = std::env::var("ARA_AUDIT_LOG") {
            self.audit.enabled = v != "0" && v != "false";
        }
    }

    /// Resolve the effective provider API key.
    /// Priority: 1) TOML config api_key  2) env var ARA_API_KEY_{ID}
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.provider.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        let env_name = format!(
            "ARA_API_KEY_{}",
            self.provider.id.to_uppercase().replace('-', "_")
        );
        if let Ok(key) = std::env::var(&env_name) {
            if !key.is_empty() {
                return Some(key);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let c = Config::default();
        assert!(c.guard.enabled);
        assert!(c.audit.enabled);
        assert!(c.gate.block_on_any_finding);
        assert_eq!(c.defaults.auth_method, "pin");
        assert_eq!(c.defaults.max_session_hours, 8.0);
        assert_eq!(c.defaults.max_cost_per_session, 5.0);
    }

    #[test]
    fn load_file_missing_returns_default() {
        let c = Config::load_file(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(c.provider.id, "default");
    }

    #[test]
    fn load_file_partial_toml() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            "[defaults]\nmax_cost_per_session = 2.5\n\n[gate]\nblock_on_any_finding = false\n",
        )
        .unwrap();
        let c = Config::load_file(&path).unwrap();
        assert_eq!(c.defaults.max_cost_per_session, 2.5);
        assert!(!c.gate.block_on_any_finding);
        // untouched sections keep defaults
        assert_eq!(c.defaults.max_session_hours, 8.0);
        assert!(c.guard.enabled);
    }
}
