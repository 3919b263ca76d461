use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audit::AuditSink;
use crate::orchestrator::{Orchestrator, StaticTokenAuthenticator};
use crate::quota::{
    DEFAULT_DAILY_LIMIT, DEFAULT_MONTHLY_LIMIT, QuotaGate, QuotaLimits, QuotaPolicy, QuotaStore,
};
use crate::workflow::{RetryPolicy, WorkflowClient, WorkflowClientConfig};
use crate::{FlowgateError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlowgateConfig {
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    /// When set, only these workflow ids may be executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflows: Option<Vec<String>>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_key_env", &self.api_key_env)
            .field("timeout_secs", &self.timeout_secs)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .field("stream_timeout_secs", &self.stream_timeout_secs)
            .finish()
    }
}

impl UpstreamConfig {
    /// The inline key wins over `api_key_env`.
    pub fn resolve_api_key(&self) -> Result<String> {
        if let Some(key) = self.api_key.as_deref().filter(|key| !key.trim().is_empty()) {
            return Ok(key.to_string());
        }
        let Some(env) = self.api_key_env.as_deref() else {
            return Err(FlowgateError::Config(
                "upstream needs api_key or api_key_env".to_string(),
            ));
        };
        match std::env::var(env) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(FlowgateError::Config(format!(
                "environment variable {env} is not set"
            ))),
        }
    }

    pub fn client_config(&self) -> Result<WorkflowClientConfig> {
        let mut config = WorkflowClientConfig::new(self.base_url.clone(), self.resolve_api_key()?);
        config.timeout = Duration::from_secs(self.timeout_secs);
        config.poll_timeout = Duration::from_secs(self.poll_timeout_secs);
        config.stream_timeout = Duration::from_secs(self.stream_timeout_secs);
        Ok(config)
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_poll_timeout_secs() -> u64 {
    10
}

fn default_stream_timeout_secs() -> u64 {
    300
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: None,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(self.max_retries, Duration::from_millis(self.base_delay_ms));
        match self.max_delay_ms {
            Some(max_delay_ms) => policy.with_max_delay(Duration::from_millis(max_delay_ms)),
            None => policy,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u64,
    #[serde(default = "default_monthly_limit")]
    pub monthly_limit: u64,
    #[serde(default = "default_reservation_ttl_secs")]
    pub reservation_ttl_secs: u64,
    #[serde(default)]
    pub workflows: BTreeMap<String, WorkflowQuotaConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkflowQuotaConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_limit: Option<u64>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            monthly_limit: default_monthly_limit(),
            reservation_ttl_secs: default_reservation_ttl_secs(),
            workflows: BTreeMap::new(),
        }
    }
}

impl QuotaConfig {
    pub fn default_limits(&self) -> QuotaLimits {
        QuotaLimits {
            daily: self.daily_limit,
            monthly: self.monthly_limit,
        }
    }

    pub fn policy(&self) -> QuotaPolicy {
        let defaults = self.default_limits();
        self.workflows
            .iter()
            .fold(QuotaPolicy::new(defaults), |policy, (workflow_id, overrides)| {
                policy.with_workflow_limits(
                    workflow_id.clone(),
                    QuotaLimits {
                        daily: overrides.daily_limit.unwrap_or(defaults.daily),
                        monthly: overrides.monthly_limit.unwrap_or(defaults.monthly),
                    },
                )
            })
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }
}

fn default_daily_limit() -> u64 {
    DEFAULT_DAILY_LIMIT
}

fn default_monthly_limit() -> u64 {
    DEFAULT_MONTHLY_LIMIT
}

fn default_reservation_ttl_secs() -> u64 {
    600
}

#[derive(Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub id: String,
    pub token: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl std::fmt::Debug for UserConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserConfig")
            .field("id", &self.id)
            .field("token", &"<redacted>")
            .field("enabled", &self.enabled)
            .finish()
    }
}

fn default_enabled() -> bool {
    true
}

impl FlowgateConfig {
    /// Picks the format from the extension: `.toml`, `.yaml`/`.yml` (feature
    /// `config-yaml`), anything else is JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let config = match extension.as_deref() {
            Some("toml") => Self::from_toml_str(&raw)?,
            Some("yaml" | "yml") => Self::from_yaml_str(&raw)?,
            _ => Self::from_json_str(&raw)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    #[cfg(feature = "config-yaml")]
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    #[cfg(not(feature = "config-yaml"))]
    pub fn from_yaml_str(_raw: &str) -> Result<Self> {
        Err(FlowgateError::Config(
            "yaml config requires `--features config-yaml`".to_string(),
        ))
    }

    pub fn validate(&self) -> Result<()> {
        let base_url = self.upstream.base_url.trim();
        if base_url.is_empty() {
            return Err(FlowgateError::Config("upstream.base_url is empty".to_string()));
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(FlowgateError::Config(format!(
                "upstream.base_url must be http(s): {base_url}"
            )));
        }
        if self.quota.daily_limit == 0 || self.quota.monthly_limit == 0 {
            return Err(FlowgateError::Config("quota limits must be positive".to_string()));
        }
        for (workflow_id, overrides) in &self.quota.workflows {
            if overrides.daily_limit == Some(0) || overrides.monthly_limit == Some(0) {
                return Err(FlowgateError::Config(format!(
                    "quota limits for workflow {workflow_id} must be positive"
                )));
            }
        }

        let blocking = self
            .retry
            .policy()
            .worst_case_duration(Duration::from_secs(self.upstream.timeout_secs));
        let longest_run = blocking.max(Duration::from_secs(self.upstream.stream_timeout_secs));
        if self.quota.reservation_ttl() <= longest_run {
            return Err(FlowgateError::Config(format!(
                "quota.reservation_ttl_secs ({}) must exceed the longest run ({}s)",
                self.quota.reservation_ttl_secs,
                longest_run.as_secs()
            )));
        }

        let mut ids = HashSet::new();
        let mut tokens = HashSet::new();
        for user in &self.users {
            if user.id.trim().is_empty() {
                return Err(FlowgateError::Config("user id is empty".to_string()));
            }
            if user.token.trim().is_empty() {
                return Err(FlowgateError::Config(format!(
                    "user {} has an empty token",
                    user.id
                )));
            }
            if !ids.insert(user.id.as_str()) {
                return Err(FlowgateError::Config(format!("duplicate user id: {}", user.id)));
            }
            if !tokens.insert(user.token.as_str()) {
                return Err(FlowgateError::Config(format!(
                    "user {} reuses another user's token",
                    user.id
                )));
            }
        }

        if let Some(workflows) = &self.workflows {
            for workflow_id in workflows {
                if !crate::orchestrator::is_valid_workflow_id(workflow_id) {
                    return Err(FlowgateError::Config(format!(
                        "invalid workflow id in allow-list: {workflow_id:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Wires the upstream client, quota gate and token table around the given
    /// stores.
    pub fn build_orchestrator(
        &self,
        quota_store: Arc<dyn QuotaStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Orchestrator> {
        let client = WorkflowClient::new(self.upstream.client_config()?)?
            .with_retry_policy(self.retry.policy());
        let gate = QuotaGate::new(quota_store, self.quota.policy());
        let authenticator = StaticTokenAuthenticator::from_users(&self.users);
        let orchestrator =
            Orchestrator::new(Arc::new(authenticator), gate, audit, Arc::new(client));
        Ok(match &self.workflows {
            Some(workflows) => orchestrator.with_workflow_allow_list(workflows.iter().cloned()),
            None => orchestrator,
        })
    }
}
