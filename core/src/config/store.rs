//! Configuration Store
//!
//! Loads and saves the host's TOML configuration and resolves the active
//! profile.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{HostError, Result};
use crate::handler::{BreakerConfig, HandlerSettings};
use crate::retry::RetryConfig;

pub const PROFILE_ENV: &str = "NODEHOST_PROFILE";
pub const MAX_WORKERS_ENV: &str = "NODEHOST_MAX_WORKERS";

/// Unified host configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub breaker: BreakerSection,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Base settings per handler type, passed to `Handler::initialize`
    #[serde(default)]
    pub handlers: BTreeMap<String, HandlerSettings>,

    /// Named deployment profiles
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,
}

/// Runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker pool bound; `None` is unbounded
    pub max_workers: Option<usize>,

    /// Directory scanned for `*.yaml` / `*.yml` contracts
    pub contracts_dir: Option<PathBuf>,

    /// Active profile name
    pub profile: Option<String>,

    /// Require every contract to declare its fingerprint
    pub strict_fingerprints: bool,

    /// Number of processed envelope ids remembered for redelivery dedup
    pub dedup_capacity: usize,

    /// Budget for effect intents routed by the host
    pub intent_timeout_ms: u64,

    /// Capacity of the telemetry broadcast channel
    pub telemetry_capacity: usize,

    /// Host-level redelivery of failed envelopes
    pub envelope_retry: RetryConfig,

    /// Subscribe and start steps of boot
    pub boot_retry: RetryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_workers: Some(1),
            contracts_dir: None,
            profile: None,
            strict_fingerprints: false,
            dedup_capacity: 10_000,
            intent_timeout_ms: 30_000,
            telemetry_capacity: 1024,
            envelope_retry: RetryConfig::default(),
            boot_retry: RetryConfig {
                max_retries: 5,
                base_delay_ms: 200,
                max_delay_ms: 5_000,
                exponential_base: 2.0,
            },
        }
    }
}

/// Breaker defaults plus per-handler overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerSection {
    #[serde(flatten)]
    pub defaults: BreakerConfig,

    #[serde(default)]
    pub overrides: BTreeMap<String, BreakerConfig>,
}

impl BreakerSection {
    pub fn for_handler(&self, handler_type: &str) -> BreakerConfig {
        self.overrides
            .get(handler_type)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }
}

/// Orchestrator budgets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub default_step_timeout_ms: u64,
    pub default_workflow_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_ms: 30_000,
            default_workflow_timeout_ms: 300_000,
        }
    }
}

/// A named set of nodes plus handler setting overrides
///
/// Profiles choose which nodes run and how handlers are configured. They
/// never change what a contract requires.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Explicit node ids
    pub nodes: Vec<String>,

    /// Nodes whose contract carries any of these profile tags
    pub tags: Vec<String>,

    /// Per-handler settings merged over `[handlers.<type>]`
    pub handlers: BTreeMap<String, HandlerSettings>,
}

impl ProfileConfig {
    /// Whether the profile selects every node
    pub fn selects_all(&self) -> bool {
        self.nodes.is_empty() && self.tags.is_empty()
    }

    pub fn selects(&self, node_id: &str, profile_tags: &[String]) -> bool {
        self.selects_all()
            || self.nodes.iter().any(|n| n == node_id)
            || profile_tags.iter().any(|t| self.tags.contains(t))
    }
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(HostError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;

        // Relative contract dirs resolve against the config file
        if let (Some(dir), Some(parent)) = (config.runtime.contracts_dir.as_ref(), path.parent()) {
            if dir.is_relative() {
                config.runtime.contracts_dir = Some(parent.join(dir));
            }
        }
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: HostConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load from the discovered location or fall back to defaults
    pub fn load_or_default() -> Result<Self> {
        match super::find_config_file() {
            Some(path) => {
                tracing::info!(path = %path.display(), "loading host configuration");
                Self::load(path)
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply `NODEHOST_PROFILE` and `NODEHOST_MAX_WORKERS`
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(
            std::env::var(PROFILE_ENV).ok(),
            std::env::var(MAX_WORKERS_ENV).ok(),
        )
    }

    fn apply_overrides(&mut self, profile: Option<String>, max_workers: Option<String>) -> Result<()> {
        if let Some(profile) = profile.filter(|p| !p.is_empty()) {
            self.runtime.profile = Some(profile);
        }
        if let Some(raw) = max_workers {
            self.runtime.max_workers = match raw.trim() {
                "" | "unbounded" | "none" => None,
                n => Some(n.parse().map_err(|_| HostError::InvalidConfig {
                    message: format!("{} must be a positive integer or 'unbounded', got '{}'", MAX_WORKERS_ENV, raw),
                })?),
            };
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(HostError::InvalidConfig { message });

        if self.runtime.max_workers == Some(0) {
            return invalid("runtime.max_workers must be at least 1 (omit it for unbounded)".to_string());
        }
        if self.runtime.dedup_capacity == 0 {
            return invalid("runtime.dedup_capacity must be at least 1".to_string());
        }
        for (name, breaker) in std::iter::once(("defaults", &self.breaker.defaults))
            .chain(self.breaker.overrides.iter().map(|(k, v)| (k.as_str(), v)))
        {
            if breaker.failure_threshold == 0 || breaker.half_open_max_calls == 0 {
                return invalid(format!(
                    "breaker {}: failure_threshold and half_open_max_calls must be at least 1",
                    name
                ));
            }
        }
        if self.orchestrator.default_step_timeout_ms == 0 || self.orchestrator.default_workflow_timeout_ms == 0 {
            return invalid("orchestrator timeouts must be non-zero".to_string());
        }
        if let Some(profile) = &self.runtime.profile {
            if !self.profiles.contains_key(profile) {
                return Err(HostError::ProfileNotFound {
                    profile: profile.clone(),
                });
            }
        }
        Ok(())
    }

    /// The active profile, if one is selected
    pub fn active_profile(&self) -> Result<Option<&ProfileConfig>> {
        match &self.runtime.profile {
            None => Ok(None),
            Some(name) => self
                .profiles
                .get(name)
                .map(Some)
                .ok_or_else(|| HostError::ProfileNotFound { profile: name.clone() }),
        }
    }

    /// Settings for one handler: base section overlaid with the active profile
    pub fn handler_settings(&self, handler_type: &str) -> HandlerSettings {
        let mut settings = self.handlers.get(handler_type).cloned().unwrap_or_default();
        if let Ok(Some(profile)) = self.active_profile() {
            if let Some(overrides) = profile.handlers.get(handler_type) {
                for (key, value) in overrides {
                    settings.insert(key.clone(), value.clone());
                }
            }
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"
[runtime]
max_workers = 4
contracts_dir = "contracts"
profile = "dev"

[runtime.envelope_retry]
max_retries = 2

[breaker]
failure_threshold = 3
recovery_timeout_ms = 1000

[breaker.overrides.vector_store]
failure_threshold = 10

[orchestrator]
default_step_timeout_ms = 500

[handlers.message_producer]
default_topic = "events"
acks = "all"

[profiles.dev]
nodes = ["ingestion_reducer"]
tags = ["ingest"]

[profiles.dev.handlers.message_producer]
acks = "none"
"#;

    #[test]
    fn test_parse_sections() {
        let config = HostConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.runtime.max_workers, Some(4));
        assert_eq!(config.runtime.envelope_retry.max_retries, 2);
        assert_eq!(config.runtime.envelope_retry.base_delay_ms, 100);
        assert_eq!(config.breaker.defaults.failure_threshold, 3);
        assert_eq!(config.breaker.defaults.half_open_max_calls, 1);
        assert_eq!(config.breaker.for_handler("vector_store").failure_threshold, 10);
        assert_eq!(config.breaker.for_handler("cache").failure_threshold, 3);
        assert_eq!(config.orchestrator.default_step_timeout_ms, 500);
        assert_eq!(config.orchestrator.default_workflow_timeout_ms, 300_000);
    }

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.runtime.max_workers, Some(1));
        assert!(config.active_profile().unwrap().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_profile_handler_overrides() {
        let config = HostConfig::from_toml_str(SAMPLE).unwrap();
        let settings = config.handler_settings("message_producer");
        assert_eq!(settings.get("default_topic"), Some(&json!("events")));
        assert_eq!(settings.get("acks"), Some(&json!("none")));

        let profile = config.active_profile().unwrap().unwrap();
        assert!(profile.selects("ingestion_reducer", &[]));
        assert!(profile.selects("document_parser_compute", &["ingest".to_string()]));
        assert!(!profile.selects("quality_reducer", &["quality".to_string()]));
    }

    #[test]
    fn test_unknown_profile_rejected() {
        let err = HostConfig::from_toml_str("[runtime]\nprofile = \"prod\"\n").unwrap_err();
        assert!(matches!(err, HostError::ProfileNotFound { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = HostConfig::from_toml_str(SAMPLE).unwrap();
        config.apply_overrides(None, Some("unbounded".to_string())).unwrap();
        assert_eq!(config.runtime.max_workers, None);
        config.apply_overrides(None, Some("8".to_string())).unwrap();
        assert_eq!(config.runtime.max_workers, Some(8));
        assert!(config.apply_overrides(None, Some("0".to_string())).is_err());
        assert!(config.apply_overrides(None, Some("many".to_string())).is_err());
        assert!(matches!(
            config.apply_overrides(Some("staging".to_string()), None),
            Err(HostError::ProfileNotFound { .. })
        ));
    }

    #[test]
    fn test_invalid_breaker_rejected() {
        let err = HostConfig::from_toml_str("[breaker]\nfailure_threshold = 0\n").unwrap_err();
        assert!(matches!(err, HostError::InvalidConfig { .. }));
    }

    #[test]
    fn test_load_resolves_contracts_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodehost.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = HostConfig::load(&path).unwrap();
        assert_eq!(config.runtime.contracts_dir, Some(dir.path().join("contracts")));

        let saved = dir.path().join("out").join("nodehost.toml");
        config.save(&saved).unwrap();
        assert_eq!(HostConfig::load(&saved).unwrap().runtime.max_workers, Some(4));
    }
}
