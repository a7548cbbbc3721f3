// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Orchestrator Configuration
//
// Defines the configuration schema for the composition orchestrator:
// - Watchdog and wait timeouts for every level of the agent hierarchy
// - Generator access limits (concurrency gate, health precondition)
// - Circuit breaker thresholds
// - Server-owned retry policy
// - Event stream liveness intervals
// - Optional model / generator endpoints used by the CLI
//
// Durations are written as humantime strings ("90s", "50ms", "10m").

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub timeouts: TimeoutConfig,
    pub generator: GeneratorConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub stream: StreamConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LLMConfig>,
    /// Run one short refinement call per section before generating.
    pub refine_section_prompts: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Watchdog around one section attempt.
    #[serde(with = "humantime_serde")]
    pub section: Duration,
    /// Watchdog around one instrument agent.
    #[serde(with = "humantime_serde")]
    pub instrument: Duration,
    #[serde(with = "humantime_serde")]
    pub dependency_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub generator_call: Duration,
    #[serde(with = "humantime_serde")]
    pub health_check: Duration,
    /// Bound on the coordinator's mixing plan call.
    #[serde(with = "humantime_serde")]
    pub mixing: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            section: Duration::from_secs(90),
            instrument: Duration::from_secs(600),
            dependency_wait: Duration::from_secs(60),
            generator_call: Duration::from_secs(60),
            health_check: Duration::from_secs(5),
            mixing: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Size of the counting semaphore in front of the generator.
    pub max_concurrency: usize,
    /// Abort the whole request when the pre-flight health check fails.
    pub require_healthy: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_concurrency: 2,
            require_healthy: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per section, first attempt included.
    pub max_section_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    pub max_planning_attempts: u32,
    pub max_gap_fill_calls: u32,
}

impl RetryConfig {
    /// Backoff before attempt `attempt + 1`, doubling from `base_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_backoff)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_section_attempts: 3,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(16),
            max_planning_attempts: 2,
            max_gap_fill_calls: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Idle time before a keepalive marker is emitted.
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
    /// Idle time before a warning naming the running agents is emitted.
    #[serde(with = "humantime_serde")]
    pub stall_warning: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            keepalive_interval: Duration::from_secs(15),
            stall_warning: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    pub endpoint: String,
    /// Literal key or `env:VAR_NAME`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
}

impl OrchestratorConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Discover configuration file using precedence order
    /// 1. ENSEMBLE_CONFIG_PATH environment variable
    /// 2. ./ensemble-config.yaml (working directory)
    /// 3. ~/.ensemble/config.yaml (user home)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("ENSEMBLE_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./ensemble-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".ensemble").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        let mut config = if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            Self::from_yaml_file(config_path)?
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("ENSEMBLE_GENERATOR_URL") {
            tracing::info!("Environment override: ENSEMBLE_GENERATOR_URL={}", url);
            self.generator.endpoint = Some(url);
        }

        if let Some(val) = lookup("ENSEMBLE_REQUIRE_GENERATOR") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::info!("Environment override: ENSEMBLE_REQUIRE_GENERATOR=true");
                    self.generator.require_healthy = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::info!("Environment override: ENSEMBLE_REQUIRE_GENERATOR=false");
                    self.generator.require_healthy = false;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for ENSEMBLE_REQUIRE_GENERATOR: '{}'. Expected true/false. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Some(val) = lookup("ENSEMBLE_GENERATOR_CONCURRENCY") {
            match val.parse::<usize>() {
                Ok(n) => {
                    tracing::info!("Environment override: ENSEMBLE_GENERATOR_CONCURRENCY={}", n);
                    self.generator.max_concurrency = n;
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for ENSEMBLE_GENERATOR_CONCURRENCY: '{}'. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let timeouts = [
            ("timeouts.section", self.timeouts.section),
            ("timeouts.instrument", self.timeouts.instrument),
            ("timeouts.dependency_wait", self.timeouts.dependency_wait),
            ("timeouts.generator_call", self.timeouts.generator_call),
            ("timeouts.health_check", self.timeouts.health_check),
            ("timeouts.mixing", self.timeouts.mixing),
            ("circuit_breaker.cooldown", self.circuit_breaker.cooldown),
            ("stream.poll_interval", self.stream.poll_interval),
            ("stream.keepalive_interval", self.stream.keepalive_interval),
            ("stream.stall_warning", self.stream.stall_warning),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }

        // A section watchdog that fires first drops the call before the
        // breaker hears about the timeout.
        if self.timeouts.generator_call >= self.timeouts.section {
            anyhow::bail!(
                "timeouts.generator_call ({:?}) must be shorter than timeouts.section ({:?})",
                self.timeouts.generator_call,
                self.timeouts.section
            );
        }

        if self.generator.max_concurrency == 0 {
            anyhow::bail!("generator.max_concurrency must be at least 1");
        }

        if self.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("circuit_breaker.failure_threshold must be at least 1");
        }

        if self.retry.max_section_attempts == 0 {
            anyhow::bail!("retry.max_section_attempts must be at least 1");
        }

        if self.retry.max_planning_attempts == 0 {
            anyhow::bail!("retry.max_planning_attempts must be at least 1");
        }

        if self.stream.keepalive_interval >= self.stream.stall_warning {
            anyhow::bail!(
                "stream.keepalive_interval ({:?}) must be shorter than stream.stall_warning ({:?})",
                self.stream.keepalive_interval,
                self.stream.stall_warning
            );
        }

        if let Some(llm) = &self.llm {
            if llm.endpoint.is_empty() {
                anyhow::bail!("llm.endpoint cannot be empty");
            }
            if llm.model.is_empty() {
                anyhow::bail!("llm.model cannot be empty");
            }
        }

        Ok(())
    }
}
