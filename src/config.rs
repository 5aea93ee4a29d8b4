//! Configuration for Tracegate
//!
//! Loaded from `config.toml` (every section optional), with environment
//! overrides for the model endpoint. Defaults match the tuned values of the
//! streaming pipeline: 35..90 tokens per chunk, 15s silence, 40s max wait.

use crate::{Result, TracegateError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Default LLM endpoint (local OpenAI-compatible server)
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:1234/v1";

/// Default model used for both oracles unless overridden
const DEFAULT_MODEL: &str = "qwen/qwen3-4b";

/// Token gate thresholds and timers
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GateConfig {
    /// Minimum accumulated tokens before a boundary cue may flush
    pub min_tokens: usize,
    /// Hard cap: reaching this many tokens always flushes
    pub max_tokens: usize,
    /// Characters that mark a segment boundary
    pub boundary_cues: String,
    /// Seconds without a new token before the buffer is flushed
    pub silence_timer_secs: f64,
    /// Seconds since the first buffered token before a forced flush
    pub max_wait_timeout_secs: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_tokens: 35,
            max_tokens: 90,
            boundary_cues: ".?!\n".to_string(),
            silence_timer_secs: 15.0,
            max_wait_timeout_secs: 40.0,
        }
    }
}

impl GateConfig {
    /// Only meaningful once [`GateConfig::validate`] has accepted the value.
    pub fn silence_timer(&self) -> Duration {
        Duration::try_from_secs_f64(self.silence_timer_secs).unwrap_or_default()
    }

    pub fn max_wait_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.max_wait_timeout_secs).unwrap_or_default()
    }

    pub fn with_thresholds(mut self, min_tokens: usize, max_tokens: usize) -> Self {
        self.min_tokens = min_tokens;
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_boundary_cues(mut self, cues: impl Into<String>) -> Self {
        self.boundary_cues = cues.into();
        self
    }

    pub fn with_timers(mut self, silence: Duration, max_wait: Duration) -> Self {
        self.silence_timer_secs = silence.as_secs_f64();
        self.max_wait_timeout_secs = max_wait.as_secs_f64();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(TracegateError::Config(
                "gate.max_tokens must be at least 1".to_string(),
            ));
        }
        if self.min_tokens > self.max_tokens {
            return Err(TracegateError::Config(format!(
                "gate.min_tokens ({}) exceeds gate.max_tokens ({})",
                self.min_tokens, self.max_tokens
            )));
        }
        for (name, secs) in [
            ("silence_timer_secs", self.silence_timer_secs),
            ("max_wait_timeout_secs", self.max_wait_timeout_secs),
        ] {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(TracegateError::Config(format!(
                    "gate.{name} must be a positive number of seconds, got {secs}"
                )));
            }
            if let Err(e) = Duration::try_from_secs_f64(secs) {
                return Err(TracegateError::Config(format!(
                    "gate.{name} is out of range ({secs}): {e}"
                )));
            }
        }
        Ok(())
    }
}

/// Trace accumulator behavior
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AccumulatorConfig {
    /// Report a flush for the first trace into a cold buffer without asking
    /// the decision oracle
    pub always_flush_first: bool,
    /// Per-producer trace log cap (oldest entries are dropped)
    pub max_traces_per_producer: usize,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            always_flush_first: false,
            max_traces_per_producer: 256,
        }
    }
}

/// Coordinator timers and failure policy
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Period of the background gate timer check
    pub timer_tick_ms: u64,
    /// Producers idle for longer than this are evicted from the gate and
    /// the accumulator's bookkeeping
    pub producer_ttl_secs: u64,
    /// Put a flushed batch back into the buffer when summarization fails
    pub retain_failed_batches: bool,
    /// Capacity of the summary broadcast channel
    pub broadcast_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            timer_tick_ms: 500,
            producer_ttl_secs: 3600,
            retain_failed_batches: true,
            broadcast_capacity: 64,
        }
    }
}

impl CoordinatorConfig {
    pub fn timer_tick(&self) -> Duration {
        Duration::from_millis(self.timer_tick_ms.max(1))
    }

    pub fn producer_ttl(&self) -> Duration {
        Duration::from_secs(self.producer_ttl_secs)
    }
}

/// OpenAI-compatible endpoint used by the LLM oracles
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    /// Optional smaller model for the YES/NO flush decision
    pub decision_model: Option<String>,
    /// Environment variable holding the API key (unset means no auth header)
    pub api_key_env: String,
    pub request_timeout_secs: u64,
    pub max_retry_attempts: u32,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            decision_model: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_secs: 60,
            max_retry_attempts: 4,
            temperature: 0.1,
            max_tokens: 2048,
        }
    }
}

impl LlmConfig {
    /// Model for the decision oracle (falls back to the main model)
    pub fn decision_model(&self) -> &str {
        self.decision_model.as_deref().unwrap_or(&self.model)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TracegateConfig {
    pub gate: GateConfig,
    pub accumulator: AccumulatorConfig,
    pub coordinator: CoordinatorConfig,
    pub llm: LlmConfig,
}

impl TracegateConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the defaults. Environment overrides
    /// (`TRACEGATE_MODEL`, `TRACEGATE_BASE_URL`) are applied afterwards and
    /// the result is validated.
    pub async fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config = Self::from_toml_str(&content)?;
            info!("Loaded config from {:?}", path);
            config
        } else {
            debug!("No config file at {:?}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text (no env overrides, no validation)
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str::<Self>(content)?)
    }

    /// Default config file location: `$TRACEGATE_HOME/config.toml`, else
    /// `~/.tracegate/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(home) = std::env::var("TRACEGATE_HOME") {
            return Some(PathBuf::from(home).join("config.toml"));
        }
        dirs::home_dir().map(|home| home.join(".tracegate").join("config.toml"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("TRACEGATE_MODEL") {
            if !model.trim().is_empty() {
                self.llm.model = model.trim().to_string();
            }
        }
        if let Ok(base_url) = std::env::var("TRACEGATE_BASE_URL") {
            if !base_url.trim().is_empty() {
                self.llm.base_url = base_url.trim().to_string();
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.gate.validate()?;
        if self.coordinator.broadcast_capacity == 0 {
            return Err(TracegateError::Config(
                "coordinator.broadcast_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_gate(mut self, gate: GateConfig) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_always_flush_first(mut self, always: bool) -> Self {
        self.accumulator.always_flush_first = always;
        self
    }

    pub fn with_retain_failed_batches(mut self, retain: bool) -> Self {
        self.coordinator.retain_failed_batches = retain;
        self
    }

    pub fn with_llm(mut self, llm: LlmConfig) -> Self {
        self.llm = llm;
        self
    }
}
