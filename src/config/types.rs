//! Configuration Types
//!
//! All configuration structures with sensible defaults.

use serde::{Deserialize, Serialize};

use crate::constants::{consolidation, engine, network};
use crate::types::{LoomError, Result};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration version
    pub version: String,

    /// LLM provider settings
    pub llm: LlmConfig,

    /// Chunk-loop driver settings
    pub engine: EngineConfig,

    /// Codebook consolidation settings
    pub consolidation: ConsolidationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            llm: LlmConfig::default(),
            engine: EngineConfig::default(),
            consolidation: ConsolidationConfig::default(),
        }
    }
}

impl Config {
    /// Validate configuration values are within acceptable ranges.
    /// Returns `LoomError::Config` on validation failure.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(LoomError::Config(format!(
                "LLM temperature must be between 0.0 and 2.0, got {}",
                self.llm.temperature
            )));
        }

        if self.llm.timeout_secs == 0 {
            return Err(LoomError::Config(
                "LLM timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.llm.max_items == 0 {
            return Err(LoomError::Config(
                "LLM max_items must be greater than 0".to_string(),
            ));
        }

        if self.engine.retries == 0 {
            return Err(LoomError::Config(
                "Engine retries must be greater than 0".to_string(),
            ));
        }

        if self.consolidation.refine_max_rounds == 0 {
            return Err(LoomError::Config(
                "Consolidation refine_max_rounds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

// =============================================================================
// LLM Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name (`openai` or `ollama`)
    pub provider: String,

    /// Model name; the provider's default when unset
    pub model: Option<String>,

    /// API base URL or Ollama endpoint
    pub api_base: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Base temperature; stages may override it
    pub temperature: f32,

    /// Maximum subunits the model handles in one request
    pub max_items: usize,

    /// Completion token limit
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: None,
            api_base: None,
            timeout_secs: network::DEFAULT_TIMEOUT_SECS,
            temperature: 0.0,
            max_items: engine::DEFAULT_MAX_ITEMS,
            max_tokens: network::DEFAULT_MAX_TOKENS,
        }
    }
}

// =============================================================================
// Engine Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts per chunk
    pub retries: usize,

    /// Transport-level retries per request
    pub transport_retries: usize,

    /// Keep responses in memory for identical requests
    pub cache_responses: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retries: engine::DEFAULT_RETRIES,
            transport_retries: network::DEFAULT_TRANSPORT_RETRIES,
            cache_responses: true,
        }
    }
}

// =============================================================================
// Consolidation Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Shuffle seed applied before each stage
    pub seed: u64,

    /// Rounds before the refinement stage stops on its own
    pub refine_max_rounds: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            seed: consolidation::DEFAULT_SEED,
            refine_max_rounds: consolidation::DEFAULT_REFINE_MAX_ROUNDS,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
