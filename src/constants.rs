//! Global Constants
//!
//! Centralized constants for configuration and tuning.

/// Chunk-loop driver constants
pub mod engine {
    /// Attempts per chunk before the driver gives up
    pub const DEFAULT_RETRIES: usize = 5;

    /// Subunits per chunk when the provider does not say otherwise
    pub const DEFAULT_MAX_ITEMS: usize = 32;

    /// Temperature added to a request for each failed attempt on the same chunk
    pub const RETRY_TEMPERATURE_STEP: f32 = 0.2;

    /// Upper bound for the retry temperature
    pub const MAX_RETRY_TEMPERATURE: f32 = 1.0;
}

/// Codebook consolidation constants
pub mod consolidation {
    /// Label of a code that was absorbed into another code
    pub const MERGED_LABEL: &str = "[Merged]";

    /// Seed for the shuffle applied before every stage preprocess
    pub const DEFAULT_SEED: u64 = 42;

    /// Rounds a looping refinement stage runs before it stops on its own
    pub const DEFAULT_REFINE_MAX_ROUNDS: usize = 10;

    /// Examples quoted per code in a prompt
    pub const PROMPT_EXAMPLES_PER_CODE: usize = 3;

    /// Shrink divisor for chunkified stages: each retry removes ceil(recommended / 4)
    pub const SHRINK_DIVISOR: usize = 4;
}

/// Network and provider constants
pub mod network {
    /// Default LLM request timeout (seconds)
    pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

    /// Health check timeout (seconds)
    pub const HEALTH_CHECK_TIMEOUT_SECS: u64 = 5;

    /// Transport-level retries inside a single request
    pub const DEFAULT_TRANSPORT_RETRIES: usize = 3;

    /// Base delay for exponential backoff (milliseconds)
    pub const BASE_DELAY_MS: u64 = 500;

    /// Maximum delay between retries (seconds)
    pub const MAX_DELAY_SECS: u64 = 30;

    /// Default completion token limit
    pub const DEFAULT_MAX_TOKENS: u32 = 4096;

    pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
    pub const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";
    pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.1";
    pub const DEFAULT_OLLAMA_ENDPOINT: &str = "http://localhost:11434";
}
