//! AI Integration Layer
//!
//! Provider backends, the request collaborator used by the chunk loop, and the
//! per-run session counters.

pub mod provider;
pub mod request;
pub mod session;
pub mod timeout;

pub use provider::{
    LlmProvider, LlmResponse, OllamaProvider, OpenAiProvider, ProviderConfig, ResponseMetadata,
    ResponseTiming, SharedProvider, TokenUsage, create_provider,
};
pub use request::Requester;
pub use session::{Session, SessionSummary, SharedSession, create_shared_session};
pub use timeout::{TimeoutConfig, with_timeout};
