pub mod code;
pub mod error;

pub use code::{Code, Codebook, normalize_label};
pub use error::{ErrorCategory, ErrorClassifier, LlmError, LoomError, Result};
