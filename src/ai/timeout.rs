//! Timeout helpers for LLM requests and provider health checks.
//!
//! ## Usage
//!
//! ```ignore
//! use crate::ai::timeout::{TimeoutConfig, with_timeout};
//!
//! let config = TimeoutConfig::default();
//! let text = with_timeout(config.llm_request, provider.generate(..), "LLM request").await?;
//! let healthy = with_timeout(config.health_check, provider.health_check(), "health check").await;
//! ```

use std::future::Future;
use std::time::Duration;

use crate::constants::network as net_constants;
use crate::types::{LoomError, Result};

/// Timeouts for the operations that can stall a run
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Timeout for one LLM request (default: 5 minutes)
    pub llm_request: Duration,
    /// Timeout for a provider health check (default: 5 seconds)
    pub health_check: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            llm_request: Duration::from_secs(net_constants::DEFAULT_TIMEOUT_SECS),
            health_check: Duration::from_secs(net_constants::HEALTH_CHECK_TIMEOUT_SECS),
        }
    }
}

impl TimeoutConfig {
    pub fn with_llm_request_secs(mut self, secs: u64) -> Self {
        self.llm_request = Duration::from_secs(secs);
        self
    }
}

/// Execute an async operation with a timeout
///
/// Returns `LoomError::Timeout` if the operation doesn't complete within the
/// specified duration.
pub async fn with_timeout<T, F>(timeout: Duration, future: F, operation_name: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(LoomError::timeout(operation_name, timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_config_defaults() {
        let config = TimeoutConfig::default();
        assert_eq!(config.llm_request.as_secs(), 300);
        assert_eq!(config.health_check.as_secs(), 5);
        assert_eq!(
            config.with_llm_request_secs(30).llm_request,
            Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(
            Duration::from_secs(1),
            async { Ok::<_, LoomError>(42) },
            "test operation",
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result = with_timeout(
            Duration::from_millis(10),
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, LoomError>(42)
            },
            "slow operation",
        )
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, LoomError::Timeout { .. }));
        assert!(err.is_transport());
    }
}
