//! Request Collaborator
//!
//! `Requester` is the single place where the engine talks to a model:
//! - bounds each call with [`with_timeout`]
//! - retries transport failures (network, rate limit, transient, timeout) with
//!   exponential backoff; everything else is returned to the chunk loop
//! - keeps responses in memory, keyed by a SHA-256 digest of namespace,
//!   prompts and temperature
//! - records token usage in the session

use backon::{ExponentialBuilder, Retryable};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::ai::provider::SharedProvider;
use crate::ai::session::SharedSession;
use crate::ai::timeout::{TimeoutConfig, with_timeout};
use crate::constants::network;
use crate::engine::Prompts;
use crate::types::{LoomError, Result};

#[derive(Clone)]
pub struct Requester {
    provider: SharedProvider,
    session: SharedSession,
    cache: Option<Arc<DashMap<String, String>>>,
    timeout: Duration,
    transport_retries: usize,
    base_delay: Duration,
}

impl Requester {
    pub fn new(provider: SharedProvider, session: SharedSession) -> Self {
        Self {
            provider,
            session,
            cache: Some(Arc::new(DashMap::new())),
            timeout: TimeoutConfig::default().llm_request,
            transport_retries: network::DEFAULT_TRANSPORT_RETRIES,
            base_delay: Duration::from_millis(network::BASE_DELAY_MS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_transport_retries(mut self, retries: usize) -> Self {
        self.transport_retries = retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache = enabled.then(|| Arc::new(DashMap::new()));
        self
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    /// Subunits per request the provider recommends.
    pub fn max_items(&self) -> usize {
        self.provider.max_items()
    }

    pub fn cached_responses(&self) -> usize {
        self.cache.as_ref().map_or(0, |cache| cache.len())
    }

    #[instrument(skip(self, prompts), fields(provider = self.provider.name()))]
    pub async fn request(
        &self,
        prompts: &Prompts,
        namespace: &str,
        temperature: f32,
    ) -> Result<String> {
        let key = cache_key(namespace, prompts, temperature);

        if let Some(cache) = &self.cache
            && let Some(hit) = cache.get(&key)
        {
            debug!("Response served from cache");
            self.session.record_cache_hit();
            return Ok(hit.value().clone());
        }

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(Duration::from_secs(network::MAX_DELAY_SECS))
            .with_max_times(self.transport_retries)
            .with_jitter();

        let response = (|| async {
            with_timeout(
                self.timeout,
                self.provider
                    .generate(&prompts.system, &prompts.user, temperature),
                "LLM request",
            )
            .await
        })
        .retry(backoff)
        .when(LoomError::is_transport)
        .notify(|err: &LoomError, delay: Duration| {
            warn!(
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "Transport failure, retrying request"
            );
        })
        .await?;

        self.session.record_response(&response);

        if let Some(cache) = &self.cache {
            cache.insert(key, response.content.clone());
        }

        Ok(response.content)
    }
}

fn cache_key(namespace: &str, prompts: &Prompts, temperature: f32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([0u8]);
    hasher.update(prompts.system.as_bytes());
    hasher.update([0u8]);
    hasher.update(prompts.user.as_bytes());
    hasher.update([0u8]);
    hasher.update(temperature.to_bits().to_le_bytes());
    format!("{:x}", hasher.finalize())
}
