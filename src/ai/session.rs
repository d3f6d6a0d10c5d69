//! Session Counters
//!
//! Progress and usage counters for one top-level unit of work. The chunk loop
//! charges expected/finished items for every attempt; the requester records
//! tokens and calls. All counters are atomic so both sides update them through
//! a shared reference.
//!
//! ## Usage
//!
//! ```ignore
//! let session = create_shared_session();
//! session.add_expected(4);
//! session.add_finished(4);
//! println!("{}", session.snapshot().display());
//! ```

use crate::ai::provider::LlmResponse;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

// =============================================================================
// Session
// =============================================================================

pub struct Session {
    /// Session identifier (UUID v4)
    id: String,
    started_at: DateTime<Utc>,
    start_time: Instant,
    /// Subunits handed to chunk attempts
    expected_items: AtomicU64,
    /// Subunits reported as done, including charged failures
    finished_items: AtomicU64,
    /// Chunk attempts that did not advance the cursor
    failed_attempts: AtomicU64,
    api_calls: AtomicU32,
    cache_hits: AtomicU32,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    total_latency_ms: AtomicU64,
}

/// Point-in-time copy of the session counters
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub expected_items: u64,
    pub finished_items: u64,
    pub failed_attempts: u64,
    pub api_calls: u32,
    pub cache_hits: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub avg_latency_ms: f64,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            started_at: Utc::now(),
            start_time: Instant::now(),
            expected_items: AtomicU64::new(0),
            finished_items: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
            api_calls: AtomicU32::new(0),
            cache_hits: AtomicU32::new(0),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn add_expected(&self, items: usize) {
        self.expected_items
            .fetch_add(items as u64, Ordering::Relaxed);
    }

    pub fn add_finished(&self, items: usize) {
        self.finished_items
            .fetch_add(items as u64, Ordering::Relaxed);
    }

    pub fn record_failed_attempt(&self) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record usage from an LLM response
    pub fn record_response(&self, response: &LlmResponse) {
        self.api_calls.fetch_add(1, Ordering::Relaxed);
        self.input_tokens
            .fetch_add(response.usage.input_tokens as u64, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(response.usage.output_tokens as u64, Ordering::Relaxed);
        self.total_latency_ms
            .fetch_add(response.timing.total_ms, Ordering::Relaxed);
    }

    pub fn expected_items(&self) -> u64 {
        self.expected_items.load(Ordering::Relaxed)
    }

    pub fn finished_items(&self) -> u64 {
        self.finished_items.load(Ordering::Relaxed)
    }

    /// Get current counters snapshot
    pub fn snapshot(&self) -> SessionSummary {
        let api_calls = self.api_calls.load(Ordering::Relaxed);
        let input_tokens = self.input_tokens.load(Ordering::Relaxed);
        let output_tokens = self.output_tokens.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);

        let avg_latency = if api_calls > 0 {
            total_latency as f64 / api_calls as f64
        } else {
            0.0
        };

        SessionSummary {
            session_id: self.id.clone(),
            started_at: self.started_at,
            total_duration_ms: self.start_time.elapsed().as_millis() as u64,
            expected_items: self.expected_items(),
            finished_items: self.finished_items(),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            api_calls,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            avg_latency_ms: avg_latency,
        }
    }
}

impl SessionSummary {
    /// Format summary for display
    pub fn display(&self) -> String {
        format!(
            "Session: {}\n\
             Started: {}\n\
             Duration: {:.1}s\n\
             Items: {}/{} ({} failed attempts)\n\
             API Calls: {} ({} cached)\n\
             Tokens: {} (input: {}, output: {})\n\
             Avg Latency: {:.0}ms",
            self.session_id,
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.total_duration_ms as f64 / 1000.0,
            self.finished_items,
            self.expected_items,
            self.failed_attempts,
            self.api_calls,
            self.cache_hits,
            self.total_tokens,
            self.input_tokens,
            self.output_tokens,
            self.avg_latency_ms
        )
    }
}

// =============================================================================
// Shared Type
// =============================================================================

/// Session shared between the chunk loop and the requester
pub type SharedSession = Arc<Session>;

pub fn create_shared_session() -> SharedSession {
    Arc::new(Session::new())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::provider::{ResponseMetadata, ResponseTiming, TokenUsage};

    #[test]
    fn test_item_counters() {
        let session = Session::with_id("test-session");
        session.add_expected(4);
        session.add_finished(3);
        session.record_failed_attempt();

        let summary = session.snapshot();
        assert_eq!(summary.session_id, "test-session");
        assert_eq!(summary.expected_items, 4);
        assert_eq!(summary.finished_items, 3);
        assert_eq!(summary.failed_attempts, 1);
    }

    #[test]
    fn test_record_response() {
        let session = Session::new();
        let response = LlmResponse::with_metrics(
            "1. label",
            TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            ResponseTiming { total_ms: 500 },
            ResponseMetadata {
                model: "gpt-4o-mini".to_string(),
                provider: "openai".to_string(),
            },
        );

        session.record_response(&response);
        session.record_response(&response);
        session.record_cache_hit();

        let summary = session.snapshot();
        assert_eq!(summary.api_calls, 2);
        assert_eq!(summary.cache_hits, 1);
        assert_eq!(summary.total_tokens, 300);
        assert!((summary.avg_latency_ms - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(Session::new().id(), Session::new().id());
    }

    #[test]
    fn test_display_contains_items() {
        let session = Session::with_id("s");
        session.add_expected(10);
        session.add_finished(10);
        let text = session.snapshot().display();
        assert!(text.contains("Items: 10/10"));
    }
}
