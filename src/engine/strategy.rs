//! Strategy Contract
//!
//! A `Strategy` parameterizes the chunk loop: how large a chunk may be, which
//! subunits take part in an iteration, what the model is asked, and how its
//! answer is folded back into the analysis. It has no control flow of its own.
//!
//! Every hook has a safe default, so a strategy only overrides what it needs.
//!
//! ## Sentinels
//!
//! - [`ChunkDecision::Abort`] ends the current iteration without an error.
//! - [`ParseOutcome::CursorDelta`] moves the cursor relative to the nominal
//!   chunk end; negative values ask for a partial re-read.
//! - [`Preprocessed::Complete`] ends the whole run before `max_iterations`.

use std::collections::BTreeMap;

use crate::constants::engine::{MAX_RETRY_TEMPERATURE, RETRY_TEMPERATURE_STEP};
use crate::types::Result;

// =============================================================================
// Hook Results
// =============================================================================

/// Chunk size answer of [`Strategy::chunk_size`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkDecision {
    /// Process `size` subunits from the cursor, with extra read-only context
    /// before (`prefetch`) and after (`postfetch`) the chunk.
    Proceed {
        size: usize,
        prefetch: usize,
        postfetch: usize,
    },
    /// Stop the current iteration.
    Abort,
}

impl ChunkDecision {
    pub fn size(size: usize) -> Self {
        Self::Proceed {
            size,
            prefetch: 0,
            postfetch: 0,
        }
    }

    pub fn with_context(size: usize, prefetch: usize, postfetch: usize) -> Self {
        Self::Proceed {
            size,
            prefetch,
            postfetch,
        }
    }
}

/// System and user prompt for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompts {
    pub system: String,
    pub user: String,
}

impl Prompts {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Result of [`Strategy::parse_response`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Raw answers keyed by 1-based position in the chunk window.
    ItemResults(BTreeMap<usize, String>),
    /// Cursor correction relative to the end of the chunk.
    CursorDelta(isize),
}

impl ParseOutcome {
    /// Cursor correction contributed by this outcome.
    pub fn correction(&self) -> isize {
        match self {
            Self::ItemResults(_) => 0,
            Self::CursorDelta(delta) => *delta,
        }
    }
}

/// Result of [`Strategy::preprocess`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preprocessed<U> {
    /// Subunits for this iteration; empty skips the iteration.
    Units(Vec<U>),
    /// Nothing left to do; the loop stops.
    Complete,
}

// =============================================================================
// Strategy Trait
// =============================================================================

pub trait Strategy: Send {
    type Unit: Clone + Send + Sync;
    type Analysis: Send;
    type Source: Send + Sync + ?Sized;

    /// Name used in logs and as the default cache namespace.
    fn name(&self) -> &str;

    fn max_iterations(&self) -> usize {
        1
    }

    fn cache_namespace(&self) -> &str {
        self.name()
    }

    /// Base temperature for requests made on behalf of this strategy.
    fn temperature(&self) -> f32 {
        0.0
    }

    /// Temperature for attempt `tries` on the same chunk. Raising it on
    /// retries also changes the response cache key.
    fn retry_temperature(&self, tries: usize) -> f32 {
        let raised = self.temperature() + tries as f32 * RETRY_TEMPERATURE_STEP;
        if tries == 0 {
            raised
        } else {
            raised.min(MAX_RETRY_TEMPERATURE.max(self.temperature()))
        }
    }

    /// `recommended` is `min(provider max items, remaining)`.
    fn chunk_size(
        &mut self,
        recommended: usize,
        _remaining: usize,
        _iteration: usize,
        _tries: usize,
    ) -> ChunkDecision {
        ChunkDecision::size(recommended)
    }

    /// One-time hook before a batch of top-level units is chunked.
    fn batch_preprocess(
        &mut self,
        _units: &[Vec<Self::Unit>],
        _analyses: &mut [Self::Analysis],
    ) -> Result<()> {
        Ok(())
    }

    /// Runs once per iteration, before filtering.
    fn preprocess(
        &mut self,
        _analysis: &mut Self::Analysis,
        _source: &Self::Source,
        subunits: Vec<Self::Unit>,
        _iteration: usize,
    ) -> Result<Preprocessed<Self::Unit>> {
        Ok(Preprocessed::Units(subunits))
    }

    fn subunit_filter(&self, _subunit: &Self::Unit, _iteration: usize) -> bool {
        true
    }

    /// `None` skips the model call for this chunk.
    fn build_prompts(
        &mut self,
        _analysis: &mut Self::Analysis,
        _source: &Self::Source,
        _subunits: &[Self::Unit],
        _chunk_start: usize,
        _iteration: usize,
    ) -> Result<Option<Prompts>> {
        Ok(None)
    }

    /// `lines` is the response split on newlines; `subunits` is the same
    /// window `build_prompts` saw.
    fn parse_response(
        &mut self,
        _analysis: &mut Self::Analysis,
        _lines: &[&str],
        _subunits: &[Self::Unit],
        _chunk_start: usize,
        _iteration: usize,
    ) -> Result<ParseOutcome> {
        Ok(ParseOutcome::CursorDelta(0))
    }
}
