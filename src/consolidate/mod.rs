//! Codebook Consolidation
//!
//! A [`Consolidator`] is one refinement stage over a [`Codebook`]: merge
//! duplicates, write definitions, fold together codes naming the same concept.
//! [`PipelineConsolidator`] chains stages behind a single [`Strategy`] so the
//! regular chunk loop runs the whole pipeline.
//!
//! ## Handoff
//!
//! Stage hooks see the current codebook read-only. A hook that changes codes
//! returns a [`StageOutput`]; the pipeline adopts it as the new codebook.
//! - `Codes`: the full code list, rebuilt into a codebook keyed by label
//! - `Codebook`: a codebook replacing the current one
//!
//! [`Strategy`]: crate::engine::Strategy

pub mod definitions;
pub mod duplicates;
pub mod pipeline;
pub mod refine;

pub use definitions::DefinitionGenerator;
pub use duplicates::DuplicateMerger;
pub use pipeline::{PipelineConsolidator, Stage, should_advance};
pub use refine::RefineMerger;

use crate::constants::consolidation::SHRINK_DIVISOR;
use crate::engine::{ChunkDecision, ParseOutcome, Prompts};
use crate::types::{Code, Codebook, Result};

// =============================================================================
// Stage Results
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutput {
    Codes(Vec<Code>),
    Codebook(Codebook),
}

impl StageOutput {
    pub fn into_codebook(self) -> Codebook {
        match self {
            Self::Codes(codes) => Codebook::from_codes(codes),
            Self::Codebook(codebook) => codebook,
        }
    }
}

/// Prompts of a stage, plus an optional handoff
#[derive(Debug, Clone, Default)]
pub struct StagePrompts {
    pub prompts: Option<Prompts>,
    pub handoff: Option<StageOutput>,
}

impl StagePrompts {
    pub fn new(prompts: Prompts) -> Self {
        Self {
            prompts: Some(prompts),
            handoff: None,
        }
    }

    /// No model call for this chunk.
    pub fn skip() -> Self {
        Self::default()
    }

    pub fn with_handoff(mut self, handoff: StageOutput) -> Self {
        self.handoff = Some(handoff);
        self
    }
}

/// Parse result of a stage, plus an optional handoff
#[derive(Debug, Clone)]
pub struct StageParse {
    pub outcome: ParseOutcome,
    pub handoff: Option<StageOutput>,
}

impl StageParse {
    pub fn new(outcome: ParseOutcome) -> Self {
        Self {
            outcome,
            handoff: None,
        }
    }

    pub fn with_handoff(mut self, handoff: StageOutput) -> Self {
        self.handoff = Some(handoff);
        self
    }
}

/// Chunk size of a chunkified stage on attempt `tries`: each retry removes a
/// quarter of `recommended`, never going below one.
pub fn shrunk_chunk_size(recommended: usize, tries: usize) -> usize {
    let step = recommended.div_ceil(SHRINK_DIVISOR);
    recommended
        .saturating_sub(tries.saturating_mul(step))
        .max(1)
}

// =============================================================================
// Consolidator Trait
// =============================================================================

pub trait Consolidator: Send {
    fn name(&self) -> &str;

    /// Whether chunks shrink on retry instead of covering everything remaining.
    fn chunkified(&self) -> bool {
        false
    }

    /// Whether the stage runs again until it reports `is_stopping`.
    fn looping(&self) -> bool {
        false
    }

    fn is_stopping(&self) -> bool {
        false
    }

    fn reset_stopping(&mut self) {}

    /// Stage temperature; `None` uses the pipeline's base temperature.
    fn temperature(&self) -> Option<f32> {
        None
    }

    fn chunk_size(
        &self,
        recommended: usize,
        remaining: usize,
        _iteration: usize,
        tries: usize,
    ) -> ChunkDecision {
        if self.chunkified() {
            ChunkDecision::size(shrunk_chunk_size(recommended, tries))
        } else {
            ChunkDecision::size(remaining)
        }
    }

    fn subunit_filter(&self, _code: &Code, _iteration: usize) -> bool {
        true
    }

    fn preprocess(
        &mut self,
        _codebook: &Codebook,
        codes: Vec<Code>,
        _iteration: usize,
    ) -> Result<StageOutput> {
        Ok(StageOutput::Codes(codes))
    }

    fn build_prompts(
        &mut self,
        _codebook: &Codebook,
        _codes: &[Code],
        _chunk_start: usize,
        _iteration: usize,
    ) -> Result<StagePrompts> {
        Ok(StagePrompts::skip())
    }

    fn parse_response(
        &mut self,
        _codebook: &Codebook,
        _lines: &[&str],
        _codes: &[Code],
        _chunk_start: usize,
        _iteration: usize,
    ) -> Result<StageParse> {
        Ok(StageParse::new(ParseOutcome::CursorDelta(0)))
    }

    /// Runs once when the pipeline leaves this stage.
    fn postprocess(&mut self, codes: Vec<Code>) -> Vec<Code> {
        codes.into_iter().filter(|code| !code.is_merged()).collect()
    }
}

/// Numbered code list used in prompts: `1. label` plus definition and examples.
pub(crate) fn describe_codes(codes: &[Code], examples: usize) -> String {
    let mut out = String::new();
    for (i, code) in codes.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, code.label));
        if let Some(definition) = code.definitions.first() {
            out.push_str(&format!("Definition: {}\n", definition));
        }
        for example in code.examples.iter().take(examples) {
            out.push_str(&format!("- {}\n", example));
        }
    }
    out
}

/// Replace codes in `current` by label with their `updated` versions.
/// Returns the full list, in codebook order, for a `Codes` handoff.
pub(crate) fn apply_updates(current: &Codebook, updated: Vec<(String, Code)>) -> Vec<Code> {
    let mut codebook = current.clone();
    let mut replacements = Vec::with_capacity(updated.len());
    for (old_label, code) in updated {
        codebook.remove(&old_label);
        replacements.push(code);
    }
    let mut codes = codebook.into_codes();
    codes.extend(replacements);
    codes
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain {
        chunkified: bool,
    }

    impl Consolidator for Plain {
        fn name(&self) -> &str {
            "plain"
        }

        fn chunkified(&self) -> bool {
            self.chunkified
        }
    }

    #[test]
    fn test_shrinking_sequence() {
        let sizes: Vec<usize> = (0..5).map(|tries| shrunk_chunk_size(32, tries)).collect();
        assert_eq!(sizes, vec![32, 24, 16, 8, 1]);
        assert_eq!(shrunk_chunk_size(3, 0), 3);
        assert_eq!(shrunk_chunk_size(3, 1), 2);
        assert_eq!(shrunk_chunk_size(1, 9), 1);
    }

    #[test]
    fn test_chunk_size_modes() {
        let chunked = Plain { chunkified: true };
        assert_eq!(chunked.chunk_size(32, 100, 0, 1), ChunkDecision::size(24));

        let whole = Plain { chunkified: false };
        assert_eq!(whole.chunk_size(32, 100, 0, 3), ChunkDecision::size(100));
    }

    #[test]
    fn test_default_postprocess_drops_merged() {
        let mut merged = Code::new("b");
        merged.mark_merged();
        let mut stage = Plain { chunkified: false };

        let kept = stage.postprocess(vec![Code::new("a"), merged]);
        assert_eq!(kept, vec![Code::new("a")]);
    }

    #[test]
    fn test_stage_output_into_codebook() {
        let output = StageOutput::Codes(vec![Code::new("b"), Code::new("a")]);
        let codebook = output.into_codebook();
        assert_eq!(codebook.labels().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_apply_updates_handles_renames() {
        let current = Codebook::from_codes(vec![Code::new("a"), Code::new("b")]);
        let mut renamed = Code::new("a");
        renamed.rename("alpha");

        let codes = apply_updates(&current, vec![("a".to_string(), renamed)]);
        let labels: Vec<_> = codes.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["b", "alpha"]);
    }

    #[test]
    fn test_describe_codes() {
        let codes = vec![
            Code::new("coping")
                .with_definition("Managing stress")
                .with_example("I run"),
            Code::new("isolation"),
        ];
        let text = describe_codes(&codes, 3);
        assert_eq!(
            text,
            "1. coping\nDefinition: Managing stress\n- I run\n2. isolation\n"
        );
    }
}
