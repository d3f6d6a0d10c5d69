//! Definition generation
//!
//! Asks the model to write a definition and a category for every code that
//! has none. Answers come back as numbered blocks:
//!
//! ```text
//! 1. peer support
//! Definition: Help and encouragement received from people in a similar situation.
//! Category: Social resources
//! ```
//!
//! A block may refine the label; the previous one is kept as an alternative.
//! Fewer blocks than requested move the cursor back so the rest is asked again.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::{Consolidator, StageOutput, StageParse, StagePrompts, apply_updates, describe_codes};
use crate::constants::consolidation::PROMPT_EXAMPLES_PER_CODE;
use crate::engine::{ParseOutcome, Prompts};
use crate::types::{Code, Codebook, LoomError, Result};

static NUMBERED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\**(\d+)\.\s*(.+?)\**$").expect("valid regex")
});
static DEFINITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\**definition\**:\s*\**\s*(.+)$").expect("valid regex")
});
static CATEGORY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\**category\**:\s*\**\s*(.+)$").expect("valid regex")
});

const SYSTEM_PROMPT: &str = "You are an expert in qualitative research. \
You write short, precise definitions for codes in a codebook.";

/// One answered block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionBlock {
    pub number: usize,
    pub label: String,
    pub definition: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Default)]
pub struct DefinitionGenerator {
    context: Option<String>,
}

impl DefinitionGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Research question or study description quoted in every prompt.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        self.context = (!context.trim().is_empty()).then_some(context);
        self
    }

    fn user_prompt(&self, codes: &[Code]) -> String {
        let mut prompt = String::new();
        if let Some(context) = &self.context {
            prompt.push_str(&format!("Research context: {}\n\n", context.trim()));
        }
        prompt.push_str(&format!(
            "Write a definition and a category for each of the {} codes below.\n\
             Answer with one block per code, in the same order and numbering:\n\n\
             N. <label>\n\
             Definition: <one sentence>\n\
             Category: <broader theme>\n\n\
             Codes:\n",
            codes.len()
        ));
        prompt.push_str(&describe_codes(codes, PROMPT_EXAMPLES_PER_CODE));
        prompt
    }
}

/// Parses numbered blocks. Numbering must start at 1 and increase by one,
/// and stay within `requested`. A last block without a definition is
/// dropped; any other block without one is an error.
pub fn parse_blocks(lines: &[&str], requested: usize) -> Result<Vec<DefinitionBlock>> {
    let mut blocks: Vec<DefinitionBlock> = Vec::new();

    for (index, raw) in lines.iter().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(caps) = DEFINITION.captures(line) {
            if let Some(block) = blocks.last_mut() {
                block.definition = Some(caps[1].trim().to_string());
            }
        } else if let Some(caps) = CATEGORY.captures(line) {
            if let Some(block) = blocks.last_mut() {
                block.category = Some(caps[1].trim().to_string());
            }
        } else if let Some(caps) = NUMBERED.captures(line) {
            let number: usize = caps[1].parse().map_err(|_| {
                LoomError::invalid_response_at(index + 1, format!("Bad item number in {:?}", line))
            })?;
            let expected = blocks.len() + 1;
            if number != expected {
                return Err(LoomError::invalid_response_at(
                    index + 1,
                    format!("Expected item {}, found item {}", expected, number),
                ));
            }
            if number > requested {
                return Err(LoomError::invalid_response_at(
                    index + 1,
                    format!("Item {} is beyond the {} requested codes", number, requested),
                ));
            }
            blocks.push(DefinitionBlock {
                number,
                label: caps[2].trim().to_string(),
                definition: None,
                category: None,
            });
        }
    }

    // an answer cut off inside its last block keeps the blocks before it
    if blocks.last().is_some_and(|block| block.definition.is_none())
        && let Some(block) = blocks.pop()
    {
        debug!(item = block.number, label = %block.label, "Dropping truncated last block");
    }

    if let Some(block) = blocks.iter().find(|block| block.definition.is_none()) {
        return Err(LoomError::invalid_response(format!(
            "Item {} ({}) has no definition",
            block.number, block.label
        )));
    }

    Ok(blocks)
}

impl Consolidator for DefinitionGenerator {
    fn name(&self) -> &str {
        "definitions"
    }

    fn chunkified(&self) -> bool {
        true
    }

    fn subunit_filter(&self, code: &Code, _iteration: usize) -> bool {
        !code.has_definition() && !code.is_merged()
    }

    fn build_prompts(
        &mut self,
        _codebook: &Codebook,
        codes: &[Code],
        chunk_start: usize,
        _iteration: usize,
    ) -> Result<StagePrompts> {
        let chunk = codes.get(chunk_start..).unwrap_or_default();
        if chunk.is_empty() {
            return Ok(StagePrompts::skip());
        }
        Ok(StagePrompts::new(Prompts::new(
            SYSTEM_PROMPT,
            self.user_prompt(chunk),
        )))
    }

    fn parse_response(
        &mut self,
        codebook: &Codebook,
        lines: &[&str],
        codes: &[Code],
        chunk_start: usize,
        _iteration: usize,
    ) -> Result<StageParse> {
        let requested = codes.len().saturating_sub(chunk_start);
        let blocks = parse_blocks(lines, requested)?;

        let mut updates = Vec::with_capacity(blocks.len());
        for (offset, block) in blocks.iter().enumerate() {
            let Some(original) = codes.get(chunk_start + offset) else {
                break;
            };
            let Some(current) = codebook.get(&original.label) else {
                debug!(label = %original.label, "Code left the codebook, skipping definition");
                continue;
            };

            let mut code = current.clone();
            if let Some(definition) = &block.definition {
                code = code.with_definition(definition.clone());
            }
            if let Some(category) = &block.category {
                code = code.with_category(category.clone());
            }
            if !block.label.is_empty() {
                code.rename(block.label.clone());
            }
            updates.push((original.label.clone(), code));
        }

        let delta = blocks.len() as isize - requested as isize;
        debug!(requested, answered = blocks.len(), delta, "Definitions parsed");

        Ok(StageParse::new(ParseOutcome::CursorDelta(delta))
            .with_handoff(StageOutput::Codes(apply_updates(codebook, updates))))
    }
}
