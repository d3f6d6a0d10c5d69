//! Iterative refinement merging
//!
//! Shows the model a chunk of codes and asks which of them name the same
//! concept. Each answer line groups chunk positions under a new label:
//!
//! ```text
//! 1, 3 => coping through exercise
//! ```
//!
//! The first code of a group absorbs the others and takes the new label;
//! the others become `[Merged]` until the stage finishes. The stage runs in
//! rounds (one per loop iteration) and stops once a round merged nothing or
//! `max_rounds` rounds ran.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use super::{Consolidator, StageOutput, StageParse, StagePrompts, describe_codes};
use crate::constants::consolidation::{DEFAULT_REFINE_MAX_ROUNDS, PROMPT_EXAMPLES_PER_CODE};
use crate::engine::{ParseOutcome, Prompts};
use crate::types::{Code, Codebook, LoomError, Result};

static GROUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\s\-*]*(\d+(?:\s*,\s*\d+)+)\s*=>\s*(.+?)\s*$").expect("valid regex")
});

const SYSTEM_PROMPT: &str = "You are an expert in qualitative research. \
You consolidate codebooks by finding codes that describe the same concept.";

/// One `positions => label` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeGroup {
    /// 1-based chunk positions, in answer order without repeats
    pub positions: Vec<usize>,
    pub label: String,
}

/// Parses merge groups. Positions must lie in `1..=chunk_len`; lines that are
/// not groups (commentary, `None`) are ignored.
pub fn parse_groups(lines: &[&str], chunk_len: usize) -> Result<Vec<MergeGroup>> {
    let mut groups = Vec::new();

    for (index, line) in lines.iter().enumerate() {
        let Some(caps) = GROUP.captures(line.trim()) else {
            continue;
        };

        let mut positions = Vec::new();
        for part in caps[1].split(',') {
            let position: usize = part.trim().parse().map_err(|_| {
                LoomError::invalid_response_at(index + 1, format!("Bad position {:?}", part))
            })?;
            if position == 0 || position > chunk_len {
                return Err(LoomError::invalid_response_at(
                    index + 1,
                    format!("Position {} is outside the chunk of {} codes", position, chunk_len),
                ));
            }
            if !positions.contains(&position) {
                positions.push(position);
            }
        }

        let label = caps[2].trim_matches(|c: char| c == '"' || c == '*').trim();
        if positions.len() < 2 || label.is_empty() {
            continue;
        }
        groups.push(MergeGroup {
            positions,
            label: label.to_string(),
        });
    }

    Ok(groups)
}

#[derive(Debug)]
pub struct RefineMerger {
    max_rounds: usize,
    context: Option<String>,
    round: usize,
    merges: usize,
    stopping: bool,
}

impl Default for RefineMerger {
    fn default() -> Self {
        Self::new(DEFAULT_REFINE_MAX_ROUNDS)
    }
}

impl RefineMerger {
    pub fn new(max_rounds: usize) -> Self {
        Self {
            max_rounds,
            context: None,
            round: 0,
            merges: 0,
            stopping: false,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        self.context = (!context.trim().is_empty()).then_some(context);
        self
    }

    /// Rounds started so far
    pub fn round(&self) -> usize {
        self.round
    }

    /// Codes absorbed in the current round
    pub fn merges(&self) -> usize {
        self.merges
    }

    fn user_prompt(&self, codes: &[Code]) -> String {
        let mut prompt = String::new();
        if let Some(context) = &self.context {
            prompt.push_str(&format!("Research context: {}\n\n", context.trim()));
        }
        prompt.push_str(
            "Find codes below that describe the same concept. For each group, answer one line\n\
             with the code numbers and a label covering all of them:\n\n\
             1, 3 => <merged label>\n\n\
             Leave out codes that have no match. Answer \"None\" if nothing should be merged.\n\n\
             Codes:\n",
        );
        prompt.push_str(&describe_codes(codes, PROMPT_EXAMPLES_PER_CODE));
        prompt
    }

    /// Applies `groups` to a copy of `codebook`. Returns it with the number of
    /// codes absorbed.
    fn merge_groups(
        &self,
        codebook: &Codebook,
        chunk: &[Code],
        groups: &[MergeGroup],
    ) -> (Codebook, usize) {
        let mut working = codebook.clone();
        let mut taken = BTreeSet::new();
        let mut absorbed = 0;

        for group in groups {
            if group.positions.iter().any(|position| taken.contains(position)) {
                debug!(label = %group.label, "Group overlaps an earlier one, skipping");
                continue;
            }

            let labels: Vec<&str> = group
                .positions
                .iter()
                .map(|&position| chunk[position - 1].label.as_str())
                .collect();
            let Some(mut keeper) = working.remove(labels[0]) else {
                debug!(label = labels[0], "Code left the codebook, skipping group");
                continue;
            };

            for label in &labels[1..] {
                if *label == keeper.label {
                    continue;
                }
                if let Some(mut other) = working.remove(label) {
                    keeper.absorb(other.clone());
                    other.mark_merged();
                    working.upsert(other);
                    absorbed += 1;
                }
            }

            keeper.rename(group.label.clone());
            debug!(label = %keeper.label, members = labels.len(), "Codes merged");
            working.upsert(keeper);
            taken.extend(group.positions.iter().copied());
        }

        (working, absorbed)
    }
}

impl Consolidator for RefineMerger {
    fn name(&self) -> &str {
        "refine"
    }

    fn chunkified(&self) -> bool {
        true
    }

    fn looping(&self) -> bool {
        true
    }

    fn is_stopping(&self) -> bool {
        self.stopping
    }

    fn reset_stopping(&mut self) {
        self.stopping = false;
        self.round = 0;
        self.merges = 0;
    }

    fn subunit_filter(&self, code: &Code, _iteration: usize) -> bool {
        !code.is_merged()
    }

    fn preprocess(
        &mut self,
        _codebook: &Codebook,
        codes: Vec<Code>,
        iteration: usize,
    ) -> Result<StageOutput> {
        if self.round > 0 && self.merges == 0 {
            info!(round = self.round, "No merges in the last round, stopping");
            self.stopping = true;
        } else if self.round >= self.max_rounds {
            info!(rounds = self.max_rounds, "Refinement round limit reached");
            self.stopping = true;
        } else {
            self.round += 1;
            self.merges = 0;
            debug!(round = self.round, iteration, codes = codes.len(), "Refinement round");
        }
        Ok(StageOutput::Codes(codes))
    }

    fn build_prompts(
        &mut self,
        _codebook: &Codebook,
        codes: &[Code],
        chunk_start: usize,
        _iteration: usize,
    ) -> Result<StagePrompts> {
        let chunk = codes.get(chunk_start..).unwrap_or_default();
        if chunk.len() < 2 {
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
        let chunk = codes.get(chunk_start..).unwrap_or_default();
        let groups = parse_groups(lines, chunk.len())?;
        let parse = StageParse::new(ParseOutcome::CursorDelta(0));
        if groups.is_empty() {
            return Ok(parse);
        }

        let (merged, absorbed) = self.merge_groups(codebook, chunk, &groups);
        self.merges += absorbed;
        Ok(parse.with_handoff(StageOutput::Codes(merged.into_codes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codebook(labels: &[&str]) -> Codebook {
        Codebook::from_codes(
            labels
                .iter()
                .map(|l| Code::new(*l).with_example(format!("about {}", l))),
        )
    }

    fn lines(text: &str) -> Vec<&str> {
        text.lines().collect()
    }

    #[test]
    fn test_parse_groups() {
        let groups = parse_groups(
            &lines("Here are the groups:\n1, 3 => coping\n- 2,4,2 => \"support\"\nNone"),
            4,
        )
        .unwrap();

        assert_eq!(
            groups,
            vec![
                MergeGroup {
                    positions: vec![1, 3],
                    label: "coping".to_string()
                },
                MergeGroup {
                    positions: vec![2, 4],
                    label: "support".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_position_outside_chunk_is_invalid() {
        let err = parse_groups(&lines("1, 5 => x"), 4).unwrap_err();
        assert!(matches!(err, LoomError::InvalidResponse { line: Some(1), .. }));
        assert!(parse_groups(&lines("0, 1 => x"), 4).is_err());
    }

    #[test]
    fn test_single_position_is_not_a_group() {
        assert!(parse_groups(&lines("2, 2 => x"), 4).unwrap().is_empty());
    }

    #[test]
    fn test_merge_marks_absorbed_codes() {
        let mut stage = RefineMerger::new(3);
        let current = codebook(&["exercise", "running", "sleep"]);
        let codes = current.codes();
        stage.preprocess(&current, codes.clone(), 0).unwrap();

        let parse = stage
            .parse_response(&current, &lines("1, 2 => physical activity"), &codes, 0, 0)
            .unwrap();

        assert_eq!(parse.outcome, ParseOutcome::CursorDelta(0));
        assert_eq!(stage.merges(), 1);
        let updated = parse.handoff.unwrap().into_codebook();
        let keeper = updated.get("physical activity").unwrap();
        assert_eq!(keeper.examples, vec!["about exercise", "about running"]);
        assert!(keeper.alternatives.contains(&"exercise".to_string()));
        assert!(keeper.alternatives.contains(&"running".to_string()));
        assert!(updated.iter().any(|code| code.is_merged()));
        assert!(updated.contains("sleep"));
        assert!(!updated.contains("running"));
    }

    #[test]
    fn test_no_groups_no_handoff() {
        let mut stage = RefineMerger::new(3);
        let current = codebook(&["a", "b"]);
        let codes = current.codes();

        let parse = stage
            .parse_response(&current, &lines("None"), &codes, 0, 0)
            .unwrap();
        assert!(parse.handoff.is_none());
        assert_eq!(stage.merges(), 0);
    }

    #[test]
    fn test_stops_after_a_round_without_merges() {
        let mut stage = RefineMerger::new(10);
        let current = codebook(&["a", "b"]);

        stage.preprocess(&current, current.codes(), 0).unwrap();
        assert!(!stage.is_stopping());
        assert_eq!(stage.round(), 1);

        stage.preprocess(&current, current.codes(), 1).unwrap();
        assert!(stage.is_stopping());

        stage.reset_stopping();
        assert!(!stage.is_stopping());
        assert_eq!(stage.round(), 0);
    }

    #[test]
    fn test_stops_at_round_limit() {
        let mut stage = RefineMerger::new(2);
        let current = codebook(&["a", "b", "c", "d"]);
        let codes = current.codes();

        for iteration in 0..2 {
            stage.preprocess(&current, codes.clone(), iteration).unwrap();
            stage
                .parse_response(&current, &lines("1, 2 => ab"), &codes, 0, iteration)
                .unwrap();
            assert!(!stage.is_stopping());
        }

        stage.preprocess(&current, codes, 2).unwrap();
        assert!(stage.is_stopping());
    }

    #[test]
    fn test_small_chunks_skip_the_model() {
        let mut stage = RefineMerger::default();
        let current = codebook(&["a", "b"]);
        let codes = current.codes();

        assert!(stage.build_prompts(&current, &codes, 1, 0).unwrap().prompts.is_none());
        let prompts = stage.build_prompts(&current, &codes, 0, 0).unwrap().prompts.unwrap();
        assert!(prompts.user.contains("1. a\n- about a\n2. b\n"));
    }
}
