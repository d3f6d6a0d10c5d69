//! Duplicate label merging
//!
//! Folds together codes whose labels only differ in casing, separators or
//! whitespace. Runs without the model.

use std::collections::BTreeMap;

use tracing::debug;

use super::{Consolidator, StageOutput};
use crate::types::{Code, Codebook, Result, normalize_label};

#[derive(Debug, Default)]
pub struct DuplicateMerger;

impl DuplicateMerger {
    pub fn new() -> Self {
        Self
    }

    /// Codes grouped by normalized label; the first code of a group (in label
    /// order) absorbs the rest.
    pub fn merge(mut codes: Vec<Code>) -> Codebook {
        codes.sort_by(|a, b| a.label.cmp(&b.label));

        let mut groups: BTreeMap<String, Code> = BTreeMap::new();
        for code in codes.into_iter().filter(|code| !code.is_merged()) {
            match groups.get_mut(&normalize_label(&code.label)) {
                Some(keeper) => {
                    debug!(keeper = %keeper.label, absorbed = %code.label, "Merging duplicate label");
                    keeper.absorb(code);
                }
                None => {
                    groups.insert(normalize_label(&code.label), code);
                }
            }
        }

        Codebook::from_codes(groups.into_values())
    }
}

impl Consolidator for DuplicateMerger {
    fn name(&self) -> &str {
        "duplicates"
    }

    fn preprocess(
        &mut self,
        _codebook: &Codebook,
        codes: Vec<Code>,
        _iteration: usize,
    ) -> Result<StageOutput> {
        let before = codes.len();
        let merged = Self::merge(codes);
        debug!(before, after = merged.len(), "Duplicate labels merged");
        Ok(StageOutput::Codebook(merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merges_case_and_separator_variants() {
        let codes = vec![
            Code::new("peer_support").with_example("my friends helped"),
            Code::new("Peer Support").with_definition("Help from peers"),
            Code::new("peer-support "),
            Code::new("coping"),
        ];

        let codebook = DuplicateMerger::merge(codes);

        assert_eq!(codebook.len(), 2);
        let kept = codebook.get("Peer Support").unwrap();
        assert_eq!(kept.definitions, vec!["Help from peers"]);
        assert_eq!(kept.examples, vec!["my friends helped"]);
        assert!(kept.alternatives.contains(&"peer_support".to_string()));
        assert!(kept.alternatives.contains(&"peer-support".to_string()));
        assert!(codebook.contains("coping"));
    }

    #[test]
    fn test_result_does_not_depend_on_input_order() {
        let forward = vec![Code::new("A b"), Code::new("a_b"), Code::new("c")];
        let mut backward = forward.clone();
        backward.reverse();

        assert_eq!(
            DuplicateMerger::merge(forward),
            DuplicateMerger::merge(backward)
        );
    }

    #[test]
    fn test_merged_codes_are_dropped() {
        let mut absorbed = Code::new("old");
        absorbed.mark_merged();

        let codebook = DuplicateMerger::merge(vec![absorbed, Code::new("kept")]);
        assert_eq!(codebook.labels().collect::<Vec<_>>(), vec!["kept"]);
    }

    #[test]
    fn test_stage_hands_off_a_codebook_without_prompts() {
        let mut stage = DuplicateMerger::new();
        let current = Codebook::from_codes(vec![Code::new("x"), Code::new("X")]);

        let output = stage.preprocess(&current, current.codes(), 0).unwrap();
        assert!(matches!(&output, StageOutput::Codebook(codebook) if codebook.len() == 1));

        let prompts = stage
            .build_prompts(&current, &current.codes(), 0, 0)
            .unwrap();
        assert!(prompts.prompts.is_none());
        assert!(!stage.looping());
        assert!(!stage.chunkified());
    }
}
