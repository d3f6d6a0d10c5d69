//! Pipeline Orchestrator
//!
//! Runs an ordered list of consolidators through one chunk loop. Each loop
//! iteration belongs to exactly one stage; the stage machine moves forward in
//! `preprocess`, before the active stage sees the codes:
//!
//! ```text
//! NotStarted -> Active(0) -> Active(1) -> ... -> Complete
//! ```
//!
//! A non-looping stage gets one iteration. A looping stage keeps its place
//! until it reports `is_stopping` or receives no codes. Leaving a stage runs
//! its `postprocess` over the current codebook and clears its stop flag.
//!
//! The codebook (the loop's analysis object) is the source of truth between
//! iterations; before every stage preprocess its codes are shuffled with a
//! fixed seed.

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use super::{Consolidator, StageOutput, StageParse, StagePrompts};
use crate::constants::consolidation::DEFAULT_SEED;
use crate::engine::{ChunkDecision, ParseOutcome, Preprocessed, Prompts, Strategy};
use crate::types::{Code, Codebook, LoomError, Result};

// =============================================================================
// Stage State Machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    NotStarted,
    Active(usize),
    Complete,
}

impl Stage {
    pub fn index(self) -> Option<usize> {
        match self {
            Self::Active(index) => Some(index),
            _ => None,
        }
    }

    /// Position in `-1..=len`.
    pub fn position(self, len: usize) -> isize {
        match self {
            Self::NotStarted => -1,
            Self::Active(index) => index as isize,
            Self::Complete => len as isize,
        }
    }

    pub fn advance(self, len: usize) -> Self {
        let next = match self {
            Self::NotStarted => 0,
            Self::Active(index) => index + 1,
            Self::Complete => return Self::Complete,
        };
        if next < len {
            Self::Active(next)
        } else {
            Self::Complete
        }
    }
}

/// Whether the pipeline leaves `stage` before the next iteration.
pub fn should_advance(stage: Stage, looping: bool, stopping: bool, incoming_empty: bool) -> bool {
    match stage {
        Stage::NotStarted => true,
        Stage::Active(_) => !looping || stopping || incoming_empty,
        Stage::Complete => false,
    }
}

/// Deterministic permutation of `items`.
pub fn seeded_shuffle<T>(mut items: Vec<T>, seed: u64) -> Vec<T> {
    let mut rng = StdRng::seed_from_u64(seed);
    items.shuffle(&mut rng);
    items
}

/// Make `output` the current codebook; returns its codes as the next subunits.
fn adopt(codebook: &mut Codebook, output: StageOutput) -> Vec<Code> {
    match output {
        StageOutput::Codes(codes) => {
            *codebook = Codebook::from_codes(codes.iter().cloned());
            codes
        }
        StageOutput::Codebook(next) => {
            let codes = next.codes();
            *codebook = next;
            codes
        }
    }
}

fn same_labels(codebook: &Codebook, codes: &[Code]) -> bool {
    let incoming: BTreeSet<&str> = codes.iter().map(|code| code.label.as_str()).collect();
    incoming.len() == codebook.len() && incoming.iter().all(|label| codebook.contains(label))
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct PipelineConsolidator {
    stages: Vec<Box<dyn Consolidator>>,
    stage: Stage,
    seed: u64,
    temperature: f32,
}

impl PipelineConsolidator {
    pub fn new(stages: Vec<Box<dyn Consolidator>>) -> Self {
        Self {
            stages,
            stage: Stage::NotStarted,
            seed: DEFAULT_SEED,
            temperature: 0.0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Temperature for stages that do not set their own.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn position(&self) -> isize {
        self.stage.position(self.stages.len())
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    fn active(&self) -> Result<Option<&dyn Consolidator>> {
        match self.stage.index() {
            Some(index) => self
                .stages
                .get(index)
                .map(|stage| Some(stage.as_ref()))
                .ok_or_else(|| self.out_of_range(index)),
            None => Ok(None),
        }
    }

    fn active_mut(&mut self) -> Result<Option<&mut Box<dyn Consolidator>>> {
        match self.stage.index() {
            Some(index) => {
                let len = self.stages.len();
                self.stages.get_mut(index).map(Some).ok_or_else(|| {
                    LoomError::Config(format!(
                        "Stage {} is out of range for {} consolidators",
                        index, len
                    ))
                })
            }
            None => Ok(None),
        }
    }

    /// Active stage that has not asked to stop.
    fn running(&self) -> Option<&dyn Consolidator> {
        self.active()
            .ok()
            .flatten()
            .filter(|stage| !stage.is_stopping())
    }

    fn out_of_range(&self, index: usize) -> LoomError {
        LoomError::Config(format!(
            "Stage {} is out of range for {} consolidators",
            index,
            self.stages.len()
        ))
    }

    fn finish_active(&mut self, codebook: &mut Codebook) -> Result<()> {
        if let Some(stage) = self.active_mut()? {
            let codes = stage.postprocess(codebook.codes());
            stage.reset_stopping();
            info!(stage = stage.name(), codes = codes.len(), "Stage finished");
            *codebook = Codebook::from_codes(codes);
        }
        Ok(())
    }
}

impl Strategy for PipelineConsolidator {
    type Unit = Code;
    type Analysis = Codebook;
    type Source = str;

    fn name(&self) -> &str {
        "pipeline"
    }

    fn max_iterations(&self) -> usize {
        usize::MAX
    }

    fn cache_namespace(&self) -> &str {
        self.active()
            .ok()
            .flatten()
            .map_or("pipeline", |stage| stage.name())
    }

    fn temperature(&self) -> f32 {
        self.active()
            .ok()
            .flatten()
            .and_then(|stage| stage.temperature())
            .unwrap_or(self.temperature)
    }

    fn chunk_size(
        &mut self,
        recommended: usize,
        remaining: usize,
        iteration: usize,
        tries: usize,
    ) -> ChunkDecision {
        match self.running() {
            Some(stage) => stage.chunk_size(recommended, remaining, iteration, tries),
            None => ChunkDecision::Abort,
        }
    }

    /// On the first call an empty `codebook` is seeded from `subunits`. A
    /// non-empty one must hold the same labels as `subunits` (or `subunits`
    /// must be empty), otherwise the run is misconfigured. From then on the
    /// codebook is authoritative and the incoming list only signals whether
    /// the previous iteration left anything to do.
    fn preprocess(
        &mut self,
        codebook: &mut Codebook,
        source: &str,
        subunits: Vec<Code>,
        iteration: usize,
    ) -> Result<Preprocessed<Code>> {
        if self.stage == Stage::NotStarted {
            if codebook.is_empty() {
                *codebook = Codebook::from_codes(subunits.iter().cloned());
            } else if !subunits.is_empty() && !same_labels(codebook, &subunits) {
                return Err(LoomError::Config(format!(
                    "Pipeline received {} codes that do not match its codebook of {}",
                    subunits.len(),
                    codebook.len()
                )));
            }
        }

        let (looping, stopping) = self
            .active()?
            .map_or((false, false), |stage| (stage.looping(), stage.is_stopping()));

        if should_advance(self.stage, looping, stopping, subunits.is_empty()) {
            self.finish_active(codebook)?;
            self.stage = self.stage.advance(self.stages.len());
            if let Some(stage) = self.active()? {
                info!(
                    source,
                    stage = stage.name(),
                    position = self.position(),
                    codes = codebook.len(),
                    "Stage started"
                );
            }
        }

        let Some(index) = self.stage.index() else {
            info!(source, codes = codebook.len(), "Consolidation pipeline complete");
            return Ok(Preprocessed::Complete);
        };

        let codes = seeded_shuffle(codebook.codes(), self.seed);
        let stage = self
            .stages
            .get_mut(index)
            .ok_or_else(|| LoomError::Config(format!("Stage {} is out of range", index)))?;
        debug!(stage = stage.name(), iteration, "Stage preprocess");
        let output = stage.preprocess(codebook, codes, iteration)?;

        Ok(Preprocessed::Units(adopt(codebook, output)))
    }

    fn subunit_filter(&self, code: &Code, iteration: usize) -> bool {
        self.running()
            .is_some_and(|stage| stage.subunit_filter(code, iteration))
    }

    fn build_prompts(
        &mut self,
        codebook: &mut Codebook,
        _source: &str,
        codes: &[Code],
        chunk_start: usize,
        iteration: usize,
    ) -> Result<Option<Prompts>> {
        let Some(stage) = self.active_mut()? else {
            return Ok(None);
        };
        if stage.is_stopping() {
            return Ok(None);
        }

        let StagePrompts { prompts, handoff } =
            stage.build_prompts(codebook, codes, chunk_start, iteration)?;
        if let Some(handoff) = handoff {
            adopt(codebook, handoff);
        }
        Ok(prompts)
    }

    fn parse_response(
        &mut self,
        codebook: &mut Codebook,
        lines: &[&str],
        codes: &[Code],
        chunk_start: usize,
        iteration: usize,
    ) -> Result<ParseOutcome> {
        let Some(stage) = self.active_mut()? else {
            return Ok(ParseOutcome::CursorDelta(0));
        };
        if stage.is_stopping() {
            return Ok(ParseOutcome::CursorDelta(0));
        }

        let StageParse { outcome, handoff } =
            stage.parse_response(codebook, lines, codes, chunk_start, iteration)?;
        if let Some(handoff) = handoff {
            adopt(codebook, handoff);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::session::Session;
    use crate::consolidate::DuplicateMerger;
    use crate::engine::{ChunkAction, ChunkLoop, ChunkStep};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        name: String,
        looping: bool,
        stop: Arc<AtomicBool>,
        postprocessed: Arc<AtomicUsize>,
        received: Arc<Mutex<Vec<Vec<String>>>>,
        add_on_preprocess: Option<String>,
        rename_on_parse: Option<(String, String)>,
    }

    impl Recorder {
        fn named(name: &str) -> Self {
            Self {
                name: name.to_string(),
                ..Default::default()
            }
        }
    }

    impl Consolidator for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn looping(&self) -> bool {
            self.looping
        }

        fn is_stopping(&self) -> bool {
            self.stop.load(Ordering::SeqCst)
        }

        fn reset_stopping(&mut self) {
            self.stop.store(false, Ordering::SeqCst);
        }

        fn preprocess(
            &mut self,
            codebook: &Codebook,
            codes: Vec<Code>,
            _iteration: usize,
        ) -> Result<StageOutput> {
            self.received
                .lock()
                .unwrap()
                .push(codes.iter().map(|c| c.label.clone()).collect());
            match &self.add_on_preprocess {
                Some(label) => {
                    let mut next = codebook.clone();
                    next.insert(Code::new(label.clone()));
                    Ok(StageOutput::Codebook(next))
                }
                None => Ok(StageOutput::Codes(codes)),
            }
        }

        fn build_prompts(
            &mut self,
            _codebook: &Codebook,
            codes: &[Code],
            _chunk_start: usize,
            _iteration: usize,
        ) -> Result<StagePrompts> {
            Ok(StagePrompts::new(Prompts::new("sys", format!("{}", codes.len()))))
        }

        fn parse_response(
            &mut self,
            codebook: &Codebook,
            _lines: &[&str],
            _codes: &[Code],
            _chunk_start: usize,
            _iteration: usize,
        ) -> Result<StageParse> {
            let parse = StageParse::new(ParseOutcome::CursorDelta(0));
            match &self.rename_on_parse {
                Some((from, to)) => {
                    let mut codes = codebook.codes();
                    for code in codes.iter_mut().filter(|c| c.label == *from) {
                        code.rename(to.clone());
                    }
                    Ok(parse.with_handoff(StageOutput::Codes(codes)))
                }
                None => Ok(parse),
            }
        }

        fn postprocess(&mut self, codes: Vec<Code>) -> Vec<Code> {
            self.postprocessed.fetch_add(1, Ordering::SeqCst);
            codes
        }
    }

    fn boxed(stage: impl Consolidator + 'static) -> Box<dyn Consolidator> {
        Box::new(stage)
    }

    fn codes(labels: &[&str]) -> Vec<Code> {
        labels.iter().map(|l| Code::new(*l)).collect()
    }

    #[test]
    fn test_stage_advance() {
        assert_eq!(Stage::NotStarted.advance(2), Stage::Active(0));
        assert_eq!(Stage::Active(0).advance(2), Stage::Active(1));
        assert_eq!(Stage::Active(1).advance(2), Stage::Complete);
        assert_eq!(Stage::Complete.advance(2), Stage::Complete);
        assert_eq!(Stage::NotStarted.advance(0), Stage::Complete);
        assert_eq!(Stage::NotStarted.position(3), -1);
        assert_eq!(Stage::Complete.position(3), 3);
    }

    #[test]
    fn test_should_advance_rule() {
        assert!(should_advance(Stage::NotStarted, true, false, false));
        assert!(should_advance(Stage::Active(0), false, false, false));
        assert!(!should_advance(Stage::Active(0), true, false, false));
        assert!(should_advance(Stage::Active(0), true, true, false));
        assert!(should_advance(Stage::Active(0), true, false, true));
        assert!(!should_advance(Stage::Complete, false, true, true));
    }

    #[test]
    fn test_non_looping_stages_advance_every_call() {
        let postprocessed = Arc::new(AtomicUsize::new(0));
        let stages: Vec<Box<dyn Consolidator>> = ["a", "b", "c"]
            .iter()
            .map(|name| {
                boxed(Recorder {
                    postprocessed: postprocessed.clone(),
                    ..Recorder::named(name)
                })
            })
            .collect();
        let mut pipeline = PipelineConsolidator::new(stages);
        let mut codebook = Codebook::new();
        let input = codes(&["x", "y"]);

        let mut positions = Vec::new();
        let mut outcomes = Vec::new();
        for iteration in 0..4 {
            let outcome = pipeline
                .preprocess(&mut codebook, "test", input.clone(), iteration)
                .unwrap();
            positions.push(pipeline.position());
            outcomes.push(outcome);
        }

        assert_eq!(positions, vec![0, 1, 2, 3]);
        assert_eq!(pipeline.stage(), Stage::Complete);
        assert_eq!(outcomes[3], Preprocessed::Complete);
        assert!(matches!(outcomes[0], Preprocessed::Units(ref units) if units.len() == 2));
        assert_eq!(postprocessed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_looping_stage_waits_for_stop_flag() {
        let stop = Arc::new(AtomicBool::new(false));
        let postprocessed = Arc::new(AtomicUsize::new(0));
        let looping = Recorder {
            looping: true,
            stop: stop.clone(),
            postprocessed: postprocessed.clone(),
            ..Recorder::named("loop")
        };
        let mut pipeline =
            PipelineConsolidator::new(vec![boxed(looping), boxed(Recorder::named("after"))]);
        let mut codebook = Codebook::new();
        let input = codes(&["x"]);

        for iteration in 0..10 {
            pipeline
                .preprocess(&mut codebook, "test", input.clone(), iteration)
                .unwrap();
            assert_eq!(pipeline.stage(), Stage::Active(0));
        }
        assert_eq!(postprocessed.load(Ordering::SeqCst), 0);

        stop.store(true, Ordering::SeqCst);
        assert_eq!(pipeline.chunk_size(4, 4, 10, 0), ChunkDecision::Abort);
        assert!(!pipeline.subunit_filter(&Code::new("x"), 10));

        pipeline
            .preprocess(&mut codebook, "test", input.clone(), 10)
            .unwrap();
        assert_eq!(pipeline.stage(), Stage::Active(1));
        assert_eq!(postprocessed.load(Ordering::SeqCst), 1);
        assert!(!stop.load(Ordering::SeqCst));
    }

    #[test]
    fn test_looping_stage_leaves_on_empty_input() {
        let looping = Recorder {
            looping: true,
            ..Recorder::named("loop")
        };
        let mut pipeline = PipelineConsolidator::new(vec![boxed(looping)]);
        let mut codebook = Codebook::from_codes(codes(&["x"]));

        pipeline
            .preprocess(&mut codebook, "test", codes(&["x"]), 0)
            .unwrap();
        assert_eq!(pipeline.stage(), Stage::Active(0));

        let outcome = pipeline
            .preprocess(&mut codebook, "test", Vec::new(), 1)
            .unwrap();
        assert_eq!(outcome, Preprocessed::Complete);
    }

    #[test]
    fn test_codebook_handoff_is_adopted() {
        let stage = Recorder {
            add_on_preprocess: Some("added".to_string()),
            ..Recorder::named("adder")
        };
        let mut pipeline = PipelineConsolidator::new(vec![boxed(stage)]);
        let mut codebook = Codebook::new();

        let outcome = pipeline
            .preprocess(&mut codebook, "test", codes(&["x"]), 0)
            .unwrap();

        assert!(codebook.contains("added"));
        assert!(codebook.contains("x"));
        match outcome {
            Preprocessed::Units(units) => assert_eq!(units.len(), 2),
            Preprocessed::Complete => panic!("pipeline ended early"),
        }
    }

    #[test]
    fn test_codes_handoff_from_parse_is_adopted() {
        let stage = Recorder {
            rename_on_parse: Some(("x".to_string(), "renamed".to_string())),
            ..Recorder::named("renamer")
        };
        let mut pipeline = PipelineConsolidator::new(vec![boxed(stage)]);
        let mut codebook = Codebook::new();
        pipeline
            .preprocess(&mut codebook, "test", codes(&["x", "y"]), 0)
            .unwrap();

        let outcome = pipeline
            .parse_response(&mut codebook, &["ok"], &codes(&["x"]), 0, 0)
            .unwrap();

        assert_eq!(outcome, ParseOutcome::CursorDelta(0));
        assert!(!codebook.contains("x"));
        assert_eq!(
            codebook.get("renamed").unwrap().alternatives,
            vec!["x".to_string()]
        );
    }

    #[test]
    fn test_base_temperature_applies_to_stages_without_one() {
        let mut pipeline =
            PipelineConsolidator::new(vec![boxed(Recorder::named("a"))]).with_temperature(0.7);
        let mut codebook = Codebook::new();
        assert_eq!(pipeline.cache_namespace(), "pipeline");

        pipeline
            .preprocess(&mut codebook, "test", codes(&["x"]), 0)
            .unwrap();

        assert!((pipeline.temperature() - 0.7).abs() < 1e-6);
        assert_eq!(pipeline.cache_namespace(), "a");
    }

    #[test]
    fn test_existing_codebook_must_match_incoming_codes() {
        let mut pipeline = PipelineConsolidator::new(vec![boxed(Recorder::named("a"))]);
        let mut codebook = Codebook::from_codes(codes(&["kept"]));

        let err = pipeline
            .preprocess(&mut codebook, "test", codes(&["ignored"]), 0)
            .unwrap_err();
        assert!(matches!(err, LoomError::Config(_)));
        assert!(codebook.contains("kept"));
        assert_eq!(pipeline.stage(), Stage::NotStarted);
    }

    #[test]
    fn test_existing_codebook_with_matching_codes() {
        let mut pipeline = PipelineConsolidator::new(vec![boxed(Recorder::named("a"))]);
        let mut codebook = Codebook::from_codes(codes(&["kept", "other"]));

        pipeline
            .preprocess(&mut codebook, "test", codes(&["other", "kept"]), 0)
            .unwrap();
        assert_eq!(codebook.len(), 2);

        let mut fresh = PipelineConsolidator::new(vec![boxed(Recorder::named("a"))]);
        let mut existing = Codebook::from_codes(codes(&["kept"]));
        let out = fresh
            .preprocess(&mut existing, "test", Vec::new(), 0)
            .unwrap();
        assert!(matches!(out, Preprocessed::Units(units) if units.len() == 1));
    }

    #[test]
    fn test_shuffle_is_reproducible() {
        let labels: Vec<String> = (0..20).map(|i| format!("code-{:02}", i)).collect();
        let input: Vec<Code> = labels.iter().map(|l| Code::new(l.clone())).collect();

        let run = |seed: u64| {
            let received = Arc::new(Mutex::new(Vec::new()));
            let stage = Recorder {
                received: received.clone(),
                ..Recorder::named("recorder")
            };
            let mut pipeline = PipelineConsolidator::new(vec![boxed(stage)]).with_seed(seed);
            let mut codebook = Codebook::new();
            pipeline
                .preprocess(&mut codebook, "test", input.clone(), 0)
                .unwrap();
            let seen = received.lock().unwrap()[0].clone();
            seen
        };

        let first = run(42);
        assert_eq!(first, run(42));

        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(sorted, labels);
    }

    #[test]
    fn test_empty_pipeline_completes_immediately() {
        let mut pipeline = PipelineConsolidator::new(Vec::new());
        let mut codebook = Codebook::new();
        let outcome = pipeline
            .preprocess(&mut codebook, "test", codes(&["x"]), 0)
            .unwrap();
        assert_eq!(outcome, Preprocessed::Complete);
        assert_eq!(codebook.len(), 1);
    }

    /// Counts attempts and answers every chunk in full.
    #[derive(Default)]
    struct CountingAction {
        calls: usize,
    }

    #[async_trait]
    impl ChunkAction<PipelineConsolidator> for CountingAction {
        async fn run(
            &mut self,
            strategy: &mut PipelineConsolidator,
            analysis: &mut Codebook,
            source: &str,
            step: ChunkStep<'_, Code>,
        ) -> Result<isize> {
            self.calls += 1;
            strategy.build_prompts(analysis, source, step.units, step.chunk_start, step.iteration)?;
            strategy.parse_response(analysis, &[], step.units, step.chunk_start, step.iteration)?;
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_pipeline_runs_through_chunk_loop() {
        let postprocessed = Arc::new(AtomicUsize::new(0));
        let recorder = Recorder {
            postprocessed: postprocessed.clone(),
            ..Recorder::named("recorder")
        };
        let mut pipeline =
            PipelineConsolidator::new(vec![boxed(DuplicateMerger::new()), boxed(recorder)]);
        let mut codebook = Codebook::new();
        let mut action = CountingAction::default();

        let report = ChunkLoop::new(Arc::new(Session::new()))
            .with_max_items(2)
            .run(
                &mut pipeline,
                &mut codebook,
                "test",
                codes(&["Peer Support", "peer_support", "coping"]),
                &mut action,
            )
            .await
            .unwrap();

        assert_eq!(pipeline.stage(), Stage::Complete);
        assert_eq!(report.iterations, 2);
        assert_eq!(codebook.len(), 2);
        assert_eq!(postprocessed.load(Ordering::SeqCst), 1);
        // duplicate stage: one whole-list chunk; recorder stage: whole list again
        assert_eq!(action.calls, 2);
    }
}
