//! Chunk-Loop Driver
//!
//! Turns a [`Strategy`] into an iterate / chunk / retry / advance loop:
//!
//! ```text
//! for iteration in 0..max_iterations
//!     subunits = preprocess(subunits)          empty -> next, Complete -> stop
//!     filtered = subunits.filter(subunit_filter)
//!     cursor = 0
//!     while cursor < filtered.len()
//!         for tries in 0..retries
//!             chunk_size(...)                  Abort -> end iteration
//!             action(window)                   -> correction
//!             size + correction > 0            -> success, leave retry loop
//!         cursor += size + correction
//!     on_iterate(iteration, analysis)
//! ```
//!
//! ## Accounting
//!
//! Every attempt adds its chunk size to the session's expected items. A
//! successful attempt adds `size + correction` to the finished items; a failed
//! one adds `size`, so expected and finished stay comparable across retries.
//!
//! The analysis is restored to its state before a failed attempt, so only
//! accepted answers are ever recorded.

use tracing::{debug, info, instrument, warn};

use super::action::{ChunkAction, ChunkStep};
use super::strategy::{ChunkDecision, Preprocessed, Strategy};
use crate::ai::session::SharedSession;
use crate::constants::engine::{DEFAULT_MAX_ITEMS, DEFAULT_RETRIES};
use crate::types::{LoomError, Result};

/// Hook run after each completed iteration
pub type IterateHook<'h, A> = Box<dyn FnMut(usize, &mut A) -> Result<()> + Send + 'h>;

/// What one run of the loop did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopReport {
    /// Iterations that reached chunking
    pub iterations: usize,
    /// Iterations skipped because preprocess returned nothing
    pub skipped_iterations: usize,
    /// Iterations ended early by the strategy
    pub aborted_iterations: usize,
    /// Chunks that advanced the cursor
    pub chunks: usize,
    pub attempts: usize,
    pub failed_attempts: usize,
}

pub struct ChunkLoop<'h, A> {
    session: SharedSession,
    retries: usize,
    max_items: usize,
    on_iterate: Option<IterateHook<'h, A>>,
}

impl<'h, A> ChunkLoop<'h, A> {
    pub fn new(session: SharedSession) -> Self {
        Self {
            session,
            retries: DEFAULT_RETRIES,
            max_items: DEFAULT_MAX_ITEMS,
            on_iterate: None,
        }
    }

    /// Attempts per chunk; at least one.
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries.max(1);
        self
    }

    /// Upper bound of the recommended chunk size; at least one.
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items.max(1);
        self
    }

    pub fn on_iterate(mut self, hook: impl FnMut(usize, &mut A) -> Result<()> + Send + 'h) -> Self {
        self.on_iterate = Some(Box::new(hook));
        self
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    #[instrument(skip_all, fields(strategy = %strategy.name(), subunits = subunits.len()))]
    pub async fn run<S, Act>(
        &mut self,
        strategy: &mut S,
        analysis: &mut A,
        source: &S::Source,
        mut subunits: Vec<S::Unit>,
        action: &mut Act,
    ) -> Result<LoopReport>
    where
        A: Clone,
        S: Strategy<Analysis = A> + ?Sized,
        Act: ChunkAction<S> + ?Sized,
    {
        let mut report = LoopReport::default();
        let max_iterations = strategy.max_iterations();

        let mut iteration = 0;
        while iteration < max_iterations {
            subunits = match strategy.preprocess(analysis, source, subunits, iteration)? {
                Preprocessed::Complete => {
                    debug!(iteration, "Strategy reported completion");
                    break;
                }
                Preprocessed::Units(units) => units,
            };

            if subunits.is_empty() {
                debug!(iteration, "No subunits after preprocess, skipping iteration");
                report.skipped_iterations += 1;
                iteration += 1;
                continue;
            }

            let filtered: Vec<S::Unit> = subunits
                .iter()
                .filter(|unit| strategy.subunit_filter(unit, iteration))
                .cloned()
                .collect();

            info!(
                iteration,
                subunits = subunits.len(),
                filtered = filtered.len(),
                "Iteration started"
            );

            self.run_iteration(strategy, analysis, source, &filtered, action, iteration, &mut report)
                .await?;
            report.iterations += 1;

            if let Some(hook) = self.on_iterate.as_mut() {
                hook(iteration, analysis)?;
            }
            iteration += 1;
        }

        info!(
            iterations = report.iterations,
            chunks = report.chunks,
            failed_attempts = report.failed_attempts,
            "Chunk loop finished"
        );
        Ok(report)
    }

    /// Run a batch of top-level units with the same strategy. The strategy's
    /// `batch_preprocess` sees all of them first; each unit then runs on its
    /// own, and one unit's failure does not stop the others.
    pub async fn run_batch<S, Act>(
        &mut self,
        strategy: &mut S,
        analyses: &mut [A],
        sources: &[&S::Source],
        units: Vec<Vec<S::Unit>>,
        action: &mut Act,
    ) -> Result<Vec<Result<LoopReport>>>
    where
        A: Clone,
        S: Strategy<Analysis = A> + ?Sized,
        Act: ChunkAction<S> + ?Sized,
    {
        if analyses.len() != units.len() || sources.len() != units.len() {
            return Err(LoomError::Config(format!(
                "Batch size mismatch: {} analyses, {} sources, {} unit lists",
                analyses.len(),
                sources.len(),
                units.len()
            )));
        }

        strategy.batch_preprocess(&units, analyses)?;

        let mut reports = Vec::with_capacity(units.len());
        for ((analysis, source), subunits) in analyses.iter_mut().zip(sources).zip(units) {
            let result = self.run(strategy, analysis, source, subunits, action).await;
            if let Err(e) = &result {
                warn!(error = %e, "Batch item failed");
            }
            reports.push(result);
        }
        Ok(reports)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_iteration<S, Act>(
        &self,
        strategy: &mut S,
        analysis: &mut A,
        source: &S::Source,
        filtered: &[S::Unit],
        action: &mut Act,
        iteration: usize,
        report: &mut LoopReport,
    ) -> Result<()>
    where
        A: Clone,
        S: Strategy<Analysis = A> + ?Sized,
        Act: ChunkAction<S> + ?Sized,
    {
        let len = filtered.len();
        let mut cursor = 0usize;

        while cursor < len {
            let remaining = len - cursor;
            let recommended = self.max_items.min(remaining);
            let mut progress = None;

            for tries in 0..self.retries {
                let (size, prefetch, postfetch) =
                    match strategy.chunk_size(recommended, remaining, iteration, tries) {
                        ChunkDecision::Proceed {
                            size,
                            prefetch,
                            postfetch,
                        } if size > 0 => (size, prefetch, postfetch),
                        _ => {
                            debug!(iteration, cursor, "Strategy ended the iteration");
                            report.aborted_iterations += 1;
                            return Ok(());
                        }
                    };

                let start = cursor.saturating_sub(prefetch);
                let end = cursor.saturating_add(size).saturating_add(postfetch).min(len);
                let step = ChunkStep {
                    units: &filtered[start..end],
                    chunk_start: cursor - start,
                    is_first: cursor == 0,
                    tries,
                    iteration,
                };

                debug!(iteration, cursor, size, start, end, tries, "Processing chunk");
                report.attempts += 1;
                self.session.add_expected(size);

                let snapshot = analysis.clone();
                let outcome = action
                    .run(strategy, analysis, source, step)
                    .await
                    .and_then(|correction| net_progress(cursor, size, correction));

                let error = match outcome {
                    Ok(advanced) => {
                        self.session.add_finished(advanced);
                        report.chunks += 1;
                        progress = Some(advanced);
                        break;
                    }
                    Err(e) => e,
                };

                // a failed attempt leaves no trace in the analysis
                *analysis = snapshot;
                self.session.add_finished(size);
                self.session.record_failed_attempt();
                report.failed_attempts += 1;

                if !error.is_recoverable() {
                    return Err(error);
                }

                warn!(
                    iteration,
                    cursor,
                    tries,
                    error = %error,
                    "Chunk attempt failed"
                );

                if tries + 1 == self.retries {
                    return Err(LoomError::internal(
                        format!(
                            "Chunk at {} of iteration {} failed after {} attempts",
                            cursor, iteration, self.retries
                        ),
                        error,
                    ));
                }
            }

            match progress {
                Some(advanced) => cursor = cursor.saturating_add(advanced),
                None => {
                    return Err(LoomError::Config(
                        "Chunk loop needs at least one attempt per chunk".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Subunits an attempt advanced, `size + correction`. Anything not strictly
/// positive, or out of range, is an invalid response.
fn net_progress(cursor: usize, size: usize, correction: isize) -> Result<usize> {
    let advanced = isize::try_from(size)
        .ok()
        .and_then(|size| size.checked_add(correction));
    match advanced {
        Some(advanced) if advanced > 0 => Ok(advanced.unsigned_abs()),
        Some(_) => Err(LoomError::invalid_response(format!(
            "Chunk at {} made no progress (size {}, correction {})",
            cursor, size, correction
        ))),
        None => Err(LoomError::invalid_response(format!(
            "Correction {} overflows chunk at {} (size {})",
            correction, cursor, size
        ))),
    }
}

/// Run `strategy` over `subunits` with default retries and chunk bound.
pub async fn loop_through_chunk<S, Act>(
    strategy: &mut S,
    analysis: &mut S::Analysis,
    source: &S::Source,
    subunits: Vec<S::Unit>,
    action: &mut Act,
    session: SharedSession,
) -> Result<LoopReport>
where
    S: Strategy + ?Sized,
    S::Analysis: Clone,
    Act: ChunkAction<S> + ?Sized,
{
    ChunkLoop::new(session)
        .run(strategy, analysis, source, subunits, action)
        .await
}
