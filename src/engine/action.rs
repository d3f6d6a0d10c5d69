//! Chunk Actions
//!
//! The chunk loop delegates the request/parse step of every attempt to a
//! [`ChunkAction`]. It receives the chunk window and answers with a relative
//! cursor correction. [`ModelAction`] is the standard one: build prompts, ask
//! the model, parse the answer.

use async_trait::async_trait;
use tracing::debug;

use super::strategy::{ParseOutcome, Strategy};
use crate::ai::request::Requester;
use crate::types::{LoomError, Result};

/// One attempt on one chunk window
#[derive(Debug)]
pub struct ChunkStep<'a, U> {
    /// Window `[start, end)` including prefetch/postfetch context
    pub units: &'a [U],
    /// Offset of the cursor inside `units`
    pub chunk_start: usize,
    /// Whether this is the first chunk of the iteration
    pub is_first: bool,
    /// Attempt number on this chunk, starting at 0
    pub tries: usize,
    pub iteration: usize,
}

#[async_trait]
pub trait ChunkAction<S: Strategy + ?Sized>: Send {
    /// Returns the cursor correction relative to the nominal chunk end.
    /// Changes made to `analysis` by an attempt that fails are undone by the
    /// chunk loop.
    async fn run(
        &mut self,
        strategy: &mut S,
        analysis: &mut S::Analysis,
        source: &S::Source,
        step: ChunkStep<'_, S::Unit>,
    ) -> Result<isize>;
}

// =============================================================================
// Model Action
// =============================================================================

/// build prompts → request → parse
pub struct ModelAction {
    requester: Requester,
}

impl ModelAction {
    pub fn new(requester: Requester) -> Self {
        Self { requester }
    }

    pub fn requester(&self) -> &Requester {
        &self.requester
    }
}

#[async_trait]
impl<S> ChunkAction<S> for ModelAction
where
    S: Strategy + ?Sized,
{
    async fn run(
        &mut self,
        strategy: &mut S,
        analysis: &mut S::Analysis,
        source: &S::Source,
        step: ChunkStep<'_, S::Unit>,
    ) -> Result<isize> {
        let Some(prompts) = strategy.build_prompts(
            analysis,
            source,
            step.units,
            step.chunk_start,
            step.iteration,
        )?
        else {
            debug!(
                strategy = strategy.name(),
                chunk_start = step.chunk_start,
                "No prompts for chunk, skipping request"
            );
            return Ok(0);
        };

        let temperature = strategy.retry_temperature(step.tries);
        let namespace = strategy.cache_namespace().to_string();
        let response = self
            .requester
            .request(&prompts, &namespace, temperature)
            .await?;

        let lines: Vec<&str> = response.lines().collect();
        let outcome = strategy.parse_response(
            analysis,
            &lines,
            step.units,
            step.chunk_start,
            step.iteration,
        )?;

        if let ParseOutcome::ItemResults(items) = &outcome
            && let Some(index) = items
                .keys()
                .find(|&&index| index == 0 || index > step.units.len())
        {
            return Err(LoomError::invalid_response(format!(
                "Item {} is outside the chunk of {} subunits",
                index,
                step.units.len()
            )));
        }

        Ok(outcome.correction())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::provider::testing::ScriptedProvider;
    use crate::ai::session::Session;
    use crate::engine::chunk_loop::ChunkLoop;
    use crate::engine::strategy::Prompts;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    /// Echoes one numbered line per subunit; the parser keeps what it sees.
    struct Labeler {
        prompts: bool,
        item_results: bool,
    }

    impl Strategy for Labeler {
        type Unit = String;
        type Analysis = Vec<String>;
        type Source = str;

        fn name(&self) -> &str {
            "labeler"
        }

        fn build_prompts(
            &mut self,
            _analysis: &mut Vec<String>,
            source: &str,
            subunits: &[String],
            chunk_start: usize,
            _iteration: usize,
        ) -> Result<Option<Prompts>> {
            if !self.prompts {
                return Ok(None);
            }
            Ok(Some(Prompts::new(
                source,
                subunits[chunk_start..].join("\n"),
            )))
        }

        fn parse_response(
            &mut self,
            analysis: &mut Vec<String>,
            lines: &[&str],
            subunits: &[String],
            chunk_start: usize,
            _iteration: usize,
        ) -> Result<ParseOutcome> {
            analysis.extend(lines.iter().map(|l| l.to_string()));
            if self.item_results {
                let items: BTreeMap<usize, String> = lines
                    .iter()
                    .enumerate()
                    .map(|(i, l)| (i + 1, l.to_string()))
                    .collect();
                return Ok(ParseOutcome::ItemResults(items));
            }
            let requested = (subunits.len() - chunk_start) as isize;
            Ok(ParseOutcome::CursorDelta(lines.len() as isize - requested))
        }
    }

    fn action(provider: Arc<ScriptedProvider>) -> ModelAction {
        ModelAction::new(Requester::new(provider, Arc::new(Session::new())))
    }

    fn units(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("u{}", i)).collect()
    }

    fn step(units: &[String], tries: usize) -> ChunkStep<'_, String> {
        ChunkStep {
            units,
            chunk_start: 0,
            is_first: true,
            tries,
            iteration: 0,
        }
    }

    #[tokio::test]
    async fn test_partial_answer_gives_negative_correction() {
        let provider = Arc::new(ScriptedProvider::replying("a\nb"));
        let mut action = action(provider.clone());
        let mut strategy = Labeler {
            prompts: true,
            item_results: false,
        };
        let mut analysis = Vec::new();
        let window = units(3);

        let correction = action
            .run(&mut strategy, &mut analysis, "sys", step(&window, 0))
            .await
            .unwrap();

        assert_eq!(correction, -1);
        assert_eq!(analysis, vec!["a", "b"]);
        let (system, user, _) = provider.prompts.lock().unwrap()[0].clone();
        assert_eq!(system, "sys");
        assert_eq!(user, "u0\nu1\nu2");
    }

    #[tokio::test]
    async fn test_missing_prompts_skip_request() {
        let provider = Arc::new(ScriptedProvider::replying("unused"));
        let mut action = action(provider.clone());
        let mut strategy = Labeler {
            prompts: false,
            item_results: false,
        };
        let mut analysis = Vec::new();
        let window = units(2);

        let correction = action
            .run(&mut strategy, &mut analysis, "sys", step(&window, 0))
            .await
            .unwrap();

        assert_eq!(correction, 0);
        assert_eq!(provider.call_count(), 0);
        assert!(analysis.is_empty());
    }

    #[tokio::test]
    async fn test_item_results_outside_window_are_invalid() {
        let provider = Arc::new(ScriptedProvider::replying("a\nb\nc"));
        let mut action = action(provider);
        let mut strategy = Labeler {
            prompts: true,
            item_results: true,
        };
        let mut analysis = Vec::new();
        let window = units(2);

        let err = action
            .run(&mut strategy, &mut analysis, "sys", step(&window, 0))
            .await
            .unwrap_err();

        assert!(matches!(err, LoomError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_rejected_answer_leaves_no_items_behind() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok("a\nb\nc".to_string()),
            Ok("x\ny".to_string()),
        ]));
        let session = Arc::new(Session::new());
        let mut action =
            ModelAction::new(Requester::new(provider.clone(), session.clone()).with_cache(false));
        let mut strategy = Labeler {
            prompts: true,
            item_results: true,
        };
        let mut analysis = Vec::new();

        let report = ChunkLoop::new(session)
            .with_max_items(2)
            .run(&mut strategy, &mut analysis, "sys", units(2), &mut action)
            .await
            .unwrap();

        assert_eq!(report.failed_attempts, 1);
        assert_eq!(provider.call_count(), 2);
        assert_eq!(analysis, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_retries_raise_temperature() {
        let provider = Arc::new(ScriptedProvider::replying("a"));
        let mut action = action(provider.clone());
        let mut strategy = Labeler {
            prompts: true,
            item_results: true,
        };
        let mut analysis = Vec::new();
        let window = units(1);

        action
            .run(&mut strategy, &mut analysis, "sys", step(&window, 0))
            .await
            .unwrap();
        action
            .run(&mut strategy, &mut analysis, "sys", step(&window, 1))
            .await
            .unwrap();

        let prompts = provider.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].2 > prompts[0].2);
    }
}
