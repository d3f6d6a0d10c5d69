//! Consolidate Command
//!
//! Runs a codebook through the consolidation pipeline:
//! duplicates → definitions → refine.
//!
//! Usage:
//!   codeloom consolidate codes.yaml [-o merged.yaml] [--skip-definitions] [--skip-refine]

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::ai::{
    ProviderConfig, Requester, SessionSummary, SharedProvider, TimeoutConfig, create_provider,
    create_shared_session, with_timeout,
};
use crate::cli::Output;
use crate::config::{Config, ConfigLoader};
use crate::consolidate::{
    Consolidator, DefinitionGenerator, DuplicateMerger, PipelineConsolidator, RefineMerger,
};
use crate::engine::{ChunkLoop, LoopReport, ModelAction};
use crate::types::{Codebook, Result};

/// Consolidate run options (consolidated CLI parameters)
#[derive(Debug, Clone, Default)]
pub struct ConsolidateOptions {
    /// Input codebook (JSON or YAML)
    pub codebook: PathBuf,
    /// Output path; `<input>.consolidated.<ext>` when unset
    pub output: Option<PathBuf>,
    /// LLM provider override
    pub provider: Option<String>,
    /// Model override
    pub model: Option<String>,
    /// Shuffle seed override
    pub seed: Option<u64>,
    /// Research question quoted in prompts
    pub context: Option<String>,
    pub stages: StageSelection,
    pub quiet: bool,
}

/// Optional pipeline stages. Duplicate merging always runs.
#[derive(Debug, Clone)]
pub struct StageSelection {
    pub definitions: bool,
    pub refine: bool,
}

impl Default for StageSelection {
    fn default() -> Self {
        Self {
            definitions: true,
            refine: true,
        }
    }
}

/// What a consolidation run produced
#[derive(Debug)]
pub struct ConsolidationResult {
    pub codebook: Codebook,
    pub report: LoopReport,
    pub summary: SessionSummary,
}

/// Run the consolidate command
pub fn run(options: ConsolidateOptions) -> Result<()> {
    let output = Output::quiet(options.quiet);

    let mut config = ConfigLoader::load()?;
    if let Some(provider) = &options.provider {
        config.llm.provider = provider.clone();
    }
    if let Some(model) = &options.model {
        config.llm.model = Some(model.clone());
    }
    if let Some(seed) = options.seed {
        config.consolidation.seed = seed;
    }
    config.validate()?;

    let input = Codebook::load(&options.codebook)?;
    let output_path = options
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&options.codebook));

    output.section("Consolidating codebook");
    output.field("Input", options.codebook.display());
    output.field("Codes", input.len());

    let provider = create_provider(&ProviderConfig::from(&config))?;
    output.field("Provider", format!("{} ({})", provider.name(), provider.model()));
    info!(provider = provider.name(), model = provider.model(), "Using LLM provider");

    let rt = Runtime::new()?;
    let timeouts = TimeoutConfig::default();
    if !rt.block_on(provider_is_healthy(&provider, timeouts.health_check)) {
        output.warning(&format!(
            "Provider '{}' did not answer the health check; continuing anyway",
            provider.name()
        ));
    }

    let result = rt.block_on(consolidate(
        provider,
        input,
        &config,
        &options.stages,
        options.context.as_deref(),
    ))?;

    result.codebook.save(&output_path)?;

    output.success(&format!(
        "Wrote {} codes to {}",
        result.codebook.len(),
        output_path.display()
    ));
    output.field("Iterations", result.report.iterations);
    output.field("Chunks", result.report.chunks);
    output.session(&result.summary);
    debug!("{}", result.summary.display());

    Ok(())
}

/// Health check bounded by `timeout`. Errors and timeouts count as unhealthy.
pub async fn provider_is_healthy(provider: &SharedProvider, timeout: Duration) -> bool {
    match with_timeout(timeout, provider.health_check(), "health check").await {
        Ok(healthy) => healthy,
        Err(e) => {
            debug!(provider = provider.name(), error = %e, "Health check failed");
            false
        }
    }
}

/// Stages in run order for `selection`
pub fn build_pipeline(
    config: &Config,
    selection: &StageSelection,
    context: Option<&str>,
) -> PipelineConsolidator {
    let mut stages: Vec<Box<dyn Consolidator>> = vec![Box::new(DuplicateMerger::new())];

    if selection.definitions {
        stages.push(Box::new(
            DefinitionGenerator::new().with_context(context.unwrap_or_default()),
        ));
    }
    if selection.refine {
        stages.push(Box::new(
            RefineMerger::new(config.consolidation.refine_max_rounds)
                .with_context(context.unwrap_or_default()),
        ));
    }

    PipelineConsolidator::new(stages)
        .with_seed(config.consolidation.seed)
        .with_temperature(config.llm.temperature)
}

/// Run the pipeline over `codebook` with the chunk loop.
pub async fn consolidate(
    provider: SharedProvider,
    codebook: Codebook,
    config: &Config,
    selection: &StageSelection,
    context: Option<&str>,
) -> Result<ConsolidationResult> {
    let session = create_shared_session();
    let requester = Requester::new(provider, session.clone())
        .with_timeout(Duration::from_secs(config.llm.timeout_secs))
        .with_transport_retries(config.engine.transport_retries)
        .with_cache(config.engine.cache_responses);
    let max_items = requester.max_items();

    let mut pipeline = build_pipeline(config, selection, context);
    let mut action = ModelAction::new(requester);
    let mut current = Codebook::new();

    info!(
        stages = ?pipeline.stage_names(),
        codes = codebook.len(),
        max_items,
        "Starting consolidation"
    );

    let report = ChunkLoop::new(session.clone())
        .with_retries(config.engine.retries)
        .with_max_items(max_items)
        .on_iterate(|iteration: usize, codebook: &mut Codebook| {
            debug!(iteration, codes = codebook.len(), "Iteration finished");
            Ok(())
        })
        .run(
            &mut pipeline,
            &mut current,
            "consolidate",
            codebook.into_codes(),
            &mut action,
        )
        .await?;

    if current.merged_count() > 0 {
        warn!(
            merged = current.merged_count(),
            "Merged placeholders left after the pipeline finished"
        );
    }

    Ok(ConsolidationResult {
        codebook: current,
        report,
        summary: session.snapshot(),
    })
}

/// `codes.yaml` → `codes.consolidated.yaml`, JSON when the input has no extension
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("codebook");
    let extension = input
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("json");
    input.with_file_name(format!("{}.consolidated.{}", stem, extension))
}
