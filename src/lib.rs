//! codeloom - Adaptive Chunked LLM Analysis
//!
//! Drives an LLM over long ordered inputs (transcript lines, codebook
//! entries) in adaptively sized chunks, with retries, cursor corrections and
//! multi-pass iteration. Codebook consolidation is built on top of it as a
//! pipeline of refinement stages.
//!
//! ## Quick Start
//!
//! ```ignore
//! use codeloom::ai::{create_provider, create_shared_session, ProviderConfig, Requester};
//! use codeloom::engine::{ChunkLoop, ModelAction};
//!
//! let session = create_shared_session();
//! let provider = create_provider(&ProviderConfig::default())?;
//! let mut action = ModelAction::new(Requester::new(provider, session.clone()));
//! let report = ChunkLoop::new(session)
//!     .run(&mut strategy, &mut analysis, source, subunits, &mut action)
//!     .await?;
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: strategy contract and the chunk-loop driver
//! - [`consolidate`]: consolidators and the pipeline orchestrator
//! - [`ai`]: LLM providers, request collaborator, session counters
//! - [`config`]: layered configuration
//! - [`types`]: codes, codebooks, error taxonomy

pub mod ai;
pub mod cli;
pub mod config;
pub mod consolidate;
pub mod constants;
pub mod engine;
pub mod types;

// =============================================================================
// Core Re-exports
// =============================================================================

pub use config::{Config, ConfigLoader};
pub use types::{Code, Codebook, ErrorCategory, LoomError, Result};

pub use engine::{
    ChunkAction, ChunkDecision, ChunkLoop, LoopReport, ModelAction, ParseOutcome, Preprocessed,
    Prompts, Strategy, loop_through_chunk,
};

pub use consolidate::{
    Consolidator, DefinitionGenerator, DuplicateMerger, PipelineConsolidator, RefineMerger,
};

pub use ai::{LlmProvider, Requester, Session, SharedSession, TimeoutConfig, create_provider};
