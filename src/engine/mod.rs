//! Adaptive Chunked-Analysis Engine
//!
//! - `strategy`: the hooks a caller implements (chunk size, filter, prompts, parse)
//! - `chunk_loop`: the driver owning cursor, retries and iterations
//! - `action`: the per-chunk request/parse step

pub mod action;
pub mod chunk_loop;
pub mod strategy;

pub use action::{ChunkAction, ChunkStep, ModelAction};
pub use chunk_loop::{ChunkLoop, IterateHook, LoopReport, loop_through_chunk};
pub use strategy::{ChunkDecision, ParseOutcome, Preprocessed, Prompts, Strategy};
