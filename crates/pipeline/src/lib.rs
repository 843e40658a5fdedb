//! Pipeline execution for chained generative image edits.
//!
//! The executor walks an ordered node list, resolving each node's input
//! from a batch-scoped output cache, calling the generation API once per
//! node, and writing every produced image to disk. A background run handle
//! carries progress events to the presentation layer over a channel.

pub mod cache;
pub mod client;
pub mod error;
pub mod events;
pub mod executor;
pub mod runner;

pub use cache::OutputCache;
pub use client::{GeminiClient, ImageGenerator, DEFAULT_MODEL};
pub use error::PipelineError;
pub use events::PipelineEvent;
pub use executor::{NodeOutput, PipelineExecutor, RunSettings, RunSummary};
pub use runner::{spawn_pipeline_run, RunHandle};
