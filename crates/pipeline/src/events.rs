use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Progress reports emitted by a run and drained by the presentation layer.
///
/// Exactly one terminal event (`RunCompleted` or `RunFailed`) is emitted
/// per background run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// Human-readable status line.
    Status(String),

    /// One (batch, node) output was generated and written to disk.
    NodeFinished {
        batch: u32,
        node: String,
        path: PathBuf,
    },

    /// The whole run succeeded.
    RunCompleted { images: usize },

    /// The run aborted; images already written stay on disk.
    RunFailed { message: String },
}

impl PipelineEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunCompleted { .. } | Self::RunFailed { .. })
    }
}
