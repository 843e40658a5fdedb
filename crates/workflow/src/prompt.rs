use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// System prompt shared by every stage of a run.
///
/// Loaded from a JSON file of the form `{"prompt": "..."}`; the field may
/// be omitted, which yields an empty instruction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemPrompt {
    #[serde(default)]
    pub prompt: String,
}

impl SystemPrompt {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read system prompt {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse system prompt {}", path.display()))
    }
}
