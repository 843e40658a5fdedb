use std::fmt;
use std::path::PathBuf;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Sentinel stored in the workflow file for the previous-node input.
const PREVIOUS_SENTINEL: &str = "previous";

/// Sentinel stored in the workflow file for the global base image.
const GLOBAL_SENTINEL: &str = "global";

/// A node's declared input source.
///
/// Serialized as a bare string: `"previous"`, `"global"`, or the literal
/// name of an earlier node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentSelector {
    /// Output of the node immediately before this one; the global base
    /// image when the node is first in the list.
    Previous,
    /// The run's global base image.
    Global,
    /// Output of an earlier node, addressed by its resolved name.
    Node(String),
}

impl ParentSelector {
    /// The string form used in the workflow file.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Previous => PREVIOUS_SENTINEL,
            Self::Global => GLOBAL_SENTINEL,
            Self::Node(name) => name,
        }
    }
}

impl From<String> for ParentSelector {
    fn from(value: String) -> Self {
        match value.as_str() {
            PREVIOUS_SENTINEL => Self::Previous,
            GLOBAL_SENTINEL => Self::Global,
            _ => Self::Node(value),
        }
    }
}

impl Default for ParentSelector {
    fn default() -> Self {
        Self::Previous
    }
}

impl fmt::Display for ParentSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ParentSelector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ParentSelector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(String::deserialize(deserializer)?.into())
    }
}

/// One pipeline stage: an instruction, an optional reference image, and an
/// input selector.
///
/// Every field is optional in the file; missing keys fall back to their
/// defaults so hand-written workflows stay terse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Display name. May be empty (a positional fallback applies) and is
    /// not required to be unique.
    #[serde(default)]
    pub name: String,

    /// Auxiliary instruction appended to the system prompt for this stage.
    #[serde(default)]
    pub prompt: String,

    /// Optional reference image sent alongside the input (pose sheets,
    /// style boards).
    #[serde(default)]
    pub image_path: Option<PathBuf>,

    /// Where this stage's input image comes from.
    #[serde(default)]
    pub parent: ParentSelector,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: String::new(),
            image_path: None,
            parent: ParentSelector::Previous,
        }
    }

    /// With an auxiliary instruction.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// With a reference image.
    pub fn with_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_path = Some(path.into());
        self
    }

    /// With an input selector.
    pub fn with_parent(mut self, parent: ParentSelector) -> Self {
        self.parent = parent;
        self
    }

    /// The label used for cache entries and output files: the trimmed
    /// display name, or `node_{index + 1}` when the name is empty.
    pub fn resolved_name(&self, index: usize) -> String {
        let trimmed = self.name.trim();
        if trimmed.is_empty() {
            format!("node_{}", index + 1)
        } else {
            trimmed.to_string()
        }
    }
}

/// An ordered node list plus a display name.
///
/// The name is taken from the workflow file's stem on load and is not
/// persisted inside the JSON.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Workflow {
    pub name: String,
    pub nodes: Vec<Node>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    pub fn push(&mut self, node: Node) {
        self.nodes.push(node);
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Position of the first node whose resolved name matches `name`.
    pub fn find_node(&self, name: &str) -> Option<usize> {
        self.nodes
            .iter()
            .enumerate()
            .find(|(index, node)| node.resolved_name(*index) == name)
            .map(|(index, _)| index)
    }
}
