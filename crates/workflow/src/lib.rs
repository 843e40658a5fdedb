//! Workflow model and persistence for chained image-generation pipelines.
//!
//! A workflow is an ordered list of nodes; each node carries an instruction,
//! an optional reference image, and a selector naming where its input image
//! comes from. Workflows are saved as a flat JSON array so they can be
//! edited by hand and shared between installs.

pub mod credentials;
pub mod node;
pub mod paths;
pub mod prompt;
pub mod store;

pub use node::{Node, ParentSelector, Workflow};
pub use paths::AppPaths;
pub use prompt::SystemPrompt;
pub use store::{load_workflow, save_workflow, StoreError};
