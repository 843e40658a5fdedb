use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::node::{Node, Workflow};

/// Failures while loading or saving workflow files.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read workflow file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write workflow file {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("workflow file {} is not a valid node list", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode workflow")]
    Encode(#[source] serde_json::Error),
}

/// Save a workflow as a flat, pretty-printed JSON array of node records.
///
/// Reference image paths under `base_dir` are stored relative to it so the
/// file survives a relocated install; paths outside `base_dir` are kept
/// absolute.
pub fn save_workflow(path: &Path, workflow: &Workflow, base_dir: &Path) -> Result<(), StoreError> {
    let records: Vec<Node> = workflow
        .nodes
        .iter()
        .cloned()
        .map(|mut node| {
            if let Some(image_path) = node.image_path.take() {
                node.image_path = Some(relativize(&image_path, base_dir));
            }
            node
        })
        .collect();

    let json = serde_json::to_string_pretty(&records).map_err(StoreError::Encode)?;
    fs::write(path, json).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Load a workflow from a JSON node list.
///
/// Relative reference image paths are resolved against `base_dir`; the
/// workflow's display name comes from the file stem.
pub fn load_workflow(path: &Path, base_dir: &Path) -> Result<Workflow, StoreError> {
    let raw = fs::read_to_string(path).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut nodes: Vec<Node> = serde_json::from_str(&raw).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    for node in &mut nodes {
        if let Some(image_path) = node.image_path.take() {
            node.image_path = Some(if image_path.is_absolute() {
                image_path
            } else {
                base_dir.join(image_path)
            });
        }
    }

    let name = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("untitled")
        .to_string();

    Ok(Workflow { name, nodes })
}

fn relativize(path: &Path, base_dir: &Path) -> PathBuf {
    path.strip_prefix(base_dir)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| path.to_path_buf())
}
