use std::collections::HashMap;

use image::DynamicImage;

/// Transient mapping of stage labels to produced images, valid for one
/// batch run.
///
/// The base image sits in its own slot rather than in the produced map, so
/// a failed lookup of a node output never has to touch (or be confused
/// with) the base entry.
#[derive(Default)]
pub struct OutputCache {
    base: Option<DynamicImage>,
    produced: HashMap<String, DynamicImage>,
}

impl OutputCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh batch: drop every produced entry and install the
    /// batch's base image.
    pub fn reset(&mut self, base: DynamicImage) {
        self.produced.clear();
        self.base = Some(base);
    }

    pub fn has_base(&self) -> bool {
        self.base.is_some()
    }

    /// Install the base image without clearing produced entries (lazy seed
    /// for single-node runs on a cold cache).
    pub fn set_base(&mut self, base: DynamicImage) {
        self.base = Some(base);
    }

    pub fn base(&self) -> Option<&DynamicImage> {
        self.base.as_ref()
    }

    /// Record a node's output. Later inserts under the same label overwrite
    /// earlier ones, so duplicate node names resolve to the most recent
    /// output.
    pub fn insert(&mut self, label: impl Into<String>, image: DynamicImage) {
        self.produced.insert(label.into(), image);
    }

    pub fn get(&self, label: &str) -> Option<&DynamicImage> {
        self.produced.get(label)
    }

    pub fn produced_len(&self) -> usize {
        self.produced.len()
    }

    pub fn produced_labels(&self) -> impl Iterator<Item = &str> {
        self.produced.keys().map(String::as_str)
    }
}
