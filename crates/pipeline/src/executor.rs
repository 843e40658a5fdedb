use std::fs;
use std::path::{Path, PathBuf};

use crossbeam_channel::Sender;
use image::DynamicImage;
use tracing::debug;
use workflow::{Node, ParentSelector, Workflow};

use crate::cache::OutputCache;
use crate::client::ImageGenerator;
use crate::error::PipelineError;
use crate::events::PipelineEvent;

/// Fixed preamble sent ahead of every request.
const INSTRUCTIONAL_PREAMBLE: &str = "You are an image generation pipeline. Follow the user's instructions precisely. Generate a single image as the output. Do not respond with text.";

/// Inputs shared by every stage of a run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Image every batch starts from.
    pub base_image: PathBuf,

    /// System instruction shared by all stages.
    pub system_prompt: String,

    /// Root directory for generated images; each workflow gets its own
    /// subdirectory under it.
    pub output_root: PathBuf,
}

/// Outcome of a full pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Number of images written: iterations x node count on success.
    pub images: usize,
}

/// Outcome of a single-node run.
#[derive(Debug, Clone)]
pub struct NodeOutput {
    pub node: String,
    pub path: PathBuf,
}

enum FileTag {
    Batch { batch: u32, iterations: u32 },
    Single,
}

/// Walks a node list, feeding each stage's output to the stages that name
/// it, calling the generator once per (batch, node) pair.
pub struct PipelineExecutor<G> {
    generator: G,
    settings: RunSettings,
    cache: OutputCache,
}

impl<G: ImageGenerator> PipelineExecutor<G> {
    pub fn new(generator: G, settings: RunSettings) -> Self {
        Self {
            generator,
            settings,
            cache: OutputCache::new(),
        }
    }

    pub fn cache(&self) -> &OutputCache {
        &self.cache
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Run every node of `workflow`, `iterations` times over.
    ///
    /// Each batch starts from a fresh cache seeded with the base image, so
    /// nothing leaks between batches. Any failure aborts the whole run;
    /// images already written stay on disk. Progress goes out on `events`
    /// (sends to a disconnected channel are dropped).
    pub async fn run_pipeline(
        &mut self,
        workflow: &Workflow,
        iterations: u32,
        events: &Sender<PipelineEvent>,
    ) -> Result<RunSummary, PipelineError> {
        if workflow.nodes.is_empty() {
            return Err(PipelineError::MissingPrerequisite(
                "the workflow has no nodes".to_string(),
            ));
        }

        let mut images = 0usize;
        for batch in 0..iterations {
            let _ = events.send(PipelineEvent::Status(format!(
                "batch {}/{} started",
                batch + 1,
                iterations
            )));

            let base = self.load_base_image()?;
            self.cache.reset(base);

            for (index, node) in workflow.nodes.iter().enumerate() {
                let name = node.resolved_name(index);
                let _ = events.send(PipelineEvent::Status(format!(
                    "batch {}/{} - running node '{}'",
                    batch + 1,
                    iterations,
                    name
                )));

                let output = self.run_node(workflow, index, node).await?;
                let path = self.save_output(
                    &workflow.name,
                    &name,
                    index,
                    FileTag::Batch { batch, iterations },
                    &output,
                )?;
                self.cache.insert(name.clone(), output);
                images += 1;

                let _ = events.send(PipelineEvent::NodeFinished {
                    batch: batch + 1,
                    node: name,
                    path,
                });
            }
        }

        Ok(RunSummary { images })
    }

    /// Run exactly one node against the current cache.
    ///
    /// The cache is not reset and earlier nodes are not replayed; the base
    /// image is seeded lazily when nothing has run yet. A parent that has
    /// not produced an output fails without touching the produced entries.
    pub async fn run_single(
        &mut self,
        workflow: &Workflow,
        index: usize,
    ) -> Result<NodeOutput, PipelineError> {
        let node = workflow.nodes.get(index).ok_or_else(|| {
            PipelineError::MissingPrerequisite(format!(
                "the workflow has no node #{} ({} nodes)",
                index + 1,
                workflow.nodes.len()
            ))
        })?;

        if !self.cache.has_base() {
            let base = self.load_base_image()?;
            self.cache.set_base(base);
        }

        let name = node.resolved_name(index);
        let output = match self.run_node(workflow, index, node).await {
            Ok(output) => output,
            Err(PipelineError::UnresolvedParent { label }) => {
                return Err(PipelineError::UpstreamNotRun { label });
            }
            Err(e) => return Err(e),
        };

        let path = self.save_output(&workflow.name, &name, index, FileTag::Single, &output)?;
        self.cache.insert(name.clone(), output);
        Ok(NodeOutput { node: name, path })
    }

    /// Resolve the node's input, call the generator once, and hand back the
    /// produced image.
    async fn run_node(
        &self,
        workflow: &Workflow,
        index: usize,
        node: &Node,
    ) -> Result<DynamicImage, PipelineError> {
        let input = self.resolve_input(workflow, index, &node.parent)?;
        let reference = match &node.image_path {
            Some(path) => Some(load_image(path)?),
            None => None,
        };

        let prompt = compose_prompt(&self.settings.system_prompt, &node.prompt);
        debug!(generator = self.generator.name(), node = index, "dispatching generation request");
        self.generator
            .generate(&prompt, input, reference.as_ref())
            .await
    }

    /// Look up the image a node reads from, per its parent selector.
    fn resolve_input(
        &self,
        workflow: &Workflow,
        index: usize,
        parent: &ParentSelector,
    ) -> Result<&DynamicImage, PipelineError> {
        match parent {
            ParentSelector::Global => self.base_or_missing(),
            ParentSelector::Previous if index == 0 => self.base_or_missing(),
            ParentSelector::Previous => {
                let label = workflow.nodes[index - 1].resolved_name(index - 1);
                self.cache
                    .get(&label)
                    .ok_or(PipelineError::UnresolvedParent { label })
            }
            ParentSelector::Node(name) => self
                .cache
                .get(name)
                .ok_or_else(|| PipelineError::UnresolvedParent {
                    label: name.clone(),
                }),
        }
    }

    fn base_or_missing(&self) -> Result<&DynamicImage, PipelineError> {
        self.cache.base().ok_or_else(|| {
            PipelineError::MissingPrerequisite("no base image is loaded".to_string())
        })
    }

    fn load_base_image(&self) -> Result<DynamicImage, PipelineError> {
        load_image(&self.settings.base_image)
    }

    fn save_output(
        &self,
        workflow_name: &str,
        node_name: &str,
        index: usize,
        tag: FileTag,
        image: &DynamicImage,
    ) -> Result<PathBuf, PipelineError> {
        let dir = self
            .settings
            .output_root
            .join(sanitize_or(workflow_name, "untitled"));
        fs::create_dir_all(&dir)?;

        let stem = sanitize_or(node_name, &format!("node_{}", index + 1));
        let file_name = match tag {
            FileTag::Batch { batch, iterations } if iterations > 1 => {
                format!("{stem}_batch{}.png", batch + 1)
            }
            FileTag::Batch { .. } => format!("{stem}.png"),
            FileTag::Single => format!("{stem}_single.png"),
        };

        let path = dir.join(file_name);
        image.save(&path)?;
        debug!(path = %path.display(), "saved generated image");
        Ok(path)
    }
}

/// Full prompt for one stage: fixed preamble, shared system prompt, then
/// the node's own instruction.
fn compose_prompt(system_prompt: &str, node_prompt: &str) -> String {
    format!(
        "{INSTRUCTIONAL_PREAMBLE}\n\n## System Prompt:\n{system_prompt}\n\n## User Instruction for this step:\n{node_prompt}"
    )
}

/// Open an image off disk, folding a missing file into the prerequisite
/// taxonomy.
fn load_image(path: &Path) -> Result<DynamicImage, PipelineError> {
    if !path.exists() {
        return Err(PipelineError::MissingPrerequisite(format!(
            "image not found: {}",
            path.display()
        )));
    }
    Ok(image::open(path)?)
}

/// Reduce a display name to a filesystem-safe stem: alphanumerics, spaces,
/// and underscores survive; trailing whitespace is trimmed; spaces become
/// underscores.
pub fn sanitize_name(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ' || *c == '_')
        .collect();
    kept.trim_end().replace(' ', "_")
}

fn sanitize_or(name: &str, fallback: &str) -> String {
    let sanitized = sanitize_name(name);
    if sanitized.is_empty() {
        fallback.to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crossbeam_channel::unbounded;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use workflow::Node;

    /// Echoes its input back as the generated image.
    struct StubGenerator {
        calls: Arc<AtomicUsize>,
        fail_on_call: Option<usize>,
    }

    impl StubGenerator {
        fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                fail_on_call: None,
            }
        }

        fn failing_on(call: usize) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                fail_on_call: Some(call),
            }
        }
    }

    #[async_trait]
    impl ImageGenerator for StubGenerator {
        fn name(&self) -> &str {
            "stub"
        }

        async fn generate(
            &self,
            _prompt: &str,
            input: &DynamicImage,
            _reference: Option<&DynamicImage>,
        ) -> Result<DynamicImage, PipelineError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on_call == Some(call) {
                return Err(PipelineError::Api("stubbed failure".to_string()));
            }
            Ok(input.clone())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        settings: RunSettings,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let base_image = dir.path().join("base.png");
        DynamicImage::new_rgb8(4, 4).save(&base_image).unwrap();
        let settings = RunSettings {
            base_image,
            system_prompt: "keep the character on-model".to_string(),
            output_root: dir.path().join("img"),
        };
        Fixture {
            _dir: dir,
            settings,
        }
    }

    fn executor(generator: StubGenerator, fixture: &Fixture) -> PipelineExecutor<StubGenerator> {
        PipelineExecutor::new(generator, fixture.settings.clone())
    }

    fn three_stage_workflow() -> Workflow {
        let mut workflow = Workflow::new("portrait shoot");
        workflow.push(Node::new("sketch").with_parent(ParentSelector::Global));
        workflow.push(Node::new("pose"));
        workflow.push(Node::new("final").with_parent(ParentSelector::Node("sketch".to_string())));
        workflow
    }

    #[tokio::test]
    async fn test_run_produces_iterations_times_nodes_images() {
        let fx = fixture();
        let mut executor = executor(StubGenerator::new(), &fx);
        let (tx, rx) = unbounded();

        let workflow = three_stage_workflow();
        let summary = executor.run_pipeline(&workflow, 2, &tx).await.unwrap();
        assert_eq!(summary.images, 6);

        let out_dir = fx.settings.output_root.join("portrait_shoot");
        for name in ["sketch", "pose", "final"] {
            for batch in 1..=2 {
                assert!(out_dir.join(format!("{name}_batch{batch}.png")).is_file());
            }
        }

        let finished = rx
            .try_iter()
            .filter(|e| matches!(e, PipelineEvent::NodeFinished { .. }))
            .count();
        assert_eq!(finished, 6);
    }

    #[tokio::test]
    async fn test_single_iteration_files_have_no_batch_suffix() {
        let fx = fixture();
        let mut executor = executor(StubGenerator::new(), &fx);
        let (tx, _rx) = unbounded();

        let workflow = three_stage_workflow();
        executor.run_pipeline(&workflow, 1, &tx).await.unwrap();
        let out_dir = fx.settings.output_root.join("portrait_shoot");
        assert!(out_dir.join("sketch.png").is_file());
        assert!(!out_dir.join("sketch_batch1.png").exists());
    }

    #[tokio::test]
    async fn test_forward_reference_fails_deterministically() {
        let fx = fixture();
        let mut executor = executor(StubGenerator::new(), &fx);
        let (tx, _rx) = unbounded();

        let mut workflow = Workflow::new("w");
        workflow.push(Node::new("first").with_parent(ParentSelector::Node("later".to_string())));
        workflow.push(Node::new("later"));

        match executor.run_pipeline(&workflow, 1, &tx).await {
            Err(PipelineError::UnresolvedParent { label }) => assert_eq!(label, "later"),
            other => panic!("expected UnresolvedParent, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failure_aborts_run_but_keeps_written_images() {
        let fx = fixture();
        let mut executor = executor(StubGenerator::failing_on(2), &fx);
        let (tx, _rx) = unbounded();

        let workflow = three_stage_workflow();
        assert!(matches!(
            executor.run_pipeline(&workflow, 1, &tx).await,
            Err(PipelineError::Api(_))
        ));

        let out_dir = fx.settings.output_root.join("portrait_shoot");
        assert!(out_dir.join("sketch.png").is_file());
        assert!(!out_dir.join("pose.png").exists());
    }

    #[tokio::test]
    async fn test_empty_workflow_is_a_missing_prerequisite() {
        let fx = fixture();
        let mut executor = executor(StubGenerator::new(), &fx);
        let (tx, _rx) = unbounded();

        let workflow = Workflow::new("empty");
        assert!(matches!(
            executor.run_pipeline(&workflow, 1, &tx).await,
            Err(PipelineError::MissingPrerequisite(_))
        ));
    }

    #[tokio::test]
    async fn test_rerun_fully_replaces_cache() {
        let fx = fixture();
        let mut executor = executor(StubGenerator::new(), &fx);
        let (tx, _rx) = unbounded();

        let mut first = Workflow::new("one");
        first.push(Node::new("alpha"));
        executor.run_pipeline(&first, 1, &tx).await.unwrap();
        assert!(executor.cache().get("alpha").is_some());

        let mut second = Workflow::new("two");
        second.push(Node::new("beta"));
        executor.run_pipeline(&second, 1, &tx).await.unwrap();
        assert!(executor.cache().get("alpha").is_none());
        assert!(executor.cache().get("beta").is_some());
    }

    #[tokio::test]
    async fn test_single_node_cold_cache_uses_base_image() {
        let fx = fixture();
        let mut executor = executor(StubGenerator::new(), &fx);

        let mut workflow = Workflow::new("solo");
        workflow.push(Node::new("only"));

        let output = executor.run_single(&workflow, 0).await.unwrap();
        assert_eq!(output.node, "only");
        assert!(output.path.ends_with("only_single.png"));
        assert!(output.path.is_file());
        assert!(executor.cache().get("only").is_some());
    }

    #[tokio::test]
    async fn test_single_node_with_unproduced_parent_leaves_cache_untouched() {
        let fx = fixture();
        let mut executor = executor(StubGenerator::new(), &fx);

        let mut workflow = Workflow::new("solo");
        workflow.push(Node::new("late").with_parent(ParentSelector::Node("ghost".to_string())));

        match executor.run_single(&workflow, 0).await {
            Err(PipelineError::UpstreamNotRun { label }) => assert_eq!(label, "ghost"),
            other => panic!("expected UpstreamNotRun, got {other:?}"),
        }
        assert_eq!(executor.cache().produced_len(), 0);
    }

    #[tokio::test]
    async fn test_single_node_previous_beyond_first_needs_prior_output() {
        let fx = fixture();
        let mut executor = executor(StubGenerator::new(), &fx);

        let mut workflow = Workflow::new("solo");
        workflow.push(Node::new("first"));
        workflow.push(Node::new("second"));

        assert!(matches!(
            executor.run_single(&workflow, 1).await,
            Err(PipelineError::UpstreamNotRun { .. })
        ));

        // after the prior node ran once, the second resolves
        executor.run_single(&workflow, 0).await.unwrap();
        executor.run_single(&workflow, 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_base_image_reported_before_any_call() {
        let fx = fixture();
        let generator = StubGenerator::new();
        let calls = generator.calls.clone();
        let mut executor = PipelineExecutor::new(
            generator,
            RunSettings {
                base_image: fx.settings.output_root.join("nope.png"),
                ..fx.settings.clone()
            },
        );
        let (tx, _rx) = unbounded();

        let mut workflow = Workflow::new("w");
        workflow.push(Node::new("a"));
        assert!(matches!(
            executor.run_pipeline(&workflow, 1, &tx).await,
            Err(PipelineError::MissingPrerequisite(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sanitize_name_matches_output_rules() {
        assert_eq!(sanitize_name("portrait shoot"), "portrait_shoot");
        assert_eq!(sanitize_name("v2: final (hi-res) "), "v2_final_hires");
        assert_eq!(sanitize_name("///"), "");
        assert_eq!(sanitize_name("под_ключ"), "под_ключ");
    }

    #[test]
    fn test_compose_prompt_sections() {
        let prompt = compose_prompt("house style", "add a hat");
        assert!(prompt.starts_with(INSTRUCTIONAL_PREAMBLE));
        assert!(prompt.contains("## System Prompt:\nhouse style"));
        assert!(prompt.contains("## User Instruction for this step:\nadd a hat"));
    }
}
