use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver};
use workflow::Workflow;

use crate::client::ImageGenerator;
use crate::error::PipelineError;
use crate::events::PipelineEvent;
use crate::executor::{PipelineExecutor, RunSummary};

/// A full pipeline run executing on its own worker thread.
///
/// One run at a time by convention: callers hold the handle and drain
/// events until the terminal event arrives, then take the executor back
/// with [`RunHandle::join`].
pub struct RunHandle<G> {
    events: Receiver<PipelineEvent>,
    running: Arc<AtomicBool>,
    join: thread::JoinHandle<(PipelineExecutor<G>, Result<RunSummary, PipelineError>)>,
}

impl<G: ImageGenerator + Send + 'static> RunHandle<G> {
    /// Event stream for this run. The sender side closes when the worker
    /// finishes, so draining until disconnect observes every event.
    pub fn events(&self) -> &Receiver<PipelineEvent> {
        &self.events
    }

    /// Whether the worker is still going.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait for the worker and take back the executor (with its cache) and
    /// the run result.
    pub fn join(self) -> (PipelineExecutor<G>, Result<RunSummary, PipelineError>) {
        self.join.join().expect("pipeline worker panicked")
    }
}

/// Start a pipeline run on a background worker thread.
///
/// The worker owns the executor for the run's duration, drives it on a
/// current-thread runtime, and always emits exactly one terminal event and
/// clears the running flag, success or failure.
pub fn spawn_pipeline_run<G>(
    mut executor: PipelineExecutor<G>,
    workflow: Workflow,
    iterations: u32,
) -> RunHandle<G>
where
    G: ImageGenerator + Send + 'static,
{
    let (tx_events, rx_events) = unbounded();
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();

    let join = thread::spawn(move || {
        let result = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime.block_on(executor.run_pipeline(&workflow, iterations, &tx_events)),
            Err(e) => Err(PipelineError::Io(e)),
        };

        match &result {
            Ok(summary) => {
                let _ = tx_events.send(PipelineEvent::RunCompleted {
                    images: summary.images,
                });
            }
            Err(e) => {
                let _ = tx_events.send(PipelineEvent::RunFailed {
                    message: e.to_string(),
                });
            }
        }
        flag.store(false, Ordering::SeqCst);
        (executor, result)
    });

    RunHandle {
        events: rx_events,
        running,
        join,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RunSettings;
    use async_trait::async_trait;
    use image::DynamicImage;
    use workflow::Node;

    struct EchoGenerator;

    #[async_trait]
    impl ImageGenerator for EchoGenerator {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(
            &self,
            _prompt: &str,
            input: &DynamicImage,
            _reference: Option<&DynamicImage>,
        ) -> Result<DynamicImage, PipelineError> {
            Ok(input.clone())
        }
    }

    fn settings(dir: &tempfile::TempDir) -> RunSettings {
        let base_image = dir.path().join("base.png");
        DynamicImage::new_rgb8(2, 2).save(&base_image).unwrap();
        RunSettings {
            base_image,
            system_prompt: String::new(),
            output_root: dir.path().join("img"),
        }
    }

    #[test]
    fn test_background_run_emits_terminal_event_and_returns_executor() {
        let dir = tempfile::tempdir().unwrap();
        let executor = PipelineExecutor::new(EchoGenerator, settings(&dir));

        let mut workflow = Workflow::new("bg");
        workflow.push(Node::new("a"));
        workflow.push(Node::new("b"));

        let handle = spawn_pipeline_run(executor, workflow, 2);
        let events: Vec<PipelineEvent> = handle.events().iter().collect();
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::RunCompleted { images: 4 })
        ));
        assert_eq!(
            events.iter().filter(|e| e.is_terminal()).count(),
            1,
            "exactly one terminal event"
        );

        let (executor, result) = handle.join();
        assert!(result.is_ok());
        assert_eq!(executor.cache().produced_len(), 2);
    }

    #[test]
    fn test_failed_run_still_terminates_and_clears_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut run_settings = settings(&dir);
        run_settings.base_image = dir.path().join("missing.png");
        let executor = PipelineExecutor::new(EchoGenerator, run_settings);

        let mut workflow = Workflow::new("bg");
        workflow.push(Node::new("a"));

        let handle = spawn_pipeline_run(executor, workflow, 1);
        let events: Vec<PipelineEvent> = handle.events().iter().collect();
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::RunFailed { .. })
        ));

        assert!(!handle.is_running());
        let (_executor, result) = handle.join();
        assert!(result.is_err());
    }
}
