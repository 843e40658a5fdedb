use thiserror::Error;

/// Failure modes of a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The run was started without everything it needs; nothing was
    /// attempted.
    #[error("{0}")]
    MissingPrerequisite(String),

    /// A node's parent selector points at an entry the current batch has
    /// not produced. Forward references land here too.
    #[error("no output named '{label}' has been produced in this batch")]
    UnresolvedParent { label: String },

    /// Single-node variant of an unresolved parent.
    #[error("no output for '{label}' yet; run the pipeline or the prior node first")]
    UpstreamNotRun { label: String },

    /// The model answered without an inline image payload. `text` carries
    /// whatever the model said instead.
    #[error("the model returned no image: {text}")]
    NoImageReturned { text: String },

    /// Transport failure or non-success response from the generation API.
    #[error("generation request failed: {0}")]
    Api(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
