use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use pipeline::{spawn_pipeline_run, GeminiClient, PipelineEvent, PipelineExecutor, RunSettings};
use tracing::{error, info};
use workflow::{credentials, load_workflow, AppPaths, SystemPrompt, Workflow};

/// How often the event queue is polled while a background run is going.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "imgpipe")]
#[command(about = "Chains generative image edits through a node workflow")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every node of a workflow, optionally several times over
    Run {
        /// Workflow file (JSON node list)
        #[arg(short, long)]
        workflow: PathBuf,

        /// Image the first stage starts from
        #[arg(short, long)]
        base_image: PathBuf,

        /// System prompt file (JSON with a "prompt" field)
        #[arg(short, long)]
        system_prompt: Option<PathBuf>,

        /// How many batches to run
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=100))]
        iterations: u32,

        /// Model id to use instead of the default
        #[arg(long)]
        model: Option<String>,
    },

    /// Run a single node against a fresh cache
    RunNode {
        /// Workflow file (JSON node list)
        #[arg(short, long)]
        workflow: PathBuf,

        /// Node to run: resolved name or 1-based index
        #[arg(short, long)]
        node: String,

        /// Image the stage starts from
        #[arg(short, long)]
        base_image: PathBuf,

        /// System prompt file (JSON with a "prompt" field)
        #[arg(short, long)]
        system_prompt: Option<PathBuf>,

        /// Model id to use instead of the default
        #[arg(long)]
        model: Option<String>,
    },

    /// List the nodes of a workflow without running anything
    Nodes {
        /// Workflow file (JSON node list)
        workflow: PathBuf,
    },

    /// Prompt for an API key and store it next to the executable
    SetKey,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let paths = AppPaths::discover();
    paths.ensure().context("create application directories")?;

    match cli.command {
        Commands::Run {
            workflow,
            base_image,
            system_prompt,
            iterations,
            model,
        } => run_command(&paths, workflow, base_image, system_prompt, iterations, model),
        Commands::RunNode {
            workflow,
            node,
            base_image,
            system_prompt,
            model,
        } => run_node_command(&paths, workflow, node, base_image, system_prompt, model),
        Commands::Nodes { workflow } => nodes_command(&paths, workflow),
        Commands::SetKey => set_key_command(&paths),
    }
}

fn run_command(
    paths: &AppPaths,
    workflow_path: PathBuf,
    base_image: PathBuf,
    system_prompt: Option<PathBuf>,
    iterations: u32,
    model: Option<String>,
) -> Result<()> {
    let client = make_client(paths, model)?;
    let (workflow, prompt) = load_inputs(paths, &workflow_path, system_prompt.as_deref())?;

    info!(
        "running workflow '{}' ({} node(s), {} iteration(s))",
        workflow.name,
        workflow.len(),
        iterations
    );

    let executor = PipelineExecutor::new(
        client,
        RunSettings {
            base_image,
            system_prompt: prompt,
            output_root: paths.output_dir(),
        },
    );

    let handle = spawn_pipeline_run(executor, workflow, iterations);
    loop {
        match handle.events().recv_timeout(EVENT_POLL_INTERVAL) {
            Ok(event) => report_event(&event),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let (_executor, result) = handle.join();
    match result {
        Ok(summary) => {
            info!("pipeline finished: {} image(s) written", summary.images);
            Ok(())
        }
        Err(e) => bail!("pipeline run failed: {e}"),
    }
}

fn run_node_command(
    paths: &AppPaths,
    workflow_path: PathBuf,
    node: String,
    base_image: PathBuf,
    system_prompt: Option<PathBuf>,
    model: Option<String>,
) -> Result<()> {
    let client = make_client(paths, model)?;
    let (workflow, prompt) = load_inputs(paths, &workflow_path, system_prompt.as_deref())?;
    let index = find_node(&workflow, &node)?;

    let mut executor = PipelineExecutor::new(
        client,
        RunSettings {
            base_image,
            system_prompt: prompt,
            output_root: paths.output_dir(),
        },
    );

    // Single-node runs stay on the interactive thread.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build runtime")?;
    let output = runtime.block_on(executor.run_single(&workflow, index))?;

    info!(
        "node '{}' finished; saved to {}",
        output.node,
        output.path.display()
    );
    Ok(())
}

fn nodes_command(paths: &AppPaths, workflow_path: PathBuf) -> Result<()> {
    let workflow = load_workflow(&workflow_path, paths.base())?;
    if workflow.is_empty() {
        println!("workflow '{}' has no nodes", workflow.name);
        return Ok(());
    }

    println!("workflow '{}' ({} node(s)):", workflow.name, workflow.len());
    for (index, node) in workflow.nodes.iter().enumerate() {
        let reference = node
            .image_path
            .as_ref()
            .map(|p| format!("  ref: {}", p.display()))
            .unwrap_or_default();
        println!(
            "  {}. {} <- {}{}",
            index + 1,
            node.resolved_name(index),
            node.parent,
            reference
        );
        if !node.prompt.is_empty() {
            println!("     {}", node.prompt);
        }
    }
    Ok(())
}

fn set_key_command(paths: &AppPaths) -> Result<()> {
    print!("API key: ");
    io::stdout().flush()?;

    let mut key = String::new();
    io::stdin().read_line(&mut key)?;
    let key = key.trim();
    if key.is_empty() {
        bail!("no key entered");
    }

    credentials::save_api_key(&paths.api_key_file(), key)?;
    info!("API key saved to {}", paths.api_key_file().display());
    Ok(())
}

fn make_client(paths: &AppPaths, model: Option<String>) -> Result<GeminiClient> {
    let key = api_key(paths)?;
    let client = GeminiClient::new(key);
    Ok(match model {
        Some(model) => client.with_model(model),
        None => client,
    })
}

/// The environment variable wins over the stored credential file.
fn api_key(paths: &AppPaths) -> Result<String> {
    if let Ok(key) = std::env::var("GEMINI_API_KEY") {
        let key = key.trim().to_string();
        if !key.is_empty() {
            return Ok(key);
        }
    }
    match credentials::load_api_key(&paths.api_key_file())? {
        Some(key) => Ok(key),
        None => bail!("no API key found; run `imgpipe set-key` or set GEMINI_API_KEY"),
    }
}

fn load_inputs(
    paths: &AppPaths,
    workflow_path: &Path,
    system_prompt: Option<&Path>,
) -> Result<(Workflow, String)> {
    let workflow = load_workflow(workflow_path, paths.base())?;
    let prompt = match system_prompt {
        Some(path) => SystemPrompt::load(path)?.prompt,
        None => String::new(),
    };
    Ok((workflow, prompt))
}

fn find_node(workflow: &Workflow, key: &str) -> Result<usize> {
    if let Ok(position) = key.parse::<usize>() {
        if (1..=workflow.len()).contains(&position) {
            return Ok(position - 1);
        }
        bail!(
            "node index {position} is out of range (1..={})",
            workflow.len()
        );
    }
    workflow
        .find_node(key)
        .with_context(|| format!("no node named '{key}' in workflow '{}'", workflow.name))
}

fn report_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::Status(message) => info!("{message}"),
        PipelineEvent::NodeFinished { batch, node, path } => {
            info!("batch {batch}: node '{node}' saved to {}", path.display());
        }
        PipelineEvent::RunCompleted { images } => {
            info!("run completed, {images} image(s) written");
        }
        PipelineEvent::RunFailed { message } => error!("{message}"),
    }
}
