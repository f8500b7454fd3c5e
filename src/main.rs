//! Stevedore - container-execution backend for workflow job runners
//!
//! This is the CLI entry point. It consumes a JSON job description (image
//! requirement, path-mapping tables, job settings), resolves the image and
//! either prints the assembled engine invocation or runs it.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::process::ExitCode;
use stevedore::image::{Engine, EngineFlavor, ImageCache, ImageRequirement, ImageResolver};
use stevedore::machine::HostMountRegistry;
use stevedore::mount::RealFs;
use stevedore::runtime::{JobSandbox, RuntimeBuilder, RuntimeConfig, DEFAULT_ENGINE};
use tracing_subscriber::EnvFilter;

/// Stevedore - assemble and run container-engine invocations for jobs
#[derive(Parser)]
#[command(name = "stevedore")]
#[command(version)]
#[command(about = "Container-execution backend for workflow job runners", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the image and print the engine invocation without running it
    Plan {
        /// Job description file (JSON)
        #[arg(long)]
        job: PathBuf,

        #[command(flatten)]
        opts: RuntimeOpts,
    },

    /// Resolve the image, assemble the invocation and run the job
    Run {
        /// Job description file (JSON)
        #[arg(long)]
        job: PathBuf,

        #[command(flatten)]
        opts: RuntimeOpts,
    },
}

/// Runtime options overlaying the job description.
#[derive(Args)]
struct RuntimeOpts {
    /// Restricted user-space engine command (e.g. udocker)
    #[arg(long)]
    user_space_engine: Option<String>,

    /// Disallow fetching the image if it is not available locally
    #[arg(long)]
    no_pull: bool,

    /// Re-fetch the image even when a local match exists
    #[arg(long)]
    force_pull: bool,

    /// Enforce the job's memory allocation as an engine limit
    #[arg(long)]
    strict_memory_limit: bool,

    /// Do not mark the sandbox root read-only
    #[arg(long)]
    no_read_only: bool,

    /// Network name substituted when the job declares network access
    #[arg(long)]
    custom_net: Option<String>,

    /// Remove the container automatically after exit
    #[arg(long)]
    rm: bool,

    /// Directory for container-id files (must exist)
    #[arg(long)]
    cidfile_dir: Option<PathBuf>,

    /// Prefix for container-id file names
    #[arg(long)]
    cidfile_prefix: Option<String>,

    /// Allow writable mappings to bind the original host path directly
    #[arg(long)]
    inplace_update: bool,

    /// Do not match the container identity to the invoking user
    #[arg(long)]
    no_match_user: bool,

    /// Temporary-directory prefix (parent directory + name stem)
    #[arg(long)]
    tmpdir_prefix: Option<String>,
}

impl RuntimeOpts {
    fn to_config(&self, debug: bool) -> RuntimeConfig {
        let mut config = RuntimeConfig::new();
        config.user_space_engine = self.user_space_engine.clone();
        config.debug = debug;
        config.strict_memory_limit = self.strict_memory_limit;
        config.no_read_only = self.no_read_only;
        config.custom_net = self.custom_net.clone();
        config.rm_container = self.rm;
        config.cidfile_dir = self.cidfile_dir.clone();
        config.cidfile_prefix = self.cidfile_prefix.clone();
        config.inplace_update = self.inplace_update;
        config.no_match_user = self.no_match_user;
        if let Some(prefix) = &self.tmpdir_prefix {
            config.tmpdir_prefix = prefix.clone();
        }
        config
    }
}

/// On-disk job description: image requirement + sandbox + job command.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobDocument {
    requirement: ImageRequirement,
    #[serde(flatten)]
    sandbox: JobSandbox,
    #[serde(default)]
    command: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();

    let result = match &cli.command {
        Commands::Plan { job, opts } => plan(job, opts, cli.debug).map(|_| 0),
        Commands::Run { job, opts } => run(job, opts, cli.debug),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Resolve the image and assemble the invocation for a job document.
fn prepare(
    job_path: &PathBuf,
    opts: &RuntimeOpts,
    debug: bool,
) -> anyhow::Result<(Vec<String>, JobDocument)> {
    let contents = std::fs::read_to_string(job_path)
        .with_context(|| format!("reading job description {}", job_path.display()))?;
    let document: JobDocument =
        serde_json::from_str(&contents).context("parsing job description")?;

    let config = opts.to_config(debug);

    let engine = match &config.user_space_engine {
        Some(command) => Engine::locate(command, EngineFlavor::UserSpace)?,
        None => Engine::locate(DEFAULT_ENGINE, EngineFlavor::Full)?,
    };

    let resolver = ImageResolver::new(engine.clone(), ImageCache::new());
    let image_id = resolver.resolve(
        &document.requirement,
        !opts.no_pull,
        opts.force_pull,
        &config.tmpdir_prefix,
    )?;

    let registry = HostMountRegistry::from_env();
    let fs = RealFs;
    let builder = RuntimeBuilder::new(&config, &registry, &fs, &engine.command_name());
    let spec = builder.create_runtime(&document.sandbox)?;

    if let Some(cidfile) = spec.cidfile() {
        tracing::info!(cidfile = %cidfile.display(), "Container id will be recorded");
    }

    let (mut args, _cidfile) = spec.into_parts();
    args.push(image_id);
    args.extend(document.command.iter().cloned());
    Ok((args, document))
}

fn plan(job_path: &PathBuf, opts: &RuntimeOpts, debug: bool) -> anyhow::Result<()> {
    let (args, _) = prepare(job_path, opts, debug)?;
    for arg in args {
        println!("{arg}");
    }
    Ok(())
}

fn run(job_path: &PathBuf, opts: &RuntimeOpts, debug: bool) -> anyhow::Result<u8> {
    let (args, document) = prepare(job_path, opts, debug)?;
    tracing::info!(job = %document.sandbox.name, "Starting container job");

    let status = std::process::Command::new(&args[0])
        .args(&args[1..])
        .status()
        .with_context(|| format!("spawning {}", args[0]))?;

    let code = status.code().unwrap_or(1);
    if code == 0 {
        tracing::info!(job = %document.sandbox.name, "Job completed");
    } else {
        tracing::warn!(job = %document.sandbox.name, code, "Job exited non-zero");
    }
    Ok(u8::try_from(code).unwrap_or(1))
}
