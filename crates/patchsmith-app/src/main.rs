//! patchsmith - turn LLM SEARCH/REPLACE edits into verified patches
//!
//! Parses completion text into edit commands, retries them under an
//! indentation/granularity ladder gated by a syntax check, renders unified
//! diffs and applies them to a working tree.

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use patchsmith_adapters::config::Config;
use patchsmith_adapters::store::ArtifactStore;
use patchsmith_core::aggregate::RunSummary;
use patchsmith_core::syntax::Language;
use patchsmith_core::RepairResult;
use patchsmith_engine::{
    BatchManifest, BatchRunner, ChatCompletionClient, InstanceRequest, RepairPipeline,
    RepairSettings,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_OUT_DIR: &str = "patchsmith-out";

#[derive(Parser, Debug)]
#[command(
    name = "patchsmith",
    about = "Turn LLM SEARCH/REPLACE edits into verified patches",
    version
)]
struct Cli {
    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Prompt the model from localization output and apply its edits
    Repair(RepairArgs),
    /// Apply an already-obtained completion to a working tree
    Apply(ApplyArgs),
    /// Run every instance in a TOML manifest
    Batch(BatchArgs),
    /// Print counts over stored results
    Summary(SummaryArgs),
    /// Write the consolidated JSONL of successful fixes
    Export(ExportArgs),
    /// Build results for stored completions that have diffs but no record
    Collect(OutArgs),
    /// Show the effective configuration or write the config file
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
struct OutArgs {
    /// Artifact directory
    #[arg(long, default_value = DEFAULT_OUT_DIR)]
    out: PathBuf,
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Override the configured model
    #[arg(long)]
    model: Option<String>,
    /// Override the configured API base URL
    #[arg(long)]
    base_url: Option<String>,
}

#[derive(Args, Debug)]
struct RepairArgs {
    /// Instance id (org__repo-number)
    id: String,
    /// Working tree to patch
    #[arg(long)]
    repo: PathBuf,
    /// Directory holding <id>.json localization files
    #[arg(long)]
    locations: PathBuf,
    #[arg(long, value_enum, default_value_t = LanguageArg::Python)]
    language: LanguageArg,
    #[command(flatten)]
    model: ModelArgs,
    #[command(flatten)]
    out: OutArgs,
}

#[derive(Args, Debug)]
struct ApplyArgs {
    /// Instance id (org__repo-number)
    id: String,
    /// Working tree to patch
    #[arg(long)]
    repo: PathBuf,
    /// File containing the raw completion text
    #[arg(long)]
    raw: PathBuf,
    #[arg(long, value_enum, default_value_t = LanguageArg::Python)]
    language: LanguageArg,
    #[command(flatten)]
    out: OutArgs,
}

#[derive(Args, Debug)]
struct BatchArgs {
    /// TOML manifest with [[instance]] entries
    manifest: PathBuf,
    /// Localization directory for instances without raw_output
    #[arg(long)]
    locations: Option<PathBuf>,
    /// Concurrent instances (defaults to the configured worker count)
    #[arg(long)]
    workers: Option<usize>,
    /// Language for instances that do not name one
    #[arg(long, value_enum, default_value_t = LanguageArg::Python)]
    language: LanguageArg,
    #[command(flatten)]
    model: ModelArgs,
    #[command(flatten)]
    out: OutArgs,
}

#[derive(Args, Debug)]
struct SummaryArgs {
    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
    #[command(flatten)]
    out: OutArgs,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Write the file settings, with defaults filled in, back to the config file
    #[arg(long)]
    init: bool,
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Destination JSONL file
    dest: PathBuf,
    #[command(flatten)]
    out: OutArgs,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LanguageArg {
    Python,
    Java,
    Cpp,
    Javascript,
    Typescript,
    Go,
    Rust,
}

impl LanguageArg {
    fn as_language(self) -> Language {
        match self {
            LanguageArg::Python => Language::Python,
            LanguageArg::Java => Language::Java,
            LanguageArg::Cpp => Language::Cpp,
            LanguageArg::Javascript => Language::JavaScript,
            LanguageArg::Typescript => Language::TypeScript,
            LanguageArg::Go => Language::Go,
            LanguageArg::Rust => Language::Rust,
        }
    }
}

/// Install the global subscriber. Later calls are no-ops.
fn init_tracing(json: bool, verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().try_init().ok();
    } else {
        builder.try_init().ok();
    }
}

fn load_config(model: Option<&ModelArgs>) -> Config {
    let mut config = Config::load();
    config.apply_env_overrides();
    if let Some(model) = model {
        if let Some(name) = &model.model {
            config.model = name.clone();
        }
        if let Some(url) = &model.base_url {
            config.base_url = url.trim_end_matches('/').to_string();
        }
    }
    config
}

fn pipeline_for(config: &Config, out: &OutArgs) -> RepairPipeline {
    RepairPipeline::new(
        ArtifactStore::new(&out.out),
        RepairSettings::from_config(config),
    )
}

fn print_result(result: &RepairResult) {
    println!(
        "{}: {} ({} applied, {} failed)",
        result.instance_id,
        result.status.as_str(),
        result.applied_files.len(),
        result.failed_files.len()
    );
    for failure in &result.failed_files {
        match &failure.file_path {
            Some(path) => println!("  - {}: {}", path, failure.reason),
            None => println!("  - {}", failure.reason),
        }
    }
}

async fn run_repair(args: RepairArgs) -> Result<()> {
    let config = load_config(Some(&args.model));
    let client = ChatCompletionClient::from_config(&config)?;
    tracing::info!(
        model = %config.model,
        endpoint = client.endpoint(),
        "using completion endpoint"
    );

    let pipeline = pipeline_for(&config, &args.out);
    let request = InstanceRequest::new(&args.id, &args.repo, args.language.as_language());
    let result = pipeline
        .repair_from_locations(&request, &args.locations, &client)
        .await?;
    print_result(&result);
    Ok(())
}

async fn run_apply(args: ApplyArgs) -> Result<()> {
    let config = load_config(None);
    let raw = std::fs::read_to_string(&args.raw)
        .with_context(|| format!("Failed to read completion '{}'", args.raw.display()))?;

    let pipeline = pipeline_for(&config, &args.out);
    let request = InstanceRequest::new(&args.id, &args.repo, args.language.as_language());
    let result = pipeline.process_raw_output(&request, raw).await?;
    print_result(&result);
    Ok(())
}

async fn run_batch(args: BatchArgs) -> Result<()> {
    let mut config = load_config(Some(&args.model));
    if let Some(workers) = args.workers {
        if workers == 0 {
            return Err(anyhow!("--workers must be at least 1"));
        }
        config.workers = workers;
    }
    let manifest = BatchManifest::load(&args.manifest)?;

    let pipeline = pipeline_for(&config, &args.out);
    let mut runner = BatchRunner::new(pipeline, config.workers)
        .with_default_language(args.language.as_language());
    if let Some(locations) = args.locations {
        let client = ChatCompletionClient::from_config(&config)?;
        runner = runner.with_completion(Arc::new(client), locations);
    }

    tracing::info!(
        instances = manifest.instances.len(),
        workers = config.workers,
        "starting batch"
    );
    let results = runner.run(&manifest).await;
    for result in &results {
        print_result(result);
    }
    println!();
    println!("{}", RunSummary::from_results(&results).render());
    Ok(())
}

fn run_summary(args: SummaryArgs) -> Result<()> {
    let summary = ArtifactStore::new(&args.out.out).summary()?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary.render());
    }
    Ok(())
}

fn run_export(args: ExportArgs) -> Result<()> {
    let written = ArtifactStore::new(&args.out.out).export_standard(&args.dest)?;
    println!("exported {} records to {}", written, args.dest.display());
    Ok(())
}

fn run_collect(args: OutArgs) -> Result<()> {
    let collected = ArtifactStore::new(&args.out).collect_untracked()?;
    for result in &collected {
        print_result(result);
    }
    println!("collected {} instances", collected.len());
    Ok(())
}

fn run_config(args: ConfigArgs) -> Result<()> {
    if args.init {
        Config::load().save()?;
        println!("wrote {}", Config::config_location());
        return Ok(());
    }
    let config = load_config(None);
    println!("# {}", Config::config_location());
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs, cli.verbose);

    match cli.command {
        Commands::Repair(args) => run_repair(args).await,
        Commands::Apply(args) => run_apply(args).await,
        Commands::Batch(args) => run_batch(args).await,
        Commands::Summary(args) => run_summary(args),
        Commands::Export(args) => run_export(args),
        Commands::Collect(args) => run_collect(args),
        Commands::Config(args) => run_config(args),
    }
}
