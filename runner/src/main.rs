use agentbench::{
    adapter::{load_adapters, FixedWorkspace},
    collector::collect_prompts,
    config::{BenchConfig, ConfigErrors},
    ingest::Ingestors,
    report::{summarize, write_results},
    resources::ResourceProbe,
    scheduler::{NestedScheduler, TrialEnvironment},
};
use clap::{Parser, Subcommand};
use std::{
    error::Error,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "agentbench",
    version,
    about = "Benchmark coding assistants against a set of prompts"
)]
struct Cli {
    /// log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full benchmark matrix
    Run {
        #[arg(short, long)]
        config: PathBuf,
        /// overrides `output` of the config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Only run the preflight checks of a config
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print the resource snapshot and the concurrency it allows
    Probe {
        #[arg(short, long, default_value_t = 8)]
        requested: usize,
    },
}

fn load_checked(path: &Path) -> Result<BenchConfig, ConfigErrors> {
    let mut config = BenchConfig::load(path)?;

    if config.preflight_checks() {
        return Err(ConfigErrors::PreflightFailed);
    }

    Ok(config)
}

async fn run(config_path: PathBuf, output: Option<PathBuf>) -> Result<(), Box<dyn Error>> {
    let config = load_checked(&config_path)?;
    let prompts = collect_prompts(&config.prompts)?;

    info!("Collected {} prompts", prompts.len());

    let probe = Arc::new(ResourceProbe::new(config.resources.clone()));
    let environment = Arc::new(TrialEnvironment::new(
        load_adapters(&config),
        Ingestors::load(&config.ingest),
        Arc::new(FixedWorkspace::new(config.workspace.path.clone())),
    ));

    let scheduler = NestedScheduler::new(config.matrix(prompts), probe, environment)
        .with_trial_timeout(config.trial_timeout());
    let results = scheduler.run().await?;

    write_results(&output.unwrap_or_else(|| config.output.clone()), &results)?;

    for (assistant, summary) in summarize(&results) {
        info!(
            assistant = %assistant,
            runs = summary.runs,
            failures = summary.failures,
            mean_response_time_seconds = ?summary.mean_response_time_seconds,
            "Success rate {:.1}%",
            summary.success_rate * 100.0
        );
    }

    Ok(())
}

fn probe(requested: usize) -> Result<(), Box<dyn Error>> {
    let probe = ResourceProbe::new(Default::default());
    let report = serde_json::json!({
        "snapshot": probe.snapshot(),
        "plan": probe.plan(requested),
    });

    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let result = match cli.command {
        Commands::Run { config, output } => run(config, output).await,
        Commands::Check { config } => load_checked(&config)
            .map(|_| info!("Config {} passed the preflight checks", config.display()))
            .map_err(Into::into),
        Commands::Probe { requested } => probe(requested),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
