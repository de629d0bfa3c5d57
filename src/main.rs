//! scatter CLI - parallel test runner for provisioned device slots.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use scatter::config::{self, Config};
use scatter::device::LocalDeviceProvider;
use scatter::discovery;
use scatter::exec::ProcessExecutor;
use scatter::report::print_summary;
use scatter::run::TestRun;
use scatter::sink::OutputSink;

#[derive(Parser)]
#[command(name = "scatter")]
#[command(about = "Parallel test runner for provisioned device slots", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "scatter.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, enumerate and run this partition's tests
    Run {
        /// Override the partition spec ("index/total", 1-based)
        #[arg(short, long)]
        partition: Option<String>,

        /// Override the per-test retry ceiling
        #[arg(long)]
        retry_ceiling: Option<u32>,

        /// Skip the build step
        #[arg(long)]
        skip_build: bool,
    },

    /// Enumerate tests without running them
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let code = match cli.command {
        Commands::Run {
            partition,
            retry_ceiling,
            skip_build,
        } => run_tests(&cli.config, partition, retry_ceiling, skip_build).await,
        Commands::List { format } => list_tests(&cli.config, &format).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(&cli.config),
    };

    match code {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}

async fn run_tests(
    config_path: &Path,
    partition_override: Option<String>,
    ceiling_override: Option<u32>,
    skip_build: bool,
) -> Result<i32> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // Apply overrides
    if let Some(partition) = partition_override {
        config.scatter.partition = partition;
    }
    if let Some(ceiling) = ceiling_override {
        config.scatter.retry_ceiling = ceiling;
    }
    if skip_build {
        config.build.enabled = false;
    }
    config.validate()?;

    info!("Loaded configuration from {}", config_path.display());

    // Clear the output directory to avoid stale result logs.
    let output_dir = config.scatter.output_dir.clone();
    if output_dir.exists() {
        std::fs::remove_dir_all(&output_dir).ok();
    }
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let sink = OutputSink::stdout();
    let handle = sink.handle();

    if config.build.enabled {
        discovery::build(&config.build, &config.executor, &handle)
            .await
            .context("Build step failed")?;
    }

    let bundles = discovery::list_tests(&config.enumerate, &config.executor, &handle)
        .await
        .context("Test enumeration failed")?;
    match discovery::write_enumeration(&bundles, &output_dir) {
        Ok(path) => info!("Wrote enumeration to {}", path.display()),
        Err(e) => error!("Unable to write enumeration artifact: {e}"),
    }

    let universe = discovery::load_tests_for_partition(&bundles, &config.scatter.partition)?;
    if universe.is_empty() {
        bail!("Unable to load tests for partition {}", config.scatter.partition);
    }
    info!(
        "Partition {} holds {} tests",
        config.scatter.partition,
        universe.len()
    );

    let provider = LocalDeviceProvider::from_config(&config.devices);
    let executor = Arc::new(ProcessExecutor::new(config.executor.clone(), output_dir));

    let run = TestRun::new(config, provider, executor, handle);
    let tally = run.run(&universe).await?;

    // Drain the log stream before printing the summary. The run (and its
    // sink handle) must go first or the drain would wait on it forever.
    drop(run);
    sink.close().await;
    print_summary(&tally);

    Ok(tally.exit_code())
}

async fn list_tests(config_path: &Path, format: &str) -> Result<i32> {
    let config = config::load_config(config_path)?;
    let sink = OutputSink::stdout();

    let bundles = discovery::list_tests(&config.enumerate, &config.executor, &sink.handle())
        .await
        .context("Test enumeration failed")?;
    sink.close().await;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&bundles)?),
        "text" => {
            for (bundle, tests) in &bundles {
                println!("{}:", bundle);
                for test in tests {
                    println!("  {}", test);
                }
            }
        }
        other => bail!("Unknown format: {other}"),
    }

    Ok(0)
}

fn validate_config(config_path: &Path) -> Result<i32> {
    let config = config::load_config(config_path)?;
    config.validate()?;
    println!("Configuration OK: {}", config_path.display());
    Ok(0)
}

fn init_config(config_path: &Path) -> Result<i32> {
    if config_path.exists() {
        bail!("{} already exists", config_path.display());
    }

    let template = r#"[scatter]
partition = "1/1"
retry_ceiling = 5
max_batch_size = 10
launch_timeout_secs = 60
idle_timeout_secs = 120

[build]
enabled = true
command = "make build-tests"

[enumerate]
command = "testctl list --json"

[devices.families]
"iPhone 6" = 2

[executor]
command = "testctl run --device {device_id} --only {tests} --result-log {result_log}"
"#;

    // Sanity-check that the template stays loadable.
    let config: Config = toml::from_str(template).context("Config template is invalid")?;
    config.validate()?;

    std::fs::write(config_path, template)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("Wrote {}", config_path.display());

    Ok(0)
}
