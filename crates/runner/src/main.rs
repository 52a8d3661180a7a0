//! Sightline
//!
//! Runs visual end-to-end installer tests, each in a disposable machine.

use anyhow::Context;
use clap::Parser;
use sightline_common::{HarnessConfig, RunLogs, VERSION};
use sightline_runner::interrupt::{self, Signal};
use sightline_runner::{
    discover, run_interruptible, Orchestrator, OrchestratorSettings, RunReport, ScriptRegistry,
    VncSessionFactory,
};
use sightline_vm::{Environment, EnvironmentSettings, VirshConnector};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sightline")]
#[command(about = "Visual end-to-end installer tests in disposable machines")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "sightline.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Never prompt, even on a terminal
    #[arg(long)]
    non_interactive: bool,

    /// Directory receiving the run logs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Hypervisor connection URI
    #[arg(long, env = "SIGHTLINE_URI")]
    uri: Option<String>,

    /// Only run the named test (repeatable)
    #[arg(short, long = "test", value_name = "NAME")]
    test: Vec<String>,

    /// Directory holding one sub-directory per test
    #[arg(default_value = ".")]
    directory: PathBuf,
}

fn init_tracing(verbose: bool, run_log: &Path) -> anyhow::Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let file = std::fs::File::create(run_log)
        .with_context(|| format!("Cannot create {}", run_log.display()))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .with(filter)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = HarnessConfig::load(&cli.config)
        .with_context(|| format!("Cannot load configuration {}", cli.config.display()))?;
    if let Some(log_dir) = cli.log_dir.clone() {
        config.log_dir = log_dir;
    }
    if let Some(uri) = cli.uri.clone() {
        config.hypervisor.uri = uri;
    }

    let logs = RunLogs::create(&config.log_dir)
        .with_context(|| format!("Cannot create a run directory in {}", config.log_dir.display()))?;
    init_tracing(cli.verbose, &logs.run_log())?;

    info!("Sightline v{}", VERSION);
    info!("Logging to {}", logs.dir().display());

    let registry = ScriptRegistry::with_builtins();
    let tests = discover(&cli.directory, &registry, &cli.test)?;

    let mut env = Environment::new(
        Box::new(VirshConnector::new(config.hypervisor.virsh.clone())),
        EnvironmentSettings::from_config(&config.hypervisor)?,
    );
    let orchestrator = Orchestrator::new(
        OrchestratorSettings {
            uri: config.hypervisor.uri.clone(),
            pool_path: config.hypervisor.pool_path.clone(),
        },
        Box::new(VncSessionFactory::new(config.display.clone(), config.recording.clone())),
        logs.clone(),
    );
    let interactive = cli.verbose && !cli.non_interactive && std::io::stdin().is_terminal();

    let signal = async {
        match interrupt::wait_for_signal().await {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Cannot listen for signals: {}", e);
                std::future::pending::<Signal>().await
            }
        }
    };
    let confirm = |count| async move {
        if interactive {
            interrupt::confirm_cleanup(count).await
        } else {
            true
        }
    };

    let mut report = RunReport::new();
    let ended =
        run_interruptible(&orchestrator, &mut env, &tests, &mut report, signal, confirm).await;
    let code = ended.exit_code(&report);

    report.finish();
    report.print_summary();

    let results = logs.dir().join("results.json");
    if let Err(e) = report.write_json(&results) {
        warn!("Cannot write {}: {}", results.display(), e);
    }

    std::process::exit(code)
}
