//! kubefirst CLI.
//!
//! Installs a GitOps management cluster on AWS, DigitalOcean, Vultr or a
//! local k3d cluster, and destroys it again.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use k1_cli::commands::destroy::DestroyCommand;
use k1_cli::commands::install::InstallCommand;
use k1_cli::commands::reset::ResetCommand;
use k1_cli::commands::GlobalArgs;
use k1_cli::{logging, ui, K1Paths};

/// kubefirst - GitOps platform installer.
#[derive(Parser)]
#[command(
    name = "kubefirst",
    version,
    about = "kubefirst GitOps platform installer",
    long_about = "Provision a Kubernetes management cluster with ArgoCD, Vault and\n\
                  Atlantis wired to a gitops repository on GitHub, GitLab or soft-serve.\n\n\
                  All operations are idempotent - re-running the same command will\n\
                  resume from where it left off."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to ~/.kubefirst).
    #[arg(long, global = true, env = "KUBEFIRST_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a management cluster.
    ///
    /// Creates the cloud infrastructure, the gitops and metaphor
    /// repositories, ArgoCD and Vault.
    Install(InstallCommand),

    /// Destroy the recorded installation.
    Destroy(DestroyCommand),

    /// Remove the configuration file and all recorded progress.
    Reset(ResetCommand),
}

fn default_config() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kubefirst")
}

async fn run(cli: Cli, global: GlobalArgs) -> anyhow::Result<()> {
    match cli.command {
        Commands::Install(cmd) => cmd.run(&global).await,
        Commands::Destroy(cmd) => cmd.run(&global).await,
        Commands::Reset(cmd) => cmd.run(&global),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_file = K1Paths::from_home()
        .ok()
        .map(|paths| logging::log_file_path(&paths.logs()));
    if let Some(path) = logging::init(cli.verbose, log_file) {
        info!(log = %path.display(), "Logging to file");
    }

    let global = GlobalArgs {
        config: cli.config.clone().unwrap_or_else(default_config),
    };

    let outcome = tokio::select! {
        result = run(cli, global) => result,
        _ = tokio::signal::ctrl_c() => {
            ui::print_warning("Interrupted. Re-run the same command to resume.");
            return ExitCode::FAILURE;
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Command failed");
            ui::print_error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}
