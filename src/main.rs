use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::GlobalArgs;

mod commands;
mod output;

use commands::{branch, config, deployment, event, repo};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "deploybot")]
#[command(version = VERSION)]
#[command(about = "Clone, build and deploy monitored branches on push, with chat notices")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage monitored repositories
    #[command(visible_alias = "repos")]
    Repo(repo::RepoArgs),
    /// Manage branch rules of a repository
    Branch(branch::BranchArgs),
    /// Feed webhook events to the dispatcher
    Event(event::EventArgs),
    /// Inspect deployment records
    #[command(visible_alias = "deployments")]
    Deployment(deployment::DeploymentArgs),
    /// Show deploybot configuration
    Config(config::ConfigArgs),
}

/// Logs go to stderr so stdout stays a single JSON document.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("deploybot=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> std::process::ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let global = GlobalArgs {};

    let (json_result, exit_code) = commands::run_json(cli.command, &global);

    if let Err(e) = output::print_json_result(json_result) {
        eprintln!("{}", e.report());
        return std::process::ExitCode::from(exit_code_to_u8(1));
    }

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
