use clap::{Args, Subcommand};
use serde::Serialize;

use deploybot::log_status;
use deploybot::store::RepositoryStore;
use deploybot::utils::validation;
use deploybot::{BranchConfig, Error};

use super::{CmdResult, Context};

#[derive(Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchOutput {
    command: String,
    repository: String,
    branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<BranchConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    replaced: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote_branches: Option<Vec<String>>,
}

#[derive(Args)]
pub struct BranchArgs {
    #[command(subcommand)]
    command: BranchCommand,
}

#[derive(Subcommand)]
enum BranchCommand {
    /// Monitor a branch, or replace its rule
    Set {
        /// Repository name
        repo: String,
        /// Branch name
        branch: String,
        /// Channel for deployment notices
        #[arg(long)]
        channel: String,
        /// Channel for pull-request notices (defaults to --channel)
        #[arg(long)]
        pr_channel: Option<String>,
        /// Shell command run before deploy
        #[arg(long)]
        build: Option<String>,
        /// Shell command that publishes the build
        #[arg(long)]
        deploy: Option<String>,
        /// Environment label (defaults to the branch name)
        #[arg(long)]
        environment: Option<String>,
    },
    /// Stop monitoring a branch
    Remove {
        /// Repository name
        repo: String,
        /// Branch name
        branch: String,
    },
    /// Ask the remote whether a branch exists
    Check {
        /// Repository name
        repo: String,
        /// Branch name
        branch: String,
    },
}

pub fn run(args: BranchArgs, _global: &crate::commands::GlobalArgs) -> CmdResult<BranchOutput> {
    let ctx = Context::load()?;

    match args.command {
        BranchCommand::Set {
            repo,
            branch,
            channel,
            pr_channel,
            build,
            deploy,
            environment,
        } => {
            let config = BranchConfig {
                branch,
                discord_channel_id: channel,
                pr_channel_id: pr_channel,
                build_command: build,
                deploy_command: deploy,
                environment,
            };
            set(&ctx, &repo, config)
        }
        BranchCommand::Remove { repo, branch } => remove(&ctx, &repo, &branch),
        BranchCommand::Check { repo, branch } => check(&ctx, &repo, &branch),
    }
}

fn set(ctx: &Context, repo: &str, config: BranchConfig) -> CmdResult<BranchOutput> {
    let repository = ctx.repository(repo)?;
    let mut branches = repository.branches.clone();
    let replaced = branches.upsert(config.clone())?;
    ctx.store.save_branches(&repository.id, &branches)?;

    log_status!(
        "branch",
        "{} {} on {}",
        if replaced { "Updated" } else { "Monitoring" },
        config.branch,
        repository.name
    );

    Ok((
        BranchOutput {
            command: "branch.set".to_string(),
            repository: repository.name,
            branch: config.branch.clone(),
            config: Some(config),
            replaced: Some(replaced),
            ..Default::default()
        },
        0,
    ))
}

fn remove(ctx: &Context, repo: &str, branch: &str) -> CmdResult<BranchOutput> {
    let repository = ctx.repository(repo)?;
    let mut branches = repository.branches.clone();
    let removed = branches
        .remove(branch)
        .ok_or_else(|| Error::branch_not_configured(&repository.name, branch))?;
    ctx.store.save_branches(&repository.id, &branches)?;

    log_status!("branch", "Stopped monitoring {} on {}", branch, repository.name);

    Ok((
        BranchOutput {
            command: "branch.remove".to_string(),
            repository: repository.name,
            branch: branch.to_string(),
            config: Some(removed),
            ..Default::default()
        },
        0,
    ))
}

fn check(ctx: &Context, repo: &str, branch: &str) -> CmdResult<BranchOutput> {
    validation::require_branch_name(branch)?;
    let repository = ctx.repository(repo)?;
    let pipeline = ctx.pipeline();
    let remote = pipeline.remote_for(&repository);

    log_status!("branch", "Checking {} on {}", branch, remote.redacted());
    let branches = pipeline.verifier().verify(&remote, branch)?;

    Ok((
        BranchOutput {
            command: "branch.check".to_string(),
            repository: repository.name,
            branch: branch.to_string(),
            config: repository.branches.find(branch).cloned(),
            remote_branches: Some(branches.into_iter().collect()),
            ..Default::default()
        },
        0,
    ))
}
