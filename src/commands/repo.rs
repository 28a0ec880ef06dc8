use clap::{Args, Subcommand};
use serde::Serialize;

use deploybot::log_status;
use deploybot::repository::NewRepository;
use deploybot::store::RepositoryStore;
use deploybot::{Provider, Repository};

use super::{CmdResult, Context};

#[derive(Default, Serialize)]
pub struct RepoOutput {
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    repository: Option<Repository>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repositories: Option<Vec<Repository>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    removed: Option<RemovedRepository>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedRepository {
    id: String,
    name: String,
    purged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    deployments_removed: Option<usize>,
}

#[derive(Args)]
pub struct RepoArgs {
    #[command(subcommand)]
    command: RepoCommand,
}

#[derive(Subcommand)]
enum RepoCommand {
    /// Start monitoring a repository
    Add {
        /// Display name, also used to match incoming events
        name: String,
        /// Clone URL
        #[arg(long)]
        url: String,
        /// Hosting provider (github or gitlab)
        #[arg(long, value_parser = parse_provider)]
        provider: Provider,
    },
    /// List monitored repositories
    List {
        /// Include deactivated repositories
        #[arg(long)]
        all: bool,
    },
    /// Show one repository with its branch rules
    Show {
        /// Repository name
        name: String,
    },
    /// Stop monitoring a repository
    Remove {
        /// Repository name
        name: String,
        /// Delete the record, its deployments and its checkouts
        #[arg(long)]
        purge: bool,
    },
}

fn parse_provider(value: &str) -> std::result::Result<Provider, String> {
    Provider::parse(value).map_err(|e| e.message)
}

pub fn run(args: RepoArgs, _global: &crate::commands::GlobalArgs) -> CmdResult<RepoOutput> {
    let ctx = Context::load()?;

    match args.command {
        RepoCommand::Add {
            name,
            url,
            provider,
        } => {
            let repository = ctx.store.create_repository(&NewRepository {
                name,
                git_url: url,
                provider,
            })?;
            log_status!("repo", "Monitoring {} ({})", repository.name, repository.id);
            Ok((
                RepoOutput {
                    command: "repo.add".to_string(),
                    repository: Some(repository),
                    ..Default::default()
                },
                0,
            ))
        }
        RepoCommand::List { all } => Ok((
            RepoOutput {
                command: "repo.list".to_string(),
                repositories: Some(ctx.store.list_repositories(all)?),
                ..Default::default()
            },
            0,
        )),
        RepoCommand::Show { name } => Ok((
            RepoOutput {
                command: "repo.show".to_string(),
                repository: Some(ctx.repository(&name)?),
                ..Default::default()
            },
            0,
        )),
        RepoCommand::Remove { name, purge } => remove(&ctx, &name, purge),
    }
}

fn remove(ctx: &Context, name: &str, purge: bool) -> CmdResult<RepoOutput> {
    let repository = ctx.repository(name)?;

    let deployments_removed = if purge {
        let removed = ctx.store.delete_repository(&repository.id)?;
        let checkouts = ctx.config.deploy_base_path.join(&repository.id);
        deploybot::git::wipe(&checkouts);
        log_status!(
            "repo",
            "Purged {} with {} deployment(s)",
            repository.name,
            removed
        );
        Some(removed)
    } else {
        ctx.store.set_repository_active(&repository.id, false)?;
        log_status!("repo", "Deactivated {}", repository.name);
        None
    };

    Ok((
        RepoOutput {
            command: "repo.remove".to_string(),
            removed: Some(RemovedRepository {
                id: repository.id,
                name: repository.name,
                purged: purge,
                deployments_removed,
            }),
            ..Default::default()
        },
        0,
    ))
}
