use clap::{Args, Subcommand};
use serde::Serialize;

use deploybot::store::DeploymentStore;
use deploybot::{Deployment, Error};

use super::{CmdResult, Context};

const DEFAULT_LIST_LIMIT: usize = 20;

#[derive(Default, Serialize)]
pub struct DeploymentOutput {
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    deployment: Option<Deployment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deployments: Option<Vec<Deployment>>,
}

#[derive(Args)]
pub struct DeploymentArgs {
    #[command(subcommand)]
    command: DeploymentCommand,
}

#[derive(Subcommand)]
enum DeploymentCommand {
    /// Show one deployment with its logs
    Show {
        /// Deployment id
        id: String,
    },
    /// List recent deployments, newest first
    List {
        /// Only deployments of this repository
        #[arg(long)]
        repo: Option<String>,
        /// Maximum number of records
        #[arg(long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
    },
}

pub fn run(
    args: DeploymentArgs,
    _global: &crate::commands::GlobalArgs,
) -> CmdResult<DeploymentOutput> {
    let ctx = Context::load()?;

    match args.command {
        DeploymentCommand::Show { id } => {
            let deployment = ctx
                .store
                .get_deployment(&id)?
                .ok_or_else(|| Error::deployment_not_found(&id))?;
            Ok((
                DeploymentOutput {
                    command: "deployment.show".to_string(),
                    deployment: Some(deployment),
                    ..Default::default()
                },
                0,
            ))
        }
        DeploymentCommand::List { repo, limit } => {
            let repository_id = match repo {
                Some(name) => Some(ctx.repository(&name)?.id),
                None => None,
            };
            let deployments = ctx
                .store
                .list_deployments(repository_id.as_deref(), limit)?;
            Ok((
                DeploymentOutput {
                    command: "deployment.list".to_string(),
                    deployments: Some(deployments),
                    ..Default::default()
                },
                0,
            ))
        }
    }
}
